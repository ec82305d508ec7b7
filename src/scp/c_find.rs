//! C-FIND handling, per spec.md §4.10: query the catalog — never the
//! filesystem — at the PATIENT/STUDY/SERIES/IMAGE level named by the
//! identifier's Query/Retrieve Level, translating DICOM wildcards into
//! case-insensitive regex and capping results at `max_query_results`.
//! Structured as a sequence of C-FIND-RSP PENDING responses (one per
//! matching row, carrying the identifier dataset) followed by a final
//! C-FIND-RSP SUCCESS with no dataset, the same Command/Data-PDU framing
//! `c_echo.rs`/`c_store.rs` already use.

use super::association::{AssociationError, Assoc};
use super::{DimseStatus, ScpContext};
use crate::catalog::{FindRow, TransactionLogRow, TransactionStatus, TransactionType};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemDicomObject;
use dicom::object::FileDicomObject;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use regex::Regex;
use std::time::Instant;

const C_FIND_RSP: u16 = 0x8020;

macro_rules! str_element {
    ($tag:expr, $vr:expr, $value:expr) => {
        DataElement::new($tag, $vr, PrimitiveValue::from($value.to_string()))
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryLevel {
    Patient,
    Study,
    Series,
    Image,
}

pub(super) fn handle(
    ctx: &ScpContext,
    association: &mut Assoc,
    pc_id: u8,
    message_id: u16,
    identifier: &InMemDicomObject,
    calling_ae: &str,
    allowed: bool,
) -> Result<(), AssociationError> {
    let start = Instant::now();

    if !allowed || !ctx.config.enable_c_find {
        send_final(association, pc_id, message_id, DimseStatus::RefusedOutOfResources.code())?;
        log_find(ctx, calling_ae, TransactionStatus::Rejected, 0, Some("C-FIND refused".to_string()));
        return Ok(());
    }

    let level = query_level(identifier);
    let patient_id_filter = element_str(identifier, tags::PATIENT_ID);
    let study_uid_filter = element_str(identifier, tags::STUDY_INSTANCE_UID);
    let series_uid_filter = element_str(identifier, tags::SERIES_INSTANCE_UID);

    let rows = ctx.runtime.block_on(async {
        match level {
            QueryLevel::Patient => ctx.repo.find_rows_patient_level().await,
            QueryLevel::Study => ctx.repo.find_rows_study_level(patient_id_filter.as_deref()).await,
            QueryLevel::Series => ctx.repo.find_rows_series_level(study_uid_filter.as_deref()).await,
            QueryLevel::Image => ctx.repo.find_rows_image_level(series_uid_filter.as_deref()).await,
        }
    });

    let rows = match rows {
        Ok(rows) => rows,
        Err(e) => {
            send_final(association, pc_id, message_id, DimseStatus::CannotUnderstand.code())?;
            log_find(ctx, calling_ae, TransactionStatus::Failure, 0, Some(e.to_string()));
            return Ok(());
        }
    };

    let max_results = if ctx.config.max_query_results > 0 { ctx.config.max_query_results as usize } else { 10_000 };

    let matched: Vec<&FindRow> = rows
        .iter()
        .filter(|row| row_matches(row, identifier, level))
        .take(max_results)
        .collect();

    for row in &matched {
        let response_identifier = build_identifier(row, level);
        send_pending(association, pc_id, message_id, &response_identifier)?;
    }

    send_final(association, pc_id, message_id, DimseStatus::Success.code())?;
    log_find(ctx, calling_ae, TransactionStatus::Success, matched.len(), None);
    Ok(())
}

fn query_level(identifier: &InMemDicomObject) -> QueryLevel {
    match element_str(identifier, tags::QUERY_RETRIEVE_LEVEL).as_deref() {
        Some("PATIENT") => QueryLevel::Patient,
        Some("STUDY") => QueryLevel::Study,
        Some("IMAGE") => QueryLevel::Image,
        _ => QueryLevel::Series,
    }
}

fn element_str(obj: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
    obj.element(tag).ok()?.to_str().ok().map(|v| v.into_owned())
}

/// Narrow the catalog's coarse level rows down to the caller's identifier,
/// per spec.md §4.10: DICOM wildcards translate to case-insensitive regex;
/// date keys additionally accept exact values and `YYYYMMDD-YYYYMMDD` ranges.
fn row_matches(row: &FindRow, identifier: &InMemDicomObject, level: QueryLevel) -> bool {
    if let Some(pattern) = element_str(identifier, tags::PATIENT_NAME) {
        if !matches_text(row.patient_name.as_deref(), &pattern) {
            return false;
        }
    }
    if matches!(level, QueryLevel::Study | QueryLevel::Series | QueryLevel::Image) {
        if let Some(pattern) = element_str(identifier, tags::STUDY_DATE) {
            if !matches_date(row.study_date.as_deref(), &pattern) {
                return false;
            }
        }
        if let Some(pattern) = element_str(identifier, tags::STUDY_DESCRIPTION) {
            if !matches_text(row.study_description.as_deref(), &pattern) {
                return false;
            }
        }
        if let Some(pattern) = element_str(identifier, tags::ACCESSION_NUMBER) {
            if !matches_text(row.accession.as_deref(), &pattern) {
                return false;
            }
        }
    }
    if matches!(level, QueryLevel::Series | QueryLevel::Image) {
        if let Some(pattern) = element_str(identifier, tags::SERIES_DESCRIPTION) {
            if !matches_text(row.series_description.as_deref(), &pattern) {
                return false;
            }
        }
        if let Some(pattern) = element_str(identifier, tags::MODALITY) {
            if !matches_text(row.modality.as_deref(), &pattern) {
                return false;
            }
        }
    }
    true
}

fn matches_text(value: Option<&str>, pattern: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    match value {
        Some(v) => wildcard_regex(pattern).is_match(v),
        None => false,
    }
}

fn matches_date(value: Option<&str>, pattern: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let Some(value) = value else { return false };
    if let Some((lo, hi)) = pattern.split_once('-') {
        (lo.is_empty() || value >= lo) && (hi.is_empty() || value <= hi)
    } else if pattern.contains('*') || pattern.contains('?') {
        wildcard_regex(pattern).is_match(value)
    } else {
        value == pattern
    }
}

fn wildcard_regex(pattern: &str) -> Regex {
    let mut escaped = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        match c {
            '*' => escaped.push_str(".*"),
            '?' => escaped.push('.'),
            _ => escaped.push_str(&regex::escape(&c.to_string())),
        }
    }
    Regex::new(&format!("(?i)^{escaped}$")).unwrap_or_else(|_| Regex::new("^$").unwrap())
}

/// Build the identifier dataset for one matching row, filling every field
/// the queried level requires with an empty string when unknown (clients
/// require presence even when the value is blank).
fn build_identifier(row: &FindRow, level: QueryLevel) -> InMemDicomObject {
    let mut elements = vec![
        str_element!(tags::PATIENT_ID, VR::LO, &row.patient_id),
        str_element!(tags::PATIENT_NAME, VR::PN, row.patient_name.as_deref().unwrap_or("")),
        str_element!(tags::QUERY_RETRIEVE_LEVEL, VR::CS, level_name(level)),
    ];
    if matches!(level, QueryLevel::Study | QueryLevel::Series | QueryLevel::Image) {
        elements.push(str_element!(tags::STUDY_INSTANCE_UID, VR::UI, row.study_uid.as_deref().unwrap_or("")));
        elements.push(str_element!(tags::STUDY_DATE, VR::DA, row.study_date.as_deref().unwrap_or("")));
        elements.push(str_element!(tags::STUDY_DESCRIPTION, VR::LO, row.study_description.as_deref().unwrap_or("")));
        elements.push(str_element!(tags::ACCESSION_NUMBER, VR::SH, row.accession.as_deref().unwrap_or("")));
        elements.push(str_element!(tags::STUDY_ID, VR::SH, row.study_id.as_deref().unwrap_or("")));
    }
    if matches!(level, QueryLevel::Series | QueryLevel::Image) {
        elements.push(str_element!(tags::SERIES_INSTANCE_UID, VR::UI, row.series_uid.as_deref().unwrap_or("")));
        elements.push(str_element!(tags::SERIES_DESCRIPTION, VR::LO, row.series_description.as_deref().unwrap_or("")));
        elements.push(str_element!(tags::MODALITY, VR::CS, row.modality.as_deref().unwrap_or("")));
    }
    if level == QueryLevel::Image {
        elements.push(str_element!(tags::SOP_INSTANCE_UID, VR::UI, row.sop_instance_uid.as_deref().unwrap_or("")));
    }
    InMemDicomObject::from_element_iter(elements)
}

fn level_name(level: QueryLevel) -> &'static str {
    match level {
        QueryLevel::Patient => "PATIENT",
        QueryLevel::Study => "STUDY",
        QueryLevel::Series => "SERIES",
        QueryLevel::Image => "IMAGE",
    }
}

const STATUS_PENDING: u16 = 0xFF00;

fn send_pending(association: &mut Assoc, pc_id: u8, message_id: u16, identifier: &InMemDicomObject) -> Result<(), AssociationError> {
    let command = command_object(message_id, STATUS_PENDING, true);
    let mut command_bytes = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut command_bytes, &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|_| AssociationError::CannotRespond("failed to encode C-FIND-RSP command"))?;
    association
        .send(&Pdu::PData {
            data: vec![PDataValue { presentation_context_id: pc_id, value_type: PDataValueType::Command, is_last: true, data: command_bytes }],
        })
        .map_err(|_| AssociationError::CannotRespond("failed to send C-FIND-RSP command"))?;

    let mut identifier_bytes = Vec::with_capacity(256);
    identifier
        .write_dataset_with_ts(&mut identifier_bytes, &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|_| AssociationError::CannotRespond("failed to encode C-FIND identifier"))?;
    association
        .send(&Pdu::PData {
            data: vec![PDataValue { presentation_context_id: pc_id, value_type: PDataValueType::Data, is_last: true, data: identifier_bytes }],
        })
        .map_err(|_| AssociationError::CannotRespond("failed to send C-FIND identifier"))
}

fn send_final(association: &mut Assoc, pc_id: u8, message_id: u16, status: u16) -> Result<(), AssociationError> {
    let command = command_object(message_id, status, false);
    let mut data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut data, &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|_| AssociationError::CannotRespond("failed to encode C-FIND-RSP"))?;
    association
        .send(&Pdu::PData { data: vec![PDataValue { presentation_context_id: pc_id, value_type: PDataValueType::Command, is_last: true, data }] })
        .map_err(|_| AssociationError::CannotRespond("failed to send C-FIND-RSP"))
}

fn command_object(message_id: u16, status: u16, has_dataset: bool) -> FileDicomObject<InMemDicomObject> {
    let dataset_type = if has_dataset { 0x0102u16 } else { 0x0101u16 };
    FileDicomObject::from(InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(dicom::dictionary_std::uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(C_FIND_RSP)),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, PrimitiveValue::from(message_id)),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(dataset_type)),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status)),
    ]))
}

fn log_find(ctx: &ScpContext, calling_ae: &str, status: TransactionStatus, match_count: usize, error: Option<String>) {
    ctx.tx_log.enqueue(TransactionLogRow {
        transaction_type: TransactionType::CFind,
        status,
        calling_ae: Some(calling_ae.to_string()),
        called_ae: Some(ctx.config.ae_title.clone()),
        remote_ip: None,
        remote_port: None,
        patient_id: None,
        study_uid: None,
        series_uid: None,
        sop_instance_uid: None,
        sop_class_uid: None,
        file_path: None,
        file_size: Some(match_count as i64),
        transfer_syntax: None,
        duration_s: None,
        transfer_speed_mbps: None,
        error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_star_matches_prefix() {
        assert!(matches_text(Some("CHEST CT"), "CHEST*"));
        assert!(!matches_text(Some("HEAD CT"), "CHEST*"));
    }

    #[test]
    fn wildcard_question_mark_matches_one_char() {
        assert!(matches_text(Some("CT1"), "CT?"));
        assert!(!matches_text(Some("CT12"), "CT?"));
    }

    #[test]
    fn empty_pattern_is_universal_match() {
        assert!(matches_text(None, ""));
        assert!(matches_text(Some("anything"), ""));
    }

    #[test]
    fn date_range_matches_inclusive_bounds() {
        assert!(matches_date(Some("20240115"), "20240101-20240131"));
        assert!(!matches_date(Some("20240215"), "20240101-20240131"));
    }

    #[test]
    fn date_open_range_matches_one_side() {
        assert!(matches_date(Some("20240115"), "20240101-"));
        assert!(matches_date(Some("20240115"), "-20240131"));
    }
}
