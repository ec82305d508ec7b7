//! C-GET handling, per spec.md §4.10: same catalog selection as C-MOVE, but
//! every sub-operation dataset is streamed back over the *same* association
//! instead of a fresh one to a third party. The original SCU plays C-STORE
//! SCP for the duration of the exchange, which is why storage presentation
//! contexts are negotiated with the SCP role set in `association.rs` when
//! C-GET is enabled. Limited to 1000 matches per spec.

use super::association::{AssociationError, Assoc};
use super::{DimseStatus, ScpContext};
use crate::catalog::{InstanceLocation, TransactionLogRow, TransactionStatus, TransactionType};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemDicomObject;
use dicom::object::open_file;
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;

const C_GET_RSP: u16 = 0x8010;
const C_STORE_RQ_ON_GET: u16 = 0x0001;
const STATUS_PENDING: u16 = 0xFF00;
const STATUS_WARNING: u16 = 0xB000;
const MAX_MATCHES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryLevel {
    Patient,
    Study,
    Series,
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
    if !allowed || !ctx.config.enable_c_get {
        send_final(association, pc_id, message_id, DimseStatus::RefusedOutOfResources.code(), None)?;
        log_get(ctx, calling_ae, TransactionStatus::Rejected, 0, 0, Some("C-GET refused".to_string()));
        return Ok(());
    }

    let locations = ctx.runtime.block_on(fetch_locations(ctx, identifier));
    let mut locations = match locations {
        Ok(locations) => locations,
        Err(e) => {
            send_final(association, pc_id, message_id, DimseStatus::CannotUnderstand.code(), None)?;
            log_get(ctx, calling_ae, TransactionStatus::Failure, 0, 0, Some(e.to_string()));
            return Ok(());
        }
    };
    let truncated = locations.len() > MAX_MATCHES;
    locations.truncate(MAX_MATCHES);
    if truncated {
        tracing::warn!(matches = locations.len(), "C-GET result set truncated to 1000 matches");
    }

    let total = locations.len();
    let mut completed = 0usize;
    let mut failed = 0usize;
    for (i, location) in locations.iter().enumerate() {
        let remaining = total - i - 1;
        match send_one(association, location) {
            Ok(()) => completed += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(file_path = %location.file_path, error = %e, "C-GET sub-operation failed");
            }
        }
        send_pending(association, pc_id, message_id, remaining, completed, failed)?;
    }

    let final_status = if failed > 0 { STATUS_WARNING } else { DimseStatus::Success.code() };
    send_final(association, pc_id, message_id, final_status, Some((completed, failed)))?;
    log_get(
        ctx,
        calling_ae,
        if failed == 0 { TransactionStatus::Success } else { TransactionStatus::Failure },
        completed,
        failed,
        (failed > 0).then(|| format!("{failed} of {total} sub-operations failed")),
    );
    Ok(())
}

async fn fetch_locations(ctx: &ScpContext, identifier: &InMemDicomObject) -> Result<Vec<InstanceLocation>, sqlx::Error> {
    match query_level(identifier) {
        QueryLevel::Patient => {
            let patient_id = element_str(identifier, tags::PATIENT_ID).unwrap_or_default();
            ctx.repo.instance_locations_for_patient(&patient_id).await
        }
        QueryLevel::Study => {
            let study_uid = element_str(identifier, tags::STUDY_INSTANCE_UID).unwrap_or_default();
            ctx.repo.instance_locations_for_study(&study_uid).await
        }
        QueryLevel::Series => {
            let series_uid = element_str(identifier, tags::SERIES_INSTANCE_UID).unwrap_or_default();
            ctx.repo.instance_locations_for_series(&series_uid).await
        }
    }
}

fn query_level(identifier: &InMemDicomObject) -> QueryLevel {
    match element_str(identifier, tags::QUERY_RETRIEVE_LEVEL).as_deref() {
        Some("PATIENT") => QueryLevel::Patient,
        Some("STUDY") => QueryLevel::Study,
        _ => QueryLevel::Series,
    }
}

fn element_str(obj: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
    obj.element(tag).ok()?.to_str().ok().map(|v| v.into_owned())
}

/// Send one instance as a C-STORE-RQ sub-operation over the association
/// already open with the requesting SCU, then read its C-STORE-RSP.
fn send_one(association: &mut Assoc, location: &InstanceLocation) -> Result<(), String> {
    let file = open_file(&location.file_path).map_err(|e| e.to_string())?;
    let sop_class_uid = file.meta().media_storage_sop_class_uid().to_string();
    let sop_instance_uid = file.meta().media_storage_sop_instance_uid().to_string();

    let pc = association
        .presentation_contexts()
        .iter()
        .find(|pc| TransferSyntaxRegistry.get(&pc.transfer_syntax).is_some())
        .cloned()
        .ok_or_else(|| "no negotiated presentation context".to_string())?;
    let ts = TransferSyntaxRegistry.get(&pc.transfer_syntax).ok_or("unsupported transfer syntax")?;

    let command = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, PrimitiveValue::from(sop_class_uid.clone())),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(C_STORE_RQ_ON_GET)),
        DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(1u16)),
        DataElement::new(tags::PRIORITY, VR::US, PrimitiveValue::from(0u16)),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(1u16)),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_instance_uid)),
    ]);
    let mut command_bytes = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut command_bytes, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| e.to_string())?;
    association
        .send(&Pdu::PData {
            data: vec![PDataValue { presentation_context_id: pc.id, value_type: PDataValueType::Command, is_last: true, data: command_bytes }],
        })
        .map_err(|e| e.to_string())?;

    let mut dataset_bytes = Vec::with_capacity(4096);
    file.write_dataset_with_ts(&mut dataset_bytes, ts).map_err(|e| e.to_string())?;
    association
        .send(&Pdu::PData {
            data: vec![PDataValue { presentation_context_id: pc.id, value_type: PDataValueType::Data, is_last: true, data: dataset_bytes }],
        })
        .map_err(|e| e.to_string())?;

    match association.receive().map_err(|e| e.to_string())? {
        Pdu::PData { data } => {
            let rsp = InMemDicomObject::read_dataset_with_ts(data[0].data.as_slice(), &IMPLICIT_VR_LITTLE_ENDIAN.erased())
                .map_err(|e| e.to_string())?;
            let status = rsp.element(tags::STATUS).ok().and_then(|e| e.to_int::<u16>().ok()).unwrap_or(0xFFFF);
            if status == DimseStatus::Success.code() {
                Ok(())
            } else {
                Err(format!("requester returned C-STORE status 0x{status:04X}"))
            }
        }
        other => Err(format!("unexpected PDU from C-GET requester: {other:?}")),
    }
}

fn send_pending(
    association: &mut Assoc,
    pc_id: u8,
    message_id: u16,
    remaining: usize,
    completed: usize,
    failed: usize,
) -> Result<(), AssociationError> {
    send_response(association, pc_id, message_id, STATUS_PENDING, remaining, completed, failed)
}

fn send_final(
    association: &mut Assoc,
    pc_id: u8,
    message_id: u16,
    status: u16,
    counts: Option<(usize, usize)>,
) -> Result<(), AssociationError> {
    let (completed, failed) = counts.unwrap_or((0, 0));
    send_response(association, pc_id, message_id, status, 0, completed, failed)
}

fn send_response(
    association: &mut Assoc,
    pc_id: u8,
    message_id: u16,
    status: u16,
    remaining: usize,
    completed: usize,
    failed: usize,
) -> Result<(), AssociationError> {
    let command = InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(dicom::dictionary_std::uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(C_GET_RSP)),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, PrimitiveValue::from(message_id)),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(0x0101u16)),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status)),
        DataElement::new(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, VR::US, PrimitiveValue::from(remaining as u16)),
        DataElement::new(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, VR::US, PrimitiveValue::from(completed as u16)),
        DataElement::new(tags::NUMBER_OF_FAILED_SUBOPERATIONS, VR::US, PrimitiveValue::from(failed as u16)),
        DataElement::new(tags::NUMBER_OF_WARNING_SUBOPERATIONS, VR::US, PrimitiveValue::from(0u16)),
    ]);
    let mut data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|_| AssociationError::CannotRespond("failed to encode C-GET-RSP"))?;
    association
        .send(&Pdu::PData { data: vec![PDataValue { presentation_context_id: pc_id, value_type: PDataValueType::Command, is_last: true, data }] })
        .map_err(|_| AssociationError::CannotRespond("failed to send C-GET-RSP"))
}

fn log_get(
    ctx: &ScpContext,
    calling_ae: &str,
    status: TransactionStatus,
    completed: usize,
    failed: usize,
    error: Option<String>,
) {
    ctx.tx_log.enqueue(TransactionLogRow {
        transaction_type: TransactionType::CGet,
        status,
        calling_ae: Some(calling_ae.to_string()),
        called_ae: Some(ctx.config.ae_title.to_string()),
        remote_ip: None,
        remote_port: None,
        patient_id: None,
        study_uid: None,
        series_uid: None,
        sop_instance_uid: None,
        sop_class_uid: None,
        file_path: None,
        file_size: Some((completed + failed) as i64),
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
    fn query_level_defaults_to_series() {
        let obj = InMemDicomObject::new_empty();
        assert_eq!(query_level(&obj), QueryLevel::Series);
    }

    #[test]
    fn max_matches_caps_at_spec_limit() {
        assert_eq!(MAX_MATCHES, 1000);
    }
}
