//! C-MOVE handling, per spec.md §4.10: validate the move destination against
//! active `RemoteDicomNode` rows, enumerate matching instance file paths from
//! the catalog at the identifier's Query/Retrieve level, then forward each
//! instance to the destination over a fresh C-STORE SCU association. One
//! transaction is logged for the whole operation; the DICOM standard's
//! per-sub-operation status is carried only in the PENDING C-MOVE-RSP
//! counts, not in the transaction log.

use super::association::{AssociationError, Assoc};
use super::{DimseStatus, ScpContext};
use crate::catalog::{InstanceLocation, TransactionLogRow, TransactionStatus, TransactionType};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemDicomObject;
use dicom::object::{open_file, FileDicomObject};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::{ClientAssociationOptions, Pdu};
use std::time::Instant;

const C_MOVE_RSP: u16 = 0x8021;
const STATUS_PENDING: u16 = 0xFF00;
const STATUS_WARNING: u16 = 0xB000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryLevel {
    Patient,
    Study,
    Series,
}

#[allow(clippy::too_many_arguments)]
pub(super) fn handle(
    ctx: &ScpContext,
    association: &mut Assoc,
    pc_id: u8,
    message_id: u16,
    identifier: &InMemDicomObject,
    destination_ae: &str,
    calling_ae: &str,
    allowed: bool,
) -> Result<(), AssociationError> {
    let start = Instant::now();

    if !allowed || !ctx.config.enable_c_move {
        send_final(association, pc_id, message_id, DimseStatus::RefusedOutOfResources.code(), None)?;
        log_move(ctx, calling_ae, destination_ae, TransactionStatus::Rejected, 0, 0, Some("C-MOVE refused".to_string()));
        return Ok(());
    }

    let node = ctx.runtime.block_on(ctx.repo.remote_node_by_ae_title(destination_ae));
    let node = match node {
        Ok(Some(node)) if node.allow_incoming => node,
        Ok(_) => {
            send_final(association, pc_id, message_id, DimseStatus::MoveDestinationUnknown.code(), None)?;
            log_move(
                ctx, calling_ae, destination_ae, TransactionStatus::Rejected, 0, 0,
                Some(format!("move destination '{destination_ae}' unknown or not permitted to receive")),
            );
            return Ok(());
        }
        Err(e) => {
            send_final(association, pc_id, message_id, DimseStatus::CannotUnderstand.code(), None)?;
            log_move(ctx, calling_ae, destination_ae, TransactionStatus::Failure, 0, 0, Some(e.to_string()));
            return Ok(());
        }
    };

    let locations = ctx.runtime.block_on(fetch_locations(ctx, identifier));
    let locations = match locations {
        Ok(locations) => locations,
        Err(e) => {
            send_final(association, pc_id, message_id, DimseStatus::CannotUnderstand.code(), None)?;
            log_move(ctx, calling_ae, destination_ae, TransactionStatus::Failure, 0, 0, Some(e.to_string()));
            return Ok(());
        }
    };

    let total = locations.len();
    let address = format!("{}:{}", node.host, node.port);
    let scu = ClientAssociationOptions::new()
        .calling_ae_title(ctx.config.ae_title.as_str())
        .called_ae_title(destination_ae)
        .with_abstract_syntax(dicom::dictionary_std::uids::CT_IMAGE_STORAGE)
        .with_abstract_syntax(dicom::dictionary_std::uids::MR_IMAGE_STORAGE)
        .with_abstract_syntax(dicom::dictionary_std::uids::RT_STRUCTURE_SET_STORAGE)
        .with_abstract_syntax(dicom::dictionary_std::uids::RT_PLAN_STORAGE)
        .with_abstract_syntax(dicom::dictionary_std::uids::RT_DOSE_STORAGE)
        .with_abstract_syntax(dicom::dictionary_std::uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
        .max_pdu_length(ctx.config.max_pdu_length as u32)
        .establish_with(&address);

    let mut scu = match scu {
        Ok(scu) => scu,
        Err(e) => {
            send_final(association, pc_id, message_id, DimseStatus::RefusedOutOfResources.code(), None)?;
            log_move(
                ctx, calling_ae, destination_ae, TransactionStatus::Failure, 0, total,
                Some(format!("could not establish association with move destination: {e}")),
            );
            return Ok(());
        }
    };

    let mut completed = 0usize;
    let mut failed = 0usize;
    for (i, location) in locations.iter().enumerate() {
        let remaining = total - i - 1;
        match forward_one(&mut scu, location) {
            Ok(()) => completed += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(file_path = %location.file_path, error = %e, "C-MOVE sub-operation failed");
            }
        }
        send_pending(association, pc_id, message_id, remaining, completed, failed)?;
    }
    let _ = scu.release();

    if failed == 0 {
        ctx.runtime.block_on(async {
            let _ = ctx.repo.touch_remote_node_outgoing(destination_ae).await;
        });
    }

    let final_status = if failed > 0 { STATUS_WARNING } else { DimseStatus::Success.code() };
    send_final(association, pc_id, message_id, final_status, Some((completed, failed)))?;
    log_move(
        ctx,
        calling_ae,
        destination_ae,
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

/// Forward one instance to `scu` as a C-STORE sub-operation, matching the
/// SOP class to a negotiated presentation context.
fn forward_one(
    scu: &mut dicom::ul::ClientAssociation<std::net::TcpStream>,
    location: &InstanceLocation,
) -> Result<(), String> {
    let file = open_file(&location.file_path).map_err(|e| e.to_string())?;
    let sop_class_uid = file.meta().media_storage_sop_class_uid().to_string();
    let sop_instance_uid = file.meta().media_storage_sop_instance_uid().to_string();

    let pc = scu
        .presentation_contexts()
        .iter()
        .find(|pc| file.meta().transfer_syntax() == pc.transfer_syntax)
        .or_else(|| scu.presentation_contexts().first())
        .cloned()
        .ok_or_else(|| "no negotiated presentation context".to_string())?;
    let ts = TransferSyntaxRegistry.get(&pc.transfer_syntax).ok_or("unsupported transfer syntax")?;

    let command = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, PrimitiveValue::from(sop_class_uid.clone())),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(0x0001u16)),
        DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(1u16)),
        DataElement::new(tags::PRIORITY, VR::US, PrimitiveValue::from(0u16)),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(1u16)),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_instance_uid)),
    ]);
    let mut command_bytes = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut command_bytes, &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| e.to_string())?;
    scu.send(&Pdu::PData {
        data: vec![PDataValue { presentation_context_id: pc.id, value_type: PDataValueType::Command, is_last: true, data: command_bytes }],
    })
    .map_err(|e| e.to_string())?;

    let mut dataset_bytes = Vec::with_capacity(4096);
    file.write_dataset_with_ts(&mut dataset_bytes, ts).map_err(|e| e.to_string())?;
    scu.send(&Pdu::PData {
        data: vec![PDataValue { presentation_context_id: pc.id, value_type: PDataValueType::Data, is_last: true, data: dataset_bytes }],
    })
    .map_err(|e| e.to_string())?;

    match scu.receive().map_err(|e| e.to_string())? {
        Pdu::PData { data } => {
            let rsp = InMemDicomObject::read_dataset_with_ts(
                data[0].data.as_slice(),
                &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
            )
            .map_err(|e| e.to_string())?;
            let status = rsp.element(tags::STATUS).ok().and_then(|e| e.to_int::<u16>().ok()).unwrap_or(0xFFFF);
            if status == DimseStatus::Success.code() {
                Ok(())
            } else {
                Err(format!("destination returned C-STORE status 0x{status:04X}"))
            }
        }
        other => Err(format!("unexpected PDU from move destination: {other:?}")),
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
    let command = command_object(message_id, STATUS_PENDING, remaining, completed, failed);
    let mut data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut data, &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|_| AssociationError::CannotRespond("failed to encode C-MOVE-RSP"))?;
    association
        .send(&Pdu::PData { data: vec![PDataValue { presentation_context_id: pc_id, value_type: PDataValueType::Command, is_last: true, data }] })
        .map_err(|_| AssociationError::CannotRespond("failed to send C-MOVE-RSP"))
}

fn send_final(
    association: &mut Assoc,
    pc_id: u8,
    message_id: u16,
    status: u16,
    counts: Option<(usize, usize)>,
) -> Result<(), AssociationError> {
    let (completed, failed) = counts.unwrap_or((0, 0));
    let command = command_object(message_id, status, 0, completed, failed);
    let mut data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut data, &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|_| AssociationError::CannotRespond("failed to encode C-MOVE-RSP"))?;
    association
        .send(&Pdu::PData { data: vec![PDataValue { presentation_context_id: pc_id, value_type: PDataValueType::Command, is_last: true, data }] })
        .map_err(|_| AssociationError::CannotRespond("failed to send C-MOVE-RSP"))
}

fn command_object(
    message_id: u16,
    status: u16,
    remaining: usize,
    completed: usize,
    failed: usize,
) -> FileDicomObject<InMemDicomObject> {
    let dataset_type = if status == STATUS_PENDING { 0x0101u16 } else { 0x0101u16 };
    FileDicomObject::from(InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(dicom::dictionary_std::uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(C_MOVE_RSP)),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, PrimitiveValue::from(message_id)),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(dataset_type)),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status)),
        DataElement::new(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, VR::US, PrimitiveValue::from(remaining as u16)),
        DataElement::new(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, VR::US, PrimitiveValue::from(completed as u16)),
        DataElement::new(tags::NUMBER_OF_FAILED_SUBOPERATIONS, VR::US, PrimitiveValue::from(failed as u16)),
        DataElement::new(tags::NUMBER_OF_WARNING_SUBOPERATIONS, VR::US, PrimitiveValue::from(0u16)),
    ]))
}

#[allow(clippy::too_many_arguments)]
fn log_move(
    ctx: &ScpContext,
    calling_ae: &str,
    destination_ae: &str,
    status: TransactionStatus,
    completed: usize,
    failed: usize,
    error: Option<String>,
) {
    ctx.tx_log.enqueue(TransactionLogRow {
        transaction_type: TransactionType::CMove,
        status,
        calling_ae: Some(calling_ae.to_string()),
        called_ae: Some(destination_ae.to_string()),
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
}
