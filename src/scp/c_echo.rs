//! C-ECHO handling, per spec.md §4.10: always answered regardless of the
//! allow-list, since it is the only way a caller not yet known to be
//! permitted can be told it reached the right AE.

use super::association::{AssociationError, Assoc};
use super::{DimseStatus, ScpContext};
use crate::catalog::{TransactionLogRow, TransactionStatus, TransactionType};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemDicomObject;
use dicom::object::FileDicomObject;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::net::IpAddr;

#[allow(clippy::too_many_arguments)]
pub(super) fn handle(
    ctx: &ScpContext,
    association: &mut Assoc,
    pc_id: u8,
    message_id: u16,
    calling_ae: &str,
    peer_ip: Option<IpAddr>,
) -> Result<(), AssociationError> {
    let response = command_response(message_id, DimseStatus::Success.code());
    let mut data = Vec::with_capacity(128);
    response
        .write_dataset_with_ts(&mut data, &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|_| AssociationError::CannotRespond("failed to encode C-ECHO-RSP"))?;

    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data,
            }],
        })
        .map_err(|_| AssociationError::CannotRespond("failed to send C-ECHO-RSP"))?;

    ctx.tx_log.enqueue(TransactionLogRow {
        transaction_type: TransactionType::CEcho,
        status: TransactionStatus::Success,
        calling_ae: Some(calling_ae.to_string()),
        called_ae: Some(ctx.config.ae_title.clone()),
        remote_ip: peer_ip.map(|ip| ip.to_string()),
        remote_port: None,
        patient_id: None,
        study_uid: None,
        series_uid: None,
        sop_instance_uid: None,
        sop_class_uid: None,
        file_path: None,
        file_size: None,
        transfer_syntax: None,
        duration_s: None,
        transfer_speed_mbps: None,
        error: None,
    });
    Ok(())
}

fn command_response(message_id: u16, status: u16) -> FileDicomObject<InMemDicomObject> {
    FileDicomObject::from(InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(dicom::dictionary_std::uids::VERIFICATION),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(0x8030u16)),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            PrimitiveValue::from(message_id),
        ),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(0x0101u16)),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status)),
    ]))
}
