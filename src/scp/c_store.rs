//! C-STORE handling, per spec.md §4.10: "optimization-critical" — the
//! encoded dataset bytes are written straight to disk without a
//! decode/re-encode cycle unless the storage layout needs instance
//! metadata, the filename convention needs it, or validation is turned on.

use super::association::{AssociationError, Assoc};
use super::{DimseStatus, ScpContext};
use crate::catalog::{
    FilenameConvention, StorageStructure, TransactionLogRow, TransactionStatus, TransactionType,
};
use crate::sanitize::sanitize_path;
use camino::{Utf8Path, Utf8PathBuf};
use dicom::core::header::Header;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemDicomObject;
use dicom::object::{FileDicomObject, FileMetaTableBuilder};
use dicom::transfer_syntax::TransferSyntax;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::io::Write as _;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use time::OffsetDateTime;

static SEQUENTIAL_COUNTER: AtomicU64 = AtomicU64::new(0);

const REQUIRED_TAGS: &[(Tag, &str)] = &[
    (tags::PATIENT_ID, "PatientID"),
    (tags::STUDY_INSTANCE_UID, "StudyInstanceUID"),
    (tags::SERIES_INSTANCE_UID, "SeriesInstanceUID"),
    (tags::SOP_INSTANCE_UID, "SOPInstanceUID"),
];

#[allow(clippy::too_many_arguments)]
pub(super) fn handle(
    ctx: &ScpContext,
    association: &mut Assoc,
    pc_id: u8,
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    raw_dataset: &[u8],
    ts: &TransferSyntax,
    calling_ae: &str,
    peer_ip: Option<IpAddr>,
    allowed: bool,
) -> Result<(), AssociationError> {
    let start = Instant::now();

    if !allowed || !ctx.config.enable_c_store {
        respond(association, pc_id, message_id, sop_class_uid, sop_instance_uid, DimseStatus::RefusedOutOfResources.code())?;
        log_store(
            ctx, calling_ae, peer_ip, sop_class_uid, sop_instance_uid, Some(ts.uid()), start,
            StoreOutcome {
                status: TransactionStatus::Rejected,
                file_path: None,
                file_size: None,
                error: Some("C-STORE refused: disallowed peer or service disabled".to_string()),
            },
        );
        return Ok(());
    }

    let needs_decode = ctx.config.storage_structure != StorageStructure::Flat
        || ctx.config.filename_convention == FilenameConvention::InstanceNumber
        || ctx.config.validate_dicom_on_receive;

    let decoded = if needs_decode {
        match InMemDicomObject::read_dataset_with_ts(raw_dataset, ts) {
            Ok(obj) => Some(obj),
            Err(e) => {
                respond(association, pc_id, message_id, sop_class_uid, sop_instance_uid, DimseStatus::CannotUnderstand.code())?;
                log_store(
                    ctx, calling_ae, peer_ip, sop_class_uid, sop_instance_uid, Some(ts.uid()), start,
                    StoreOutcome {
                        status: TransactionStatus::Failure,
                        file_path: None,
                        file_size: None,
                        error: Some(e.to_string()),
                    },
                );
                return Ok(());
            }
        }
    } else {
        None
    };

    if ctx.config.validate_dicom_on_receive {
        if let Some(missing) = decoded.as_ref().and_then(first_missing_required_tag) {
            if ctx.config.reject_invalid_dicom {
                respond(association, pc_id, message_id, sop_class_uid, sop_instance_uid, DimseStatus::CannotUnderstand.code())?;
                log_store(
                    ctx, calling_ae, peer_ip, sop_class_uid, sop_instance_uid, Some(ts.uid()), start,
                    StoreOutcome {
                        status: TransactionStatus::Failure,
                        file_path: None,
                        file_size: None,
                        error: Some(format!("missing required tag {missing}")),
                    },
                );
                return Ok(());
            }
            tracing::warn!(tag = missing, "C-STORE dataset missing a required tag; storing anyway");
        }
    }

    let max_bytes = (ctx.config.max_storage_gb * 1024.0 * 1024.0 * 1024.0) as u64;
    if ctx.storage_cache.bytes() >= max_bytes {
        if ctx.config.cleanup_enabled {
            let target_free = (max_bytes / 10).max(raw_dataset.len() as u64);
            let result = ctx.runtime.block_on(super::cleanup::run_cleanup_and_log(
                &ctx.repo,
                &ctx.storage_root,
                ctx.config.retention_days as i64,
                target_free,
            ));
            let actual = super::storage_cache::rescan_disk_usage(&ctx.storage_root);
            ctx.storage_cache.set(actual);
            ctx.runtime.block_on(async {
                let _ = ctx.repo.set_cached_storage(actual as i64).await;
            });
            tracing::info!(
                files_deleted = result.files_deleted,
                bytes_freed = result.bytes_freed,
                "cleanup ran ahead of a C-STORE at the storage limit"
            );
            if ctx.storage_cache.bytes() >= max_bytes {
                respond(association, pc_id, message_id, sop_class_uid, sop_instance_uid, DimseStatus::RefusedOutOfResources.code())?;
                log_store(
                    ctx, calling_ae, peer_ip, sop_class_uid, sop_instance_uid, Some(ts.uid()), start,
                    StoreOutcome {
                        status: TransactionStatus::Rejected,
                        file_path: None,
                        file_size: None,
                        error: Some("storage exhausted even after cleanup".to_string()),
                    },
                );
                return Ok(());
            }
        } else {
            respond(association, pc_id, message_id, sop_class_uid, sop_instance_uid, DimseStatus::RefusedOutOfResources.code())?;
            log_store(
                ctx, calling_ae, peer_ip, sop_class_uid, sop_instance_uid, Some(ts.uid()), start,
                StoreOutcome {
                    status: TransactionStatus::Rejected,
                    file_path: None,
                    file_size: None,
                    error: Some("storage exhausted".to_string()),
                },
            );
            return Ok(());
        }
    }

    let dest_dir = destination_dir(&ctx.storage_root, ctx.config.storage_structure, decoded.as_ref());
    let filename = destination_filename(ctx.config.filename_convention, sop_instance_uid, decoded.as_ref());
    let dest_path = dest_dir.join(filename);

    match write_stored_file(&dest_path, sop_class_uid, sop_instance_uid, ts, raw_dataset) {
        Ok(file_size) => {
            ctx.storage_cache.add(file_size as i64);
            ctx.runtime.block_on(async {
                let _ = ctx.repo.increment_cached_storage(file_size as i64).await;
                let _ = ctx.repo.record_file_received(file_size as i64).await;
            });
            respond(association, pc_id, message_id, sop_class_uid, sop_instance_uid, DimseStatus::Success.code())?;
            log_store(
                ctx, calling_ae, peer_ip, sop_class_uid, sop_instance_uid, Some(ts.uid()), start,
                StoreOutcome {
                    status: TransactionStatus::Success,
                    file_path: Some(dest_path.to_string()),
                    file_size: Some(file_size as i64),
                    error: None,
                },
            );
            Ok(())
        }
        Err(e) => {
            ctx.runtime.block_on(async {
                let _ = ctx.repo.record_error().await;
            });
            respond(association, pc_id, message_id, sop_class_uid, sop_instance_uid, DimseStatus::CannotUnderstand.code())?;
            log_store(
                ctx, calling_ae, peer_ip, sop_class_uid, sop_instance_uid, Some(ts.uid()), start,
                StoreOutcome { status: TransactionStatus::Failure, file_path: None, file_size: None, error: Some(e) },
            );
            Ok(())
        }
    }
}

fn first_missing_required_tag(obj: &InMemDicomObject) -> Option<&'static str> {
    REQUIRED_TAGS.iter().find(|(tag, _)| obj.element(*tag).is_err()).map(|(_, name)| *name)
}

fn element_str(obj: Option<&InMemDicomObject>, tag: Tag) -> Option<String> {
    obj?.element(tag).ok()?.to_str().ok().map(|v| v.into_owned())
}

fn destination_dir(root: &Utf8Path, structure: StorageStructure, decoded: Option<&InMemDicomObject>) -> Utf8PathBuf {
    match structure {
        StorageStructure::Flat => root.to_path_buf(),
        StorageStructure::Patient => {
            root.join(sanitize_path(element_str(decoded, tags::PATIENT_ID).unwrap_or_default()))
        }
        StorageStructure::Study => {
            root.join(sanitize_path(element_str(decoded, tags::STUDY_INSTANCE_UID).unwrap_or_default()))
        }
        StorageStructure::Series => root
            .join(sanitize_path(element_str(decoded, tags::PATIENT_ID).unwrap_or_default()))
            .join(sanitize_path(element_str(decoded, tags::STUDY_INSTANCE_UID).unwrap_or_default()))
            .join(sanitize_path(element_str(decoded, tags::SERIES_INSTANCE_UID).unwrap_or_default())),
        StorageStructure::Date => {
            let date8 = element_str(decoded, tags::STUDY_DATE).filter(|d| d.len() == 8).unwrap_or_else(|| {
                let now = OffsetDateTime::now_utc();
                format!("{:04}{:02}{:02}", now.year(), u8::from(now.month()), now.day())
            });
            root.join(&date8[0..4]).join(&date8[4..6]).join(&date8[6..8])
        }
    }
}

fn destination_filename(convention: FilenameConvention, sop_instance_uid: &str, decoded: Option<&InMemDicomObject>) -> String {
    match convention {
        FilenameConvention::SopUid => format!("{}.dcm", sanitize_path(sop_instance_uid)),
        FilenameConvention::InstanceNumber => {
            let n: i32 = element_str(decoded, tags::INSTANCE_NUMBER).and_then(|v| v.trim().parse().ok()).unwrap_or(0);
            format!("{n:04}.dcm")
        }
        FilenameConvention::Timestamp => {
            let now = OffsetDateTime::now_utc();
            format!(
                "{:04}{:02}{:02}_{:02}{:02}{:02}_{:06}.dcm",
                now.year(),
                u8::from(now.month()),
                now.day(),
                now.hour(),
                now.minute(),
                now.second(),
                now.microsecond(),
            )
        }
        FilenameConvention::Sequential => {
            let n = SEQUENTIAL_COUNTER.fetch_add(1, Ordering::Relaxed);
            format!("{n:08}.dcm")
        }
    }
}

/// Write a standards-compliant Part-10 file: 128-byte preamble, `DICM`
/// magic, file meta group, then `raw_dataset` verbatim — no decode/re-encode
/// of the dataset itself, per spec.md §4.10's optimization requirement.
fn write_stored_file(
    dest_path: &Utf8Path,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    ts: &TransferSyntax,
    raw_dataset: &[u8],
) -> Result<u64, String> {
    if let Some(parent) = dest_path.parent() {
        fs_err::create_dir_all(parent.as_std_path()).map_err(|e| e.to_string())?;
    }
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(ts.uid())
        .build()
        .map_err(|e| e.to_string())?;

    let mut file = fs_err::File::create(dest_path.as_std_path()).map_err(|e| e.to_string())?;
    file.write_all(&[0u8; 128]).map_err(|e| e.to_string())?;
    file.write_all(b"DICM").map_err(|e| e.to_string())?;
    meta.write(&mut file).map_err(|e| e.to_string())?;
    file.write_all(raw_dataset).map_err(|e| e.to_string())?;
    file.metadata().map(|m| m.len()).map_err(|e| e.to_string())
}

fn respond(
    association: &mut Assoc,
    pc_id: u8,
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> Result<(), AssociationError> {
    let response = command_response(message_id, sop_class_uid, sop_instance_uid, status);
    let mut data = Vec::with_capacity(128);
    response
        .write_dataset_with_ts(&mut data, &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|_| AssociationError::CannotRespond("failed to encode C-STORE-RSP"))?;
    association
        .send(&Pdu::PData {
            data: vec![PDataValue { presentation_context_id: pc_id, value_type: PDataValueType::Command, is_last: true, data }],
        })
        .map_err(|_| AssociationError::CannotRespond("failed to send C-STORE-RSP"))
}

fn command_response(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str, status: u16) -> FileDicomObject<InMemDicomObject> {
    FileDicomObject::from(InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, PrimitiveValue::from(sop_class_uid.to_string())),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(0x8001u16)),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, PrimitiveValue::from(message_id)),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(0x0101u16)),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_instance_uid.to_string())),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status)),
    ]))
}

struct StoreOutcome {
    status: TransactionStatus,
    file_path: Option<String>,
    file_size: Option<i64>,
    error: Option<String>,
}

#[allow(clippy::too_many_arguments)]
fn log_store(
    ctx: &ScpContext,
    calling_ae: &str,
    peer_ip: Option<IpAddr>,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    transfer_syntax: Option<&str>,
    start: Instant,
    outcome: StoreOutcome,
) {
    let duration_s = start.elapsed().as_secs_f64();
    let transfer_speed_mbps =
        outcome.file_size.filter(|_| duration_s > 0.0).map(|bytes| (bytes as f64 / 1_000_000.0) / duration_s);
    ctx.tx_log.enqueue(TransactionLogRow {
        transaction_type: TransactionType::CStore,
        status: outcome.status,
        calling_ae: Some(calling_ae.to_string()),
        called_ae: Some(ctx.config.ae_title.clone()),
        remote_ip: peer_ip.map(|ip| ip.to_string()),
        remote_port: None,
        patient_id: None,
        study_uid: None,
        series_uid: None,
        sop_instance_uid: Some(sop_instance_uid.to_string()),
        sop_class_uid: Some(sop_class_uid.to_string()),
        file_path: outcome.file_path,
        file_size: outcome.file_size,
        transfer_syntax: transfer_syntax.map(|s| s.to_string()),
        duration_s: Some(duration_s),
        transfer_speed_mbps,
        error: outcome.error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_filenames_are_unique() {
        let a = destination_filename(FilenameConvention::Sequential, "1.2.3", None);
        let b = destination_filename(FilenameConvention::Sequential, "1.2.3", None);
        assert_ne!(a, b);
    }

    #[test]
    fn sop_uid_filename_is_sanitized() {
        let name = destination_filename(FilenameConvention::SopUid, "1.2.840.10008", None);
        assert_eq!(name, "1.2.840.10008.dcm");
    }

    #[test]
    fn flat_layout_uses_root_directly() {
        let root = Utf8Path::new("/tmp/storage");
        let dir = destination_dir(root, StorageStructure::Flat, None);
        assert_eq!(dir, root);
    }
}
