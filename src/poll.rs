//! Periodically polls remote task status, refreshes the bearer token when
//! expired, downloads RT Structures, verifies checksum + modality +
//! referenced-series UID, stores the import record. Per spec.md §4.7.

use crate::catalog::{CatalogRepo, ExportRecord, ProcessingStatus, TransferStatus};
use crate::dicom_adapter;
use crate::error::{DrawClientError, StageOutcome};
use crate::http_client::{RemoteSegmentationClient, NOTIFY_SUCCESS_SUBSTRING};
use crate::token::TokenManager;
use camino::Utf8Path;
use sha2::{Digest, Sha256};
use time::{format_description, OffsetDateTime};

const TERMINAL_STATUSES: &[&str] = &["Delivered to Client", "Transfer Completed"];

pub async fn poll_export(
    repo: &CatalogRepo,
    tokens: &TokenManager,
    client: &RemoteSegmentationClient,
    export: &ExportRecord,
    series_root: &Utf8Path,
) -> StageOutcome<()> {
    if export
        .server_segmentation_status
        .as_deref()
        .is_some_and(|s| TERMINAL_STATUSES.contains(&s))
    {
        return StageOutcome::SkippedStable;
    }

    match run(repo, tokens, client, export, series_root).await {
        Ok(()) => StageOutcome::Success(()),
        Err(e @ DrawClientError::NetworkTransient(_)) => StageOutcome::RetryableFailure(e),
        Err(e) => StageOutcome::TerminalFailure(e),
    }
}

async fn run(
    repo: &CatalogRepo,
    tokens: &TokenManager,
    client: &RemoteSegmentationClient,
    export: &ExportRecord,
    series_root: &Utf8Path,
) -> Result<(), DrawClientError> {
    let task_id = export
        .server_task_id
        .as_deref()
        .ok_or_else(|| DrawClientError::ConfigurationMissing("export has no server_task_id".to_string()))?;

    // (a) status.
    let status = tokens.call_with_401_retry(|token| client.status(&token, task_id)).await?;
    repo.update_export_server_status(export.id, &status.status).await?;

    if status.status != "SEGMENTATION COMPLETED" {
        return Ok(());
    }

    // (a-b) download.
    let download = tokens.call_with_401_retry(|token| client.download(&token, task_id)).await?;

    let now = OffsetDateTime::now_utc();
    let fmt = format_description::parse("[year][month][day]_[hour][minute][second]").unwrap();
    let ts = now.format(&fmt).unwrap();
    let dest_dir = series_root.join("downloaded_rtstruct");
    fs_err::create_dir_all(dest_dir.as_std_path())?;
    let dest_path = dest_dir.join(format!("rtstruct_{task_id}_{ts}.dcm"));
    fs_err::write(dest_path.as_std_path(), &download.bytes)?;

    // (c) checksum.
    let mut hasher = Sha256::new();
    hasher.update(&download.bytes);
    let actual_checksum = format!("{:x}", hasher.finalize());
    if let Some(expected) = &download.checksum_header {
        if !expected.eq_ignore_ascii_case(&actual_checksum) {
            fs_err::remove_file(dest_path.as_std_path())?;
            repo.mark_export_transfer_status(export.id, TransferStatus::ChecksumMatchFailed)
                .await?;
            repo.transition_series(export.series_id, ProcessingStatus::InvalidRtstructureReceived)
                .await?;
            return Err(DrawClientError::IntegrityFailure {
                expected: expected.clone(),
                actual: actual_checksum,
            });
        }
    }

    // (d) parse + modality check.
    let obj = match dicom_adapter::read_metadata(dest_path.as_std_path()) {
        Ok(obj) => obj,
        Err(e) => {
            fs_err::remove_file(dest_path.as_std_path())?;
            repo.mark_export_transfer_status(export.id, TransferStatus::InvalidRtstructFile)
                .await?;
            repo.transition_series(export.series_id, ProcessingStatus::InvalidRtstructureReceived)
                .await?;
            return Err(e);
        }
    };
    let inner = obj.clone().into_inner();
    if dicom_adapter::modality(&inner).as_deref() != Some("RTSTRUCT") {
        fs_err::remove_file(dest_path.as_std_path())?;
        repo.mark_export_transfer_status(export.id, TransferStatus::InvalidRtstructFile)
            .await?;
        repo.transition_series(export.series_id, ProcessingStatus::InvalidRtstructureReceived)
            .await?;
        return Err(DrawClientError::FormatInvalid("Modality != RTSTRUCT".to_string()));
    }

    // (e) referenced series UID cross-check: if present, it MUST equal the
    // deidentified series UID this export was created for.
    if let Some(uid) = dicom_adapter::find_referenced_series_instance_uid(&inner) {
        let series = repo.series_by_id(export.series_id).await?;
        if uid != series.deidentified_series_uid {
            fs_err::remove_file(dest_path.as_std_path())?;
            repo.mark_export_transfer_status(export.id, TransferStatus::InvalidRtstructFile)
                .await?;
            repo.transition_series(export.series_id, ProcessingStatus::InvalidRtstructureReceived)
                .await?;
            return Err(DrawClientError::FormatInvalid(format!(
                "Referenced Series Instance UID {uid} does not match export's deidentified series UID"
            )));
        }
    }

    // (f) import row.
    repo.insert_import_record(export.series_id, &dest_path, &actual_checksum).await?;

    // (g) notify.
    let timestamp = now
        .format(&time::format_description::well_known::Iso8601::DEFAULT)
        .unwrap();
    let notify_body = tokens
        .call_with_401_retry(|token| client.notify(&token, task_id, "received", &timestamp))
        .await?;
    if !notify_body.contains(NOTIFY_SUCCESS_SUBSTRING) {
        // Next poll retries idempotently; the Import row already exists.
        return Ok(());
    }

    // (h) advance statuses.
    repo.mark_export_rtstruct_received(export.id).await?;
    repo.transition_series(export.series_id, ProcessingStatus::RtstructureReceived)
        .await?;

    Ok(())
}
