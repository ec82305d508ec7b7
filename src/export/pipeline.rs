use super::deidentify::{deidentify_series, UidMapping};
use crate::catalog::{CatalogRepo, ProcessingStatus};
use crate::dicom_adapter;
use crate::error::{DrawClientError, StageOutcome};
use crate::http_client::RemoteSegmentationClient;
use crate::token::TokenManager;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Run the export pipeline for one `RULE_MATCHED` series, per spec.md §4.5.
///
/// `instance_paths` are the on-disk source files for the series, read in
/// file-path order; `staging_dir` is a scratch directory for the
/// deidentified `.dcm` set and its zip archive.
pub async fn run_export_for_series(
    repo: &CatalogRepo,
    tokens: &TokenManager,
    client: &RemoteSegmentationClient,
    series_id: i64,
    instance_paths: &[String],
    staging_dir: &camino::Utf8Path,
) -> StageOutcome<String> {
    match run(repo, tokens, client, series_id, instance_paths, staging_dir).await {
        Ok(task_id) => StageOutcome::Success(task_id),
        Err(e @ DrawClientError::NetworkTransient(_)) => StageOutcome::RetryableFailure(e),
        Err(e) => StageOutcome::TerminalFailure(e),
    }
}

async fn run(
    repo: &CatalogRepo,
    tokens: &TokenManager,
    client: &RemoteSegmentationClient,
    series_id: i64,
    instance_paths: &[String],
    staging_dir: &camino::Utf8Path,
) -> Result<String, DrawClientError> {
    // Step 1: deidentify, applying the identity the ingest scanner already
    // assigned and persisted on the catalog rows rather than minting a
    // second, disconnected one here (poll.rs and reidentify.rs both key off
    // the catalog's `deidentified_*` columns). A failure here leaves the
    // series in `RuleMatched`, whose only valid failure edge is
    // `DeidentificationFailed`.
    if let Err(e) = stage_deidentified(repo, series_id, instance_paths, staging_dir).await {
        repo.transition_series(series_id, ProcessingStatus::DeidentificationFailed)
            .await?;
        return Err(e);
    }
    repo.transition_series(series_id, ProcessingStatus::DeidentifiedSuccessfully)
        .await?;

    // The series advances to `PendingTransferToDrawServer` before zipping and
    // uploading start, so every failure downstream of this point has a valid
    // edge to `FailedTransferToDrawServer`.
    repo.transition_series(series_id, ProcessingStatus::PendingTransferToDrawServer)
        .await?;
    match transfer_to_server(repo, tokens, client, series_id, staging_dir).await {
        Ok(task_id) => {
            repo.transition_series(series_id, ProcessingStatus::SentToDrawServer)
                .await?;
            Ok(task_id)
        }
        Err(e) => {
            repo.transition_series(series_id, ProcessingStatus::FailedTransferToDrawServer)
                .await?;
            Err(e)
        }
    }
}

async fn stage_deidentified(
    repo: &CatalogRepo,
    series_id: i64,
    instance_paths: &[String],
    staging_dir: &camino::Utf8Path,
) -> Result<(), DrawClientError> {
    let objects: Result<Vec<_>, _> = instance_paths
        .iter()
        .map(dicom_adapter::read_metadata)
        .collect();
    let objects = objects?.into_iter().map(|o| o.into_inner()).collect();

    let patient = repo.patient_for_series(series_id).await?;
    let study = repo.study_for_series(series_id).await?;
    let series = repo.series_by_id(series_id).await?;
    let instances = repo.instances_for_series(series_id).await?;
    let instance_uids: HashMap<String, String> = instances
        .into_iter()
        .map(|i| (i.sop_instance_uid, i.deidentified_sop_instance_uid))
        .collect();
    let mapping = UidMapping {
        deidentified_patient_id: patient.deidentified_id,
        deidentified_study_uid: study.deidentified_study_uid,
        deidentified_series_uid: series.deidentified_series_uid,
        deidentified_frame_of_reference_uid: series.deidentified_frame_of_reference_uid,
        instance_uids,
    };
    let outcome = deidentify_series(objects, &mapping)
        .map_err(|e| DrawClientError::DeidentificationFailed(e.to_string()))?;

    fs_err::create_dir_all(staging_dir.as_std_path())?;
    for (i, obj) in outcome.objects.iter().enumerate() {
        let path = staging_dir.join(format!("{i:06}.dcm"));
        let file_meta = dicom::object::FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(
                obj.element(dicom::dictionary_std::tags::SOP_CLASS_UID)
                    .map_err(|_| DrawClientError::MissingTag("SOPClassUID"))?
                    .to_str()
                    .map_err(|e| DrawClientError::DeidentificationFailed(e.to_string()))?,
            )
            .media_storage_sop_instance_uid(
                obj.element(dicom::dictionary_std::tags::SOP_INSTANCE_UID)
                    .map_err(|_| DrawClientError::MissingTag("SOPInstanceUID"))?
                    .to_str()
                    .map_err(|e| DrawClientError::DeidentificationFailed(e.to_string()))?,
            )
            .transfer_syntax(dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN.uid())
            .build()
            .map_err(|e| DrawClientError::DeidentificationFailed(e.to_string()))?;
        let file_obj = obj.clone().with_exact_meta(file_meta);
        dicom_adapter::write_file(&file_obj, &path)?;
    }
    Ok(())
}

async fn transfer_to_server(
    repo: &CatalogRepo,
    tokens: &TokenManager,
    client: &RemoteSegmentationClient,
    series_id: i64,
    staging_dir: &camino::Utf8Path,
) -> Result<String, DrawClientError> {
    // Step 2: zip + checksum.
    let zip_path = staging_dir.with_extension("zip");
    let zip_bytes = zip_directory(staging_dir)?;
    let mut hasher = Sha256::new();
    hasher.update(&zip_bytes);
    let zip_sha256 = format!("{:x}", hasher.finalize());
    fs_err::write(zip_path.as_std_path(), &zip_bytes)?;

    let export_id = repo
        .insert_export_record(series_id, zip_path.as_str(), &zip_sha256)
        .await?;

    // Step 3: upload.
    let upload_result = tokens
        .call_with_401_retry(|token| client.upload(&token, zip_bytes.clone(), &zip_sha256))
        .await;
    let response = match upload_result {
        Ok(r) => r,
        Err(e) => {
            repo.mark_export_failed(export_id).await?;
            return Err(e);
        }
    };

    repo.mark_export_uploaded(export_id, &response.task_id).await?;
    Ok(response.task_id)
}

fn zip_directory(dir: &camino::Utf8Path) -> Result<Vec<u8>, DrawClientError> {
    let mut buffer = Vec::new();
    {
        let cursor = std::io::Cursor::new(&mut buffer);
        let mut writer = ZipWriter::new(cursor);
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for entry in fs_err::read_dir(dir.as_std_path())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            writer
                .start_file(name, options)
                .map_err(|e| DrawClientError::DeidentificationFailed(e.to_string()))?;
            let contents = fs_err::read(entry.path())?;
            writer.write_all(&contents)?;
        }
        writer
            .finish()
            .map_err(|e| DrawClientError::DeidentificationFailed(e.to_string()))?;
    }
    Ok(buffer)
}
