use crate::catalog::CatalogRepo;
use crate::dicom_adapter;
use crate::error::DrawClientError;
use crate::types::mint_uid;
use camino::Utf8Path;
use dicom::dictionary_std::tags;
use std::collections::HashMap;
use std::time::SystemTime;
use time::OffsetDateTime;
use uuid::Uuid;
use walkdir::WalkDir;

/// Per-series bookkeeping carried between two consecutive scanner passes, to
/// decide stability without in-memory state surviving a restart (the
/// snapshot itself is what would be persisted on the `Series` row in a full
/// deployment; here it is threaded through the caller for one run).
#[derive(Debug, Clone, Default)]
pub struct SeriesSnapshot {
    pub instance_count: u64,
    pub max_mtime: Option<SystemTime>,
}

pub struct ScanOutcome {
    pub files_seen: u64,
    pub errors: u64,
    pub snapshots: HashMap<String, SeriesSnapshot>,
}

/// Run one ingest pass, per spec.md §4.3.
pub async fn scan_once(
    repo: &CatalogRepo,
    ingest_root: &Utf8Path,
    pull_start: OffsetDateTime,
    study_date_based_filtering: bool,
    previous: &HashMap<String, SeriesSnapshot>,
    scan_interval_elapsed: bool,
) -> Result<ScanOutcome, DrawClientError> {
    let mut files_seen = 0u64;
    let mut errors = 0u64;
    let mut snapshots: HashMap<String, SeriesSnapshot> = HashMap::new();

    for entry in WalkDir::new(ingest_root.as_std_path())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let mtime = entry.metadata().ok().and_then(|m| m.modified().ok());

        if !study_date_based_filtering {
            if let Some(mtime) = mtime {
                let mtime_odt: OffsetDateTime = mtime.into();
                if mtime_odt < pull_start {
                    continue;
                }
            }
        }

        let obj = match dicom_adapter::read_metadata(path) {
            Ok(obj) => obj,
            Err(_) => {
                errors += 1;
                continue;
            }
        };
        files_seen += 1;

        let Ok(study_date_elem) = obj.element(tags::STUDY_DATE) else {
            errors += 1;
            continue;
        };
        if study_date_based_filtering {
            if let Ok(study_date) = study_date_elem.to_str() {
                if study_date.as_ref() < pull_start.date().to_string().replace('-', "").as_str() {
                    continue;
                }
            }
        }

        let (Ok(patient_id), Ok(study_uid), Ok(series_uid), Ok(sop_instance_uid)) = (
            obj.element(tags::PATIENT_ID).and_then(|e| e.to_str().map(|v| v.into_owned())),
            obj.element(tags::STUDY_INSTANCE_UID).and_then(|e| e.to_str().map(|v| v.into_owned())),
            obj.element(tags::SERIES_INSTANCE_UID).and_then(|e| e.to_str().map(|v| v.into_owned())),
            obj.element(tags::SOP_INSTANCE_UID).and_then(|e| e.to_str().map(|v| v.into_owned())),
        ) else {
            errors += 1;
            continue;
        };

        let root_path = path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();

        let deidentified_id = Uuid::new_v4().to_string();
        let patient_row = repo.upsert_patient(&patient_id, &deidentified_id).await?;
        let study_row = repo.upsert_study(patient_row, &study_uid, &mint_uid()).await?;
        let series_row = repo
            .upsert_series(study_row, &series_uid, &mint_uid(), &root_path)
            .await?;
        repo.upsert_instance(series_row, &sop_instance_uid, &mint_uid(), &path.to_string_lossy())
            .await?;

        // Frame of Reference UID isn't present on every modality (e.g. some
        // Secondary Capture instances); `set_series_frame_of_reference` is a
        // coalescing update so only the first instance to carry one wins,
        // per spec.md §4.8's reidentification walk which substitutes it.
        if let Ok(for_uid) = obj.element(tags::FRAME_OF_REFERENCE_UID).and_then(|e| e.to_str()) {
            let for_uid = for_uid.into_owned();
            if !for_uid.is_empty() {
                repo.set_series_frame_of_reference(series_row, &for_uid, &mint_uid()).await?;
            }
        }

        let snapshot = snapshots.entry(series_uid.clone()).or_default();
        snapshot.instance_count += 1;
        snapshot.max_mtime = match (snapshot.max_mtime, mtime) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        if scan_interval_elapsed {
            if let Some(prev) = previous.get(&series_uid) {
                if prev.instance_count == snapshot.instance_count && prev.max_mtime == snapshot.max_mtime {
                    repo.mark_fully_read(series_row, snapshot.instance_count as i64).await?;
                }
            }
        }
    }

    Ok(ScanOutcome {
        files_seen,
        errors,
        snapshots,
    })
}
