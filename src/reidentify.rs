//! Rewrites a returned RT Structure's UIDs and demographics back to their
//! original values, writes the final `.dcm` next to the source series, and
//! records the VOI names it contains.

use crate::catalog::{CatalogRepo, Patient, ProcessingStatus, Study};
use crate::dicom_adapter;
use crate::error::{DrawClientError, StageOutcome};
use crate::sanitize::sanitize_patient_id;
use camino::{Utf8Path, Utf8PathBuf};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use std::collections::HashMap;
use time::{format_description, OffsetDateTime};

/// Tags whose value is replaced by the catalog's original Frame-of-Reference
/// UID rather than looked up in the UID map, since the remote service mints
/// its own during deidentification.
const FRAME_OF_REFERENCE_TAGS: &[Tag] = &[tags::FRAME_OF_REFERENCE_UID, Tag(0x3006, 0x0024)];

/// Tags substituted via the deidentified-to-original UID map built from the
/// instances, series, and study that produced this export.
const UID_MAP_TAGS: &[Tag] = &[Tag(0x0008, 0x1155), tags::SERIES_INSTANCE_UID];

/// Reidentify the most recently received RT Structure for `series_id`,
/// writing the result into the series' own root folder.
pub async fn run_reidentify(repo: &CatalogRepo, series_id: i64) -> StageOutcome<Utf8PathBuf> {
    match run(repo, series_id).await {
        Ok(path) => StageOutcome::Success(path),
        Err(e) => {
            let _ = repo
                .transition_series(series_id, ProcessingStatus::RtstructureExportFailed)
                .await;
            StageOutcome::TerminalFailure(e)
        }
    }
}

async fn run(repo: &CatalogRepo, series_id: i64) -> Result<Utf8PathBuf, DrawClientError> {
    let import = repo
        .latest_import_for_series(series_id)
        .await?
        .ok_or_else(|| DrawClientError::ReidentificationFailed("no import record for series".to_string()))?;
    let downloaded_path = Utf8Path::new(&import.downloaded_path);

    let obj = dicom_adapter::read_metadata(downloaded_path.as_std_path())?;
    let mut inner = obj.into_inner();

    let series = repo.series_by_id(series_id).await?;
    let patient = repo.patient_for_series(series_id).await?;
    let study = repo.study_for_series(series_id).await?;
    let instances = repo.instances_for_series(series_id).await?;

    rewrite_demographics(&mut inner, &patient, &study);

    let mut uid_map: HashMap<String, String> = HashMap::new();
    for instance in &instances {
        uid_map.insert(
            instance.deidentified_sop_instance_uid.clone(),
            instance.sop_instance_uid.clone(),
        );
    }
    uid_map.insert(series.deidentified_series_uid.clone(), series.series_uid.clone());
    uid_map.insert(study.deidentified_study_uid.clone(), study.study_uid.clone());

    let frame_of_reference_original = series.frame_of_reference_uid.clone().unwrap_or_default();
    rewrite_dataset(&mut inner, &uid_map, &frame_of_reference_original);

    let sanitized = sanitize_patient_id(&patient.patient_id);
    let now = OffsetDateTime::now_utc();
    let fmt = format_description::parse("[year][month][day]_[hour][minute][second]").unwrap();
    let ts = now.format(&fmt).unwrap();
    let output_path = Utf8Path::new(&series.root_path).join(format!("RS_{sanitized}_DRAW_{ts}.dcm"));

    let file_meta = dicom::object::FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(
            inner
                .element(tags::SOP_CLASS_UID)
                .map_err(|_| DrawClientError::MissingTag("SOPClassUID"))?
                .to_str()
                .map_err(|e| DrawClientError::ReidentificationFailed(e.to_string()))?,
        )
        .media_storage_sop_instance_uid(
            inner
                .element(tags::SOP_INSTANCE_UID)
                .map_err(|_| DrawClientError::MissingTag("SOPInstanceUID"))?
                .to_str()
                .map_err(|e| DrawClientError::ReidentificationFailed(e.to_string()))?,
        )
        .transfer_syntax(dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN.uid())
        .build()
        .map_err(|e| DrawClientError::ReidentificationFailed(e.to_string()))?;
    let file_obj = inner.clone().with_exact_meta(file_meta);
    dicom_adapter::write_file(&file_obj, output_path.as_std_path())?;

    repo.set_reidentified(import.id, &output_path).await?;
    repo.transition_series(series_id, ProcessingStatus::RtstructureExported)
        .await?;

    for name in dicom_adapter::enumerate_roi_names(&inner) {
        repo.insert_voi(import.id, &name).await?;
    }

    fs_err::remove_file(downloaded_path.as_std_path())?;

    Ok(output_path)
}

fn rewrite_demographics(obj: &mut InMemDicomObject, patient: &Patient, study: &Study) {
    set_str(obj, tags::PATIENT_ID, VR::LO, &patient.patient_id);
    if let Some(name) = &patient.name {
        set_str(obj, tags::PATIENT_NAME, VR::PN, name);
    }
    if let Some(dob) = &patient.dob {
        set_str(obj, tags::PATIENT_BIRTH_DATE, VR::DA, dob);
    }
    if let Some(sex) = &patient.sex {
        set_str(obj, tags::PATIENT_SEX, VR::CS, sex);
    }
    set_str(obj, tags::STUDY_INSTANCE_UID, VR::UI, &study.study_uid);
    if let Some(desc) = &study.description {
        set_str(obj, tags::STUDY_DESCRIPTION, VR::LO, desc);
    }
    if let Some(date) = &study.study_date {
        set_str(obj, tags::STUDY_DATE, VR::DA, date);
    }
    // Fixed values for the returning clinical-review workflow, not sourced
    // from the original dataset.
    set_str(obj, tags::REFERRING_PHYSICIAN_NAME, VR::PN, "DRAW");
    set_str(obj, tags::ACCESSION_NUMBER, VR::SH, "202514789");
}

fn set_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value.to_string())));
}

/// Recursively walks every data element, including sequence items,
/// substituting Frame-of-Reference and UID-map tag values in place.
/// Unmapped UID-map tag values are left untouched and logged.
fn rewrite_dataset(obj: &mut InMemDicomObject, uid_map: &HashMap<String, String>, frame_of_reference_original: &str) {
    let tags_present: Vec<Tag> = obj.iter().map(|e| e.header().tag).collect();
    for tag in tags_present {
        if FRAME_OF_REFERENCE_TAGS.contains(&tag) {
            if let Ok(elem) = obj.element(tag) {
                if elem.to_str().is_ok() {
                    obj.put(DataElement::new(
                        tag,
                        elem.vr(),
                        PrimitiveValue::from(frame_of_reference_original.to_string()),
                    ));
                }
            }
        } else if UID_MAP_TAGS.contains(&tag) {
            if let Ok(elem) = obj.element(tag) {
                if let Ok(current) = elem.to_str() {
                    if let Some(original) = uid_map.get(current.as_ref()) {
                        obj.put(DataElement::new(tag, elem.vr(), PrimitiveValue::from(original.clone())));
                    } else {
                        tracing::warn!(tag = %tag, "no reidentification mapping for UID");
                    }
                }
            }
        } else if let Ok(elem) = obj.element(tag) {
            if dicom_adapter::is_sequence(elem.vr()) {
                if let Some(items) = elem.items() {
                    let mut items = items.clone();
                    for item in items.iter_mut() {
                        rewrite_dataset(item, uid_map, frame_of_reference_original);
                    }
                    obj.put(DataElement::new(
                        tag,
                        VR::SQ,
                        dicom::core::Value::Sequence(dicom::core::value::DataSetSequence::from(items)),
                    ));
                }
            }
        }
    }
}
