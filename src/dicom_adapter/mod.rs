//! Read/write DICOM files, enumerate tags, build the representative-instance
//! tag map, and extract ROI names from an RT Structure. Per spec.md §2 "B.
//! DICOM library adapter".
//!
//! Built directly on `dicom-object`/`dicom-core`.

use crate::error::DrawClientError;
use crate::rules::TagMap;
use dicom::core::header::Header;
use dicom::core::{Tag, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::{open_file, DefaultDicomObject, FileDicomObject, InMemDicomObject};
use std::path::Path;

/// Read a DICOM file without pixel data where possible; metadata-only
/// consumers (ingest scanner, rule engine) never need pixels.
pub fn read_metadata<P: AsRef<Path>>(path: P) -> Result<DefaultDicomObject, DrawClientError> {
    let obj = open_file(path.as_ref())?;
    Ok(obj)
}

/// Read a tag's string representation as both the canonical tag alias (if
/// one is known to the standard dictionary) and the `(gggg,eeee)` form,
/// inserting both into `tags`, per spec.md §4.2 "Representative instance".
fn insert_tag_value(tags_map: &mut TagMap, obj: &InMemDicomObject, tag: Tag, alias: Option<&str>) {
    if let Ok(elem) = obj.element(tag) {
        if let Ok(value) = elem.to_str() {
            let value = value.into_owned();
            let group_elem_key = format!("({:04X},{:04X})", tag.group(), tag.element());
            if let Some(name) = alias {
                tags_map.insert(name.to_string(), value.clone());
            }
            tags_map.insert(group_elem_key, value);
        }
    }
}

/// Build the tag→value map for the representative instance of a series
/// (the first-by-file-path instance), per spec.md §4.2.
pub fn representative_tag_map(obj: &InMemDicomObject) -> TagMap {
    let mut map = TagMap::new();
    let wanted: &[(Tag, &str)] = &[
        (tags::MODALITY, "Modality"),
        (tags::BODY_PART_EXAMINED, "BodyPartExamined"),
        (tags::SLICE_THICKNESS, "SliceThickness"),
        (tags::PROTOCOL_NAME, "ProtocolName"),
        (tags::STUDY_DESCRIPTION, "StudyDescription"),
        (tags::SERIES_DESCRIPTION, "SeriesDescription"),
        (tags::PATIENT_ID, "PatientID"),
        (tags::PATIENT_NAME, "PatientName"),
        (tags::PATIENT_BIRTH_DATE, "PatientBirthDate"),
        (tags::PATIENT_SEX, "PatientSex"),
        (tags::STUDY_INSTANCE_UID, "StudyInstanceUID"),
        (tags::SERIES_INSTANCE_UID, "SeriesInstanceUID"),
        (tags::SOP_INSTANCE_UID, "SOPInstanceUID"),
        (tags::ACCESSION_NUMBER, "AccessionNumber"),
        (tags::STUDY_DATE, "StudyDate"),
    ];
    for (tag, alias) in wanted {
        insert_tag_value(&mut map, obj, *tag, Some(alias));
    }
    map
}

/// Walk (0x3006,0x0010) SSROIContourSequence → ... down to the Referenced
/// Series Instance UID, per spec.md §4.7 step (e).
pub fn find_referenced_series_instance_uid(obj: &InMemDicomObject) -> Option<String> {
    let referenced_frame_of_ref_seq = obj.element(tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE).ok()?;
    let items = referenced_frame_of_ref_seq.items()?;
    for item in items {
        let Ok(study_seq) = item.element(tags::RT_REFERENCED_STUDY_SEQUENCE) else {
            continue;
        };
        let Some(study_items) = study_seq.items() else {
            continue;
        };
        for study_item in study_items {
            let Ok(series_seq) = study_item.element(tags::RT_REFERENCED_SERIES_SEQUENCE) else {
                continue;
            };
            let Some(series_items) = series_seq.items() else {
                continue;
            };
            for series_item in series_items {
                if let Ok(elem) = series_item.element(tags::SERIES_INSTANCE_UID) {
                    if let Ok(v) = elem.to_str() {
                        return Some(v.into_owned());
                    }
                }
            }
        }
    }
    None
}

/// Enumerate `StructureSetROISequence` ROI names, per spec.md §4.8 step 6.
pub fn enumerate_roi_names(obj: &InMemDicomObject) -> Vec<String> {
    let Ok(seq) = obj.element(tags::STRUCTURE_SET_ROI_SEQUENCE) else {
        return Vec::new();
    };
    let Some(items) = seq.items() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| item.element(tags::ROI_NAME).ok())
        .filter_map(|elem| elem.to_str().ok())
        .map(|v| v.into_owned())
        .collect()
}

pub fn modality(obj: &InMemDicomObject) -> Option<String> {
    obj.element(tags::MODALITY)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|v| v.into_owned())
}

/// Write an in-memory DICOM object to a Part-10 file, creating parent
/// directories as needed.
pub fn write_file<P: AsRef<Path>>(
    obj: &FileDicomObject<InMemDicomObject<StandardDataDictionary>>,
    path: P,
) -> Result<(), DrawClientError> {
    if let Some(parent) = path.as_ref().parent() {
        fs_err::create_dir_all(parent)?;
    }
    obj.write_to_file(path.as_ref())?;
    Ok(())
}

/// Is this tag's VR a candidate for DICOM VR `VR::SQ` nested dataset walk?
pub fn is_sequence(vr: VR) -> bool {
    vr == VR::SQ
}
