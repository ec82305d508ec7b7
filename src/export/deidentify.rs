use crate::error::DrawClientError;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use std::collections::HashMap;

/// The deidentified identity this series' export must write into its
/// files, sourced entirely from catalog rows the ingest scanner already
/// populated (`Patient.deidentified_id`, `Study.deidentified_study_uid`,
/// `Series.deidentified_series_uid`/`deidentified_frame_of_reference_uid`,
/// `Instance.deidentified_sop_instance_uid`). Deidentification therefore
/// never mints its own UIDs: it applies values the catalog already holds,
/// so the mapping `reidentify` later needs back is already persisted, per
/// spec.md §4.5 step 1 ("persist the mapping in the catalog").
#[derive(Debug, Clone)]
pub struct UidMapping {
    pub deidentified_patient_id: String,
    pub deidentified_study_uid: String,
    pub deidentified_series_uid: String,
    pub deidentified_frame_of_reference_uid: Option<String>,
    /// original SOP Instance UID -> deidentified SOP Instance UID
    pub instance_uids: HashMap<String, String>,
}

pub struct DeidentifyOutcome {
    pub mapping: UidMapping,
    pub objects: Vec<InMemDicomObject>,
}

/// Rewrite a series' instances to carry `mapping`'s deidentified identity,
/// stripping plain-text demographics. Per spec.md §4.5 step 1.
pub fn deidentify_series(
    instances: Vec<InMemDicomObject>,
    mapping: &UidMapping,
) -> Result<DeidentifyOutcome, DrawClientError> {
    if instances.is_empty() {
        return Err(DrawClientError::DeidentificationFailed(
            "series has no instances".to_string(),
        ));
    }

    let mut objects = Vec::with_capacity(instances.len());

    for mut obj in instances {
        let original_sop = obj
            .element(tags::SOP_INSTANCE_UID)
            .map_err(|_| DrawClientError::MissingTag("SOPInstanceUID"))?
            .to_str()
            .map_err(|e| DrawClientError::DeidentificationFailed(e.to_string()))?
            .into_owned();
        let deidentified_sop = mapping.instance_uids.get(&original_sop).ok_or_else(|| {
            DrawClientError::DeidentificationFailed(format!(
                "no deidentified SOP Instance UID mapped for {original_sop}"
            ))
        })?;

        set_str(&mut obj, tags::PATIENT_ID, VR::LO, &mapping.deidentified_patient_id)?;
        set_str(&mut obj, tags::PATIENT_NAME, VR::PN, "ANONYMOUS")?;
        set_str(&mut obj, tags::PATIENT_BIRTH_DATE, VR::DA, "")?;
        set_str(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, &mapping.deidentified_study_uid)?;
        set_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, &mapping.deidentified_series_uid)?;
        set_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, deidentified_sop)?;
        if let Some(for_uid) = &mapping.deidentified_frame_of_reference_uid {
            set_str(&mut obj, tags::FRAME_OF_REFERENCE_UID, VR::UI, for_uid).ok();
        }

        objects.push(obj);
    }

    Ok(DeidentifyOutcome {
        mapping: mapping.clone(),
        objects,
    })
}

fn set_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) -> Result<(), DrawClientError> {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value.to_string())));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> UidMapping {
        UidMapping {
            deidentified_patient_id: "deid-patient".to_string(),
            deidentified_study_uid: "2.25.1".to_string(),
            deidentified_series_uid: "2.25.2".to_string(),
            deidentified_frame_of_reference_uid: Some("2.25.3".to_string()),
            instance_uids: HashMap::new(),
        }
    }

    #[test]
    fn test_deidentify_empty_series_fails() {
        let result = deidentify_series(Vec::new(), &mapping());
        assert!(result.is_err());
    }
}
