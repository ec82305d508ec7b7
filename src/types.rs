//! Newtype wrappers for identifiers that should not be confused with plain
//! strings.

use aliri_braid::braid;

/// DICOM Application Entity title, 1..16 chars of `[A-Z0-9_-]`.
#[braid(serde)]
pub struct AeTitle;

/// Opaque hospital patient identifier (`Patient.patient_id`).
#[braid(serde)]
pub struct PatientId;

/// A DICOM UID (Study/Series/SOP Instance/Frame of Reference), either
/// original or deidentified depending on context.
#[braid(serde)]
pub struct DicomUid;

/// Identifier handed back by the remote auto-segmentation service for one
/// export/poll cycle.
#[braid(serde)]
pub struct TaskId;

impl AeTitle {
    pub fn is_valid(s: &str) -> bool {
        !s.is_empty()
            && s.len() <= 16
            && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '-')
    }
}

/// Mint a fresh DICOM-legal UID under the UUID-derived root `2.25.<u128>`,
/// the standard convention for allocating UIDs without a registered root.
/// Used for every deidentified Study/Series/SOP Instance/Frame-of-Reference
/// UID the catalog assigns, so values later written into a `UI`-VR element
/// always pass `vr::validate_literal`.
pub fn mint_uid() -> String {
    format!("2.25.{}", uuid::Uuid::new_v4().as_u128())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ae_title_validation() {
        assert!(AeTitle::is_valid("CHAVI_SCP"));
        assert!(!AeTitle::is_valid(""));
        assert!(!AeTitle::is_valid("lowercase"));
        assert!(!AeTitle::is_valid(&"A".repeat(17)));
    }
}
