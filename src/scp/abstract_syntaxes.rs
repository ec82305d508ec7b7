//! SOP classes the SCP negotiates, per spec.md §4.10 "Presentation
//! contexts": CT, MR, RT Structure, RT Plan, RT Dose, Secondary Capture,
//! plus Verification (C-ECHO) and the Study Root Query/Retrieve models for
//! C-FIND/C-MOVE/C-GET.

use dicom::dictionary_std::uids;

pub const STORAGE_ABSTRACT_SYNTAXES: &[&str] = &[
    uids::CT_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::RT_STRUCTURE_SET_STORAGE,
    uids::RT_PLAN_STORAGE,
    uids::RT_DOSE_STORAGE,
    uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
];

pub const QUERY_RETRIEVE_ABSTRACT_SYNTAXES: &[&str] = &[
    uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
    uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
    uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
];

pub const VERIFICATION_ABSTRACT_SYNTAX: &str = uids::VERIFICATION;
