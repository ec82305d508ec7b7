#![allow(non_snake_case)]
//! Row types for every entity in spec.md §3.

use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "processing_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Unprocessed,
    RuleMatched,
    RuleNotMatched,
    MultipleRulesMatched,
    DeidentifiedSuccessfully,
    DeidentificationFailed,
    PendingTransferToDrawServer,
    SentToDrawServer,
    FailedTransferToDrawServer,
    RtstructureReceived,
    InvalidRtstructureReceived,
    RtstructureExported,
    RtstructureExportFailed,
}

impl ProcessingStatus {
    /// The DAG of spec.md §4.4: which states this one may transition into.
    /// `Unprocessed` is reachable from every terminal failure state via an
    /// explicit operator `RETRY`, modeled here as an always-allowed edge.
    pub fn allowed_next(self) -> &'static [ProcessingStatus] {
        use ProcessingStatus::*;
        match self {
            Unprocessed => &[RuleMatched, RuleNotMatched, MultipleRulesMatched],
            RuleMatched | MultipleRulesMatched => &[DeidentifiedSuccessfully, DeidentificationFailed],
            DeidentifiedSuccessfully => &[PendingTransferToDrawServer],
            PendingTransferToDrawServer => &[SentToDrawServer, FailedTransferToDrawServer],
            SentToDrawServer => &[RtstructureReceived, InvalidRtstructureReceived],
            RtstructureReceived => &[RtstructureExported, RtstructureExportFailed],
            RuleNotMatched | DeidentificationFailed | FailedTransferToDrawServer
            | InvalidRtstructureReceived | RtstructureExportFailed | RtstructureExported => &[],
        }
    }

    pub fn is_retryable_failure(self) -> bool {
        use ProcessingStatus::*;
        matches!(
            self,
            DeidentificationFailed
                | FailedTransferToDrawServer
                | InvalidRtstructureReceived
                | RtstructureExportFailed
        )
    }

    pub fn transition(self, next: ProcessingStatus) -> Result<ProcessingStatus, InvalidTransition> {
        if self.allowed_next().contains(&next) || (self.is_retryable_failure() && next == ProcessingStatus::Unprocessed) {
            Ok(next)
        } else {
            Err(InvalidTransition { from: self, to: next })
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("invalid processing status transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ProcessingStatus,
    pub to: ProcessingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "transfer_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
    ChecksumMatchFailed,
    InvalidRtstructFile,
    RtstructReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "transaction_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    CEcho,
    CStore,
    CFind,
    CMove,
    CGet,
    Association,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "transaction_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Success,
    Failure,
    Rejected,
    Timeout,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "storage_structure", rename_all = "lowercase")]
pub enum StorageStructure {
    Flat,
    Patient,
    Study,
    Series,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "filename_convention", rename_all = "snake_case")]
pub enum FilenameConvention {
    SopUid,
    InstanceNumber,
    Timestamp,
    Sequential,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Patient {
    pub id: i64,
    pub patient_id: String,
    pub deidentified_id: String,
    pub name: Option<String>,
    pub sex: Option<String>,
    pub dob: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Study {
    pub id: i64,
    pub patient_id: i64,
    pub study_uid: String,
    pub deidentified_study_uid: String,
    pub study_date: Option<String>,
    pub description: Option<String>,
    pub modality: Option<String>,
    pub accession: Option<String>,
    pub study_id: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Series {
    pub id: i64,
    pub study_id: i64,
    pub series_uid: String,
    pub deidentified_series_uid: String,
    pub frame_of_reference_uid: Option<String>,
    pub deidentified_frame_of_reference_uid: Option<String>,
    pub root_path: String,
    pub description: Option<String>,
    pub date: Option<String>,
    pub instance_count: i32,
    pub fully_read_flag: bool,
    pub fully_read_at: Option<OffsetDateTime>,
    pub processing_status: ProcessingStatus,
    pub matched_ruleset_ids: Vec<i64>,
    pub matched_template_ids: Vec<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RuleGroupRow {
    pub id: i64,
    pub template_ids: Vec<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RuleSetRow {
    pub id: i64,
    pub rule_group_id: i64,
    pub order_index: i32,
    pub combinator_with_next: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RuleRow {
    pub id: i64,
    pub rule_set_id: i64,
    pub order_index: i32,
    pub tag_key: String,
    pub operator: String,
    pub literal: String,
    pub vr: String,
    pub combinator_with_next: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Instance {
    pub id: i64,
    pub series_id: i64,
    pub sop_instance_uid: String,
    pub deidentified_sop_instance_uid: String,
    pub file_path: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExportRecord {
    pub id: i64,
    pub series_id: i64,
    pub zip_path: String,
    pub zip_sha256: String,
    pub transfer_status: TransferStatus,
    pub transferred_at: Option<OffsetDateTime>,
    pub server_task_id: Option<String>,
    pub server_segmentation_status: Option<String>,
    pub server_status_updated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ImportRecord {
    pub id: i64,
    pub series_id: i64,
    pub received_sop_uid: Option<String>,
    pub downloaded_path: String,
    pub received_sha256: Option<String>,
    pub received_at: OffsetDateTime,
    pub reidentified_path: Option<String>,
    pub reidentified_at: Option<OffsetDateTime>,
    pub assessor_name: Option<String>,
    pub date_reviewed: Option<OffsetDateTime>,
    pub time_required_s: Option<i32>,
    pub overall_rating: Option<i16>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VoiRecord {
    pub id: i64,
    pub import_id: i64,
    pub volume_name: String,
    pub modification_class: Option<String>,
    pub modification_types: Vec<String>,
    pub comments: Option<String>,
}

/// Singleton, fixed primary key 1, per spec.md §9 "Global state".
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SystemConfiguration {
    pub id: i32,
    pub base_url: String,
    pub client_id: String,
    pub upload_endpoint: String,
    pub status_endpoint: String,
    pub download_endpoint: String,
    pub notify_endpoint: String,
    pub token_refresh_endpoint: String,
    pub bearer_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expiry: Option<OffsetDateTime>,
    pub ingest_root: String,
    pub pull_start_at: OffsetDateTime,
    pub study_date_based_filtering: bool,
}

/// Singleton, fixed primary key 1.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DicomScpConfig {
    pub id: i32,
    pub ae_title: String,
    pub bind_host: String,
    pub port: i32,
    pub max_associations: i32,
    pub max_pdu_length: i32,
    pub acse_timeout_s: i32,
    pub dimse_timeout_s: i32,
    pub network_timeout_s: i32,
    pub storage_structure: StorageStructure,
    pub filename_convention: FilenameConvention,
    pub max_storage_gb: f64,
    pub cleanup_enabled: bool,
    pub retention_days: i32,
    pub allowed_ae_titles: Vec<String>,
    pub allowed_ips: Vec<String>,
    pub enable_c_echo: bool,
    pub enable_c_store: bool,
    pub enable_c_find: bool,
    pub enable_c_move: bool,
    pub enable_c_get: bool,
    pub max_query_results: i32,
    pub validate_dicom_on_receive: bool,
    pub reject_invalid_dicom: bool,
    pub log_level: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RemoteDicomNode {
    pub id: i64,
    pub ae_title: String,
    pub host: String,
    pub port: i32,
    pub allow_incoming: bool,
    pub is_active: bool,
    pub last_incoming_at: Option<OffsetDateTime>,
    pub last_successful_outgoing_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct TransactionLogRow {
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub calling_ae: Option<String>,
    pub called_ae: Option<String>,
    pub remote_ip: Option<String>,
    pub remote_port: Option<i32>,
    pub patient_id: Option<String>,
    pub study_uid: Option<String>,
    pub series_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub sop_class_uid: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub transfer_syntax: Option<String>,
    pub duration_s: Option<f64>,
    pub transfer_speed_mbps: Option<f64>,
    pub error: Option<String>,
}

/// Singleton, fixed primary key 1.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceStatus {
    pub id: i32,
    pub is_running: bool,
    pub pid: Option<i32>,
    pub started_at: Option<OffsetDateTime>,
    pub stopped_at: Option<OffsetDateTime>,
    pub total_connections: i64,
    pub active_connections: i64,
    pub total_files_received: i64,
    pub total_bytes_received: i64,
    pub total_errors: i64,
    pub last_connection_at: Option<OffsetDateTime>,
    pub last_file_received_at: Option<OffsetDateTime>,
    pub cached_storage_bytes: i64,
    pub cached_storage_updated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChainLock {
    pub name: String,
    pub chain_id: String,
    pub started_at: OffsetDateTime,
    pub started_by: String,
    pub expires_at: OffsetDateTime,
    pub status: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatisticsSample {
    pub id: i64,
    pub parameter_name: String,
    pub parameter_value: f64,
    pub created_at: OffsetDateTime,
}

/// Flattened identifier row used to answer C-FIND at any query/retrieve
/// level, per spec.md §4.10 "C-FIND". One row per patient/study/series/
/// instance depending on which `find_*` repo query produced it; fields that
/// don't apply at a given level are `None` and rendered as an empty string
/// in the response identifier, per spec.md ("empty string for known-but-
/// unknown values").
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FindRow {
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub study_uid: Option<String>,
    pub study_date: Option<String>,
    pub study_description: Option<String>,
    pub accession: Option<String>,
    pub study_id: Option<String>,
    pub series_uid: Option<String>,
    pub series_description: Option<String>,
    pub modality: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub file_path: Option<String>,
}

/// One instance's location plus the identifiers needed to log a transaction
/// and stream the file, per spec.md §4.10 "C-MOVE"/"C-GET".
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceLocation {
    pub file_path: String,
    pub sop_instance_uid: String,
    pub sop_class_uid: Option<String>,
    pub series_uid: String,
    pub study_uid: String,
    pub patient_id: String,
}
