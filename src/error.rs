//! Top-level error taxonomy.
//!
//! Every pipeline stage resolves to one of these kinds; the orchestrator maps
//! each kind to a `ProcessingStatus`/`TransferStatus` write and a log level.

#[derive(thiserror::Error, Debug)]
pub enum DrawClientError {
    #[error("configuration missing or malformed: {0}")]
    ConfigurationMissing(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error(transparent)]
    NetworkTransient(#[from] reqwest::Error),

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },

    #[error("invalid DICOM format: {0}")]
    FormatInvalid(String),

    #[error("deidentification failed: {0}")]
    DeidentificationFailed(String),

    #[error("reidentification failed: {0}")]
    ReidentificationFailed(String),

    #[error("storage exhausted")]
    StorageExhausted,

    #[error("association refused: {0}")]
    AssociationRefused(String),

    #[error("rule validation error: {0}")]
    ValidationError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    DicomRead(#[from] dicom::object::ReadError),

    #[error(transparent)]
    DicomWrite(#[from] dicom::object::WriteError),

    #[error("missing required DICOM tag: {0}")]
    MissingTag(&'static str),
}

/// Per-stage disposition, persisted by the orchestrator as the matching
/// `ProcessingStatus`/`TransferStatus` value. Mirrors spec.md §9 "Exceptions
/// for control flow".
#[derive(Debug)]
pub enum StageOutcome<T> {
    Success(T),
    SkippedStable,
    RetryableFailure(DrawClientError),
    TerminalFailure(DrawClientError),
}

impl<T> StageOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success(_))
    }
}
