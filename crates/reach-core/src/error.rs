use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReachError {
    // Schema errors
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // Policy errors
    #[error("Policy denied step {step}: {reason}")]
    PolicyDenied { step: String, reason: String },

    #[error("Signature error: {0}")]
    Signature(String),

    // Determinism errors
    #[error("Replay diverged at event index {index}")]
    ReplayMismatch { index: usize },

    #[error("Fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("Snapshot hash mismatch: expected {expected}, got {actual}")]
    SnapshotTampered { expected: String, actual: String },

    // Resource errors
    #[error("Budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("Event log capacity of {0} events reached")]
    EventLogFull(usize),

    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    // Adapter errors
    #[error("No adapter bound for tool: {0}")]
    AdapterNotFound(String),

    #[error("Adapter {adapter} failed: {message}")]
    Adapter { adapter: String, message: String },

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // CAS errors
    #[error("CAS integrity failure for {cid}: stored bytes hash to {actual}")]
    CasIntegrity { cid: String, actual: String },

    #[error("CAS object not found: {0}")]
    CasNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReachError>;

/// Coarse error classes shared by every boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    SchemaInvalid,
    PolicyDenied,
    DeterminismViolation,
    ResourceExhausted,
    StorageError,
    CasIntegrityFailure,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SchemaInvalid => "schema_invalid",
            Self::PolicyDenied => "policy_denied",
            Self::DeterminismViolation => "determinism_violation",
            Self::ResourceExhausted => "resource_exhausted",
            Self::StorageError => "storage_error",
            Self::CasIntegrityFailure => "cas_integrity_failure",
            Self::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Uniform error shape returned across every external boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub suggestion: String,
    pub deterministic: bool,
}

impl ReachError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Schema(_) => "E_SCHEMA",
            Self::InvalidInput(_) => "E_INVALID_INPUT",
            Self::InvalidWorkflow(_) => "E_WORKFLOW_INVALID",
            Self::InvalidTransition { .. } => "E_INVALID_STATE",
            Self::PolicyDenied { .. } => "POLICY_DENIED",
            Self::Signature(_) => "SIGNATURE_INVALID",
            Self::ReplayMismatch { .. } => "REPLAY_MISMATCH",
            Self::FingerprintMismatch { .. } => "FINGERPRINT_MISMATCH",
            Self::SnapshotTampered { .. } => "SNAPSHOT_TAMPERED",
            Self::BudgetExhausted(_) => "RESOURCE_EXHAUSTED",
            Self::EventLogFull(_) => "EVENT_LOG_TOO_LARGE",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::AdapterNotFound(_) => "ADAPTER_NOT_FOUND",
            Self::Adapter { .. } => "EXECUTION_FAILED",
            Self::Cancelled => "EXECUTION_CANCELLED",
            Self::Config(_) => "CONFIG_INVALID",
            Self::ConfigNotFound(_) => "CONFIG_MISSING",
            Self::Storage(_) => "STORAGE_WRITE_FAILED",
            Self::RunNotFound(_) => "STORAGE_NOT_FOUND",
            Self::CasIntegrity { .. } => "CAS_INTEGRITY",
            Self::CasNotFound(_) => "STORAGE_NOT_FOUND",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Io(_) => "STORAGE_READ_FAILED",
            Self::Json(_) => "E_SCHEMA",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Schema(_)
            | Self::InvalidInput(_)
            | Self::InvalidWorkflow(_)
            | Self::InvalidTransition { .. }
            | Self::AdapterNotFound(_)
            | Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::Json(_) => ErrorCategory::SchemaInvalid,
            Self::PolicyDenied { .. } | Self::Signature(_) => ErrorCategory::PolicyDenied,
            Self::ReplayMismatch { .. }
            | Self::FingerprintMismatch { .. }
            | Self::SnapshotTampered { .. } => ErrorCategory::DeterminismViolation,
            Self::BudgetExhausted(_) | Self::EventLogFull(_) | Self::PayloadTooLarge { .. } => {
                ErrorCategory::ResourceExhausted
            }
            Self::Storage(_) | Self::RunNotFound(_) | Self::CasNotFound(_) | Self::Io(_) => {
                ErrorCategory::StorageError
            }
            Self::CasIntegrity { .. } => ErrorCategory::CasIntegrityFailure,
            Self::Adapter { .. } | Self::Cancelled | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether identical inputs always reproduce this exact error.
    pub fn is_deterministic(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::SchemaInvalid
                | ErrorCategory::PolicyDenied
                | ErrorCategory::DeterminismViolation
                | ErrorCategory::ResourceExhausted
        ) && !matches!(self, Self::ConfigNotFound(_))
    }

    /// Storage hiccups may be retried by the caller. Integrity failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::StorageError)
            || matches!(self, Self::Adapter { .. })
    }

    pub fn suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::SchemaInvalid => "Fix the input so it matches the expected schema and retry",
            ErrorCategory::PolicyDenied => {
                "Review the policy bundle and the capabilities declared by the step"
            }
            ErrorCategory::DeterminismViolation => {
                "Compare the diverging event against the original log; do not retry blindly"
            }
            ErrorCategory::ResourceExhausted => "Raise the configured limit or reduce the workload",
            ErrorCategory::StorageError => "Check storage availability and retry",
            ErrorCategory::CasIntegrityFailure => {
                "Stored content is corrupt; restore it from a trusted source"
            }
            ErrorCategory::Internal => "Report this as a bug with the run's event log attached",
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code().to_string(),
            category: self.category(),
            message: self.to_string(),
            suggestion: self.suggestion().to_string(),
            deterministic: self.is_deterministic(),
        }
    }
}

impl From<ReachError> for ErrorEnvelope {
    fn from(err: ReachError) -> Self {
        err.envelope()
    }
}
