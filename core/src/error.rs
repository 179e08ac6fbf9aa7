use crate::model::{BucketStatus, DeliveryStatus};
use crate::types::{BucketId, FileId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Bucket '{0}' not found")]
    BucketNotFound(BucketId),

    #[error("File '{0}' not found")]
    FileNotFound(FileId),

    #[error("Bucket '{bucket_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        bucket_id: BucketId,
        from: BucketStatus,
        to: BucketStatus,
    },

    #[error("Cannot {operation} bucket '{bucket_id}' while it is {status}")]
    InvalidState {
        bucket_id: BucketId,
        status: BucketStatus,
        operation: &'static str,
    },

    #[error("Bucket '{bucket_id}' was modified concurrently (expected version {expected})")]
    ConcurrentModification { bucket_id: BucketId, expected: i64 },

    #[error("File '{file_id}' was modified concurrently (expected version {expected})")]
    FileConcurrentModification { file_id: FileId, expected: i64 },

    #[error("Actor '{actor}' lacks a required approver role ({required})")]
    Unauthorized { actor: String, required: String },

    #[error("No payment instrument available for bucket '{bucket_id}'")]
    NoInstrumentAvailable { bucket_id: BucketId },

    #[error("Payment instrument assignment failed for bucket '{bucket_id}': {message}")]
    InstrumentAssignment { bucket_id: BucketId, message: String },

    #[error("Payer/payee configuration still missing for bucket '{0}'")]
    ConfigurationMissing(BucketId),

    #[error("File '{file_id}' is not eligible for delivery ({status}, {attempts} attempts)")]
    DeliveryNotEligible {
        file_id: FileId,
        status: DeliveryStatus,
        attempts: u32,
    },

    #[error("Store was opened in memory and cannot be shared across connections")]
    InMemoryStore,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code surfaced to operators and the runner.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Config(_) => "INVALID_CONFIGURATION",
            Self::BucketNotFound(_) => "BUCKET_NOT_FOUND",
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::ConcurrentModification { .. } | Self::FileConcurrentModification { .. } => {
                "CONCURRENT_MODIFICATION"
            }
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::NoInstrumentAvailable { .. } => "NO_AVAILABLE_INSTRUMENT",
            Self::InstrumentAssignment { .. } => "INSTRUMENT_ASSIGNMENT_FAILED",
            Self::ConfigurationMissing(_) => "CONFIGURATION_MISSING",
            Self::DeliveryNotEligible { .. } => "DELIVERY_NOT_ELIGIBLE",
            Self::InMemoryStore => "IN_MEMORY_STORE",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// True when the caller can fix the request (bad input, wrong state,
    /// missing resource) rather than the engine having failed.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::BucketNotFound(_)
                | Self::FileNotFound(_)
                | Self::InvalidTransition { .. }
                | Self::InvalidState { .. }
                | Self::ConcurrentModification { .. }
                | Self::FileConcurrentModification { .. }
                | Self::Unauthorized { .. }
                | Self::NoInstrumentAvailable { .. }
                | Self::InstrumentAssignment { .. }
                | Self::ConfigurationMissing(_)
                | Self::DeliveryNotEligible { .. }
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
