//! Error taxonomy for issuing and verifying licenses.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Everything that can go wrong while issuing, persisting or verifying a license.
///
/// Each terminal verification outcome (`ClockRollbackDetected`,
/// `MachineMismatch`, `ApplicationMismatch`, `LicenseExpired`,
/// `InvalidSignature`) has its own variant. Retrying with the same inputs
/// yields the same error.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Bad issuance parameters.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Persisted license bytes are not a structurally valid license.
    #[error("malformed license record: {0}")]
    MalformedRecord(String),

    /// The system clock is behind the last observed time by more than the tolerance.
    #[error("system clock rolled back: last observed {last_observed}, now {now}")]
    ClockRollbackDetected {
        last_observed: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    /// The clock-guard record exists but cannot be parsed.
    #[error("malformed clock guard record: {0}")]
    MalformedClockGuard(String),

    #[error("license is bound to machine {expected}, not {actual}")]
    MachineMismatch { expected: String, actual: String },

    #[error("license is issued for application {expected:?}, not {actual:?}")]
    ApplicationMismatch { expected: String, actual: String },

    #[error("license expired on {expired_at}")]
    LicenseExpired { expired_at: DateTime<Utc> },

    #[error("invalid license signature")]
    InvalidSignature,

    /// Key material is not usable for the requested signature scheme.
    #[error("unsupported key: {0}")]
    UnsupportedKey(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LicenseError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short stable name of the variant, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::MalformedRecord(_) => "malformed_record",
            Self::ClockRollbackDetected { .. } => "clock_rollback_detected",
            Self::MalformedClockGuard(_) => "malformed_clock_guard",
            Self::MachineMismatch { .. } => "machine_mismatch",
            Self::ApplicationMismatch { .. } => "application_mismatch",
            Self::LicenseExpired { .. } => "license_expired",
            Self::InvalidSignature => "invalid_signature",
            Self::UnsupportedKey(_) => "unsupported_key",
            Self::Signing(_) => "signing",
            Self::Config(_) => "config",
            Self::Io { .. } => "io",
        }
    }
}

pub type LicenseResult<T> = Result<T, LicenseError>;
