//! Error taxonomy shared by the engine and the Kubernetes controllers

use std::time::Duration;

use thiserror::Error;

use crate::cluster::ports::CollaboratorError;
use crate::storage::StorageError;

/// Error variants are named with the `Error` suffix where they wrap another error type.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Rejected spec; nothing was changed
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Request refused by the termination policy
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// Member unreachable, storage timeout and similar; retried with backoff
    #[error("Transient infrastructure error (will retry): {0}")]
    TransientInfra(String),

    /// Corrupt or missing data; recorded as Failed and never retried
    #[error("Irrecoverable data error: {0}")]
    IrrecoverableData(String),

    /// Stale primary claim; resolved by forced demotion
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    /// A newer spec version arrived and this pass was abandoned
    #[error("Reconciliation superseded by spec version {0}")]
    Superseded(u64),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::StorageError(e) => e.is_transient(),
            Error::TransientInfra(_) => true,
            Error::ConsistencyViolation(_) => true,
            Error::Superseded(_) => true,
            Error::FinalizerError(_) => true,
            Error::ValidationError(_) => false,
            Error::PolicyViolation(_) => false,
            Error::IrrecoverableData(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
        }
    }

    /// Whether this is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(api)) if api.code == 404)
    }

    /// Short machine-readable reason used in status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "KubernetesError",
            Error::SerializationError(_) => "SerializationError",
            Error::StorageError(_) => "StorageError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::FinalizerError(_) => "FinalizerError",
            Error::ValidationError(_) => "ValidationFailed",
            Error::PolicyViolation(_) => "PolicyViolation",
            Error::TransientInfra(_) => "TransientInfrastructure",
            Error::IrrecoverableData(_) => "IrrecoverableData",
            Error::ConsistencyViolation(_) => "ConsistencyViolation",
            Error::Superseded(_) => "Superseded",
        }
    }
}

impl From<CollaboratorError> for Error {
    fn from(e: CollaboratorError) -> Self {
        match e {
            CollaboratorError::Corrupt(msg) => Error::IrrecoverableData(msg),
            CollaboratorError::Kube(err) => Error::KubeError(err),
            other => Error::TransientInfra(other.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Short delays for in-component retries such as segment uploads
    pub fn fast() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Non-retryable errors wait for a spec change or manual intervention
            self.max_delay
        }
    }
}

/// Context for tracking error state during reconciliation
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    /// Number of consecutive errors
    pub consecutive_errors: u32,
    /// Last error message
    pub last_error: Option<String>,
}

impl ErrorContext {
    /// Record an error
    pub fn record_error(&mut self, error: &Error) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_error = Some(error.to_string());
    }

    /// Reset error tracking (called on successful reconciliation)
    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
        self.last_error = None;
    }

    /// Check if we've exceeded max retries
    pub fn exceeded_max_retries(&self, max_retries: u32) -> bool {
        self.consecutive_errors >= max_retries
    }
}
