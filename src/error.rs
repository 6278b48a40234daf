//! Error types for cidata-iso

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Main error type for cloud-init data resolution and image generation
#[derive(Error, Debug)]
pub enum CloudInitError {
    /// No usable cloud-init volume, or the volume carries no content.
    /// Callers treat this as "nothing to do".
    #[error("No cloud-init data source: {0}")]
    MissingDataSource(String),

    #[error("Failed to resolve secret at {}: {source}", path.display())]
    SecretResolutionFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid cloud-init payload: {0}")]
    InvalidPayload(String),

    #[error("Timed out after {timeout:?} generating cloud-init image {}", path.display())]
    GenerationTimedOut { path: PathBuf, timeout: Duration },

    #[error("ISO mastering tool failed with {status} (args: '{}')", args.join(" "))]
    GenerationToolFailed { args: Vec<String>, status: ExitStatus },

    #[error("Failed to publish {} as {}: {source}", from.display(), to.display())]
    PublishFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Base64 decode error in {field}: {source}")]
    Base64Decode {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to set ownership of {}: {message}", path.display())]
    Ownership { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CloudInitError {
    /// Create a secret resolution error for the given path
    pub fn secret(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::SecretResolutionFailed {
            path: path.into(),
            source,
        }
    }

    /// Whether the caller should treat this as "no cloud-init data"
    pub fn is_missing_data_source(&self) -> bool {
        matches!(self, Self::MissingDataSource(_))
    }

    /// Whether a fresh call may succeed where this one failed.
    ///
    /// Every generation starts from a cleaned staging area, so tool and
    /// publication failures can simply be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GenerationTimedOut { .. }
                | Self::GenerationToolFailed { .. }
                | Self::PublishFailed { .. }
        )
    }
}
