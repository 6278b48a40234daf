//! Ownership of published images
//!
//! The hypervisor usually runs as a dedicated user, so images are handed
//! over before they are published.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use crate::CloudInitError;

/// Sets the owner of a generated file
#[async_trait]
pub trait OwnershipManager: Send + Sync {
    async fn set_file_ownership(&self, path: &Path) -> Result<(), CloudInitError>;
}

/// Leaves ownership unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOwnership;

#[async_trait]
impl OwnershipManager for NoopOwnership {
    async fn set_file_ownership(&self, _path: &Path) -> Result<(), CloudInitError> {
        Ok(())
    }
}

/// Runs `chown <owner> <path>`
#[derive(Debug, Clone)]
pub struct ChownOwnership {
    owner: String,
}

impl ChownOwnership {
    /// `owner` is anything `chown` accepts: `qemu`, `107:107`, ...
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[async_trait]
impl OwnershipManager for ChownOwnership {
    async fn set_file_ownership(&self, path: &Path) -> Result<(), CloudInitError> {
        debug!("Changing ownership of {} to {}", path.display(), self.owner);

        let output = Command::new("chown")
            .arg(&self.owner)
            .arg(path)
            .output()
            .await
            .map_err(|e| CloudInitError::Ownership {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(CloudInitError::Ownership {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
