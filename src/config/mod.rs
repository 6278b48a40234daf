//! Generator configuration
//!
//! Loaded from an optional YAML file; every field has a production default.
//!
//! ```yaml
//! local_dir: /var/run/libvirt/cloud-init-dir
//! secret_dir: /var/run/kubevirt-private/secret
//! iso_timeout_secs: 10
//! iso_binary: xorrisofs
//! file_owner: "107:107"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

use crate::CloudInitError;
use crate::iso::xorriso::DEFAULT_ISO_BINARY;
use crate::secrets::DEFAULT_SECRET_DIR;
use crate::state::DEFAULT_LOCAL_DIR;

/// Default wall-clock limit for the mastering tool
pub const DEFAULT_ISO_TIMEOUT_SECS: u64 = 10;

/// Settings for [`IsoGenerator`](crate::iso::IsoGenerator) and secret resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Root of the generated media tree
    pub local_dir: PathBuf,

    /// Root of the mounted secrets
    pub secret_dir: PathBuf,

    /// Limit for one mastering tool run, in seconds
    pub iso_timeout_secs: u64,

    /// Mastering tool executable
    pub iso_binary: String,

    /// `chown` owner applied to published images; ownership is left alone when unset
    pub file_owner: Option<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from(DEFAULT_LOCAL_DIR),
            secret_dir: PathBuf::from(DEFAULT_SECRET_DIR),
            iso_timeout_secs: DEFAULT_ISO_TIMEOUT_SECS,
            iso_binary: DEFAULT_ISO_BINARY.to_string(),
            file_owner: None,
        }
    }
}

impl GeneratorConfig {
    /// Parse configuration from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, CloudInitError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CloudInitError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            CloudInitError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        debug!("Loaded generator config from {}", path.display());
        Self::from_yaml(&content)
    }

    pub fn iso_timeout(&self) -> Duration {
        Duration::from_secs(self.iso_timeout_secs)
    }

    /// Reject settings the generator cannot run with
    pub fn validate(&self) -> Result<(), CloudInitError> {
        if self.iso_timeout_secs == 0 {
            return Err(CloudInitError::Config(
                "iso_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.iso_binary.is_empty() {
            return Err(CloudInitError::Config("iso_binary must not be empty".into()));
        }
        Ok(())
    }
}
