//! Virtual machine description as seen by the media generator
//!
//! Only the parts of a VM definition that matter for cloud-init media:
//! identity, volumes, access credentials and the device inventory. Field
//! names follow the Kubernetes camelCase convention so a VM definition can
//! be loaded straight from YAML or JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::CloudInitError;
use crate::datasources::DataSourceKind;
use crate::datasources::configdrive::DeviceMetadata;

/// Annotation naming a cluster-wide instance type
pub const CLUSTER_INSTANCETYPE_ANNOTATION: &str = "kubevirt.io/cluster-instancetype-name";

/// Annotation naming a namespaced instance type
pub const INSTANCETYPE_ANNOTATION: &str = "kubevirt.io/instancetype-name";

/// Maximum length of a DNS label
const MAX_HOSTNAME_LEN: usize = 63;

/// A virtual machine as seen by the media generator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualMachine {
    pub name: String,
    pub namespace: String,
    pub annotations: BTreeMap<String, String>,
    /// Explicit guest hostname, overrides the one derived from `name`
    pub hostname: Option<String>,
    /// Firmware UUID; the preferred stable instance id
    pub firmware_uuid: Option<String>,
    pub volumes: Vec<Volume>,
    pub access_credentials: Vec<AccessCredential>,
    /// Device inventory published through ConfigDrive metadata
    pub devices: Vec<DeviceMetadata>,
}

/// A VM volume; only cloud-init sources are modelled
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Volume {
    pub name: String,
    pub cloud_init_no_cloud: Option<CloudInitVolumeSource>,
    pub cloud_init_config_drive: Option<CloudInitVolumeSource>,
}

/// User-data and network-data carried by a cloud-init volume
///
/// `user_data` and `network_data` are opaque bytes. Inline values come from
/// YAML text; secret overrides may replace them with arbitrary content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudInitVolumeSource {
    #[serde(with = "text_bytes")]
    pub user_data: Vec<u8>,
    pub user_data_base64: String,
    pub user_data_secret_ref: Option<SecretReference>,
    #[serde(with = "text_bytes")]
    pub network_data: Vec<u8>,
    pub network_data_base64: String,
    pub network_data_secret_ref: Option<SecretReference>,
}

/// Reference to a Kubernetes secret by name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretReference {
    pub name: String,
}

/// Credential injected into the guest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessCredential {
    pub ssh_public_key: Option<SshPublicKeyAccessCredential>,
}

/// SSH public keys taken from a secret
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SshPublicKeyAccessCredential {
    pub source: SshPublicKeySource,
    pub propagation_method: PropagationMethod,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SshPublicKeySource {
    pub secret: Option<AccessCredentialSecret>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessCredentialSecret {
    pub secret_name: String,
}

/// How the keys reach the guest; at most one field is expected to be set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PropagationMethod {
    pub no_cloud: Option<PropagationMarker>,
    pub config_drive: Option<PropagationMarker>,
    pub qemu_guest_agent: Option<PropagationMarker>,
}

/// Empty marker object (`noCloud: {}`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropagationMarker {}

impl VirtualMachine {
    /// Parse a VM definition from YAML (JSON is accepted as well)
    pub fn from_yaml(yaml: &str) -> Result<Self, CloudInitError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a VM definition from a file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CloudInitError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml(&content)
    }

    /// Instance type hint; the cluster-wide annotation wins over the namespaced one
    pub fn instance_type(&self) -> &str {
        [CLUSTER_INSTANCETYPE_ANNOTATION, INSTANCETYPE_ANNOTATION]
            .iter()
            .filter_map(|key| self.annotations.get(*key))
            .find(|value| !value.is_empty())
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Hostname handed to the guest.
    ///
    /// Uses `hostname` when set, otherwise the VM name up to its first dot,
    /// cut to a single DNS label.
    pub fn sanitized_hostname(&self) -> String {
        if let Some(hostname) = self.hostname.as_deref().filter(|h| !h.is_empty()) {
            return hostname.to_string();
        }

        let label = self.name.split('.').next().unwrap_or_default();
        let mut end = label.len().min(MAX_HOSTNAME_LEN);
        while !label.is_char_boundary(end) {
            end -= 1;
        }
        label[..end].to_string()
    }
}

impl Volume {
    /// The cloud-init source carried by this volume, NoCloud first
    pub fn cloud_init_source(&self) -> Option<(DataSourceKind, &CloudInitVolumeSource)> {
        if let Some(source) = &self.cloud_init_no_cloud {
            return Some((DataSourceKind::NoCloud, source));
        }
        self.cloud_init_config_drive
            .as_ref()
            .map(|source| (DataSourceKind::ConfigDrive, source))
    }

    /// Mutable access to the source of the given kind
    pub fn cloud_init_source_mut(
        &mut self,
        kind: DataSourceKind,
    ) -> Option<&mut CloudInitVolumeSource> {
        match kind {
            DataSourceKind::NoCloud => self.cloud_init_no_cloud.as_mut(),
            DataSourceKind::ConfigDrive => self.cloud_init_config_drive.as_mut(),
        }
    }
}

impl CloudInitVolumeSource {
    /// Whether user-data or network-data is backed by a secret
    pub fn has_secret_refs(&self) -> bool {
        self.user_data_secret_ref.is_some() || self.network_data_secret_ref.is_some()
    }
}

impl AccessCredential {
    /// Name of the secret holding SSH keys propagated through `kind`
    pub fn ssh_key_secret_for(&self, kind: DataSourceKind) -> Option<&str> {
        let ssh = self.ssh_public_key.as_ref()?;
        let propagated = match kind {
            DataSourceKind::NoCloud => ssh.propagation_method.no_cloud.is_some(),
            DataSourceKind::ConfigDrive => ssh.propagation_method.config_drive.is_some(),
        };
        if !propagated {
            return None;
        }
        ssh.source
            .secret
            .as_ref()
            .map(|secret| secret.secret_name.as_str())
            .filter(|name| !name.is_empty())
    }
}

/// Inline payloads are written as YAML strings
mod text_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        String::deserialize(deserializer).map(String::into_bytes)
    }
}
