//! NoCloud data source
//!
//! The guest finds a filesystem labelled `cidata` and reads `meta-data`,
//! `user-data` and optionally `network-config` from its root.

use serde::{Deserialize, Serialize};

use super::DataLayout;
use crate::secrets::PublicKeys;

/// Volume label the guest looks for
pub const VOLUME_ID: &str = "cidata";

/// Image file name under the VM directory
pub const IMAGE_FILE: &str = "noCloud.iso";

/// Files live directly at the image root
pub const LAYOUT: DataLayout = DataLayout {
    subdir: "",
    meta_data: "meta-data",
    user_data: "user-data",
    network_data: "network-config",
};

/// NoCloud `meta-data` document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NoCloudMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_hostname: Option<String>,
    #[serde(
        rename = "public-keys",
        default,
        skip_serializing_if = "PublicKeys::is_empty"
    )]
    pub public_ssh_keys: PublicKeys,
}

impl NoCloudMetadata {
    pub fn new(
        instance_id: &str,
        hostname: &str,
        instance_type: &str,
        public_ssh_keys: PublicKeys,
    ) -> Self {
        Self {
            instance_type: non_empty(instance_type),
            instance_id: instance_id.to_string(),
            local_hostname: non_empty(hostname),
            public_ssh_keys,
        }
    }
}

pub(super) fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
