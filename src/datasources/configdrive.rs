//! ConfigDrive data source
//!
//! OpenStack config-drive layout: a filesystem labelled `config-2` holding
//! `openstack/latest/meta_data.json`, `user_data` and `network_data.json`.
//! https://docs.openstack.org/nova/latest/user/metadata.html

use serde::{Deserialize, Serialize};

use super::DataLayout;
use super::nocloud::non_empty;
use crate::secrets::PublicKeys;

/// Volume label the guest looks for
pub const VOLUME_ID: &str = "config-2";

/// Image file name under the VM directory
pub const IMAGE_FILE: &str = "configdrive.iso";

pub const LAYOUT: DataLayout = DataLayout {
    subdir: "openstack/latest",
    meta_data: "meta_data.json",
    user_data: "user_data",
    network_data: "network_data.json",
};

/// Kind of device published in the metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMetadataType {
    Nic,
    Hostdev,
}

/// A device visible to the guest, with the tags it was declared with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    #[serde(rename = "type")]
    pub device_type: DeviceMetadataType,
    pub bus: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(
        rename = "numaNode",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub numa_node: Option<u32>,
    #[serde(rename = "alignedCPUs", default, skip_serializing_if = "Vec::is_empty")]
    pub aligned_cpus: Vec<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// ConfigDrive `meta_data.json` document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDriveMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<DeviceMetadata>>,
    #[serde(
        rename = "public_keys",
        default,
        skip_serializing_if = "PublicKeys::is_empty"
    )]
    pub public_ssh_keys: PublicKeys,
}

impl ConfigDriveMetadata {
    /// Build the document for VM `name` in `namespace`.
    ///
    /// The instance id is `<name>.<namespace>`; `uuid` carries the stable
    /// VM identifier.
    pub fn new(
        name: &str,
        namespace: &str,
        uuid: &str,
        hostname: &str,
        instance_type: &str,
        devices: &[DeviceMetadata],
        public_ssh_keys: PublicKeys,
    ) -> Self {
        Self {
            instance_type: non_empty(instance_type),
            instance_id: format!("{name}.{namespace}"),
            local_hostname: non_empty(hostname),
            hostname: non_empty(hostname),
            uuid: non_empty(uuid),
            devices: (!devices.is_empty()).then(|| devices.to_vec()),
            public_ssh_keys,
        }
    }
}
