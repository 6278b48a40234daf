//! Cloud-init data sources
//!
//! A VM carries at most one cloud-init volume. Its content, together with
//! secret-backed overrides and SSH keys, is resolved into [`CloudInitData`]:
//! the payload that ends up inside the NoCloud or ConfigDrive image.

pub mod configdrive;
pub mod nocloud;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::CloudInitError;
use crate::secrets::{PublicKeys, SecretResolver};
use crate::state::InstanceIdStore;
use crate::vm::{CloudInitVolumeSource, VirtualMachine, Volume};

pub use configdrive::{ConfigDriveMetadata, DeviceMetadata, DeviceMetadataType};
pub use nocloud::NoCloudMetadata;

/// Which cloud-init data source a VM uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSourceKind {
    NoCloud,
    ConfigDrive,
}

impl DataSourceKind {
    /// Volume label the guest-side cloud-init expects verbatim
    pub fn volume_id(self) -> &'static str {
        match self {
            Self::NoCloud => nocloud::VOLUME_ID,
            Self::ConfigDrive => configdrive::VOLUME_ID,
        }
    }

    /// Name of the published image file
    pub fn image_file_name(self) -> &'static str {
        match self {
            Self::NoCloud => nocloud::IMAGE_FILE,
            Self::ConfigDrive => configdrive::IMAGE_FILE,
        }
    }

    /// File names inside the image
    pub fn layout(self) -> &'static DataLayout {
        match self {
            Self::NoCloud => &nocloud::LAYOUT,
            Self::ConfigDrive => &configdrive::LAYOUT,
        }
    }
}

impl fmt::Display for DataSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCloud => write!(f, "noCloud"),
            Self::ConfigDrive => write!(f, "configDrive"),
        }
    }
}

impl FromStr for DataSourceKind {
    type Err = CloudInitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "nocloud" => Ok(Self::NoCloud),
            "configdrive" => Ok(Self::ConfigDrive),
            _ => Err(CloudInitError::Config(format!(
                "invalid cloud-init data source: '{s}'"
            ))),
        }
    }
}

/// Where the data files live inside the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLayout {
    /// Directory below the image root, empty for the root itself
    pub subdir: &'static str,
    pub meta_data: &'static str,
    pub user_data: &'static str,
    pub network_data: &'static str,
}

/// Data-source specific metadata document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    NoCloud(NoCloudMetadata),
    ConfigDrive(ConfigDriveMetadata),
}

impl Metadata {
    pub fn kind(&self) -> DataSourceKind {
        match self {
            Self::NoCloud(_) => DataSourceKind::NoCloud,
            Self::ConfigDrive(_) => DataSourceKind::ConfigDrive,
        }
    }

    /// Serialize to the JSON document written into the image
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::NoCloud(metadata) => serde_json::to_vec(metadata),
            Self::ConfigDrive(metadata) => serde_json::to_vec(metadata),
        }
    }
}

/// Resolved cloud-init payload for one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudInitData {
    pub kind: DataSourceKind,
    pub metadata: Option<Metadata>,
    /// Opaque bytes handed to the guest unchanged
    pub user_data: Vec<u8>,
    /// Opaque bytes, may be empty
    pub network_data: Vec<u8>,
    /// Device inventory, ConfigDrive only
    pub devices: Vec<DeviceMetadata>,
    /// Volume this payload satisfies
    pub volume_name: String,
}

/// Inputs for building the metadata document
#[derive(Debug, Clone, Default)]
pub struct MetadataParams<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub instance_type: &'a str,
    pub hostname: &'a str,
    /// Stable VM identifier
    pub instance_id: &'a str,
    pub public_ssh_keys: PublicKeys,
    pub devices: &'a [DeviceMetadata],
}

impl CloudInitData {
    /// Whether the payload carries user-data and metadata matching the data
    /// source.
    ///
    /// Image generation is less strict, see [`validate`](Self::validate).
    pub fn is_valid(&self) -> bool {
        !self.user_data.is_empty()
            && self
                .metadata
                .as_ref()
                .is_some_and(|metadata| metadata.kind() == self.kind)
    }

    /// Check the payload can be turned into an image and return its metadata.
    ///
    /// Network-data alone is enough; the image then carries an empty
    /// user-data file.
    pub fn validate(&self) -> Result<&Metadata, CloudInitError> {
        if self.user_data.is_empty() && self.network_data.is_empty() {
            return Err(CloudInitError::InvalidPayload(format!(
                "volume {} has neither user-data nor network-data",
                self.volume_name
            )));
        }
        match &self.metadata {
            Some(metadata) if metadata.kind() == self.kind => Ok(metadata),
            Some(metadata) => Err(CloudInitError::InvalidPayload(format!(
                "{} metadata on a {} data source",
                metadata.kind(),
                self.kind
            ))),
            None => Err(CloudInitError::InvalidPayload(format!(
                "volume {} has no metadata",
                self.volume_name
            ))),
        }
    }

    /// (Re)build the metadata document, discarding any previous one
    pub fn build_metadata(&mut self, params: MetadataParams<'_>) {
        let metadata = match self.kind {
            DataSourceKind::NoCloud => Metadata::NoCloud(NoCloudMetadata::new(
                params.instance_id,
                params.hostname,
                params.instance_type,
                params.public_ssh_keys,
            )),
            DataSourceKind::ConfigDrive => {
                self.devices = params.devices.to_vec();
                Metadata::ConfigDrive(ConfigDriveMetadata::new(
                    params.name,
                    params.namespace,
                    params.instance_id,
                    params.hostname,
                    params.instance_type,
                    params.devices,
                    params.public_ssh_keys,
                ))
            }
        };
        self.metadata = Some(metadata);
    }
}

/// Index and kind of the first cloud-init volume
fn find_cloud_init_volume(volumes: &[Volume]) -> Option<(usize, DataSourceKind)> {
    volumes.iter().enumerate().find_map(|(index, volume)| {
        volume
            .cloud_init_source()
            .map(|(kind, _)| (index, kind))
    })
}

/// Read user-data and network-data from the first cloud-init volume.
///
/// Later cloud-init volumes are ignored. Returns `Ok(None)` when there is
/// no cloud-init volume at all. Secret references are not resolved here;
/// see [`SecretResolver::resolve_data_overrides`].
pub fn read_volume_data_source(
    volumes: &[Volume],
) -> Result<Option<CloudInitData>, CloudInitError> {
    let Some((volume, kind, source)) = volumes.iter().find_map(|volume| {
        volume
            .cloud_init_source()
            .map(|(kind, source)| (volume, kind, source))
    }) else {
        return Ok(None);
    };

    debug!("Reading {} data from volume {}", kind, volume.name);
    let (user_data, network_data) = read_cloud_init_data(source)?;

    Ok(Some(CloudInitData {
        kind,
        metadata: None,
        user_data,
        network_data,
        devices: Vec::new(),
        volume_name: volume.name.clone(),
    }))
}

fn read_cloud_init_data(
    source: &CloudInitVolumeSource,
) -> Result<(Vec<u8>, Vec<u8>), CloudInitError> {
    let user_data = read_raw_or_base64(
        "userDataBase64",
        &source.user_data,
        &source.user_data_base64,
    )?;
    let network_data = read_raw_or_base64(
        "networkDataBase64",
        &source.network_data,
        &source.network_data_base64,
    )?;

    if user_data.is_empty() && network_data.is_empty() {
        return Err(CloudInitError::MissingDataSource(
            "userDataBase64, userData, networkDataBase64 or networkData is required \
             for a cloud-init data source"
                .into(),
        ));
    }

    Ok((user_data, network_data))
}

fn read_raw_or_base64(
    field: &'static str,
    raw: &[u8],
    encoded: &str,
) -> Result<Vec<u8>, CloudInitError> {
    if !raw.is_empty() {
        return Ok(raw.to_vec());
    }
    if encoded.is_empty() {
        return Ok(Vec::new());
    }

    BASE64
        .decode(encoded)
        .map_err(|source| CloudInitError::Base64Decode { field, source })
}

/// Resolve the complete cloud-init payload for a VM.
///
/// Reads SSH keys and secret-backed overrides from `secrets`, the volume
/// content, and builds the metadata with a stable instance id from `ids`.
/// Secret overrides are written back into the VM's volume source. Returns
/// `Ok(None)` when the VM has no cloud-init volume.
pub async fn read_cloud_init_volume_data_source(
    vm: &mut VirtualMachine,
    secrets: &SecretResolver,
    ids: &InstanceIdStore,
) -> Result<Option<CloudInitData>, CloudInitError> {
    let Some((index, kind)) = find_cloud_init_volume(&vm.volumes) else {
        debug!("VM {}/{} has no cloud-init volume", vm.namespace, vm.name);
        return Ok(None);
    };

    let public_ssh_keys = secrets
        .resolve_ssh_public_keys(&vm.access_credentials, kind)
        .await?;
    secrets
        .resolve_data_overrides(&mut vm.volumes[index], kind)
        .await?;

    let Some(mut data) = read_volume_data_source(&vm.volumes)? else {
        return Ok(None);
    };

    let instance_id = ids.resolve(vm).await?;
    let hostname = vm.sanitized_hostname();
    data.build_metadata(MetadataParams {
        name: &vm.name,
        namespace: &vm.namespace,
        instance_type: vm.instance_type(),
        hostname: &hostname,
        instance_id: &instance_id,
        public_ssh_keys,
        devices: &vm.devices,
    });

    info!(
        "Resolved {} data source for {}/{} from volume {}",
        kind, vm.namespace, vm.name, data.volume_name
    );
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nocloud_volume(name: &str, source: CloudInitVolumeSource) -> Volume {
        Volume {
            name: name.into(),
            cloud_init_no_cloud: Some(source),
            ..Default::default()
        }
    }

    fn configdrive_volume(name: &str, source: CloudInitVolumeSource) -> Volume {
        Volume {
            name: name.into(),
            cloud_init_config_drive: Some(source),
            ..Default::default()
        }
    }

    fn encode(data: &str) -> String {
        BASE64.encode(data)
    }

    #[test]
    fn test_no_cloud_init_volume() {
        let volumes = vec![Volume {
            name: "rootdisk".into(),
            ..Default::default()
        }];
        assert!(read_volume_data_source(&volumes).unwrap().is_none());
    }

    #[test]
    fn test_user_data_base64() {
        let volumes = vec![nocloud_volume(
            "cloudinit",
            CloudInitVolumeSource {
                user_data_base64: encode("#!/bin/sh\necho hi\n"),
                ..Default::default()
            },
        )];
        let data = read_volume_data_source(&volumes).unwrap().unwrap();
        assert_eq!(data.kind, DataSourceKind::NoCloud);
        assert_eq!(data.user_data, b"#!/bin/sh\necho hi\n");
        assert!(data.network_data.is_empty());
        assert_eq!(data.volume_name, "cloudinit");
        assert!(data.metadata.is_none());
    }

    #[test]
    fn test_raw_takes_precedence_over_base64() {
        let volumes = vec![nocloud_volume(
            "cloudinit",
            CloudInitVolumeSource {
                user_data: "raw".into(),
                user_data_base64: encode("encoded"),
                network_data: "net".into(),
                ..Default::default()
            },
        )];
        let data = read_volume_data_source(&volumes).unwrap().unwrap();
        assert_eq!(data.user_data, b"raw");
        assert_eq!(data.network_data, b"net");
    }

    #[test]
    fn test_network_data_without_user_data() {
        let volumes = vec![nocloud_volume(
            "cloudinit",
            CloudInitVolumeSource {
                network_data: "version: 2".into(),
                ..Default::default()
            },
        )];
        let data = read_volume_data_source(&volumes).unwrap().unwrap();
        assert!(data.user_data.is_empty());
        assert_eq!(data.network_data, b"version: 2");
    }

    #[test]
    fn test_empty_volume_is_missing_data_source() {
        let volumes = vec![nocloud_volume("cloudinit", CloudInitVolumeSource::default())];
        let err = read_volume_data_source(&volumes).unwrap_err();
        assert!(err.is_missing_data_source());
    }

    #[test]
    fn test_bad_base64() {
        let volumes = vec![configdrive_volume(
            "cloudinit",
            CloudInitVolumeSource {
                user_data_base64: "not base64!".into(),
                ..Default::default()
            },
        )];
        let err = read_volume_data_source(&volumes).unwrap_err();
        assert!(matches!(
            err,
            CloudInitError::Base64Decode {
                field: "userDataBase64",
                ..
            }
        ));

        let volumes = vec![configdrive_volume(
            "cloudinit",
            CloudInitVolumeSource {
                user_data: "fine".into(),
                network_data_base64: "%%%".into(),
                ..Default::default()
            },
        )];
        let err = read_volume_data_source(&volumes).unwrap_err();
        assert!(matches!(
            err,
            CloudInitError::Base64Decode {
                field: "networkDataBase64",
                ..
            }
        ));
    }

    #[test]
    fn test_configdrive_base64_pair() {
        let volumes = vec![configdrive_volume(
            "cloudinit",
            CloudInitVolumeSource {
                user_data_base64: encode("#cloud-config\n"),
                network_data_base64: encode("{\"links\": []}"),
                ..Default::default()
            },
        )];
        let data = read_volume_data_source(&volumes).unwrap().unwrap();
        assert_eq!(data.kind, DataSourceKind::ConfigDrive);
        assert_eq!(data.user_data, b"#cloud-config\n");
        assert_eq!(data.network_data, b"{\"links\": []}");
    }

    #[test]
    fn test_binary_base64_is_passed_through() {
        // gzip magic followed by bytes that are not UTF-8
        let payload = [0x1f, 0x8b, 0x08, 0x00, 0xff, 0xfe, 0x00, 0x80];
        let volumes = vec![configdrive_volume(
            "cloudinit",
            CloudInitVolumeSource {
                user_data_base64: BASE64.encode(payload),
                network_data_base64: BASE64.encode(&payload[4..]),
                ..Default::default()
            },
        )];
        let data = read_volume_data_source(&volumes).unwrap().unwrap();
        assert_eq!(data.user_data, payload);
        assert_eq!(data.network_data, payload[4..]);
    }

    #[test]
    fn test_first_volume_wins() {
        let volumes = vec![
            configdrive_volume(
                "first",
                CloudInitVolumeSource {
                    user_data: "one".into(),
                    ..Default::default()
                },
            ),
            nocloud_volume(
                "second",
                CloudInitVolumeSource {
                    user_data: "two".into(),
                    ..Default::default()
                },
            ),
        ];
        let data = read_volume_data_source(&volumes).unwrap().unwrap();
        assert_eq!(data.kind, DataSourceKind::ConfigDrive);
        assert_eq!(data.volume_name, "first");
        assert_eq!(data.user_data, b"one");
    }

    #[test]
    fn test_validity() {
        let mut data = CloudInitData {
            kind: DataSourceKind::NoCloud,
            metadata: None,
            user_data: "#cloud-config".into(),
            network_data: Vec::new(),
            devices: Vec::new(),
            volume_name: "cloudinit".into(),
        };
        assert!(!data.is_valid());
        assert!(matches!(
            data.validate(),
            Err(CloudInitError::InvalidPayload(_))
        ));

        data.build_metadata(MetadataParams {
            name: "vm1",
            namespace: "ns1",
            instance_id: "id-1",
            ..Default::default()
        });
        assert!(data.is_valid());

        data.metadata = Some(Metadata::ConfigDrive(ConfigDriveMetadata::default()));
        assert!(!data.is_valid());

        data.build_metadata(MetadataParams::default());
        data.user_data.clear();
        assert!(!data.is_valid());
        data.network_data = b"version: 2".to_vec();
        assert!(data.validate().is_ok());
        data.network_data.clear();
        assert!(matches!(
            data.validate(),
            Err(CloudInitError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_build_configdrive_metadata() {
        let devices = vec![DeviceMetadata {
            device_type: DeviceMetadataType::Nic,
            bus: "pci".into(),
            address: "0000:01:00:0".into(),
            mac: Some("02:00:00:84:e9:58".into()),
            serial: None,
            numa_node: None,
            aligned_cpus: vec![],
            tags: vec!["testtag".into()],
        }];
        let mut data = CloudInitData {
            kind: DataSourceKind::ConfigDrive,
            metadata: None,
            user_data: "#cloud-config".into(),
            network_data: Vec::new(),
            devices: Vec::new(),
            volume_name: "cloudinit".into(),
        };
        data.build_metadata(MetadataParams {
            name: "vm1",
            namespace: "ns1",
            instance_type: "u1.small",
            hostname: "vm1",
            instance_id: "uuid-1",
            public_ssh_keys: PublicKeys::from([("0".into(), "key".into())]),
            devices: &devices,
        });

        let Some(Metadata::ConfigDrive(metadata)) = &data.metadata else {
            panic!("expected ConfigDrive metadata");
        };
        assert_eq!(metadata.instance_id, "vm1.ns1");
        assert_eq!(metadata.uuid.as_deref(), Some("uuid-1"));
        assert_eq!(metadata.instance_type.as_deref(), Some("u1.small"));
        assert_eq!(metadata.devices.as_ref(), Some(&devices));
        assert_eq!(data.devices, devices);
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("no-cloud".parse::<DataSourceKind>().unwrap(), DataSourceKind::NoCloud);
        assert_eq!("noCloud".parse::<DataSourceKind>().unwrap(), DataSourceKind::NoCloud);
        assert_eq!(
            "config_drive".parse::<DataSourceKind>().unwrap(),
            DataSourceKind::ConfigDrive
        );
        assert!("ec2".parse::<DataSourceKind>().is_err());
    }

    #[test]
    fn test_kind_constants() {
        assert_eq!(DataSourceKind::NoCloud.volume_id(), "cidata");
        assert_eq!(DataSourceKind::ConfigDrive.volume_id(), "config-2");
        assert_eq!(DataSourceKind::NoCloud.image_file_name(), "noCloud.iso");
        assert_eq!(DataSourceKind::ConfigDrive.image_file_name(), "configdrive.iso");
        assert_eq!(DataSourceKind::ConfigDrive.layout().subdir, "openstack/latest");
    }
}
