//! cidata-iso library
//!
//! Builds the cloud-init bootstrap media attached to virtual machines: a
//! NoCloud (`cidata`) or OpenStack ConfigDrive (`config-2`) ISO9660 image
//! carrying user-data, network-data and generated metadata.
//!
//! # Flow
//!
//! 1. [`datasources::read_cloud_init_volume_data_source`] resolves secrets,
//!    reads the VM's cloud-init volume and builds the metadata.
//! 2. [`IsoGenerator::generate`] stages the files, masters the image and
//!    publishes it with an atomic rename.
//!
//! # Design Principles
//!
//! - **Safety First**: No unsafe code (`unsafe_code = "forbid"`)
//! - **Never publish half an image**: a failed run leaves the previous
//!   image in place
//! - **Injectable collaborators**: the mastering tool and file ownership
//!   are traits, so tests run without `xorrisofs` or root

pub mod config;
pub mod datasources;
pub mod iso;
pub mod secrets;
pub mod state;
pub mod vm;

mod error;

pub use config::GeneratorConfig;
pub use datasources::{CloudInitData, DataSourceKind, Metadata};
pub use error::CloudInitError;
pub use iso::IsoGenerator;
pub use secrets::SecretResolver;
pub use state::{InstanceIdStore, LocalDir};
pub use vm::VirtualMachine;

use tracing::info;

/// Resolve the cloud-init payload of `vm` and publish its image.
///
/// Returns `Ok(None)` when the VM has no cloud-init volume, otherwise the
/// data source kind of the published image.
pub async fn generate_for_vm(
    generator: &IsoGenerator,
    secrets: &SecretResolver,
    vm: &mut VirtualMachine,
) -> Result<Option<DataSourceKind>, CloudInitError> {
    let ids = InstanceIdStore::new(generator.local_dir().clone());
    let Some(data) = datasources::read_cloud_init_volume_data_source(vm, secrets, &ids).await?
    else {
        info!("VM {}/{} has no cloud-init volume", vm.namespace, vm.name);
        return Ok(None);
    };

    generator.generate(&vm.name, &vm.namespace, &data).await?;
    Ok(Some(data.kind))
}
