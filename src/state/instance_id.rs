//! Stable instance ids
//!
//! cloud-init treats a changed instance id as a brand new machine and
//! re-runs its per-instance modules. The firmware UUID is used when the VM
//! declares one; otherwise a random id is generated once and kept next to
//! the VM's media so every regeneration reuses it.

use tokio::fs;
use tracing::{debug, info};

use super::paths::LocalDir;
use crate::CloudInitError;
use crate::vm::VirtualMachine;

/// Resolves and persists per-VM instance ids
#[derive(Debug, Clone)]
pub struct InstanceIdStore {
    local_dir: LocalDir,
}

impl InstanceIdStore {
    pub fn new(local_dir: LocalDir) -> Self {
        Self { local_dir }
    }

    /// Instance id for `vm`, stable across calls
    pub async fn resolve(&self, vm: &VirtualMachine) -> Result<String, CloudInitError> {
        if let Some(uuid) = vm.firmware_uuid.as_deref().filter(|u| !u.is_empty()) {
            return Ok(uuid.to_string());
        }

        let path = self.local_dir.instance_id_file(&vm.name, &vm.namespace);
        match fs::read_to_string(&path).await {
            Ok(cached) if !cached.trim().is_empty() => {
                debug!("Using cached instance id from {}", path.display());
                return Ok(cached.trim().to_string());
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.local_dir
            .prepare_local_path(&vm.name, &vm.namespace)
            .await?;

        // The id file is either absent or complete
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &id).await?;
        fs::rename(&tmp, &path).await?;

        info!(
            "Generated instance id {} for {}/{} (no firmware UUID)",
            id, vm.namespace, vm.name
        );
        Ok(id)
    }
}
