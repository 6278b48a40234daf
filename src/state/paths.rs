//! On-disk layout of generated cloud-init media
//!
//! ```text
//! <root>/<namespace>/<name>/
//!     noCloud.iso | configdrive.iso     published image
//!     <image>.staging                   image being built
//!     data/                             transient plain files
//!     instance-id                       generated stable id
//! ```

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::CloudInitError;
use crate::datasources::DataSourceKind;

/// Default root for generated media
pub const DEFAULT_LOCAL_DIR: &str = "/var/run/libvirt/cloud-init-dir";

const STAGING_SUFFIX: &str = ".staging";
const DATA_DIR: &str = "data";
const INSTANCE_ID_FILE: &str = "instance-id";

/// An initialized media root.
///
/// The only way to obtain one is [`LocalDir::initialize`], which creates the
/// directory and checks it is usable, so no path can be computed against a
/// root that does not exist.
#[derive(Debug, Clone)]
pub struct LocalDir {
    root: PathBuf,
}

/// Paths used while generating the image of one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub kind: DataSourceKind,
    /// `<root>/<namespace>/<name>`
    pub base: PathBuf,
    /// Root of the tree packed into the image
    pub data_root: PathBuf,
    /// Directory holding the data files (`data_root` or below it)
    pub data_dir: PathBuf,
    /// Published image
    pub image: PathBuf,
    /// Image under construction
    pub staging: PathBuf,
}

impl LocalDir {
    /// Create `root` if needed and verify it is an accessible directory
    pub async fn initialize(root: impl AsRef<Path>) -> Result<Self, CloudInitError> {
        let root = root.as_ref();
        create_dir_all_relaxed(root).await.map_err(|e| {
            CloudInitError::Config(format!(
                "unable to initialize cloud-init local directory ({}): {e}",
                root.display()
            ))
        })?;

        match fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(CloudInitError::Config(format!(
                    "cloud-init local directory ({}) is not a directory",
                    root.display()
                )));
            }
            Err(e) => {
                return Err(CloudInitError::Config(format!(
                    "cloud-init local directory ({}) does not exist or is inaccessible: {e}",
                    root.display()
                )));
            }
        }

        debug!("Using cloud-init local directory {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<namespace>/<name>`
    pub fn domain_dir(&self, name: &str, namespace: &str) -> PathBuf {
        self.root.join(namespace).join(name)
    }

    /// Where the generated stable instance id of a VM is kept
    pub fn instance_id_file(&self, name: &str, namespace: &str) -> PathBuf {
        self.domain_dir(name, namespace).join(INSTANCE_ID_FILE)
    }

    pub fn image_path(&self, kind: DataSourceKind, name: &str, namespace: &str) -> PathBuf {
        self.domain_dir(name, namespace).join(kind.image_file_name())
    }

    pub fn artifact_paths(
        &self,
        kind: DataSourceKind,
        name: &str,
        namespace: &str,
    ) -> ArtifactPaths {
        let base = self.domain_dir(name, namespace);
        let data_root = base.join(DATA_DIR);
        let subdir = kind.layout().subdir;
        let data_dir = if subdir.is_empty() {
            data_root.clone()
        } else {
            data_root.join(subdir)
        };
        let image = base.join(kind.image_file_name());
        let staging = staging_path(&image);

        ArtifactPaths {
            kind,
            base,
            data_root,
            data_dir,
            image,
            staging,
        }
    }

    /// Create the VM directory
    pub async fn prepare_local_path(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<(), CloudInitError> {
        create_dir_all_relaxed(&self.domain_dir(name, namespace)).await?;
        Ok(())
    }
}

impl ArtifactPaths {
    pub fn meta_data_file(&self) -> PathBuf {
        self.data_dir.join(self.kind.layout().meta_data)
    }

    pub fn user_data_file(&self) -> PathBuf {
        self.data_dir.join(self.kind.layout().user_data)
    }

    pub fn network_data_file(&self) -> PathBuf {
        self.data_dir.join(self.kind.layout().network_data)
    }
}

fn staging_path(image: &Path) -> PathBuf {
    let mut staging = image.as_os_str().to_os_string();
    staging.push(STAGING_SUFFIX);
    PathBuf::from(staging)
}

/// `mkdir -p` with world-readable permissions (0755)
pub async fn create_dir_all_relaxed(path: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o755);
    builder.create(path).await
}
