//! Image generation and publication
//!
//! Every run starts by removing leftovers of earlier runs, writes the payload
//! files with owner-only permissions, masters the staging image, and renames
//! it over the published one. The plain payload files are removed again
//! whatever the outcome.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{ChownOwnership, IsoBuilder, NoopOwnership, OwnershipManager, Xorrisofs};
use crate::CloudInitError;
use crate::config::{DEFAULT_ISO_TIMEOUT_SECS, GeneratorConfig};
use crate::datasources::{CloudInitData, DataSourceKind};
use crate::state::{ArtifactPaths, LocalDir, create_dir_all_relaxed};

/// Builds and publishes cloud-init images below a [`LocalDir`]
///
/// Calls for different VMs may run concurrently. Calls for the same VM
/// must be serialized by the caller.
#[derive(Clone)]
pub struct IsoGenerator {
    local_dir: LocalDir,
    builder: Arc<dyn IsoBuilder>,
    ownership: Arc<dyn OwnershipManager>,
    timeout: Duration,
}

impl std::fmt::Debug for IsoGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoGenerator")
            .field("local_dir", &self.local_dir)
            .field("builder", &self.builder.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl IsoGenerator {
    /// Generator using `xorrisofs` with the default timeout, leaving file
    /// ownership unchanged
    pub fn new(local_dir: LocalDir) -> Self {
        Self {
            local_dir,
            builder: Arc::new(Xorrisofs::new()),
            ownership: Arc::new(NoopOwnership),
            timeout: Duration::from_secs(DEFAULT_ISO_TIMEOUT_SECS),
        }
    }

    /// Initialize the local directory and wire collaborators from `config`
    pub async fn from_config(config: &GeneratorConfig) -> Result<Self, CloudInitError> {
        let local_dir = LocalDir::initialize(&config.local_dir).await?;
        let mut generator = Self::new(local_dir)
            .with_builder(Xorrisofs::with_binary(&config.iso_binary))
            .with_timeout(config.iso_timeout());
        if let Some(owner) = &config.file_owner {
            generator = generator.with_ownership(ChownOwnership::new(owner));
        }
        Ok(generator)
    }

    pub fn with_builder(mut self, builder: impl IsoBuilder + 'static) -> Self {
        self.builder = Arc::new(builder);
        self
    }

    pub fn with_ownership(mut self, ownership: impl OwnershipManager + 'static) -> Self {
        self.ownership = Arc::new(ownership);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_dir(&self) -> &LocalDir {
        &self.local_dir
    }

    /// Build and publish the image for VM `name` in `namespace`.
    ///
    /// On any error the previously published image, if one exists, is left
    /// untouched.
    pub async fn generate(
        &self,
        name: &str,
        namespace: &str,
        data: &CloudInitData,
    ) -> Result<(), CloudInitError> {
        check_identity(name)?;
        if data.user_data.is_empty() && data.network_data.is_empty() {
            return Err(CloudInitError::MissingDataSource(
                "user-data or network-data is required for a cloud-init data source".into(),
            ));
        }
        let metadata = data.validate()?.to_json()?;

        let paths = self.local_dir.artifact_paths(data.kind, name, namespace);
        create_dir_all_relaxed(&paths.data_dir).await.map_err(|e| {
            warn!(
                "Unable to create cloud-init data path {}: {}",
                paths.data_dir.display(),
                e
            );
            CloudInitError::Io(e)
        })?;

        let result = self.stage_and_publish(&paths, data, &metadata).await;
        remove_data_files(&paths).await;
        if result.is_err() {
            remove_best_effort(&paths.staging).await;
        }
        result?;

        info!("Generated {} iso file {}", data.kind, paths.image.display());
        Ok(())
    }

    async fn stage_and_publish(
        &self,
        paths: &ArtifactPaths,
        data: &CloudInitData,
        metadata: &[u8],
    ) -> Result<(), CloudInitError> {
        let user_file = paths.user_data_file();
        let meta_file = paths.meta_data_file();
        let network_file = paths.network_data_file();

        remove_files_if_exist(&[&user_file, &meta_file, &network_file, &paths.staging])
            .await?;

        write_private(&user_file, &data.user_data).await?;
        write_private(&meta_file, metadata).await?;
        if !data.network_data.is_empty() {
            write_private(&network_file, &data.network_data).await?;
        }

        debug!("Mastering {} image with {}", data.kind, self.builder.name());
        self.builder
            .build(
                &paths.staging,
                data.kind.volume_id(),
                &paths.data_root,
                self.timeout,
            )
            .await?;

        self.publish(paths).await
    }

    /// Publish a zero-filled placeholder image of `size` bytes.
    ///
    /// The file is sparse where the filesystem supports it.
    pub async fn generate_empty(
        &self,
        name: &str,
        namespace: &str,
        kind: DataSourceKind,
        size: u64,
    ) -> Result<(), CloudInitError> {
        check_identity(name)?;
        let paths = self.local_dir.artifact_paths(kind, name, namespace);

        remove_files_if_exist(&[&paths.staging]).await?;
        create_dir_all_relaxed(&paths.base).await.map_err(|e| {
            warn!(
                "Unable to create cloud-init base path {}: {}",
                paths.base.display(),
                e
            );
            CloudInitError::Io(e)
        })?;

        let result = async {
            write_sparse(&paths.staging, size).await?;
            self.publish(&paths).await
        }
        .await;
        if result.is_err() {
            remove_best_effort(&paths.staging).await;
        }
        result?;

        info!(
            "Generated empty iso file {} ({} bytes)",
            paths.image.display(),
            size
        );
        Ok(())
    }

    /// Hand the staging image over, flush it to disk and rename it into place
    async fn publish(&self, paths: &ArtifactPaths) -> Result<(), CloudInitError> {
        self.ownership.set_file_ownership(&paths.staging).await?;

        // The rename must never expose an image whose data is not on disk yet
        fs::File::open(&paths.staging).await?.sync_all().await?;

        fs::rename(&paths.staging, &paths.image).await.map_err(|source| {
            warn!(
                "Cloud-init failed to rename file {} to {}: {}",
                paths.staging.display(),
                paths.image.display(),
                source
            );
            CloudInitError::PublishFailed {
                from: paths.staging.clone(),
                to: paths.image.clone(),
                source,
            }
        })
    }
}

fn check_identity(name: &str) -> Result<(), CloudInitError> {
    if name.is_empty() {
        return Err(CloudInitError::InvalidPayload(
            "VM name must not be empty".into(),
        ));
    }
    Ok(())
}

/// Create or truncate `path` with mode 0600 and write `content`
async fn write_private(path: &Path, content: &[u8]) -> Result<(), CloudInitError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(content).await?;
    file.flush().await?;
    Ok(())
}

/// Create a `size`-byte file by writing one zero byte at its end
async fn write_sparse(path: &Path, size: u64) -> Result<(), CloudInitError> {
    let mut file = fs::File::create(path).await.map_err(|e| {
        CloudInitError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to create empty iso {}: {e}", path.display()),
        ))
    })?;
    if size > 0 {
        file.seek(SeekFrom::Start(size - 1)).await?;
        file.write_all(&[0]).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn remove_files_if_exist(paths: &[&Path]) -> Result<(), CloudInitError> {
    for path in paths {
        match fs::remove_file(path).await {
            Ok(()) => debug!("Removed stale file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn remove_best_effort(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Drop the plain payload files; the image is the only copy kept
async fn remove_data_files(paths: &ArtifactPaths) {
    for file in [
        paths.user_data_file(),
        paths.meta_data_file(),
        paths.network_data_file(),
    ] {
        remove_best_effort(&file).await;
    }
    match fs::remove_dir_all(&paths.data_root).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Failed to remove cloud-init data directory {}: {}",
            paths.data_root.display(),
            e
        ),
    }
}
