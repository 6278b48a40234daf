//! Secret-backed cloud-init inputs
//!
//! Secrets are projected into the filesystem below a single root:
//!
//! - `<root>/<secretName>-access-cred/<file>`: one SSH public key per file
//! - `<root>/<volumeName>/{userdata|userData}` and
//!   `<root>/<volumeName>/{networkdata|networkData}`: data overrides
//!
//! Kubernetes secret projection adds `..data` style entries next to the
//! real files; those are ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::CloudInitError;
use crate::datasources::DataSourceKind;
use crate::vm::{AccessCredential, Volume};

/// Default mount root for secrets
pub const DEFAULT_SECRET_DIR: &str = "/var/run/kubevirt-private/secret";

/// SSH public keys indexed `"0"`, `"1"`, ...
pub type PublicKeys = BTreeMap<String, String>;

const ACCESS_CRED_SUFFIX: &str = "-access-cred";
const USER_DATA_FILES: &[&str] = &["userdata", "userData"];
const NETWORK_DATA_FILES: &[&str] = &["networkdata", "networkData"];

/// Reads SSH keys and data overrides from the secret mount tree
#[derive(Debug, Clone)]
pub struct SecretResolver {
    root: PathBuf,
}

impl Default for SecretResolver {
    fn default() -> Self {
        Self::new(DEFAULT_SECRET_DIR)
    }
}

impl SecretResolver {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the keys of an access credential secret
    pub fn access_cred_dir(&self, secret_name: &str) -> PathBuf {
        self.root.join(format!("{secret_name}{ACCESS_CRED_SUFFIX}"))
    }

    /// Collect SSH public keys propagated through `kind`.
    ///
    /// Indices run on across credentials, so two credentials with two keys
    /// each yield `"0"` through `"3"`. Empty key files are skipped.
    pub async fn resolve_ssh_public_keys(
        &self,
        credentials: &[AccessCredential],
        kind: DataSourceKind,
    ) -> Result<PublicKeys, CloudInitError> {
        let mut keys = PublicKeys::new();

        for secret_name in credentials
            .iter()
            .filter_map(|cred| cred.ssh_key_secret_for(kind))
        {
            let dir = self.access_cred_dir(secret_name);
            for path in list_secret_files(&dir).await? {
                let key = fs::read_to_string(&path)
                    .await
                    .map_err(|e| CloudInitError::secret(&path, e))?;
                if key.is_empty() {
                    continue;
                }
                keys.insert(keys.len().to_string(), key);
            }
        }

        debug!("Resolved {} SSH public keys for {}", keys.len(), kind);
        Ok(keys)
    }

    /// Replace user-data and network-data of `volume` with secret content.
    ///
    /// Only references the volume declares are read. When both are declared
    /// and neither can be read the volume has no usable data; one of them
    /// failing alone is tolerated.
    pub async fn resolve_data_overrides(
        &self,
        volume: &mut Volume,
        kind: DataSourceKind,
    ) -> Result<(), CloudInitError> {
        let name = volume.name.clone();
        let dir = self.root.join(&name);
        let Some(source) = volume.cloud_init_source_mut(kind) else {
            return Ok(());
        };
        if !source.has_secret_refs() {
            return Ok(());
        }

        let user_data = if source.user_data_secret_ref.is_some() {
            Some(read_first_found(&dir, USER_DATA_FILES).await)
        } else {
            None
        };
        let network_data = if source.network_data_secret_ref.is_some() {
            Some(read_first_found(&dir, NETWORK_DATA_FILES).await)
        } else {
            None
        };

        if let (Some(Err(_)), Some(Err(_))) = (&user_data, &network_data) {
            return Err(CloudInitError::MissingDataSource(format!(
                "no cloud-init data-source found at volume: {name}"
            )));
        }

        if let Some(Ok(data)) = user_data {
            if !data.is_empty() {
                source.user_data = data;
            }
        }
        if let Some(Ok(data)) = network_data {
            if !data.is_empty() {
                source.network_data = data;
            }
        }

        Ok(())
    }
}

/// Regular entries of a secret directory, sorted by name
async fn list_secret_files(dir: &Path) -> Result<Vec<PathBuf>, CloudInitError> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| CloudInitError::secret(dir, e))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CloudInitError::secret(dir, e))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| CloudInitError::secret(entry.path(), e))?;
        let projected = entry.file_name().to_string_lossy().starts_with("..");
        if file_type.is_dir() || projected {
            continue;
        }
        files.push(entry.path());
    }

    files.sort();
    Ok(files)
}

/// Raw content of the first readable file among `names` in `dir`
async fn read_first_found(dir: &Path, names: &[&str]) -> std::io::Result<Vec<u8>> {
    let mut last_err = None;
    for name in names {
        let path = dir.join(name);
        match fs::read(&path).await {
            Ok(data) => return Ok(data),
            Err(e) => {
                warn!("Could not read data from source {}: {}", path.display(), e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{
        AccessCredentialSecret, CloudInitVolumeSource, PropagationMarker, PropagationMethod,
        SecretReference, SshPublicKeyAccessCredential, SshPublicKeySource,
    };
    use tempfile::TempDir;

    fn credential(secret: &str, kind: DataSourceKind) -> AccessCredential {
        let mut propagation_method = PropagationMethod::default();
        match kind {
            DataSourceKind::NoCloud => propagation_method.no_cloud = Some(PropagationMarker {}),
            DataSourceKind::ConfigDrive => {
                propagation_method.config_drive = Some(PropagationMarker {})
            }
        }
        AccessCredential {
            ssh_public_key: Some(SshPublicKeyAccessCredential {
                source: SshPublicKeySource {
                    secret: Some(AccessCredentialSecret {
                        secret_name: secret.into(),
                    }),
                },
                propagation_method,
            }),
        }
    }

    fn write_keys(root: &Path, secret: &str, keys: &[(&str, &str)]) {
        let dir = root.join(format!("{secret}-access-cred"));
        std::fs::create_dir_all(&dir).unwrap();
        for (name, key) in keys {
            std::fs::write(dir.join(name), key).unwrap();
        }
    }

    fn secret_volume(user: bool, network: bool) -> Volume {
        Volume {
            name: "cloudinit".into(),
            cloud_init_no_cloud: Some(CloudInitVolumeSource {
                user_data_secret_ref: user.then(|| SecretReference {
                    name: "user-secret".into(),
                }),
                network_data_secret_ref: network.then(|| SecretReference {
                    name: "net-secret".into(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ssh_key_indices_span_credentials() {
        let temp = TempDir::new().unwrap();
        write_keys(temp.path(), "a", &[("k1", "key-a1"), ("k2", "key-a2")]);
        write_keys(temp.path(), "b", &[("k1", "key-b1"), ("k2", "key-b2")]);

        let resolver = SecretResolver::new(temp.path());
        for order in [["a", "b"], ["b", "a"]] {
            let creds: Vec<_> = order
                .iter()
                .map(|name| credential(name, DataSourceKind::NoCloud))
                .collect();
            let keys = resolver
                .resolve_ssh_public_keys(&creds, DataSourceKind::NoCloud)
                .await
                .unwrap();
            let indices: Vec<_> = keys.keys().cloned().collect();
            assert_eq!(indices, ["0", "1", "2", "3"]);
            assert_eq!(keys["0"], format!("key-{}1", order[0]));
            assert_eq!(keys["3"], format!("key-{}2", order[1]));
        }
    }

    #[tokio::test]
    async fn test_ssh_keys_skip_projection_artifacts() {
        let temp = TempDir::new().unwrap();
        write_keys(temp.path(), "keys", &[("id", "ssh-rsa AAAA"), ("empty", "")]);
        let dir = temp.path().join("keys-access-cred");
        std::fs::create_dir_all(dir.join("..2024_01_01")).unwrap();
        std::fs::write(dir.join("..data"), "ignored").unwrap();
        std::fs::create_dir_all(dir.join("nested")).unwrap();

        let resolver = SecretResolver::new(temp.path());
        let keys = resolver
            .resolve_ssh_public_keys(
                &[credential("keys", DataSourceKind::NoCloud)],
                DataSourceKind::NoCloud,
            )
            .await
            .unwrap();
        assert_eq!(keys, PublicKeys::from([("0".into(), "ssh-rsa AAAA".into())]));
    }

    #[tokio::test]
    async fn test_ssh_keys_filtered_by_propagation_method() {
        let temp = TempDir::new().unwrap();
        write_keys(temp.path(), "nc", &[("id", "nocloud-key")]);
        write_keys(temp.path(), "cd", &[("id", "configdrive-key")]);
        let creds = [
            credential("nc", DataSourceKind::NoCloud),
            credential("cd", DataSourceKind::ConfigDrive),
        ];

        let resolver = SecretResolver::new(temp.path());
        let keys = resolver
            .resolve_ssh_public_keys(&creds, DataSourceKind::ConfigDrive)
            .await
            .unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys["0"], "configdrive-key");
    }

    #[tokio::test]
    async fn test_missing_access_cred_dir_is_error() {
        let temp = TempDir::new().unwrap();
        let resolver = SecretResolver::new(temp.path());
        let err = resolver
            .resolve_ssh_public_keys(
                &[credential("absent", DataSourceKind::NoCloud)],
                DataSourceKind::NoCloud,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CloudInitError::SecretResolutionFailed { .. }));
    }

    #[tokio::test]
    async fn test_resolve_overrides() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("cloudinit");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("userdata"), "secret-user").unwrap();
        std::fs::write(dir.join("networkdata"), "secret-net").unwrap();

        let resolver = SecretResolver::new(temp.path());
        let mut volume = secret_volume(true, true);
        resolver
            .resolve_data_overrides(&mut volume, DataSourceKind::NoCloud)
            .await
            .unwrap();

        let source = volume.cloud_init_no_cloud.unwrap();
        assert_eq!(source.user_data, b"secret-user");
        assert_eq!(source.network_data, b"secret-net");
    }

    #[tokio::test]
    async fn test_resolve_camel_case_overrides() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("cloudinit");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("userData"), "camel-user").unwrap();
        std::fs::write(dir.join("networkData"), "camel-net").unwrap();

        let resolver = SecretResolver::new(temp.path());
        let mut volume = secret_volume(true, true);
        resolver
            .resolve_data_overrides(&mut volume, DataSourceKind::NoCloud)
            .await
            .unwrap();

        let source = volume.cloud_init_no_cloud.unwrap();
        assert_eq!(source.user_data, b"camel-user");
        assert_eq!(source.network_data, b"camel-net");
    }

    #[tokio::test]
    async fn test_binary_override_kept_verbatim() {
        let payload = [0x1f, 0x8b, 0x08, 0x00, 0xff, 0xfe, 0x00, 0x80];
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("cloudinit");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("userdata"), payload).unwrap();

        let resolver = SecretResolver::new(temp.path());
        let mut volume = secret_volume(true, false);
        resolver
            .resolve_data_overrides(&mut volume, DataSourceKind::NoCloud)
            .await
            .unwrap();

        assert_eq!(volume.cloud_init_no_cloud.unwrap().user_data, payload);
    }

    #[tokio::test]
    async fn test_volume_without_refs_untouched() {
        let temp = TempDir::new().unwrap();
        let resolver = SecretResolver::new(temp.path());
        let mut volume = secret_volume(false, false);
        resolver
            .resolve_data_overrides(&mut volume, DataSourceKind::NoCloud)
            .await
            .unwrap();
        assert!(volume.cloud_init_no_cloud.unwrap().user_data.is_empty());
    }

    #[tokio::test]
    async fn test_both_overrides_unreadable() {
        let temp = TempDir::new().unwrap();
        let resolver = SecretResolver::new(temp.path());
        let mut volume = secret_volume(true, true);
        let err = resolver
            .resolve_data_overrides(&mut volume, DataSourceKind::NoCloud)
            .await
            .unwrap_err();
        assert!(err.is_missing_data_source());
    }

    #[tokio::test]
    async fn test_partial_override_accepted() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("cloudinit");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("userdata"), "only-user").unwrap();

        let resolver = SecretResolver::new(temp.path());
        let mut volume = secret_volume(true, true);
        resolver
            .resolve_data_overrides(&mut volume, DataSourceKind::NoCloud)
            .await
            .unwrap();

        let source = volume.cloud_init_no_cloud.unwrap();
        assert_eq!(source.user_data, b"only-user");
        assert!(source.network_data.is_empty());
    }
}
