//! Mock ISO builder for testing
//!
//! Records every invocation together with a snapshot of the staged files,
//! and writes a small text "image" listing them instead of running a real
//! mastering tool.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;

use super::IsoBuilder;
use crate::CloudInitError;

/// One recorded [`IsoBuilder::build`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoBuildCall {
    pub output: PathBuf,
    pub volume_id: String,
    pub source_dir: PathBuf,
    /// Staged files at build time, keyed by path relative to `source_dir`
    pub files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Succeed,
    Exit(i32),
    Hang,
}

/// Mock mastering tool
///
/// # Example
/// ```
/// use cidata_iso::iso::mock::MockIsoBuilder;
///
/// let builder = MockIsoBuilder::new().with_exit_code(1);
/// ```
#[derive(Debug, Clone)]
pub struct MockIsoBuilder {
    outcome: Outcome,
    calls: Arc<Mutex<Vec<IsoBuildCall>>>,
}

impl Default for MockIsoBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockIsoBuilder {
    /// A builder that always succeeds
    pub fn new() -> Self {
        Self {
            outcome: Outcome::Succeed,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail as if the tool exited with `code`
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.outcome = Outcome::Exit(code);
        self
    }

    /// Never finish; the call times out
    pub fn with_hang(mut self) -> Self {
        self.outcome = Outcome::Hang;
        self
    }

    /// Calls made so far (shared between clones)
    pub async fn calls(&self) -> Vec<IsoBuildCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl IsoBuilder for MockIsoBuilder {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn build(
        &self,
        output: &Path,
        volume_id: &str,
        source_dir: &Path,
        timeout: Duration,
    ) -> Result<(), CloudInitError> {
        let files = snapshot(source_dir).await?;
        self.calls.lock().await.push(IsoBuildCall {
            output: output.to_path_buf(),
            volume_id: volume_id.to_string(),
            source_dir: source_dir.to_path_buf(),
            files: files.clone(),
        });

        match self.outcome {
            Outcome::Succeed => {
                let mut image = format!("volid={volume_id}\n");
                for (name, content) in &files {
                    image.push_str(&format!("{name}:{}\n", content.len()));
                }
                fs::write(output, image).await?;
                Ok(())
            }
            Outcome::Exit(code) => {
                // Leave a partial image behind, like a tool dying mid-write
                fs::write(output, b"partial").await?;
                Err(CloudInitError::GenerationToolFailed {
                    args: vec!["mock".to_string(), volume_id.to_string()],
                    status: ExitStatus::from_raw(code << 8),
                })
            }
            Outcome::Hang => {
                let _ = tokio::time::timeout(timeout, std::future::pending::<()>()).await;
                Err(CloudInitError::GenerationTimedOut {
                    path: output.to_path_buf(),
                    timeout,
                })
            }
        }
    }
}

/// Read every regular file below `root`
async fn snapshot(root: &Path) -> Result<BTreeMap<String, Vec<u8>>, CloudInitError> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
                continue;
            }
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            files.insert(relative, fs::read(&path).await?);
        }
    }

    Ok(files)
}
