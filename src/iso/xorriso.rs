//! xorrisofs mastering tool
//!
//! Runs `xorrisofs -output <out> -volid <id> -joliet -rock
//! -partition_cyl_align on <dir>`. A run that outlives its timeout gets
//! SIGTERM, a short grace period, then SIGKILL.

use async_trait::async_trait;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, error, warn};

use super::IsoBuilder;
use crate::CloudInitError;

/// Default mastering tool executable
pub const DEFAULT_ISO_BINARY: &str = "xorrisofs";

/// Time a terminated tool gets to exit before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// [`IsoBuilder`] backed by an external `xorrisofs` process
#[derive(Debug, Clone)]
pub struct Xorrisofs {
    binary: String,
}

impl Default for Xorrisofs {
    fn default() -> Self {
        Self::new()
    }
}

impl Xorrisofs {
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_ISO_BINARY)
    }

    /// Use a different executable (a wrapper script, or a full path)
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Arguments passed to the tool
    pub fn args(output: &Path, volume_id: &str, source_dir: &Path) -> Vec<String> {
        vec![
            "-output".to_string(),
            output.to_string_lossy().into_owned(),
            "-volid".to_string(),
            volume_id.to_string(),
            "-joliet".to_string(),
            "-rock".to_string(),
            "-partition_cyl_align".to_string(),
            "on".to_string(),
            source_dir.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl IsoBuilder for Xorrisofs {
    fn name(&self) -> &'static str {
        "xorrisofs"
    }

    async fn build(
        &self,
        output: &Path,
        volume_id: &str,
        source_dir: &Path,
        timeout: Duration,
    ) -> Result<(), CloudInitError> {
        let args = Self::args(output, volume_id, source_dir);
        debug!("Running {} {}", self.binary, args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(
                    "{} failed to start while generating iso file {}: {}",
                    self.binary,
                    output.display(),
                    e
                );
                CloudInitError::Io(e)
            })?;

        match tokio::time::timeout(timeout, wait_capturing_stderr(&mut child)).await {
            Ok(result) => {
                let (status, stderr) = result?;
                if status.success() {
                    return Ok(());
                }

                let mut command_line = Vec::with_capacity(args.len() + 1);
                command_line.push(self.binary.clone());
                command_line.extend(args);
                error!(
                    "{} returned {} while generating iso file {} with args '{}': {}",
                    self.binary,
                    status,
                    output.display(),
                    command_line.join(" "),
                    stderr.trim()
                );
                Err(CloudInitError::GenerationToolFailed {
                    args: command_line,
                    status,
                })
            }
            Err(_) => {
                error!("Timed out generating cloud-init iso at path {}", output.display());
                terminate(&mut child).await;
                Err(CloudInitError::GenerationTimedOut {
                    path: output.to_path_buf(),
                    timeout,
                })
            }
        }
    }
}

/// Wait for the child while draining its stderr
async fn wait_capturing_stderr(child: &mut Child) -> std::io::Result<(ExitStatus, String)> {
    let mut stderr = child.stderr.take();
    let mut captured = Vec::new();

    let drain = async {
        match stderr.as_mut() {
            Some(pipe) => pipe.read_to_end(&mut captured).await.map(|_| ()),
            None => Ok(()),
        }
    };
    let (status, drained) = tokio::join!(child.wait(), drain);

    if let Err(e) = drained {
        debug!("Failed to read mastering tool stderr: {}", e);
    }
    Ok((status?, String::from_utf8_lossy(&captured).into_owned()))
}

/// SIGTERM, wait up to [`TERMINATE_GRACE`], then SIGKILL and reap
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let signalled = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|status| status.success());

        if signalled {
            if let Ok(Ok(status)) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                debug!("Mastering tool exited after SIGTERM with {}", status);
                return;
            }
        }
    }

    if let Err(e) = child.start_kill() {
        warn!("Failed to kill mastering tool: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap mastering tool: {}", e);
    }
}
