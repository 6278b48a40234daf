//! Per-VM state on the host
//!
//! Manages the media directory tree:
//! - Root initialization and artifact paths
//! - Stable instance ids for VMs without a firmware UUID

pub mod instance_id;
pub mod paths;

pub use instance_id::InstanceIdStore;
pub use paths::{ArtifactPaths, DEFAULT_LOCAL_DIR, LocalDir, create_dir_all_relaxed};
