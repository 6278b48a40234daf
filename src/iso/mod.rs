//! ISO9660 media generation
//!
//! [`IsoGenerator`] stages the payload files, hands the tree to an
//! [`IsoBuilder`] and publishes the result with an atomic rename.

pub mod generator;
pub mod mock;
pub mod ownership;
pub mod xorriso;

pub use generator::IsoGenerator;
pub use ownership::{ChownOwnership, NoopOwnership, OwnershipManager};
pub use xorriso::Xorrisofs;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::CloudInitError;

/// Packs a directory tree into an ISO9660 image
///
/// Implementations must give up after `timeout` and report
/// [`CloudInitError::GenerationTimedOut`], leaving no process behind.
#[async_trait]
pub trait IsoBuilder: Send + Sync {
    /// Name of this builder (e.g., "xorrisofs", "mock")
    fn name(&self) -> &'static str;

    /// Write an image of `source_dir` labelled `volume_id` to `output`
    async fn build(
        &self,
        output: &Path,
        volume_id: &str,
        source_dir: &Path,
        timeout: Duration,
    ) -> Result<(), CloudInitError>;
}
