pub mod cloud;
pub mod local;
pub mod secondary;

use anyhow::Result;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct StoredBundle {
    pub name: String,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

/// Uniform interface the orchestrator dispatches a finished bundle through.
/// `is_critical` decides whether a failure here aborts the run
/// (`BackupErrorKind::StorageFailed`) or is logged and tolerated — per the
/// spec only the local tier is critical.
pub trait Storage: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_critical(&self) -> bool;
    fn store(&self, bundle_path: &std::path::Path, file_name: &str) -> Result<()>;
    fn list(&self) -> Result<Vec<StoredBundle>>;
    fn delete(&self, name: &str) -> Result<()>;
    /// Fetches `name` into `dest_dir` (unchanged name) and returns the local
    /// path, so the restore workflow can inspect/decrypt a bundle uniformly
    /// regardless of which tier it lives on.
    fn fetch_to(&self, name: &str, dest_dir: &std::path::Path) -> Result<std::path::PathBuf>;
}
