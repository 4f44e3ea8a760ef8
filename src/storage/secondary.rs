use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::PathBuf;

use super::{Storage, StoredBundle, local::list_dir};
use crate::errors::BackupErrorKind;

/// Per the canonical atomic-copy model (§9 Open Question), `SECONDARY_PATH`
/// is always a local or already-mounted filesystem path — no rsync/SSH
/// transport is implemented here. Unlike the local tier this one is
/// non-critical: a failure is logged and the run continues.
pub struct SecondaryStorage {
    path: PathBuf,
}

impl SecondaryStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Storage for SecondaryStorage {
    fn name(&self) -> &'static str {
        "secondary"
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn store(&self, bundle_path: &std::path::Path, file_name: &str) -> Result<()> {
        let result = (|| -> Result<()> {
            fs::create_dir_all(&self.path).with_context(|| format!("mkdir {}", self.path.display()))?;
            let dest = self.path.join(file_name);
            let tmp = self.path.join(format!(".{file_name}.part"));
            fs::copy(bundle_path, &tmp)
                .with_context(|| format!("copy {} -> {}", bundle_path.display(), tmp.display()))?;
            File::open(&tmp)?.sync_all().context("fsync staged copy")?;
            fs::rename(&tmp, &dest)
                .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))
        })();
        result.map_err(|e| e.context(BackupErrorKind::StorageFailed))
    }

    fn list(&self) -> Result<Vec<StoredBundle>> {
        list_dir(&self.path)
    }

    fn delete(&self, name: &str) -> Result<()> {
        fs::remove_file(self.path.join(name)).with_context(|| format!("remove {name}"))
    }

    fn fetch_to(&self, name: &str, dest_dir: &std::path::Path) -> Result<PathBuf> {
        fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(name);
        fs::copy(self.path.join(name), &dest).with_context(|| format!("fetch {name} from secondary tier"))?;
        Ok(dest)
    }
}
