use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::path::PathBuf;

use super::{Storage, StoredBundle};
use crate::errors::BackupErrorKind;

/// The one critical tier: a same-host (or direct-attach) directory. Writes
/// go through a temp file + fsync + rename so a crash mid-copy never leaves
/// a half-written bundle at the final name.
pub struct LocalStorage {
    dir: PathBuf,
}

impl LocalStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl Storage for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    fn is_critical(&self) -> bool {
        true
    }

    fn store(&self, bundle_path: &std::path::Path, file_name: &str) -> Result<()> {
        let result = (|| -> Result<()> {
            fs::create_dir_all(&self.dir).with_context(|| format!("mkdir {}", self.dir.display()))?;
            let dest = self.dir.join(file_name);
            let tmp = self.dir.join(format!(".{file_name}.part"));

            fs::copy(bundle_path, &tmp)
                .with_context(|| format!("copy {} -> {}", bundle_path.display(), tmp.display()))?;
            File::open(&tmp)?.sync_all().context("fsync staged copy")?;
            fs::rename(&tmp, &dest)
                .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;
            if let Ok(dir_handle) = File::open(&self.dir) {
                let _ = dir_handle.sync_all();
            }
            Ok(())
        })();
        result.map_err(|e| e.context(BackupErrorKind::StorageFailed))
    }

    fn list(&self) -> Result<Vec<StoredBundle>> {
        list_dir(&self.dir)
    }

    fn delete(&self, name: &str) -> Result<()> {
        fs::remove_file(self.dir.join(name)).with_context(|| format!("remove {name}"))
    }

    fn fetch_to(&self, name: &str, dest_dir: &std::path::Path) -> Result<PathBuf> {
        fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(name);
        fs::copy(self.dir.join(name), &dest).with_context(|| format!("fetch {name} from local tier"))?;
        Ok(dest)
    }
}

pub(super) fn list_dir(dir: &std::path::Path) -> Result<Vec<StoredBundle>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read_dir {}", dir.display()))? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let modified: DateTime<Utc> = meta.modified()?.into();
        out.push(StoredBundle {
            name,
            modified,
            size: meta.len(),
        });
    }
    out.sort_by(|a, b| a.modified.cmp(&b.modified));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn store_then_list_round_trips() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("bundle.tar");
        fs::write(&src, b"data").unwrap();

        let storage = LocalStorage::new(tmp.path().join("local"));
        storage.store(&src, "run-1.bundle.tar").unwrap();

        let listed = storage.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "run-1.bundle.tar");
    }

    #[test]
    fn no_partial_file_left_behind() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("bundle.tar");
        fs::write(&src, b"data").unwrap();
        let storage = LocalStorage::new(tmp.path().join("local"));
        storage.store(&src, "run-1.bundle.tar").unwrap();
        assert!(!storage.dir.join(".run-1.bundle.tar.part").exists());
    }

    #[test]
    fn fetch_to_copies_stored_bundle() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("bundle.tar");
        fs::write(&src, b"data").unwrap();
        let storage = LocalStorage::new(tmp.path().join("local"));
        storage.store(&src, "run-1.bundle.tar").unwrap();

        let fetched = storage.fetch_to("run-1.bundle.tar", &tmp.path().join("work")).unwrap();
        assert_eq!(fs::read(fetched).unwrap(), b"data");
    }

    #[test]
    fn is_critical_is_true() {
        let storage = LocalStorage::new(PathBuf::from("/tmp/whatever"));
        assert!(storage.is_critical());
    }
}
