use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::errors::BackupErrorKind;

/// Fuses the archive, its checksum file and its manifest into one
/// zero-compression outer tar — the canonical on-wire artifact dispatched to
/// storage tiers. Order is fixed (archive, checksum, manifest) so a
/// streaming reader can start restoring the archive before the trailer has
/// even arrived.
pub fn create_bundle(
    archive_path: &Path,
    checksum_path: &Path,
    manifest_path: &Path,
    bundle_path: &Path,
) -> Result<()> {
    let result = (|| -> Result<()> {
        if let Some(parent) = bundle_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let out = File::create(bundle_path)
            .with_context(|| format!("create bundle {}", bundle_path.display()))?;
        let mut builder = tar::Builder::new(out);

        for (path, arcname) in [
            (archive_path, file_name(archive_path)?),
            (checksum_path, file_name(checksum_path)?),
            (manifest_path, file_name(manifest_path)?),
        ] {
            let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
            builder
                .append_file(arcname, &mut f)
                .with_context(|| format!("append {} to bundle", path.display()))?;
        }
        builder.finish().context("finish bundle tar")?;
        Ok(())
    })();

    result.map_err(|e| e.context(BackupErrorKind::ArchiveFailed))?;

    for path in [archive_path, checksum_path, manifest_path] {
        std::fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

fn file_name(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        path.file_name()
            .with_context(|| format!("{} has no file name", path.display()))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bundle_contains_all_three_in_order() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("a.tar.gz.age");
        let checksum = tmp.path().join("a.tar.gz.age.sha256");
        let manifest = tmp.path().join("a.manifest.json");
        std::fs::write(&archive, b"archive-bytes").unwrap();
        std::fs::write(&checksum, b"deadbeef").unwrap();
        std::fs::write(&manifest, b"{}").unwrap();

        let bundle = tmp.path().join("a.bundle.tar");
        create_bundle(&archive, &checksum, &manifest, &bundle).unwrap();

        assert!(!archive.exists());
        assert!(!checksum.exists());
        assert!(!manifest.exists());

        let mut reader = tar::Archive::new(File::open(&bundle).unwrap());
        let names: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.tar.gz.age", "a.tar.gz.age.sha256", "a.manifest.json"]);
    }
}
