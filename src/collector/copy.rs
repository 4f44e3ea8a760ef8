use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::fsprobe::FilesystemInfo;

/// Copies a single filesystem entry from `src` to `dest`, preserving
/// symlinks as symlinks (never following them) and best-effort ownership,
/// mode and mtime. Never fails the run over metadata preservation; callers
/// decide criticality based on the recipe item, not on this function's
/// return value for the metadata portion. `dest_fs` is the destination's
/// probed filesystem so ownership/mode are skipped cleanly on a target that
/// doesn't honor them (vfat/ntfs staging mounts).
pub fn copy_entry(src: &Path, dest: &Path, dest_fs: &FilesystemInfo) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }

    let meta = fs::symlink_metadata(src).with_context(|| format!("lstat {}", src.display()))?;

    if meta.file_type().is_symlink() {
        let target = fs::read_link(src).with_context(|| format!("readlink {}", src.display()))?;
        let _ = fs::remove_file(dest);
        std::os::unix::fs::symlink(&target, dest)
            .with_context(|| format!("symlink {} -> {}", dest.display(), target.display()))?;
        return Ok(());
    }

    if meta.is_dir() {
        fs::create_dir_all(dest).with_context(|| format!("mkdir {}", dest.display()))?;
    } else {
        fs::copy(src, dest)
            .with_context(|| format!("copy {} -> {}", src.display(), dest.display()))?;
    }

    preserve_metadata(dest, &meta, dest_fs);
    Ok(())
}

fn preserve_metadata(dest: &Path, meta: &fs::Metadata, dest_fs: &FilesystemInfo) {
    use nix::sys::stat::{UtimensatFlags, utimensat};
    use nix::sys::time::TimeSpec;

    if let Err(e) = crate::fsprobe::set_permissions(dest, meta.uid(), meta.gid(), meta.mode(), dest_fs) {
        tracing::debug!(path = %dest.display(), error = %e, "best-effort ownership/mode preservation failed");
    }

    let atime = TimeSpec::new(meta.atime(), meta.atime_nsec());
    let mtime = TimeSpec::new(meta.mtime(), meta.mtime_nsec());
    let _ = utimensat(None, dest, &atime, &mtime, UtimensatFlags::NoFollowSymlink);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn probe(tmp: &TempDir) -> FilesystemInfo {
        crate::fsprobe::detect(tmp.path()).unwrap()
    }

    #[test]
    fn copies_plain_file() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.txt");
        let dest = tmp.path().join("out/dest.txt");
        fs::write(&src, b"hello").unwrap();
        let fs_info = probe(&tmp);
        copy_entry(&src, &dest, &fs_info).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"hello");
    }

    #[test]
    fn preserves_symlink_as_symlink() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("target.txt");
        fs::write(&target, b"data").unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let dest = tmp.path().join("out/link");
        let fs_info = probe(&tmp);
        copy_entry(&link, &dest, &fs_info).unwrap();

        let meta = fs::symlink_metadata(&dest).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(fs::read_link(&dest).unwrap(), target);
    }

    #[test]
    fn copies_directory_shallow() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("srcdir");
        fs::create_dir(&src).unwrap();
        let dest = tmp.path().join("out/destdir");
        let fs_info = probe(&tmp);
        copy_entry(&src, &dest, &fs_info).unwrap();
        assert!(dest.is_dir());
    }
}
