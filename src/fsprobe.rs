use anyhow::{Context, Result};
use nix::sys::statfs::statfs;
use nix::unistd::{Uid, chown};
use std::path::Path;

/// Filesystem kinds this agent knows how to reason about for ownership
/// preservation. Anything else falls back to `Unknown` and gets the
/// best-effort treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Ext4,
    Xfs,
    Btrfs,
    Zfs,
    Nfs,
    Cifs,
    Vfat,
    Ntfs,
    Unknown,
}

impl FsKind {
    /// Whether this filesystem is expected to honor POSIX ownership/mode
    /// bits at all (vfat/ntfs mounts typically don't).
    pub fn supports_ownership(self) -> bool {
        !matches!(self, FsKind::Vfat | FsKind::Ntfs)
    }
}

#[derive(Debug, Clone)]
pub struct FilesystemInfo {
    pub kind: FsKind,
    pub can_chown: bool,
}

// Magic numbers from linux/magic.h.
const EXT4_SUPER_MAGIC: i64 = 0xEF53;
const XFS_SUPER_MAGIC: i64 = 0x5846_5342;
const BTRFS_SUPER_MAGIC: i64 = 0x9123_683E;
const ZFS_SUPER_MAGIC: i64 = 0x2FC1_2FC1;
const NFS_SUPER_MAGIC: i64 = 0x6969;
const CIFS_MAGIC_NUMBER: i64 = 0xFF53_4D42;
const MSDOS_SUPER_MAGIC: i64 = 0x4D44;
const NTFS_SB_MAGIC: i64 = 0x5346_544E;

/// Probes the filesystem backing `path` and reports whether this process can
/// actually preserve ownership there (root, or the effective uid already
/// owns the target — chown to self always succeeds).
pub fn detect(path: &Path) -> Result<FilesystemInfo> {
    let st = statfs(path).with_context(|| format!("statfs {}", path.display()))?;
    let magic = st.filesystem_type().0;
    let kind = match magic {
        EXT4_SUPER_MAGIC => FsKind::Ext4,
        XFS_SUPER_MAGIC => FsKind::Xfs,
        BTRFS_SUPER_MAGIC => FsKind::Btrfs,
        ZFS_SUPER_MAGIC => FsKind::Zfs,
        NFS_SUPER_MAGIC => FsKind::Nfs,
        CIFS_MAGIC_NUMBER => FsKind::Cifs,
        MSDOS_SUPER_MAGIC => FsKind::Vfat,
        NTFS_SB_MAGIC => FsKind::Ntfs,
        _ => FsKind::Unknown,
    };
    let can_chown = kind.supports_ownership() && Uid::effective().is_root();
    Ok(FilesystemInfo { kind, can_chown })
}

/// Applies ownership/mode to `dest`, silently skipping chown when the probe
/// says it won't be honored — callers treat this as best-effort, never
/// critical.
pub fn set_permissions(dest: &Path, uid: u32, gid: u32, mode: u32, info: &FilesystemInfo) -> Result<()> {
    if info.can_chown {
        chown(
            dest,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .with_context(|| format!("chown {}", dest.display()))?;
    }
    if info.kind.supports_ownership() {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {}", dest.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_tmp_does_not_error() {
        let info = detect(std::env::temp_dir().as_path()).expect("statfs on tmp should succeed");
        // We don't assert a specific kind: CI filesystems vary, just that
        // probing never panics and produces a definite can_chown answer.
        let _ = info.can_chown;
    }

    #[test]
    fn vfat_and_ntfs_never_support_ownership() {
        assert!(!FsKind::Vfat.supports_ownership());
        assert!(!FsKind::Ntfs.supports_ownership());
        assert!(FsKind::Ext4.supports_ownership());
    }
}
