#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::errors::BackupErrorKind;
use crate::hostname::short_hostname;

const LOCK_FILE_NAME: &str = ".backup.lock";

/// Payload written into the lockfile once the exclusive flock is held, so a
/// competing process (or an operator) can tell who holds it and since when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockPayload {
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockPayload {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: short_hostname(),
            acquired_at: Utc::now(),
        }
    }

    fn age(&self) -> Duration {
        let secs = (Utc::now() - self.acquired_at).num_seconds().max(0);
        Duration::from_secs(secs as u64)
    }
}

pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl LockGuard {
    /// Acquires the single run-wide lock under `lock_dir`, reclaiming a
    /// stale lock (payload older than `max_age`) exactly once before giving
    /// up with `BackupErrorKind::LockHeld`.
    pub fn acquire(lock_dir: &Path, max_age: Duration) -> Result<Self> {
        ensure_dir(lock_dir)?;
        let path = lock_dir.join(LOCK_FILE_NAME);

        match Self::try_lock(&path)? {
            Some(guard) => Ok(guard),
            None => {
                if Self::is_stale(&path, max_age) {
                    tracing::warn!(path = %path.display(), "reclaiming stale lock");
                    let _ = fs::remove_file(&path);
                    Self::try_lock(&path)?.ok_or_else(|| {
                        anyhow::anyhow!("lock still held after stale reclaim: {}", path.display())
                            .context(BackupErrorKind::LockHeld)
                    })
                } else {
                    Err(
                        anyhow::anyhow!("another run holds the lock: {}", path.display())
                            .context(BackupErrorKind::LockHeld),
                    )
                }
            }
        }
    }

    fn try_lock(path: &Path) -> Result<Option<Self>> {
        let file = open_lockfile(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                write_payload(&file, path)?;
                Ok(Some(Self {
                    file,
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).with_context(|| format!("flock {}", path.display())),
        }
    }

    fn is_stale(path: &Path, max_age: Duration) -> bool {
        read_payload(path)
            .map(|p| p.age() > max_age)
            .unwrap_or(true)
    }
}

fn write_payload(file: &File, path: &Path) -> Result<()> {
    let payload = LockPayload::current();
    let json = serde_json::to_vec_pretty(&payload)?;
    let mut f = file.try_clone().with_context(|| format!("clone handle for {}", path.display()))?;
    f.set_len(0)?;
    use std::io::Seek;
    f.seek(io::SeekFrom::Start(0))?;
    f.write_all(&json)
        .with_context(|| format!("write lock payload {}", path.display()))?;
    f.flush()?;
    Ok(())
}

fn read_payload(path: &Path) -> Option<LockPayload> {
    let mut buf = String::new();
    File::open(path).ok()?.read_to_string(&mut buf).ok()?;
    serde_json::from_str(&buf).ok()
}

fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut b = fs::DirBuilder::new();
            b.recursive(true)
                .mode(0o755)
                .create(dir)
                .with_context(|| format!("create lock dir {}", dir.display()))?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("create lock dir {}", dir.display()))?;
        }
    }
    Ok(())
}

fn open_lockfile(path: &Path) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(true);
    #[cfg(unix)]
    {
        opts.mode(0o644);
    }
    opts.open(path)
        .with_context(|| format!("open lockfile {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let g1 = LockGuard::acquire(dir.path(), Duration::from_secs(7200)).expect("first acquire");
        drop(g1);
        let _g2 =
            LockGuard::acquire(dir.path(), Duration::from_secs(7200)).expect("re-acquire after drop");
    }

    #[test]
    fn conflict_same_dir() {
        let dir = TempDir::new().unwrap();
        let _g1 = LockGuard::acquire(dir.path(), Duration::from_secs(7200)).expect("first acquire");
        let err = LockGuard::acquire(dir.path(), Duration::from_secs(7200)).unwrap_err();
        assert!(err.to_string().contains("holds the lock"));
        assert_eq!(
            err.downcast_ref::<BackupErrorKind>().copied(),
            Some(BackupErrorKind::LockHeld)
        );
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);

        // Simulate another process holding the flock with a stale payload.
        let held = open_lockfile(&path).unwrap();
        held.try_lock_exclusive().unwrap();
        let stale = LockPayload {
            pid: 999_999,
            host: "ghost".into(),
            acquired_at: Utc::now() - chrono::Duration::hours(3),
        };
        fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let _g = LockGuard::acquire(dir.path(), Duration::from_secs(7200))
            .expect("stale lock should be reclaimed");
    }

    #[test]
    fn fresh_lock_is_not_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);

        let held = open_lockfile(&path).unwrap();
        held.try_lock_exclusive().unwrap();
        let fresh = LockPayload::current();
        fs::write(&path, serde_json::to_vec(&fresh).unwrap()).unwrap();

        let err = LockGuard::acquire(dir.path(), Duration::from_secs(7200)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<BackupErrorKind>().copied(),
            Some(BackupErrorKind::LockHeld)
        );
    }

    #[test]
    fn payload_round_trips() {
        let dir = TempDir::new().unwrap();
        let g = LockGuard::acquire(dir.path(), Duration::from_secs(7200)).unwrap();
        let payload = read_payload(&g.path).expect("payload readable while held");
        assert_eq!(payload.pid, std::process::id());
    }
}
