use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use crate::utils::cancel::CancellationToken;

const READ_BUF_SIZE: usize = 32 * 1024;

/// One manifest entry, JSON-serialized alongside the archive and checksum
/// inside the bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub hostname: String,
    pub created_at: DateTime<Utc>,
    pub archive_path: String,
    pub archive_size: u64,
    pub sha256: String,
    pub compression_type: String,
    pub compression_level: u32,
    pub compression_mode: String,
    pub proxmox_type: String,
    pub proxmox_version: String,
    pub proxmox_targets: Vec<String>,
    /// Closed set: `"none"` or `"age"`. The specific AGE identity type
    /// (recipients vs. passphrase) is a restore-time concern, not recorded
    /// here; see `restore::decrypt_if_needed`.
    pub encryption_mode: String,
    pub script_version: String,
}

/// Streams `path` through SHA-256 in `READ_BUF_SIZE` chunks, polling
/// `cancel` between reads so a large archive can be interrupted promptly.
pub fn generate_checksum(path: &Path, cancel: &CancellationToken) -> Result<String> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::with_capacity(READ_BUF_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        cancel.check()?;
        let n = reader.read(&mut buf).with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn create_manifest(manifest: &Manifest, dest: &Path) -> Result<()> {
    let json = serde_json::to_vec_pretty(manifest).context("serialize manifest")?;
    let mut f = File::create(dest).with_context(|| format!("create {}", dest.display()))?;
    f.write_all(&json).with_context(|| format!("write {}", dest.display()))?;
    Ok(())
}

pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parse manifest {}", path.display()))
}

/// Recomputes the checksum of `archive_path` and compares it against the
/// value recorded in the manifest.
pub fn verify_checksum(archive_path: &Path, manifest: &Manifest, cancel: &CancellationToken) -> Result<()> {
    let actual = generate_checksum(archive_path, cancel)?;
    if actual != manifest.sha256 {
        bail!(
            "checksum mismatch for {}: expected {}, got {}",
            archive_path.display(),
            manifest.sha256,
            actual
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn checksum_matches_known_vector() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        let cancel = CancellationToken::new();
        let sum = generate_checksum(&path, &cancel).unwrap();
        assert_eq!(
            sum,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85"
        );
    }

    #[test]
    fn checksum_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        std::fs::write(&path, b"hello world").unwrap();
        let cancel = CancellationToken::new();
        let a = generate_checksum(&path, &cancel).unwrap();
        let b = generate_checksum(&path, &cancel).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn cancelled_checksum_bails_out() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        std::fs::write(&path, vec![0u8; READ_BUF_SIZE * 4]).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(generate_checksum(&path, &cancel).is_err());
    }

    #[test]
    fn manifest_round_trips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json");
        let manifest = Manifest {
            run_id: "run-1".into(),
            hostname: "pve01".into(),
            created_at: Utc::now(),
            archive_path: "archive.tar.gz.age".into(),
            archive_size: 1234,
            sha256: "a".repeat(64),
            compression_type: "gzip".into(),
            compression_level: 6,
            compression_mode: "standard".into(),
            proxmox_type: "pve".into(),
            proxmox_version: "pve-manager/8.1.0".into(),
            proxmox_targets: vec!["uname.txt".into(), "/etc/pve".into()],
            encryption_mode: "age".into(),
            script_version: "0.1.0".into(),
        };
        create_manifest(&manifest, &path).unwrap();
        let loaded = load_manifest(&path).unwrap();
        assert_eq!(loaded.run_id, manifest.run_id);
        assert_eq!(loaded.sha256, manifest.sha256);
    }

    #[test]
    fn verify_checksum_detects_mismatch() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("a.tar");
        std::fs::write(&archive, b"payload").unwrap();
        let manifest = Manifest {
            run_id: "r".into(),
            hostname: "h".into(),
            created_at: Utc::now(),
            archive_path: "a.tar".into(),
            archive_size: 7,
            sha256: "0".repeat(64),
            compression_type: "none".into(),
            compression_level: 0,
            compression_mode: "standard".into(),
            proxmox_type: "pve".into(),
            proxmox_version: String::new(),
            proxmox_targets: Vec::new(),
            encryption_mode: "none".into(),
            script_version: "0.1.0".into(),
        };
        let cancel = CancellationToken::new();
        assert!(verify_checksum(&archive, &manifest, &cancel).is_err());
    }
}
