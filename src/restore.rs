use anyhow::{Context, Result, bail};
use dialoguer::{Input, Password};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::archive::verify::decompressing_reader_dyn;
use crate::bundle;
use crate::checksum::{self, Manifest};
use crate::config::{Compressor, Config};
use crate::storage::{self, Storage};
use crate::ui::{self, BundleRow};
use crate::utils::cancel::CancellationToken;

/// The concrete backends wired up from config, built once per restore run
/// and referenced by index so bundles from different tiers don't each need
/// their own cloned `Storage` handle.
enum TierBackend {
    Local(storage::local::LocalStorage),
    Secondary(storage::secondary::SecondaryStorage),
    Cloud(storage::cloud::CloudStorage),
}

impl TierBackend {
    fn name(&self) -> &'static str {
        match self {
            TierBackend::Local(b) => b.name(),
            TierBackend::Secondary(b) => b.name(),
            TierBackend::Cloud(b) => b.name(),
        }
    }

    fn list(&self) -> Result<Vec<storage::StoredBundle>> {
        match self {
            TierBackend::Local(b) => b.list(),
            TierBackend::Secondary(b) => b.list(),
            TierBackend::Cloud(b) => b.list(),
        }
    }

    fn fetch_to(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        match self {
            TierBackend::Local(b) => b.fetch_to(name, dest_dir),
            TierBackend::Secondary(b) => b.fetch_to(name, dest_dir),
            TierBackend::Cloud(b) => b.fetch_to(name, dest_dir),
        }
    }
}

/// One bundle found on a storage tier, paired with the tier it came from so
/// the user can tell a stale secondary copy from the authoritative local one.
struct Candidate {
    tier: &'static str,
    name: String,
    backend_index: usize,
}

/// A bundle fetched and unpacked into a scratch directory: its three
/// artifacts sitting on local disk plus the parsed manifest.
struct Unpacked {
    archive_path: PathBuf,
    checksum_path: PathBuf,
    manifest: Manifest,
}

/// Interactive restore: enumerate every enabled tier, let the user pick a
/// bundle, decrypt+decompress it into a scratch directory and extract it
/// in-place to `/`. Requires a `RESTORE` confirmation token because there is
/// no dry-run for overwriting the live filesystem.
pub fn interactive_restore(cfg: &Config) -> Result<()> {
    crate::preflight::run(cfg)?;

    let (backends, candidates) = discover_candidates(cfg)?;
    if candidates.is_empty() {
        tracing::warn!("no bundles found on any enabled tier");
        return Ok(());
    }

    let work = tempfile::tempdir().context("create restore scratch directory")?;
    let mut rows = Vec::new();
    let mut unpacked_by_row = Vec::new();
    for candidate in &candidates {
        let backend = &backends[candidate.backend_index];
        let fetched = backend.fetch_to(&candidate.name, work.path())?;
        match unpack_bundle(&fetched, work.path()) {
            Ok(unpacked) => {
                rows.push(BundleRow {
                    index: rows.len() + 1,
                    timestamp: unpacked.manifest.created_at.to_rfc3339(),
                    encryption: encryption_label(&unpacked.manifest.encryption_mode),
                    script_version: unpacked.manifest.script_version.clone(),
                    tier: candidate.tier,
                });
                unpacked_by_row.push(unpacked);
            }
            Err(e) => {
                tracing::warn!(tier = candidate.tier, name = %candidate.name, error = %e, "skipping unreadable bundle");
            }
        }
    }
    if rows.is_empty() {
        tracing::warn!("no bundle on any tier could be read");
        return Ok(());
    }

    ui::print_bundle_table(&rows);
    let selection = select_row(rows.len())?;
    let Some(index) = selection else {
        tracing::info!("restore aborted by user");
        return Ok(());
    };
    let chosen = &unpacked_by_row[index];

    let token: String = Input::new()
        .with_prompt("Type RESTORE to overwrite the live filesystem, anything else to abort")
        .allow_empty(true)
        .interact_text()
        .context("read confirmation token")?;
    if token.trim() != "RESTORE" {
        tracing::info!("restore aborted: confirmation token not given");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    checksum::verify_checksum(&chosen.archive_path, &chosen.manifest, &cancel)
        .context("archive checksum does not match manifest")?;

    let compressor = Compressor::parse(&chosen.manifest.compression_type)?;
    let plain_reader = decrypt_if_needed(&chosen.archive_path, &chosen.manifest, "restore")?;
    let tar_reader = decompressing_reader_dyn(plain_reader, compressor)?;
    let mut archive = tar::Archive::new(tar_reader);
    archive.set_preserve_permissions(true);
    archive.unpack("/").context("extract archive to /")?;

    tracing::info!(run_id = %chosen.manifest.run_id, "restore complete");
    Ok(())
}

/// Non-interactive entry point for `--decrypt BUNDLE`: decrypts (but does
/// not decompress or extract) a single bundle file already on local disk,
/// writing `<run_id>.decrypted.bundle.tar` containing the plaintext archive,
/// a freshly computed checksum and the original manifest.
pub fn decrypt_bundle(bundle_path: &Path) -> Result<()> {
    let work = tempfile::tempdir().context("create decrypt scratch directory")?;
    let unpacked = unpack_bundle(bundle_path, work.path())?;

    let dest_dir: String = Input::new()
        .with_prompt("Destination directory for the decrypted bundle")
        .default(".".to_string())
        .interact_text()
        .context("read destination")?;
    let dest_dir = PathBuf::from(dest_dir);
    std::fs::create_dir_all(&dest_dir)
        .with_context(|| format!("create destination dir {}", dest_dir.display()))?;

    let cancel = CancellationToken::new();
    checksum::verify_checksum(&unpacked.archive_path, &unpacked.manifest, &cancel)
        .context("archive checksum does not match manifest")?;

    let mut reader = decrypt_if_needed(&unpacked.archive_path, &unpacked.manifest, "decrypt")?;
    let plain_name = unpacked
        .manifest
        .archive_path
        .strip_suffix(".age")
        .unwrap_or(&unpacked.manifest.archive_path)
        .to_string();
    let plain_archive_path = work.path().join(&plain_name);
    let mut out = File::create(&plain_archive_path)
        .with_context(|| format!("create {}", plain_archive_path.display()))?;
    io::copy(&mut reader, &mut out).context("write decrypted archive")?;
    drop(out);

    let plain_sha256 = checksum::generate_checksum(&plain_archive_path, &cancel)?;
    let plain_checksum_path = work.path().join(format!("{plain_name}.sha256"));
    std::fs::write(&plain_checksum_path, format!("{plain_sha256}  {plain_name}\n"))?;

    let mut metadata = unpacked.manifest.clone();
    metadata.sha256 = plain_sha256;
    metadata.encryption_mode = "none".to_string();
    let metadata_path = work.path().join(format!("{plain_name}.metadata.json"));
    checksum::create_manifest(&metadata, &metadata_path)?;

    let output_path = dest_dir.join(format!("{}.decrypted.bundle.tar", unpacked.manifest.run_id));
    bundle::create_bundle(&plain_archive_path, &plain_checksum_path, &metadata_path, &output_path)?;

    tracing::info!(path = %output_path.display(), "decrypted bundle written");
    Ok(())
}

fn discover_candidates(cfg: &Config) -> Result<(Vec<TierBackend>, Vec<Candidate>)> {
    let mut backends = Vec::new();
    if let Some(local) = &cfg.local {
        backends.push(TierBackend::Local(storage::local::LocalStorage::new(local.dir.clone())));
    }
    if let Some(secondary) = &cfg.secondary {
        backends.push(TierBackend::Secondary(storage::secondary::SecondaryStorage::new(
            secondary.path.clone(),
        )));
    }
    if let Some(cloud) = &cfg.cloud {
        backends.push(TierBackend::Cloud(storage::cloud::CloudStorage::new(
            cloud.remote.clone(),
            cloud.remote_path.clone(),
            cloud.log_path.clone(),
            cloud.transfer_tool.clone(),
            cloud.connection_timeout,
            cloud.operation_timeout,
            cloud.delete_timeout,
            cloud.retry_count,
            cloud.batch_delete_size,
            cloud.batch_pause,
        )));
    }

    let mut candidates = Vec::new();
    for (index, backend) in backends.iter().enumerate() {
        let bundles = match backend.list() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(tier = backend.name(), error = %e, "failed to list tier for restore");
                continue;
            }
        };
        for b in bundles {
            if b.name.ends_with(".bundle.tar") {
                candidates.push(Candidate {
                    tier: backend.name(),
                    name: b.name,
                    backend_index: index,
                });
            }
        }
    }
    Ok((backends, candidates))
}

fn encryption_label(mode: &str) -> &'static str {
    match mode {
        "none" => "PLAIN",
        _ => "ENCRYPTED",
    }
}

fn select_row(count: usize) -> Result<Option<usize>> {
    let choice: String = Input::new()
        .with_prompt(format!("Select a bundle [1-{count}] or 0 to exit"))
        .interact_text()
        .context("read selection")?;
    let choice: usize = choice.trim().parse().context("selection must be a number")?;
    if choice == 0 {
        return Ok(None);
    }
    if choice > count {
        bail!("selection out of range");
    }
    Ok(Some(choice - 1))
}

fn unpack_bundle(bundle_path: &Path, work_dir: &Path) -> Result<Unpacked> {
    let file = File::open(bundle_path).with_context(|| format!("open {}", bundle_path.display()))?;
    let mut archive = tar::Archive::new(file);
    let mut archive_path = None;
    let mut checksum_path = None;
    let mut manifest_path = None;

    for entry in archive.entries().context("read bundle entries")? {
        let mut entry = entry.context("read bundle entry")?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let dest = work_dir.join(&name);
        entry.unpack(&dest).with_context(|| format!("unpack {name}"))?;
        if name.ends_with(".manifest.json") {
            manifest_path = Some(dest);
        } else if name.ends_with(".sha256") {
            checksum_path = Some(dest);
        } else {
            archive_path = Some(dest);
        }
    }

    let archive_path = archive_path.context("bundle has no archive entry")?;
    let checksum_path = checksum_path.context("bundle has no checksum entry")?;
    let manifest_path = manifest_path.context("bundle has no manifest entry")?;
    let manifest = checksum::load_manifest(&manifest_path)?;

    Ok(Unpacked {
        archive_path,
        checksum_path,
        manifest,
    })
}

/// Strips the AGE layer if the manifest says the archive is encrypted,
/// prompting for the matching key/passphrase and looping on a wrong answer.
/// Typing `0` at the prompt aborts with an error rather than looping forever.
/// The manifest only records `"none"` or `"age"` (the concrete key kind isn't
/// persisted), so on each attempt we try the input as an AGE identity first
/// and fall back to treating it as a passphrase.
fn decrypt_if_needed(archive_path: &Path, manifest: &Manifest, verb: &str) -> Result<Box<dyn Read>> {
    if manifest.encryption_mode == "none" {
        let file = File::open(archive_path).with_context(|| format!("open {}", archive_path.display()))?;
        return Ok(Box::new(file));
    }

    loop {
        let mut secret = Password::new()
            .with_prompt("AGE private key or passphrase (or 0 to abort)")
            .interact()
            .context("read key material")?;
        if secret.trim() == "0" {
            bail!("{verb} aborted by user");
        }

        let file = File::open(archive_path).with_context(|| format!("open {}", archive_path.display()))?;
        let decryptor = match age::Decryptor::new(std::io::BufReader::new(file)) {
            Ok(d) => d,
            Err(e) => {
                use zeroize::Zeroize;
                secret.zeroize();
                return Err(anyhow::anyhow!("archive is not a valid AGE container: {e}"));
            }
        };

        let attempt = match secret.trim().parse::<age::x25519::Identity>() {
            Ok(identity) => decryptor
                .decrypt(std::iter::once(&identity as &dyn age::Identity))
                .context("decrypt with provided key"),
            Err(_) => {
                let identity = age::scrypt::Identity::new(age::secrecy::SecretString::new(secret.clone()));
                decryptor
                    .decrypt(std::iter::once(&identity as &dyn age::Identity))
                    .context("decrypt with provided passphrase")
            }
        };

        use zeroize::Zeroize;
        secret.zeroize();

        match attempt {
            Ok(reader) => return Ok(Box::new(reader)),
            Err(e) => {
                tracing::warn!(error = %e, "decryption failed, wrong key or passphrase");
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Manifest;
    use chrono::Utc;
    use tempfile::TempDir;

    fn plain_manifest(archive_name: &str) -> Manifest {
        Manifest {
            run_id: "host-backup-20260101-000000".into(),
            hostname: "host".into(),
            created_at: Utc::now(),
            archive_path: archive_name.to_string(),
            archive_size: 7,
            sha256: String::new(),
            compression_type: "none".into(),
            compression_level: 0,
            compression_mode: "standard".into(),
            proxmox_type: "pve".into(),
            proxmox_version: "pve-manager/8.1.0".into(),
            proxmox_targets: vec!["uname.txt".into()],
            encryption_mode: "none".into(),
            script_version: "0.1.0".into(),
        }
    }

    #[test]
    fn unpack_bundle_round_trips_manifest() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("a.tar");
        let checksum = tmp.path().join("a.tar.sha256");
        let manifest_path = tmp.path().join("a.manifest.json");
        std::fs::write(&archive, b"payload").unwrap();
        std::fs::write(&checksum, b"deadbeef  a.tar\n").unwrap();
        let manifest = plain_manifest("a.tar");
        checksum::create_manifest(&manifest, &manifest_path).unwrap();

        let bundle_path = tmp.path().join("a.bundle.tar");
        bundle::create_bundle(&archive, &checksum, &manifest_path, &bundle_path).unwrap();

        let work = tmp.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let unpacked = unpack_bundle(&bundle_path, &work).unwrap();
        assert_eq!(unpacked.manifest.run_id, manifest.run_id);
        assert!(unpacked.archive_path.exists());
        assert!(unpacked.checksum_path.exists());
    }

    #[test]
    fn decrypt_if_needed_passes_through_plaintext() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("a.tar");
        std::fs::write(&archive, b"payload").unwrap();
        let manifest = plain_manifest("a.tar");
        let mut reader = decrypt_if_needed(&archive, &manifest, "test").unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"payload");
    }

    #[test]
    fn encryption_label_maps_none_to_plain() {
        assert_eq!(encryption_label("none"), "PLAIN");
        assert_eq!(encryption_label("age"), "ENCRYPTED");
    }
}
