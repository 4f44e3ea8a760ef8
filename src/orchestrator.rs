use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::archive::{self, compress::select as select_compressor, verify::verify_archive};
use crate::bundle;
use crate::checksum::{self, Manifest};
use crate::collector::recipe::{self, CollectorConfig};
use crate::collector::{Collector, default_runner};
use crate::config::Config;
use crate::errors::BackupErrorKind;
use crate::hostname::short_hostname;
use crate::notify::{self, Notifier};
use crate::retention;
use crate::storage::{self, Storage};
use crate::utils::cancel::CancellationToken;
use crate::utils::lock::LockGuard;
use crate::{metrics, security};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Mutated through every stage and serialized to
/// `backup-stats-<timestamp>.json` in the log directory at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct BackupStats {
    pub run_id: String,
    pub success: bool,
    pub duration_seconds: u64,
    pub archive_bytes: u64,
    pub items_collected: u64,
    pub items_skipped: u64,
    pub items_best_effort_failed: u64,
}

#[derive(Debug, Clone, Serialize)]
struct TierOutcome {
    tier: &'static str,
    stored: bool,
    retained: usize,
    deleted: usize,
    warning: Option<String>,
}

/// Runs the full backup pipeline:
/// `PRE_CHECK -> LOCK -> COLLECT -> ARCHIVE -> VERIFY -> CHECKSUM ->
/// MANIFEST -> BUNDLE -> DISPATCH(tiers) -> RETENTION -> NOTIFY -> CLEANUP`.
///
/// Cleanup (staging removal, stats report, metrics textfile) always runs,
/// even when an earlier stage returned an error — the staging directory and
/// stats report must never be left behind regardless of how the run ended.
pub fn run(cfg: &Config, cancel: &CancellationToken) -> Result<BackupStats> {
    let started = Instant::now();
    let started_at = Utc::now();
    let hostname = short_hostname();
    let run_id = format!("{}-backup-{}", hostname, started_at.format("%Y%m%d-%H%M%S"));

    tracing::info!(run_id = %run_id, "pre-flight checks");
    let mut tiers = Vec::new();
    let result = execute(cfg, cancel, &run_id, &hostname, started_at, &mut tiers);

    let success = result.is_ok();
    let (archive_bytes, items_collected, items_skipped, items_best_effort_failed) = result
        .as_ref()
        .map(|r: &ExecuteOutcome| {
            (
                r.archive_bytes,
                r.items_collected,
                r.items_skipped,
                r.items_best_effort_failed,
            )
        })
        .unwrap_or((0, 0, 0, 0));

    let stats = BackupStats {
        run_id: run_id.clone(),
        success,
        duration_seconds: started.elapsed().as_secs(),
        archive_bytes,
        items_collected,
        items_skipped,
        items_best_effort_failed,
    };

    if let Err(e) = write_stats_report(cfg, &stats) {
        tracing::warn!(error = %e, "failed to write stats report");
    }
    if cfg.metrics.enabled {
        if let Some(path) = &cfg.metrics.textfile_path {
            if let Err(e) = metrics::write_textfile(&stats, path) {
                tracing::warn!(error = %e, "failed to write metrics textfile");
            }
        }
    }

    // Notifications fire regardless of outcome, using whatever tier
    // dispatch info was accumulated before the run failed (if it did).
    dispatch_notifications(cfg, &run_id, success, &tiers);

    match result {
        Ok(_) => {
            tracing::info!(run_id = %run_id, duration_s = stats.duration_seconds, "backup completed");
            Ok(stats)
        }
        Err(e) => {
            tracing::error!(run_id = %run_id, error = %e, "backup failed");
            Err(e)
        }
    }
}

struct ExecuteOutcome {
    archive_bytes: u64,
    items_collected: u64,
    items_skipped: u64,
    items_best_effort_failed: u64,
}

fn execute(
    cfg: &Config,
    cancel: &CancellationToken,
    run_id: &str,
    hostname: &str,
    started_at: chrono::DateTime<Utc>,
    tiers: &mut Vec<TierOutcome>,
) -> Result<ExecuteOutcome> {
    crate::preflight::run(cfg)?;
    cancel.check()?;

    security::audit_secret_permissions(&[
        cfg.encryption.recipients_file.as_deref().unwrap_or(Path::new("")),
        cfg.encryption.identity_file.as_deref().unwrap_or(Path::new("")),
    ])
    .ok();

    tracing::info!("acquiring run lock");
    let _lock = LockGuard::acquire(&cfg.lock_dir, cfg.max_lock_age)?;
    cancel.check()?;

    std::fs::create_dir_all(&cfg.staging_dir)
        .with_context(|| format!("create staging dir {}", cfg.staging_dir.display()))
        .map_err(|e| e.context(BackupErrorKind::CollectionFailed))?;

    let self_exclude = self_exclude_paths(cfg);
    let runner = default_runner();
    let collector = Collector::new(cfg.staging_dir.clone(), &[], self_exclude, &runner, cancel)?;
    let items = recipe::build(&CollectorConfig::default(), cfg.proxmox_type);

    tracing::info!("collecting configuration state");
    let collect_result = collector.run(&items);
    let cleanup_staging = || {
        if let Err(e) = std::fs::remove_dir_all(&cfg.staging_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "failed to remove staging dir");
            }
        }
    };
    let collect_stats = match collect_result {
        Ok(s) => s,
        Err(e) => {
            cleanup_staging();
            return Err(e);
        }
    };
    cancel.check()?;

    // Resolve the effective compressor up front so the archive filename
    // matches the bytes `create_archive` actually produces even when the
    // requested binary is missing and it falls back to gzip.
    let effective_compressor = select_compressor(cfg.compression.requested).effective;
    let archive_ext = if effective_compressor == crate::config::Compressor::None {
        String::new()
    } else {
        format!(".{}", effective_compressor.extension())
    };
    let age_ext = match cfg.encryption.mode {
        crate::config::EncryptionMode::None => "",
        _ => ".age",
    };
    let archive_name = format!("{run_id}.tar{archive_ext}{age_ext}");
    let archive_path = cfg.staging_parent().join(&archive_name);

    tracing::info!("creating archive");
    let archive_result = archive::create_archive(
        &cfg.staging_dir,
        &archive_path,
        cfg.compression.requested,
        cfg.compression.level,
        cfg.compression.mode,
        cfg.compression.threads,
        &cfg.encryption,
        cancel,
    );
    cleanup_staging();
    let archive_output = archive_result?;
    cancel.check()?;

    tracing::info!("verifying archive");
    verify_archive(&archive_path, archive_output.effective_compressor, &cfg.encryption)?;

    tracing::info!("computing checksum");
    let sha256 = checksum::generate_checksum(&archive_path, cancel)
        .map_err(|e| e.context(BackupErrorKind::VerificationFailed))?;
    let checksum_path = append_suffix(&archive_path, ".sha256");
    std::fs::write(&checksum_path, format!("{sha256}  {archive_name}\n"))
        .with_context(|| format!("write {}", checksum_path.display()))
        .map_err(|e| e.context(BackupErrorKind::VerificationFailed))?;

    let encryption_mode = if cfg.encryption.mode == crate::config::EncryptionMode::None {
        "none"
    } else {
        "age"
    };
    let manifest = Manifest {
        run_id: run_id.to_string(),
        hostname: hostname.to_string(),
        created_at: started_at,
        archive_path: archive_name.clone(),
        archive_size: archive_output.size,
        sha256,
        compression_type: archive_output.effective_compressor.as_str().to_string(),
        compression_level: archive_output.effective_level,
        compression_mode: cfg.compression.mode.as_str().to_string(),
        proxmox_type: cfg.proxmox_type.as_str().to_string(),
        proxmox_version: collect_stats.proxmox_version.clone().unwrap_or_default(),
        proxmox_targets: recipe::target_names(&items),
        encryption_mode: encryption_mode.to_string(),
        script_version: AGENT_VERSION.to_string(),
    };
    let manifest_path = append_suffix(&archive_path, ".manifest.json");
    checksum::create_manifest(&manifest, &manifest_path)
        .map_err(|e| e.context(BackupErrorKind::VerificationFailed))?;

    tracing::info!("bundling artifact triplet");
    let bundle_file_name = format!("{archive_name}.bundle.tar");
    let bundle_path = cfg.staging_parent().join(&bundle_file_name);
    bundle::create_bundle(&archive_path, &checksum_path, &manifest_path, &bundle_path)?;
    cancel.check()?;

    dispatch_and_retain(cfg, &bundle_path, &bundle_file_name, tiers)?;

    let _ = std::fs::remove_file(&bundle_path);

    Ok(ExecuteOutcome {
        archive_bytes: archive_output.size,
        items_collected: collect_stats.collected,
        items_skipped: collect_stats.skipped_missing,
        items_best_effort_failed: collect_stats.best_effort_failed,
    })
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn self_exclude_paths(cfg: &Config) -> Vec<PathBuf> {
    let mut out = vec![cfg.staging_dir.clone()];
    if let Some(local) = &cfg.local {
        out.push(local.dir.clone());
    }
    if let Some(secondary) = &cfg.secondary {
        out.push(secondary.path.clone());
    }
    out
}

/// Dispatches the bundle to each enabled tier, then runs that tier's
/// retention. The local tier is critical: a failure there aborts with
/// `BackupErrorKind::StorageFailed`. Secondary and cloud failures are logged
/// and recorded as warnings in the tier outcome, never fatal.
fn dispatch_and_retain(
    cfg: &Config,
    bundle_path: &Path,
    file_name: &str,
    outcomes: &mut Vec<TierOutcome>,
) -> Result<()> {
    if let Some(local) = &cfg.local {
        let backend = storage::local::LocalStorage::new(local.dir.clone());
        match store_tier(&backend, bundle_path, file_name) {
            Ok(()) => outcomes.push(apply_retention(&backend, &local.retention)),
            Err(e) => {
                outcomes.push(TierOutcome {
                    tier: backend.name(),
                    stored: false,
                    retained: 0,
                    deleted: 0,
                    warning: Some(e.to_string()),
                });
                return Err(e);
            }
        }
    }
    if let Some(secondary) = &cfg.secondary {
        let backend = storage::secondary::SecondaryStorage::new(secondary.path.clone());
        outcomes.push(try_store_tier(&backend, bundle_path, file_name, &secondary.retention));
    }
    if let Some(cloud) = &cfg.cloud {
        let backend = storage::cloud::CloudStorage::new(
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
        );
        outcomes.push(try_store_tier(&backend, bundle_path, file_name, &cloud.retention));
    }

    Ok(())
}

fn store_tier(backend: &dyn Storage, bundle_path: &Path, file_name: &str) -> Result<()> {
    tracing::info!(tier = backend.name(), "dispatching bundle");
    backend
        .store(bundle_path, file_name)
        .map_err(|e| e.context(BackupErrorKind::StorageFailed))
}

fn try_store_tier(
    backend: &dyn Storage,
    bundle_path: &Path,
    file_name: &str,
    retention: &crate::config::RetentionConfig,
) -> TierOutcome {
    tracing::info!(tier = backend.name(), "dispatching bundle");
    match backend.store(bundle_path, file_name) {
        Ok(()) => apply_retention(backend, retention),
        Err(e) => {
            tracing::warn!(tier = backend.name(), error = %e, "non-critical storage tier failed");
            TierOutcome {
                tier: backend.name(),
                stored: false,
                retained: 0,
                deleted: 0,
                warning: Some(e.to_string()),
            }
        }
    }
}

fn apply_retention(backend: &dyn Storage, retention: &crate::config::RetentionConfig) -> TierOutcome {
    let bundles = match backend.list() {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(tier = backend.name(), error = %e, "failed to list tier for retention");
            return TierOutcome {
                tier: backend.name(),
                stored: true,
                retained: 0,
                deleted: 0,
                warning: Some(e.to_string()),
            };
        }
    };
    let (keep, delete) = retention::classify(&bundles, retention);
    for name in &delete {
        if let Err(e) = backend.delete(name) {
            tracing::warn!(tier = backend.name(), name, error = %e, "retention delete failed");
        }
    }
    TierOutcome {
        tier: backend.name(),
        stored: true,
        retained: keep.len(),
        deleted: delete.len(),
        warning: None,
    }
}

fn dispatch_notifications(cfg: &Config, run_id: &str, success: bool, tiers: &[TierOutcome]) {
    if !cfg.notify.enabled {
        return;
    }
    if (success && !cfg.notify.on_success) || (!success && !cfg.notify.on_failure) {
        return;
    }
    let summary = tiers
        .iter()
        .map(|t| format!("{}: stored={} retained={} deleted={}", t.tier, t.stored, t.retained, t.deleted))
        .collect::<Vec<_>>()
        .join("; ");
    let notifier = notify::log::LogNotifier::new(true);
    let data = notify::NotificationData {
        run_id: run_id.to_string(),
        success,
        summary,
    };
    if let Err(e) = notifier.send(&data) {
        tracing::warn!(error = %e, "notification dispatch failed");
    }
}

fn write_stats_report(cfg: &Config, stats: &BackupStats) -> Result<()> {
    let dir = cfg.log_file.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("backup-stats-{}.json", Utc::now().format("%Y%m%dT%H%M%SZ")));
    let json = serde_json::to_vec_pretty(stats)?;
    std::fs::write(path, json)?;
    Ok(())
}

impl Config {
    /// Destination directory for the archive/bundle before tier dispatch —
    /// the staging directory's parent, never the staging directory itself,
    /// so the bundle is never mistaken for a collected item.
    fn staging_parent(&self) -> PathBuf {
        self.staging_dir
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.staging_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CompressionConfig, CompressionMode, Compressor, EncryptionConfig, EncryptionMode,
        LocalTierConfig, MetricsConfig, NotifyConfig, ProxmoxType, RetentionConfig, RetentionMode,
        GfsQuotas,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    fn minimal_config(tmp: &TempDir) -> Config {
        Config {
            staging_dir: tmp.path().join("stage"),
            lock_dir: tmp.path().join("lock"),
            log_file: tmp.path().join("log/agent.log"),
            max_lock_age: Duration::from_secs(7200),
            compression: CompressionConfig {
                requested: Compressor::None,
                level: None,
                mode: CompressionMode::Standard,
                threads: None,
            },
            encryption: EncryptionConfig {
                mode: EncryptionMode::None,
                recipients_file: None,
                identity_file: None,
            },
            local: Some(LocalTierConfig {
                dir: tmp.path().join("local"),
                retention: RetentionConfig {
                    mode: RetentionMode::Simple,
                    keep_count: 5,
                    gfs: GfsQuotas { daily: 0, weekly: 0, monthly: 0, yearly: 0 },
                },
            }),
            secondary: None,
            cloud: None,
            notify: NotifyConfig {
                enabled: false,
                on_success: true,
                on_failure: true,
            },
            metrics: MetricsConfig {
                enabled: false,
                textfile_path: None,
            },
            dry_run: false,
            proxmox_type: ProxmoxType::Pve,
        }
    }

    #[test]
    fn full_run_produces_stored_bundle_and_stats() {
        let tmp = TempDir::new().unwrap();
        let cfg = minimal_config(&tmp);
        let cancel = CancellationToken::new();

        let stats = run(&cfg, &cancel).expect("run should succeed");
        assert!(stats.success);
        assert!(stats.archive_bytes > 0);

        let stored = std::fs::read_dir(tmp.path().join("local")).unwrap().count();
        assert_eq!(stored, 1);

        let reports: Vec<_> = std::fs::read_dir(tmp.path().join("log"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("backup-stats-"))
            .collect();
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn local_tier_failure_is_recorded_before_propagating() {
        let tmp = TempDir::new().unwrap();
        // A file standing where the local tier's directory needs to be
        // created forces `store()` to fail.
        let blocker = tmp.path().join("blocker-file");
        std::fs::write(&blocker, b"x").unwrap();
        let cfg = Config {
            local: Some(LocalTierConfig {
                dir: blocker.join("nested"),
                retention: RetentionConfig {
                    mode: RetentionMode::Simple,
                    keep_count: 5,
                    gfs: GfsQuotas { daily: 0, weekly: 0, monthly: 0, yearly: 0 },
                },
            }),
            ..minimal_config(&tmp)
        };
        let bundle_path = tmp.path().join("bundle.tar");
        std::fs::write(&bundle_path, b"payload").unwrap();

        let mut outcomes = Vec::new();
        let result = dispatch_and_retain(&cfg, &bundle_path, "bundle.tar", &mut outcomes);
        assert!(result.is_err());
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].stored);
        assert!(outcomes[0].warning.is_some());
    }

    #[test]
    fn staging_dir_is_removed_after_run() {
        let tmp = TempDir::new().unwrap();
        let cfg = minimal_config(&tmp);
        let cancel = CancellationToken::new();
        run(&cfg, &cancel).unwrap();
        assert!(!cfg.staging_dir.exists());
    }
}
