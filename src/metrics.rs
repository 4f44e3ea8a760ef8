use anyhow::{Context, Result};
use std::path::Path;

use crate::orchestrator::BackupStats;

/// Minimal Prometheus textfile-collector exporter: one gauge per field of
/// `BackupStats`, written atomically so `node_exporter`'s textfile
/// collector never reads a half-written file.
pub fn write_textfile(stats: &BackupStats, path: &Path) -> Result<()> {
    let mut out = String::new();
    out.push_str("# HELP pve_backup_agent_last_run_success Whether the last run succeeded\n");
    out.push_str("# TYPE pve_backup_agent_last_run_success gauge\n");
    out.push_str(&format!(
        "pve_backup_agent_last_run_success {}\n",
        stats.success as u8
    ));
    out.push_str("# HELP pve_backup_agent_duration_seconds Last run duration in seconds\n");
    out.push_str("# TYPE pve_backup_agent_duration_seconds gauge\n");
    out.push_str(&format!(
        "pve_backup_agent_duration_seconds {}\n",
        stats.duration_seconds
    ));
    out.push_str("# HELP pve_backup_agent_archive_bytes Size of the produced archive in bytes\n");
    out.push_str("# TYPE pve_backup_agent_archive_bytes gauge\n");
    out.push_str(&format!(
        "pve_backup_agent_archive_bytes {}\n",
        stats.archive_bytes
    ));
    out.push_str("# HELP pve_backup_agent_items_collected Number of items collected\n");
    out.push_str("# TYPE pve_backup_agent_items_collected gauge\n");
    out.push_str(&format!(
        "pve_backup_agent_items_collected {}\n",
        stats.items_collected
    ));

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, out).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_expected_gauges() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metrics.prom");
        let stats = BackupStats {
            run_id: "r1".into(),
            success: true,
            duration_seconds: 12,
            archive_bytes: 4096,
            items_collected: 10,
            items_skipped: 0,
            items_best_effort_failed: 0,
        };
        write_textfile(&stats, &path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("pve_backup_agent_last_run_success 1"));
        assert!(content.contains("pve_backup_agent_archive_bytes 4096"));
    }
}
