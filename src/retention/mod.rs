use std::collections::HashSet;

use crate::config::{GfsQuotas, RetentionConfig, RetentionMode};
use crate::storage::StoredBundle;
use crate::utils::time::{calendar_day, calendar_month, calendar_year, iso_year_week};

/// Classifies which of `bundles` to keep vs delete under a tier's retention
/// policy. `bundles` need not be pre-sorted; classification always
/// processes newest-first so GFS buckets are seeded by the most recent
/// backup in each period.
pub fn classify(bundles: &[StoredBundle], retention: &RetentionConfig) -> (Vec<String>, Vec<String>) {
    let mut sorted: Vec<&StoredBundle> = bundles.iter().collect();
    sorted.sort_by(|a, b| b.modified.cmp(&a.modified));

    match retention.mode {
        RetentionMode::Simple => classify_simple(&sorted, retention.keep_count),
        RetentionMode::Gfs => classify_gfs(&sorted, &retention.gfs),
    }
}

fn classify_simple(sorted: &[&StoredBundle], keep_count: u32) -> (Vec<String>, Vec<String>) {
    let keep_count = keep_count as usize;
    let mut keep = Vec::new();
    let mut delete = Vec::new();
    for (i, b) in sorted.iter().enumerate() {
        if i < keep_count {
            keep.push(b.name.clone());
        } else {
            delete.push(b.name.clone());
        }
    }
    (keep, delete)
}

/// Quota-bucket GFS: newest-first, each bundle tries daily, then weekly,
/// then monthly, then yearly — the first bucket that both has room left
/// under its quota and hasn't already claimed a representative for that
/// period wins. Anything that fits nowhere is deleted.
fn classify_gfs(sorted: &[&StoredBundle], quotas: &GfsQuotas) -> (Vec<String>, Vec<String>) {
    let mut daily_used: HashSet<(i32, u32, u32)> = HashSet::new();
    let mut weekly_used: HashSet<(i32, u32)> = HashSet::new();
    let mut monthly_used: HashSet<(i32, u32)> = HashSet::new();
    let mut yearly_used: HashSet<i32> = HashSet::new();

    let mut daily_count = 0u32;
    let mut weekly_count = 0u32;
    let mut monthly_count = 0u32;
    let mut yearly_count = 0u32;

    let mut keep = Vec::new();
    let mut delete = Vec::new();

    for b in sorted {
        let day = calendar_day(b.modified);
        let week = iso_year_week(b.modified);
        let month = calendar_month(b.modified);
        let year = calendar_year(b.modified);

        if daily_count < quotas.daily && daily_used.insert(day) {
            daily_count += 1;
            keep.push(b.name.clone());
        } else if weekly_count < quotas.weekly && weekly_used.insert(week) {
            weekly_count += 1;
            keep.push(b.name.clone());
        } else if monthly_count < quotas.monthly && monthly_used.insert(month) {
            monthly_count += 1;
            keep.push(b.name.clone());
        } else if yearly_count < quotas.yearly && yearly_used.insert(year) {
            yearly_count += 1;
            keep.push(b.name.clone());
        } else {
            delete.push(b.name.clone());
        }
    }

    tracing::info!(
        kept = keep.len(),
        deleted = delete.len(),
        daily = daily_count,
        weekly = weekly_count,
        monthly = monthly_count,
        yearly = yearly_count,
        "GFS retention classified"
    );

    (keep, delete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bundle(name: &str, days_ago: i64) -> StoredBundle {
        StoredBundle {
            name: name.to_string(),
            modified: Utc::now() - Duration::days(days_ago),
            size: 100,
        }
    }

    #[test]
    fn simple_keeps_newest_n() {
        let bundles = vec![bundle("a", 0), bundle("b", 1), bundle("c", 2)];
        let retention = RetentionConfig {
            mode: RetentionMode::Simple,
            keep_count: 2,
            gfs: GfsQuotas { daily: 0, weekly: 0, monthly: 0, yearly: 0 },
        };
        let (keep, delete) = classify(&bundles, &retention);
        assert_eq!(keep, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(delete, vec!["c".to_string()]);
    }

    #[test]
    fn gfs_keeps_one_per_day_up_to_quota() {
        let bundles = vec![bundle("d0", 0), bundle("d1", 1), bundle("d2", 2)];
        let retention = RetentionConfig {
            mode: RetentionMode::Gfs,
            keep_count: 0,
            gfs: GfsQuotas { daily: 2, weekly: 0, monthly: 0, yearly: 0 },
        };
        let (keep, delete) = classify(&bundles, &retention);
        assert_eq!(keep.len(), 2);
        assert_eq!(delete, vec!["d2".to_string()]);
    }

    #[test]
    fn gfs_falls_through_to_weekly_when_daily_exhausted() {
        let bundles = vec![bundle("d0", 0), bundle("d1", 1)];
        let retention = RetentionConfig {
            mode: RetentionMode::Gfs,
            keep_count: 0,
            gfs: GfsQuotas { daily: 1, weekly: 1, monthly: 0, yearly: 0 },
        };
        let (keep, delete) = classify(&bundles, &retention);
        assert_eq!(keep.len(), 2);
        assert!(delete.is_empty());
    }

    #[test]
    fn gfs_deletes_when_no_bucket_has_room() {
        let bundles = vec![bundle("d0", 0), bundle("d1", 1)];
        let retention = RetentionConfig {
            mode: RetentionMode::Gfs,
            keep_count: 0,
            gfs: GfsQuotas { daily: 1, weekly: 0, monthly: 0, yearly: 0 },
        };
        let (keep, delete) = classify(&bundles, &retention);
        assert_eq!(keep, vec!["d0".to_string()]);
        assert_eq!(delete, vec!["d1".to_string()]);
    }

    #[test]
    fn empty_input_keeps_and_deletes_nothing() {
        let retention = RetentionConfig {
            mode: RetentionMode::Simple,
            keep_count: 5,
            gfs: GfsQuotas { daily: 0, weekly: 0, monthly: 0, yearly: 0 },
        };
        let (keep, delete) = classify(&[], &retention);
        assert!(keep.is_empty() && delete.is_empty());
    }
}
