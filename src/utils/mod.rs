pub mod bins;
pub mod cancel;
pub mod exec_policy;
pub mod lock;
pub mod process;

pub mod time {
    use chrono::{DateTime, Datelike, TimeZone, Utc};

    #[inline]
    pub fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[inline]
    pub fn current_epoch() -> u64 {
        now().timestamp().max(0) as u64
    }

    pub fn fmt_rfc3339(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }

    pub fn run_basename_stamp(ts: DateTime<Utc>) -> String {
        ts.format("%Y%m%d-%H%M%S").to_string()
    }

    /// ISO-8601 (year, week) pair used by GFS weekly bucketing.
    pub fn iso_year_week(ts: DateTime<Utc>) -> (i32, u32) {
        let iw = ts.iso_week();
        (iw.year(), iw.week())
    }

    pub fn calendar_month(ts: DateTime<Utc>) -> (i32, u32) {
        (ts.year(), ts.month())
    }

    pub fn calendar_year(ts: DateTime<Utc>) -> i32 {
        ts.year()
    }

    pub fn calendar_day(ts: DateTime<Utc>) -> (i32, u32, u32) {
        (ts.year(), ts.month(), ts.day())
    }

    pub fn from_epoch(secs: u64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs as i64, 0).single().unwrap_or_else(Utc::now)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn epoch_is_sane() {
            assert!(current_epoch() > 1_600_000_000);
        }

        #[test]
        fn iso_week_matches_known_date() {
            let dt = Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap();
            assert_eq!(iso_year_week(dt), (2024, 23));
        }

        #[test]
        fn roundtrip_epoch() {
            let dt = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
            let back = from_epoch(dt.timestamp() as u64);
            assert_eq!(back.timestamp(), dt.timestamp());
        }
    }
}
