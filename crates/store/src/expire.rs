//! Expiration bookkeeping (§3.7, §4.2's `expire`): normalizing an
//! expiration epoch to midnight and naming the daily cleanup list a
//! key belongs on.

use chrono::{Datelike, TimeZone, Utc};

/// The hash that optionally mirrors every key's expiration for direct
/// lookup, when `expiration_updates` is configured.
pub const EXPIRES_HASH_KEY: &str = "_cleanup/expires";

fn midnight_utc(epoch: i64) -> i64 {
    let dt = Utc
        .timestamp_opt(epoch, 0)
        .single()
        .expect("epoch seconds always map to a valid UTC instant");
    dt.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight always exists")
        .and_utc()
        .timestamp()
}

/// Normalize `epoch` to midnight UTC (§3.7). Unless `force`, an epoch
/// landing today or earlier is pushed to tomorrow's midnight so it
/// doesn't race today's already-run (or in-progress) maintenance pass.
pub fn normalize_expiration(epoch: i64, force: bool, now: i64) -> i64 {
    let midnight = midnight_utc(epoch);
    if !force && midnight <= midnight_utc(now) {
        midnight + 86_400
    } else {
        midnight
    }
}

/// The daily cleanup list key a key expiring at `epoch` (already
/// midnight-aligned) should be recorded on: `_cleanup/YYYY/MM/DD`.
pub fn cleanup_list_key(epoch: i64) -> String {
    let dt = Utc
        .timestamp_opt(epoch, 0)
        .single()
        .expect("epoch seconds always map to a valid UTC instant");
    format!("_cleanup/{:04}/{:02}/{:02}", dt.year(), dt.month(), dt.day())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn epoch(y: i32, m: u32, d: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap()
            .and_utc()
            .timestamp()
    }

    #[test]
    fn future_epoch_normalizes_to_its_own_midnight() {
        let now = epoch(2024, 1, 1);
        let e = epoch(2024, 6, 15);
        let got = normalize_expiration(e, false, now);
        assert_eq!(got, midnight_utc(e));
    }

    #[test]
    fn today_or_past_advances_to_tomorrow_unless_forced() {
        let now = epoch(2024, 6, 15);
        let got = normalize_expiration(now, false, now);
        assert_eq!(got, midnight_utc(now) + 86_400);

        let forced = normalize_expiration(now, true, now);
        assert_eq!(forced, midnight_utc(now));
    }

    #[test]
    fn cleanup_list_key_formats_date_path() {
        assert_eq!(cleanup_list_key(epoch(2024, 3, 7)), "_cleanup/2024/03/07");
    }
}
