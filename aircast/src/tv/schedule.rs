//! Schedule arithmetic: which program is on air, what comes next.

use chrono::{DateTime, Utc};

use super::TvScheduleEntry;

/// Keep a schedule sorted by start time. Entries are compared by start
/// time only; callers enforce id uniqueness.
pub fn sort_schedule(entries: &mut [TvScheduleEntry]) {
    entries.sort_by_key(|e| e.start_time);
}

/// The entry on air at `now`: `start <= now < start + duration`. When
/// entries overlap, the latest-starting one wins (it superseded the other).
pub fn current_entry(schedule: &[TvScheduleEntry], now: DateTime<Utc>) -> Option<&TvScheduleEntry> {
    schedule
        .iter()
        .filter(|e| e.start_time <= now && now < e.end_time())
        .last()
}

/// The next entry strictly after `now`.
pub fn next_entry_after(
    schedule: &[TvScheduleEntry],
    now: DateTime<Utc>,
) -> Option<&TvScheduleEntry> {
    schedule.iter().find(|e| e.start_time > now)
}

/// Seconds of `entry` already elapsed at `now`.
pub fn offset_secs(entry: &TvScheduleEntry, now: DateTime<Utc>) -> f64 {
    ((now - entry.start_time).num_milliseconds().max(0) as f64) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tv::TvProgram;

    fn entry(id: &str, start_offset_secs: i64, duration_secs: f64) -> TvScheduleEntry {
        TvScheduleEntry {
            program: TvProgram {
                id: id.to_string(),
                title: id.to_string(),
                description: None,
                media_path: format!("/video/{id}.mp4"),
                duration_secs,
            },
            start_time: base() + chrono::Duration::seconds(start_offset_secs),
        }
    }

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn current_entry_respects_bounds() {
        let mut schedule = vec![entry("a", 0, 60.0), entry("b", 60, 60.0)];
        sort_schedule(&mut schedule);

        let at = |secs: i64| base() + chrono::Duration::seconds(secs);
        assert_eq!(current_entry(&schedule, at(0)).unwrap().program.id, "a");
        assert_eq!(current_entry(&schedule, at(59)).unwrap().program.id, "a");
        assert_eq!(current_entry(&schedule, at(60)).unwrap().program.id, "b");
        assert!(current_entry(&schedule, at(120)).is_none());
        assert!(current_entry(&schedule, at(-1)).is_none());
    }

    #[test]
    fn gap_between_programs_has_no_current_entry() {
        let schedule = vec![entry("a", 0, 30.0), entry("b", 120, 30.0)];
        let at = |secs: i64| base() + chrono::Duration::seconds(secs);
        assert!(current_entry(&schedule, at(60)).is_none());
        assert_eq!(next_entry_after(&schedule, at(60)).unwrap().program.id, "b");
    }

    #[test]
    fn overlapping_entries_prefer_latest_start() {
        let mut schedule = vec![entry("long", 0, 300.0), entry("override", 60, 60.0)];
        sort_schedule(&mut schedule);
        let at = |secs: i64| base() + chrono::Duration::seconds(secs);
        assert_eq!(
            current_entry(&schedule, at(90)).unwrap().program.id,
            "override"
        );
    }

    #[test]
    fn offset_into_program() {
        let e = entry("a", 0, 60.0);
        let now = base() + chrono::Duration::seconds(12);
        assert!((offset_secs(&e, now) - 12.0).abs() < f64::EPSILON);
        assert_eq!(offset_secs(&e, base() - chrono::Duration::seconds(5)), 0.0);
    }
}
