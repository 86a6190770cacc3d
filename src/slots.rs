//! Candidate slot generation for a single business day.
//!
//! Local opening times are anchored to absolute instants in the business
//! timezone once; after that the cursor walks in absolute milliseconds, so a
//! DST change inside opening hours shortens or lengthens the day instead of
//! shifting every later slot.

use chrono::{DateTime, NaiveDate, NaiveTime, Offset, TimeDelta, TimeZone};
use chrono_tz::Tz;
use serde::Serialize;

use crate::limits::MAX_SLOTS_PER_DAY;
use crate::model::{minutes_to_ms, DaySchedule, Ms, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    ZeroDuration,
    InvalidDate(String),
    InvalidTimezone(String),
}

impl std::fmt::Display for SlotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotError::ZeroDuration => write!(f, "slot duration must be positive"),
            SlotError::InvalidDate(s) => write!(f, "invalid date {s:?}: expected YYYY-MM-DD"),
            SlotError::InvalidTimezone(s) => write!(f, "unknown timezone {s:?}"),
        }
    }
}

impl std::error::Error for SlotError {}

/// A bookable start time of fixed length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CandidateSlot {
    pub start: Ms,
    pub duration_minutes: u32,
}

impl CandidateSlot {
    pub fn span(&self) -> Span {
        Span::starting_at(self.start, self.duration_minutes)
    }
}

/// Lazy, finite slot sequence. Cloning restarts from the clone point.
#[derive(Debug, Clone)]
pub struct SlotIter {
    cursor: Ms,
    close: Ms,
    duration_minutes: u32,
    step: Ms,
    remaining: usize,
}

impl Iterator for SlotIter {
    type Item = CandidateSlot;

    fn next(&mut self) -> Option<CandidateSlot> {
        if self.remaining == 0 || self.cursor + minutes_to_ms(self.duration_minutes) > self.close {
            return None;
        }
        let slot = CandidateSlot {
            start: self.cursor,
            duration_minutes: self.duration_minutes,
        };
        self.cursor += self.step;
        self.remaining -= 1;
        Some(slot)
    }
}

/// Slots for `date` between the schedule's opening and closing times, spaced
/// `duration + buffer` apart. Empty when closed or when nothing fits.
pub fn candidate_slots(
    date: NaiveDate,
    tz: Tz,
    schedule: DaySchedule,
    duration_minutes: u32,
    buffer_minutes: u32,
) -> Result<SlotIter, SlotError> {
    if duration_minutes == 0 {
        return Err(SlotError::ZeroDuration);
    }
    let open = local_instant(tz, date, schedule.opens);
    let close = local_instant(tz, date, schedule.closes);
    Ok(SlotIter {
        cursor: open,
        close,
        duration_minutes,
        step: minutes_to_ms(duration_minutes) + minutes_to_ms(buffer_minutes),
        remaining: if schedule.opens < schedule.closes { MAX_SLOTS_PER_DAY } else { 0 },
    })
}

/// Absolute instant of a local wall-clock time.
///
/// Ambiguous times (DST fall-back) take the earlier instant. Times inside a
/// spring-forward gap keep the pre-transition offset, which lands them after
/// the gap by its own length.
pub fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Ms {
    let naive = date.and_time(time);
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return dt.timestamp_millis();
    }
    let offset_secs = tz
        .from_local_datetime(&(naive - TimeDelta::hours(3)))
        .earliest()
        .map(|dt| dt.offset().fix().local_minus_utc())
        .unwrap_or(0);
    (naive - TimeDelta::seconds(i64::from(offset_secs)))
        .and_utc()
        .timestamp_millis()
}

/// Local midnight to the next local midnight.
pub fn day_window(tz: Tz, date: NaiveDate) -> Span {
    let start = local_instant(tz, date, NaiveTime::MIN);
    let end = date
        .succ_opt()
        .map(|next| local_instant(tz, next, NaiveTime::MIN))
        .unwrap_or(start + crate::model::DAY_MS);
    Span::new(start, end)
}

pub fn today_in(tz: Tz, now: Ms) -> NaiveDate {
    DateTime::from_timestamp_millis(now)
        .unwrap_or_default()
        .with_timezone(&tz)
        .date_naive()
}

/// `HH:MM` in the business timezone.
pub fn display_time(tz: Tz, instant: Ms) -> String {
    DateTime::from_timestamp_millis(instant)
        .unwrap_or_default()
        .with_timezone(&tz)
        .format("%H:%M")
        .to_string()
}

pub fn parse_date(s: &str) -> Result<NaiveDate, SlotError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| SlotError::InvalidDate(s.to_string()))
}

pub fn parse_timezone(s: &str) -> Result<Tz, SlotError> {
    s.parse::<Tz>().map_err(|_| SlotError::InvalidTimezone(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HOUR_MS as H, MINUTE_MS as M};

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sched(open: (u32, u32), close: (u32, u32)) -> DaySchedule {
        DaySchedule {
            opens: hm(open.0, open.1),
            closes: hm(close.0, close.1),
        }
    }

    fn local_times(slots: SlotIter, tz: Tz) -> Vec<String> {
        slots.map(|s| display_time(tz, s.start)).collect()
    }

    #[test]
    fn nine_to_five_hour_slots_with_buffer() {
        let tz: Tz = "UTC".parse().unwrap();
        let slots = candidate_slots(date(2026, 3, 2), tz, sched((9, 0), (17, 0)), 60, 15).unwrap();
        assert_eq!(
            local_times(slots, tz),
            vec!["09:00", "10:15", "11:30", "12:45", "14:00", "15:15"]
        );
    }

    #[test]
    fn slots_anchor_in_business_timezone() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let d = date(2026, 1, 15);
        let first = candidate_slots(d, tz, sched((9, 0), (10, 0)), 30, 0)
            .unwrap()
            .next()
            .unwrap();
        // EST is UTC-5.
        let midnight_utc = d.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
        assert_eq!(first.start, midnight_utc + 14 * H);
    }

    #[test]
    fn exact_fit_last_slot_included() {
        let tz: Tz = "UTC".parse().unwrap();
        let slots: Vec<_> = candidate_slots(date(2026, 3, 2), tz, sched((9, 0), (11, 0)), 60, 0)
            .unwrap()
            .collect();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[1].span().end - slots[0].start, 2 * H);
    }

    #[test]
    fn closed_or_inverted_hours_produce_nothing() {
        let tz: Tz = "UTC".parse().unwrap();
        assert_eq!(candidate_slots(date(2026, 3, 2), tz, sched((17, 0), (9, 0)), 30, 0).unwrap().count(), 0);
        assert_eq!(candidate_slots(date(2026, 3, 2), tz, sched((9, 0), (9, 0)), 30, 0).unwrap().count(), 0);
    }

    #[test]
    fn duration_longer_than_day_produces_nothing() {
        let tz: Tz = "UTC".parse().unwrap();
        let n = candidate_slots(date(2026, 3, 2), tz, sched((9, 0), (9, 45)), 60, 0).unwrap().count();
        assert_eq!(n, 0);
    }

    #[test]
    fn zero_duration_rejected() {
        let tz: Tz = "UTC".parse().unwrap();
        let err = candidate_slots(date(2026, 3, 2), tz, sched((9, 0), (17, 0)), 0, 0).unwrap_err();
        assert_eq!(err, SlotError::ZeroDuration);
    }

    #[test]
    fn iterator_is_restartable() {
        let tz: Tz = "UTC".parse().unwrap();
        let slots = candidate_slots(date(2026, 3, 2), tz, sched((9, 0), (12, 0)), 45, 5).unwrap();
        let a: Vec<_> = slots.clone().collect();
        let b: Vec<_> = slots.collect();
        assert_eq!(a, b);
    }

    #[test]
    fn spring_forward_day_is_shorter() {
        // 2026-03-08 02:00 local does not exist in New York.
        let tz: Tz = "America/New_York".parse().unwrap();
        let window = day_window(tz, date(2026, 3, 8));
        assert_eq!(window.duration_ms(), 23 * H);

        let slots: Vec<_> = candidate_slots(date(2026, 3, 8), tz, sched((1, 0), (4, 0)), 60, 0)
            .unwrap()
            .collect();
        // 01:00 EST to 04:00 EDT is two real hours.
        assert_eq!(slots.len(), 2);
        assert_eq!(display_time(tz, slots[1].start), "03:00");
    }

    #[test]
    fn gap_time_is_shifted_forward() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let d = date(2026, 3, 8);
        let in_gap = local_instant(tz, d, hm(2, 30));
        assert_eq!(display_time(tz, in_gap), "03:30");
        assert_eq!(in_gap - local_instant(tz, d, hm(1, 30)), H);
    }

    #[test]
    fn fall_back_ambiguous_time_takes_earlier() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let d = date(2026, 11, 1);
        let one_thirty = local_instant(tz, d, hm(1, 30));
        let midnight = local_instant(tz, d, hm(0, 0));
        assert_eq!(one_thirty - midnight, H + 30 * M);
        assert_eq!(day_window(tz, d).duration_ms(), 25 * H);
    }

    #[test]
    fn today_in_respects_timezone() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        // 2026-03-01 20:00 UTC is 2026-03-02 05:00 in Tokyo.
        let now = date(2026, 3, 1).and_time(hm(20, 0)).and_utc().timestamp_millis();
        assert_eq!(today_in(tz, now), date(2026, 3, 2));
        assert_eq!(today_in(chrono_tz::UTC, now), date(2026, 3, 1));
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_date("2026-03-02").unwrap(), date(2026, 3, 2));
        assert!(matches!(parse_date("03/02/2026"), Err(SlotError::InvalidDate(_))));
        assert!(matches!(parse_date("2026-02-30"), Err(SlotError::InvalidDate(_))));
        assert!(parse_timezone("Europe/Berlin").is_ok());
        assert!(matches!(parse_timezone("Mars/Olympus"), Err(SlotError::InvalidTimezone(_))));
    }
}
