use chrono::{NaiveDate, NaiveTime};
use proptest::prelude::*;

use slotwise::interval::{collides, merge_sorted, saturated_spans};
use slotwise::model::{DaySchedule, MINUTE_MS, Span};
use slotwise::slots::{candidate_slots, local_instant};

fn span() -> impl Strategy<Value = Span> {
    (0i64..600, 1i64..120).prop_map(|(start, len)| Span::new(start * MINUTE_MS, (start + len) * MINUTE_MS))
}

fn spans() -> impl Strategy<Value = Vec<Span>> {
    prop::collection::vec(span(), 0..24)
}

proptest! {
    #[test]
    fn merged_spans_are_sorted_disjoint_and_cover_input(input in spans()) {
        let merged = merge_sorted(&input);
        for pair in merged.windows(2) {
            prop_assert!(pair[0].end < pair[1].start);
        }
        for s in &input {
            prop_assert!(merged.iter().any(|m| m.contains_span(s)));
        }
        prop_assert!(merged.len() <= input.len());
    }

    #[test]
    fn collides_agrees_with_linear_scan(input in spans(), candidate in span(), buffer in 0u32..30) {
        let merged = merge_sorted(&input);
        let fast = collides(&merged, &candidate, buffer).is_some();
        let slow = input.iter().any(|s| s.expand(buffer).overlaps(&candidate));
        prop_assert_eq!(fast, slow);
    }

    #[test]
    fn saturated_instants_match_allocation_count(input in spans(), capacity in 1u32..4) {
        let saturated = saturated_spans(&input, capacity);
        for minute in 0i64..720 {
            let t = minute * MINUTE_MS;
            let held = input.iter().filter(|s| s.contains_instant(t)).count() as u32;
            let in_saturated = saturated.iter().any(|s| s.contains_instant(t));
            prop_assert_eq!(in_saturated, held >= capacity, "at minute {}", minute);
        }
    }

    #[test]
    fn candidate_slots_fit_inside_opening_hours(
        open_h in 0u32..12,
        hours in 1u32..12,
        duration in 5u32..180,
        buffer in 0u32..60,
    ) {
        let date = NaiveDate::from_ymd_opt(2030, 3, 4).unwrap();
        let schedule = DaySchedule {
            opens: NaiveTime::from_hms_opt(open_h, 0, 0).unwrap(),
            closes: NaiveTime::from_hms_opt(open_h + hours, 0, 0).unwrap(),
        };
        let open = local_instant(chrono_tz::UTC, date, schedule.opens);
        let close = local_instant(chrono_tz::UTC, date, schedule.closes);
        let slots: Vec<_> = candidate_slots(date, chrono_tz::UTC, schedule, duration, buffer)
            .unwrap()
            .collect();

        let step = i64::from(duration + buffer) * MINUTE_MS;
        for (i, slot) in slots.iter().enumerate() {
            prop_assert_eq!(slot.start, open + i as i64 * step);
            prop_assert!(slot.span().end <= close);
        }
        // No room for one more.
        let next = open + slots.len() as i64 * step;
        prop_assert!(next + i64::from(duration) * MINUTE_MS > close);
    }
}
