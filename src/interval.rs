//! Interval primitives shared by slot resolution and booking conflict checks.
//!
//! All spans are half-open, so intervals that merely touch never collide.

use crate::model::{Ms, Span};

/// Strict half-open overlap.
pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.overlaps(b)
}

/// Widen `span` by `buffer_minutes` on both sides.
pub fn expand(span: &Span, buffer_minutes: u32) -> Span {
    span.expand(buffer_minutes)
}

/// Sort by start (stable) and merge overlapping or touching spans into
/// disjoint intervals.
pub fn merge_sorted(spans: &[Span]) -> Vec<Span> {
    let mut sorted = spans.to_vec();
    sorted.sort_by_key(|s| s.start);

    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// First span in `busy` that collides with `candidate` once padded by
/// `buffer_minutes`. `busy` must be disjoint and sorted (see [`merge_sorted`]).
pub fn collides(busy: &[Span], candidate: &Span, buffer_minutes: u32) -> Option<Span> {
    let first = busy.partition_point(|b| b.expand(buffer_minutes).end <= candidate.start);
    busy[first..]
        .iter()
        .take_while(|b| b.expand(buffer_minutes).start < candidate.end)
        .find(|b| b.expand(buffer_minutes).overlaps(candidate))
        .copied()
}

/// Sweep-line algorithm: find time ranges where allocation count >= capacity.
/// Returns sorted, merged spans representing fully-saturated time ranges.
pub fn saturated_spans(allocs: &[Span], capacity: u32) -> Vec<Span> {
    if allocs.is_empty() || capacity == 0 {
        return Vec::new();
    }
    if capacity == 1 {
        return merge_sorted(allocs);
    }

    // Ends sort before starts at the same instant: touching is not overlap.
    let mut events: Vec<(Ms, i32)> = Vec::with_capacity(allocs.len() * 2);
    for a in allocs {
        events.push((a.start, 1));
        events.push((a.end, -1));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result: Vec<Span> = Vec::new();
    let mut count: i64 = 0;
    let mut saturated_start: Option<Ms> = None;

    for (time, delta) in events {
        count += i64::from(delta);
        if count >= i64::from(capacity) {
            if saturated_start.is_none() {
                saturated_start = Some(time);
            }
        } else if let Some(start) = saturated_start.take()
            && time > start
        {
            match result.last_mut() {
                Some(last) if last.end >= start => last.end = last.end.max(time),
                _ => result.push(Span::new(start, time)),
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HOUR_MS as H, MINUTE_MS as M};

    #[test]
    fn touching_spans_do_not_overlap() {
        assert!(!overlaps(&Span::new(0, 100), &Span::new(100, 200)));
        assert!(overlaps(&Span::new(0, 101), &Span::new(100, 200)));
    }

    #[test]
    fn merge_sorted_unsorted_input() {
        let spans = vec![Span::new(500, 600), Span::new(100, 300), Span::new(200, 400)];
        assert_eq!(merge_sorted(&spans), vec![Span::new(100, 400), Span::new(500, 600)]);
    }

    #[test]
    fn merge_sorted_touching_spans_join() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_sorted(&spans), vec![Span::new(100, 300)]);
    }

    #[test]
    fn merge_sorted_contained_span() {
        let spans = vec![Span::new(100, 500), Span::new(200, 300)];
        assert_eq!(merge_sorted(&spans), vec![Span::new(100, 500)]);
    }

    #[test]
    fn merge_sorted_empty() {
        assert!(merge_sorted(&[]).is_empty());
    }

    #[test]
    fn collides_with_buffer() {
        let busy = vec![Span::new(10 * H, 11 * H)];
        // 09:00-10:00 touches the raw busy span but hits the 15 min pad.
        assert!(collides(&busy, &Span::new(9 * H, 10 * H), 0).is_none());
        assert_eq!(collides(&busy, &Span::new(9 * H, 10 * H), 15), Some(busy[0]));
        // 11:30 starts after 11:15.
        assert!(collides(&busy, &Span::new(11 * H + 30 * M, 12 * H + 30 * M), 15).is_none());
        // 11:15 exactly touches the padded end.
        assert!(collides(&busy, &Span::new(11 * H + 15 * M, 12 * H), 15).is_none());
    }

    #[test]
    fn collides_skips_earlier_spans() {
        let busy = vec![Span::new(0, 100), Span::new(1000, 1100), Span::new(5000, 6000)];
        assert_eq!(collides(&busy, &Span::new(1050, 1200), 0), Some(busy[1]));
        assert!(collides(&busy, &Span::new(2000, 3000), 0).is_none());
    }

    #[test]
    fn saturated_spans_basic() {
        let allocs = vec![Span::new(0, 100), Span::new(50, 150)];
        assert_eq!(saturated_spans(&allocs, 2), vec![Span::new(50, 100)]);
    }

    #[test]
    fn saturated_spans_touching_not_counted() {
        let allocs = vec![Span::new(0, 100), Span::new(100, 200)];
        assert!(saturated_spans(&allocs, 2).is_empty());
    }

    #[test]
    fn saturated_spans_capacity_one_merges() {
        let allocs = vec![Span::new(0, 100), Span::new(200, 300)];
        assert_eq!(saturated_spans(&allocs, 1), allocs);
    }

    #[test]
    fn saturated_spans_three_overlap_capacity_three() {
        let allocs = vec![Span::new(0, 100), Span::new(25, 75), Span::new(50, 150)];
        assert_eq!(saturated_spans(&allocs, 3), vec![Span::new(50, 75)]);
    }

    #[test]
    fn saturated_spans_empty() {
        assert!(saturated_spans(&[], 5).is_empty());
    }
}
