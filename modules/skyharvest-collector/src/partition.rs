use chrono::{DateTime, Duration, Utc};
use tracing::info;

use skyharvest_common::{PartitionStrategy, TimeWindow};

/// Split `[start, end]` into exactly `workers` windows, worker ids in order.
///
/// `equal`, `weighted` and `overlap` always cover the whole range with the
/// outer bounds snapped. A custom list that is too short is padded with its
/// last window (or with `[start, end]` when empty); one that is too long is
/// truncated.
pub fn partition(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    workers: usize,
    strategy: &PartitionStrategy,
) -> Vec<TimeWindow> {
    if workers == 0 {
        return Vec::new();
    }
    let windows = match strategy {
        PartitionStrategy::Equal => equal(start, end, workers),
        PartitionStrategy::Weighted { base } => weighted(start, end, workers, *base),
        PartitionStrategy::Overlap { percent } => overlap(start, end, workers, *percent),
        PartitionStrategy::Custom { windows } => custom(start, end, workers, windows),
    };
    info!(
        strategy = strategy.name(),
        workers,
        "Divided time range into {} windows",
        windows.len()
    );
    for window in &windows {
        info!("  {window}");
    }
    windows
}

fn window(worker_id: usize, start: DateTime<Utc>, end: DateTime<Utc>) -> TimeWindow {
    TimeWindow {
        worker_id,
        start,
        end,
    }
}

fn span_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds().max(0)
}

fn equal(start: DateTime<Utc>, end: DateTime<Utc>, n: usize) -> Vec<TimeWindow> {
    let step = span_ms(start, end) / n as i64;
    (0..n)
        .map(|i| {
            let from = start + Duration::milliseconds(step * i as i64);
            let to = if i == n - 1 {
                end
            } else {
                start + Duration::milliseconds(step * (i as i64 + 1))
            };
            window(i, from, to)
        })
        .collect()
}

/// Worker `i` gets a share proportional to `base^(n-1-i)`: the earliest
/// window is the longest. Boundaries are cumulative, so windows stay contiguous.
fn weighted(start: DateTime<Utc>, end: DateTime<Utc>, n: usize, base: f64) -> Vec<TimeWindow> {
    let total = span_ms(start, end) as f64;
    let weights: Vec<f64> = (0..n).map(|i| base.powi((n - 1 - i) as i32)).collect();
    let total_weight: f64 = weights.iter().sum();

    let mut windows = Vec::with_capacity(n);
    let mut from = start;
    let mut cumulative = 0.0;
    for (i, weight) in weights.iter().enumerate() {
        cumulative += weight;
        let to = if i == n - 1 {
            end
        } else {
            start + Duration::milliseconds((total * cumulative / total_weight).round() as i64)
        };
        windows.push(window(i, from, to));
        from = to;
    }
    windows
}

/// Neighbouring windows share `percent`% of the total range.
fn overlap(start: DateTime<Utc>, end: DateTime<Utc>, n: usize, percent: f64) -> Vec<TimeWindow> {
    let percent = if percent.is_finite() {
        percent.clamp(0.0, 100.0)
    } else {
        0.0
    };
    let total = span_ms(start, end) as f64;
    let shared = total * percent / 100.0;
    let width = (total + shared * (n as f64 - 1.0)) / n as f64;

    (0..n)
        .map(|i| {
            let offset = i as f64 * (width - shared);
            let from = if i == 0 {
                start
            } else {
                start + Duration::milliseconds(offset.round() as i64)
            };
            let to = if i == n - 1 {
                end
            } else {
                start + Duration::milliseconds((offset + width).round() as i64)
            };
            window(i, from, to)
        })
        .collect()
}

fn custom(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    n: usize,
    given: &[(DateTime<Utc>, DateTime<Utc>)],
) -> Vec<TimeWindow> {
    if given.len() != n {
        tracing::warn!(
            given = given.len(),
            workers = n,
            "Custom window count does not match worker count, padding or truncating"
        );
    }
    let fallback = given.last().copied().unwrap_or((start, end));
    (0..n)
        .map(|i| {
            let (from, to) = given.get(i).copied().unwrap_or(fallback);
            window(i, from, to)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyharvest_common::parse_timestamp;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    fn assert_contiguous(windows: &[TimeWindow], start: DateTime<Utc>, end: DateTime<Utc>) {
        assert_eq!(windows.first().unwrap().start, start);
        assert_eq!(windows.last().unwrap().end, end);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn equal_split_of_four_days() {
        let windows = partition(ts("2024-02-01"), ts("2024-02-05"), 2, &PartitionStrategy::Equal);
        assert_eq!(
            windows,
            vec![
                window(0, ts("2024-02-01"), ts("2024-02-03")),
                window(1, ts("2024-02-03"), ts("2024-02-05")),
            ]
        );
    }

    #[test]
    fn equal_snaps_last_window_on_uneven_split() {
        let (start, end) = (ts("2024-02-01T00:00:00Z"), ts("2024-02-01T00:00:01Z"));
        let windows = partition(start, end, 3, &PartitionStrategy::Equal);
        assert_eq!(windows.len(), 3);
        assert_contiguous(&windows, start, end);
    }

    #[test]
    fn weighted_windows_shrink_toward_present() {
        let (start, end) = (ts("2024-02-01"), ts("2025-02-01"));
        let windows = partition(start, end, 4, &PartitionStrategy::Weighted { base: 2.0 });

        assert_eq!(windows.len(), 4);
        assert_contiguous(&windows, start, end);
        let spans: Vec<i64> = windows.iter().map(|w| span_ms(w.start, w.end)).collect();
        assert!(spans.windows(2).all(|p| p[0] > p[1]), "{spans:?}");
        // 8:4:2:1 of the whole range
        assert_eq!(spans[0], (span_ms(start, end) as f64 * 8.0 / 15.0).round() as i64);
    }

    #[test]
    fn overlap_neighbours_share_the_requested_share() {
        let (start, end) = (ts("2024-02-01"), ts("2024-02-11"));
        let windows = partition(start, end, 3, &PartitionStrategy::Overlap { percent: 10.0 });

        assert_eq!(windows[0].start, start);
        assert_eq!(windows[2].end, end);
        let one_day = Duration::days(1);
        assert_eq!(windows[0].end - windows[1].start, one_day);
        assert_eq!(windows[1].end - windows[2].start, one_day);
    }

    #[test]
    fn out_of_range_overlap_still_covers_exactly_the_range() {
        let (start, end) = (ts("2024-02-01"), ts("2024-02-11"));

        let wide = partition(start, end, 3, &PartitionStrategy::Overlap { percent: 150.0 });
        assert!(wide.iter().all(|w| w.start >= start && w.end <= end));

        // Negative overlap is treated as none: contiguous, no gaps.
        let negative = partition(start, end, 3, &PartitionStrategy::Overlap { percent: -20.0 });
        assert_eq!(negative[0].start, start);
        assert_eq!(negative[0].end, negative[1].start);
        assert_eq!(negative[1].end, negative[2].start);
        assert_eq!(negative[2].end, end);
    }

    #[test]
    fn custom_list_is_padded_or_truncated() {
        let (start, end) = (ts("2024-01-01"), ts("2024-12-31"));
        let given = vec![
            (ts("2024-02-01"), ts("2024-03-01")),
            (ts("2024-03-01"), ts("2024-04-01")),
        ];

        let padded = partition(start, end, 3, &PartitionStrategy::Custom { windows: given.clone() });
        assert_eq!(padded.len(), 3);
        assert_eq!(padded[2], window(2, ts("2024-03-01"), ts("2024-04-01")));

        let truncated = partition(start, end, 1, &PartitionStrategy::Custom { windows: given });
        assert_eq!(truncated, vec![window(0, ts("2024-02-01"), ts("2024-03-01"))]);

        let empty = partition(start, end, 2, &PartitionStrategy::Custom { windows: vec![] });
        assert!(empty.iter().all(|w| w.start == start && w.end == end));
    }

    #[test]
    fn zero_workers_yields_nothing() {
        assert!(partition(ts("2024-02-01"), ts("2024-02-05"), 0, &PartitionStrategy::Equal).is_empty());
    }
}
