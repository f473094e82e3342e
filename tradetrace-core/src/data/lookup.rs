//! Nearest-sample search over time-ordered sequences.

use crate::domain::BarRecord;
use chrono::{DateTime, Duration, Utc};

/// Index of the item closest to `target`. Equidistant candidates resolve to
/// the earlier timestamp. `items` must be sorted ascending by `ts`.
pub fn nearest_index<T>(
    items: &[T],
    target: DateTime<Utc>,
    ts: impl Fn(&T) -> DateTime<Utc>,
) -> Option<usize> {
    if items.is_empty() {
        return None;
    }
    // First index at or after the target.
    let i = items.partition_point(|item| ts(item) < target);
    if i == 0 {
        return Some(0);
    }
    if i == items.len() {
        return Some(i - 1);
    }
    let before = target - ts(&items[i - 1]);
    let after = ts(&items[i]) - target;
    Some(if before <= after { i - 1 } else { i })
}

/// Direct index of the bar stamped exactly at `target`, computed from the
/// first bar and the unit without searching. `None` when `target` is not on
/// the unit grid or the bar at that position does not carry that timestamp
/// (a gap shifted the sequence).
pub fn exact_bar_index(bars: &[BarRecord], target: DateTime<Utc>, unit: Duration) -> Option<usize> {
    let first = bars.first()?.timestamp;
    let unit_ms = unit.num_milliseconds();
    if unit_ms <= 0 {
        return None;
    }
    let offset_ms = (target - first).num_milliseconds();
    if offset_ms < 0 || offset_ms % unit_ms != 0 {
        return None;
    }
    let idx = usize::try_from(offset_ms / unit_ms).ok()?;
    bars.get(idx)
        .filter(|b| b.timestamp == target)
        .map(|_| idx)
}

/// Exact grid hit first, nearest otherwise.
pub fn bar_index_for(bars: &[BarRecord], target: DateTime<Utc>, unit: Duration) -> Option<usize> {
    exact_bar_index(bars, target, unit).or_else(|| nearest_index(bars, target, |b| b.timestamp))
}

/// Floor `ts` to a multiple of `unit` since the epoch.
pub fn align_down(ts: DateTime<Utc>, unit: Duration) -> DateTime<Utc> {
    let unit_ms = unit.num_milliseconds();
    if unit_ms <= 0 {
        return ts;
    }
    let ms = ts.timestamp_millis();
    let floored = ms - ms.rem_euclid(unit_ms);
    DateTime::from_timestamp(floored.div_euclid(1000), (floored.rem_euclid(1000) * 1_000_000) as u32)
        .unwrap_or(ts)
}
