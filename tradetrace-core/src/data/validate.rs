//! Data quality checks for fetched sequences.
//!
//! Pure functions over a slice: nothing is mutated or dropped. Empty input,
//! inconsistent OHLC and non-ascending timestamps make a report invalid;
//! gaps, quiet volume, extreme ranges and low coverage are advisory.

use crate::config::ValidationConfig;
use crate::domain::{BarRecord, Granularity, TickRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A missing stretch between two consecutive bars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarGap {
    pub after: DateTime<Utc>,
    pub before: DateTime<Utc>,
    /// Whole units absent between the two bars.
    pub missing_units: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityWarning {
    Empty,
    /// First position where a timestamp goes backwards.
    OutOfOrder { index: usize, timestamp: DateTime<Utc> },
    DuplicateTimestamps { count: usize },
    InvalidOhlc { count: usize, first_index: usize },
    InvalidTicks { count: usize, first_index: usize },
    Gaps { count: usize, largest_missing_units: i64 },
    ZeroVolume { bars: usize, runs: usize, longest_run: usize },
    LowVolume { bars: usize, share: f64 },
    ExtremeMove { min_low: f64, max_high: f64, ratio: f64 },
    LowCoverage {
        actual: usize,
        expected: usize,
        ratio: f64,
        threshold: f64,
    },
}

impl QualityWarning {
    pub fn severity(&self) -> Severity {
        match self {
            QualityWarning::Empty
            | QualityWarning::OutOfOrder { .. }
            | QualityWarning::DuplicateTimestamps { .. }
            | QualityWarning::InvalidOhlc { .. }
            | QualityWarning::InvalidTicks { .. } => Severity::Error,
            QualityWarning::LowCoverage { .. } | QualityWarning::Gaps { .. } => Severity::Warning,
            QualityWarning::ZeroVolume { .. }
            | QualityWarning::LowVolume { .. }
            | QualityWarning::ExtremeMove { .. } => Severity::Info,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub valid: bool,
    pub granularity: Granularity,
    pub count: usize,
    pub expected_count: Option<usize>,
    pub coverage_ratio: Option<f64>,
    pub warnings: Vec<QualityWarning>,
    pub gaps: Vec<BarGap>,
    /// (min low, max high) over sane bars, or (min, max) price for ticks.
    pub price_range: Option<(f64, f64)>,
}

impl QualityReport {
    fn finish(
        granularity: Granularity,
        count: usize,
        expected_count: Option<usize>,
        coverage_ratio: Option<f64>,
        warnings: Vec<QualityWarning>,
        gaps: Vec<BarGap>,
        price_range: Option<(f64, f64)>,
    ) -> Self {
        Self {
            valid: !warnings.iter().any(QualityWarning::is_fatal),
            granularity,
            count,
            expected_count,
            coverage_ratio,
            warnings,
            gaps,
            price_range,
        }
    }

    pub fn has_warning(&self, pred: impl Fn(&QualityWarning) -> bool) -> bool {
        self.warnings.iter().any(pred)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DataQualityValidator {
    config: ValidationConfig,
}

impl DataQualityValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Assess a bar sequence. `expected` is the bar count the window should
    /// hold; `None` skips the coverage check.
    pub fn validate_bars(
        &self,
        bars: &[BarRecord],
        granularity: Granularity,
        expected: Option<usize>,
    ) -> QualityReport {
        let mut warnings = Vec::new();

        if bars.is_empty() {
            warnings.push(QualityWarning::Empty);
            let coverage = expected.filter(|&e| e > 0).map(|_| 0.0);
            return QualityReport::finish(granularity, 0, expected, coverage, warnings, vec![], None);
        }

        check_ordering(bars.iter().map(|b| b.timestamp), &mut warnings, true);

        let invalid: Vec<usize> = bars
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_sane())
            .map(|(i, _)| i)
            .collect();
        if let Some(&first_index) = invalid.first() {
            warnings.push(QualityWarning::InvalidOhlc {
                count: invalid.len(),
                first_index,
            });
        }

        let gaps = find_gaps(bars, granularity);
        if !gaps.is_empty() {
            warnings.push(QualityWarning::Gaps {
                count: gaps.len(),
                largest_missing_units: gaps.iter().map(|g| g.missing_units).max().unwrap_or(0),
            });
        }

        self.check_volume(bars, &mut warnings);

        let price_range = bars
            .iter()
            .filter(|b| b.is_sane())
            .fold(None, |acc: Option<(f64, f64)>, b| match acc {
                None => Some((b.low, b.high)),
                Some((lo, hi)) => Some((lo.min(b.low), hi.max(b.high))),
            });
        if let Some((min_low, max_high)) = price_range {
            let ratio = max_high / min_low;
            if ratio > self.config.extreme_move_ratio {
                warnings.push(QualityWarning::ExtremeMove {
                    min_low,
                    max_high,
                    ratio,
                });
            }
        }

        let coverage_ratio = self.check_coverage(bars.len(), expected, &mut warnings);
        QualityReport::finish(
            granularity,
            bars.len(),
            expected,
            coverage_ratio,
            warnings,
            gaps,
            price_range,
        )
    }

    /// Assess a tick sequence: ordering and positive price/size only. Equal
    /// timestamps are normal for ticks.
    pub fn validate_ticks(&self, ticks: &[TickRecord]) -> QualityReport {
        let mut warnings = Vec::new();
        if ticks.is_empty() {
            warnings.push(QualityWarning::Empty);
            return QualityReport::finish(Granularity::Tick, 0, None, None, warnings, vec![], None);
        }

        check_ordering(ticks.iter().map(|t| t.timestamp), &mut warnings, false);

        let invalid: Vec<usize> = ticks
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_sane())
            .map(|(i, _)| i)
            .collect();
        if let Some(&first_index) = invalid.first() {
            warnings.push(QualityWarning::InvalidTicks {
                count: invalid.len(),
                first_index,
            });
        }

        let price_range = ticks
            .iter()
            .filter(|t| t.is_sane())
            .fold(None, |acc: Option<(f64, f64)>, t| match acc {
                None => Some((t.price, t.price)),
                Some((lo, hi)) => Some((lo.min(t.price), hi.max(t.price))),
            });

        QualityReport::finish(
            Granularity::Tick,
            ticks.len(),
            None,
            None,
            warnings,
            vec![],
            price_range,
        )
    }

    fn check_volume(&self, bars: &[BarRecord], warnings: &mut Vec<QualityWarning>) {
        let mut zero_bars = 0;
        let mut runs = 0;
        let mut longest_run = 0;
        let mut current = 0;
        for bar in bars {
            if bar.volume == 0 {
                zero_bars += 1;
                if current == 0 {
                    runs += 1;
                }
                current += 1;
                longest_run = longest_run.max(current);
            } else {
                current = 0;
            }
        }
        if zero_bars > 0 {
            warnings.push(QualityWarning::ZeroVolume {
                bars: zero_bars,
                runs,
                longest_run,
            });
        }

        let low = bars
            .iter()
            .filter(|b| b.volume > 0 && b.volume < self.config.low_volume_threshold)
            .count();
        let share = low as f64 / bars.len() as f64;
        if low > 0 && share > self.config.low_volume_share {
            warnings.push(QualityWarning::LowVolume { bars: low, share });
        }
    }

    fn check_coverage(
        &self,
        actual: usize,
        expected: Option<usize>,
        warnings: &mut Vec<QualityWarning>,
    ) -> Option<f64> {
        let expected = expected.filter(|&e| e > 0)?;
        let ratio = actual as f64 / expected as f64;
        if ratio < self.config.coverage_threshold {
            warnings.push(QualityWarning::LowCoverage {
                actual,
                expected,
                ratio,
                threshold: self.config.coverage_threshold,
            });
        }
        Some(ratio)
    }
}

/// Flags the first backwards step and counts repeated timestamps.
fn check_ordering(
    timestamps: impl Iterator<Item = DateTime<Utc>>,
    warnings: &mut Vec<QualityWarning>,
    strict: bool,
) {
    let mut prev: Option<DateTime<Utc>> = None;
    let mut out_of_order = None;
    let mut duplicates = 0;
    for (i, ts) in timestamps.enumerate() {
        if let Some(p) = prev {
            if ts < p && out_of_order.is_none() {
                out_of_order = Some((i, ts));
            } else if ts == p {
                duplicates += 1;
            }
        }
        prev = Some(ts);
    }
    if let Some((index, timestamp)) = out_of_order {
        warnings.push(QualityWarning::OutOfOrder { index, timestamp });
    }
    if strict && duplicates > 0 {
        warnings.push(QualityWarning::DuplicateTimestamps { count: duplicates });
    }
}

fn find_gaps(bars: &[BarRecord], granularity: Granularity) -> Vec<BarGap> {
    let Some(unit) = granularity.unit() else {
        return Vec::new();
    };
    let unit_ms = unit.num_milliseconds();
    bars.windows(2)
        .filter_map(|pair| {
            let delta = (pair[1].timestamp - pair[0].timestamp).num_milliseconds();
            (delta > unit_ms).then(|| BarGap {
                after: pair[0].timestamp,
                before: pair[1].timestamp,
                missing_units: delta / unit_ms - 1,
            })
        })
        .collect()
}
