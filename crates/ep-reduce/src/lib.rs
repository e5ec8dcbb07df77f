#![forbid(unsafe_code)]

use chrono::Duration;
use ep_value::{Number, Point, Series, TimeRange};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReduceError {
    #[error("unknown reducer '{0}'")]
    UnknownReducer(String),
    #[error("unknown downsampler '{0}'")]
    UnknownDownsampler(String),
    #[error("unknown upsampler '{0}'")]
    UnknownUpsampler(String),
    #[error("invalid resample rule '{0}'")]
    InvalidRule(String),
    #[error("time range shorter than rule interval")]
    RangeTooShort,
}

// ── Strict reducers ─────────────────────────────────────────────────────

/// Series-to-number reducers with strict null handling: a single null or
/// NaN input poisons the result for the aggregating reducers. The output
/// value is always present; absence is encoded as NaN, never as null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrictReducer {
    Sum,
    Mean,
    Min,
    Max,
    Count,
    Last,
    Median,
}

impl StrictReducer {
    pub fn from_name(name: &str) -> Result<Self, ReduceError> {
        match name {
            "sum" => Ok(Self::Sum),
            "mean" | "avg" => Ok(Self::Mean),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "count" => Ok(Self::Count),
            "last" => Ok(Self::Last),
            "median" => Ok(Self::Median),
            other => Err(ReduceError::UnknownReducer(other.to_owned())),
        }
    }

    #[must_use]
    pub fn reduce(self, series: &Series) -> Number {
        let value = match self {
            Self::Count => series.points.len() as f64,
            Self::Sum => strict_fold(series, 0.0, |acc, v| acc + v),
            Self::Mean => {
                if series.points.is_empty() {
                    f64::NAN
                } else {
                    strict_fold(series, 0.0, |acc, v| acc + v) / series.points.len() as f64
                }
            }
            Self::Min => strict_extreme(series, |acc, v| v < acc),
            Self::Max => strict_extreme(series, |acc, v| v > acc),
            Self::Last => series
                .points
                .last()
                .and_then(|p| p.value)
                .unwrap_or(f64::NAN),
            Self::Median => strict_median(series),
        };
        Number::new(series.labels.clone(), Some(value))
    }
}

fn strict_fold(series: &Series, init: f64, f: impl Fn(f64, f64) -> f64) -> f64 {
    let mut acc = init;
    for point in &series.points {
        match point.value {
            Some(v) if !v.is_nan() => acc = f(acc, v),
            _ => return f64::NAN,
        }
    }
    acc
}

fn strict_extreme(series: &Series, better: impl Fn(f64, f64) -> bool) -> f64 {
    if series.points.is_empty() {
        return f64::NAN;
    }
    let mut acc: Option<f64> = None;
    for point in &series.points {
        match point.value {
            Some(v) if !v.is_nan() => {
                acc = Some(match acc {
                    Some(cur) if !better(cur, v) => cur,
                    _ => v,
                });
            }
            _ => return f64::NAN,
        }
    }
    acc.unwrap_or(f64::NAN)
}

fn strict_median(series: &Series) -> f64 {
    if series.points.is_empty() {
        return f64::NAN;
    }
    let mut values = Vec::with_capacity(series.points.len());
    for point in &series.points {
        match point.value {
            Some(v) if !v.is_nan() => values.push(v),
            _ => return f64::NAN,
        }
    }
    median_of(&mut values).unwrap_or(f64::NAN)
}

fn median_of(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Pre-reduction filter applied point by point. "Non-number" means a
/// point that is null, NaN, or infinite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReduceMapper {
    DropNonNumber,
    ReplaceNonNumberWithValue(f64),
}

impl ReduceMapper {
    #[must_use]
    pub fn apply(self, series: &Series) -> Series {
        let mut out = series.clone();
        match self {
            Self::DropNonNumber => {
                out.points.retain(|p| is_number_point(p));
            }
            Self::ReplaceNonNumberWithValue(replacement) => {
                for point in &mut out.points {
                    if !is_number_point(point) {
                        point.value = Some(replacement);
                    }
                }
            }
        }
        out
    }
}

fn is_number_point(point: &Point) -> bool {
    matches!(point.value, Some(v) if v.is_finite())
}

// ── Classic reducers ────────────────────────────────────────────────────

/// Reducers used by classic conditions. Unlike the strict family these
/// skip null and NaN points, and the output may itself be absent (None)
/// when no valid point exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassicReducer {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Last,
    Median,
    Diff,
    DiffAbs,
    PercentDiff,
    PercentDiffAbs,
    CountNonNull,
}

impl ClassicReducer {
    pub fn from_name(name: &str) -> Result<Self, ReduceError> {
        match name {
            "sum" => Ok(Self::Sum),
            "avg" => Ok(Self::Avg),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "count" => Ok(Self::Count),
            "last" => Ok(Self::Last),
            "median" => Ok(Self::Median),
            "diff" => Ok(Self::Diff),
            "diff_abs" => Ok(Self::DiffAbs),
            "percent_diff" => Ok(Self::PercentDiff),
            "percent_diff_abs" => Ok(Self::PercentDiffAbs),
            "count_non_null" | "count_not_null" => Ok(Self::CountNonNull),
            other => Err(ReduceError::UnknownReducer(other.to_owned())),
        }
    }

    #[must_use]
    pub fn reduce(self, series: &Series) -> Option<f64> {
        let valid: Vec<f64> = series
            .points
            .iter()
            .filter_map(|p| p.value)
            .filter(|v| !v.is_nan())
            .collect();

        match self {
            Self::Sum => Some(valid.iter().sum()),
            Self::Avg => {
                if valid.is_empty() {
                    None
                } else {
                    Some(valid.iter().sum::<f64>() / valid.len() as f64)
                }
            }
            Self::Min => Some(if valid.is_empty() {
                0.0
            } else {
                valid.iter().copied().fold(f64::INFINITY, f64::min)
            }),
            Self::Max => Some(if valid.is_empty() {
                0.0
            } else {
                valid.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            }),
            Self::Count => Some(series.points.len() as f64),
            Self::Last => series.points.last().and_then(|p| p.value),
            Self::Median => {
                let mut values = valid;
                median_of(&mut values)
            }
            Self::Diff => Some(diff_pair(series).map_or(0.0, |(newest, oldest)| newest - oldest)),
            Self::DiffAbs => Some(
                diff_pair(series).map_or(0.0, |(newest, oldest)| (newest - oldest).abs()),
            ),
            Self::PercentDiff => Some(diff_pair(series).map_or(0.0, |(newest, oldest)| {
                (newest - oldest) / oldest.abs() * 100.0
            })),
            Self::PercentDiffAbs => Some(diff_pair(series).map_or(0.0, |(newest, oldest)| {
                ((newest - oldest) / oldest * 100.0).abs()
            })),
            Self::CountNonNull => {
                Some(series.points.iter().filter(|p| p.value.is_some()).count() as f64)
            }
        }
    }
}

/// Newest and oldest valid values for the diff family. `None` with fewer
/// than two valid points, so the family stays at its zero default instead
/// of dividing through a degenerate pair.
fn diff_pair(series: &Series) -> Option<(f64, f64)> {
    let mut oldest: Option<f64> = None;
    let mut newest: Option<f64> = None;
    let mut valid = 0usize;
    for point in &series.points {
        if let Some(v) = point.value {
            if v.is_nan() {
                continue;
            }
            if oldest.is_none() {
                oldest = Some(v);
            }
            newest = Some(v);
            valid += 1;
        }
    }
    match (newest, oldest) {
        (Some(n), Some(o)) if valid >= 2 => Some((n, o)),
        _ => None,
    }
}

// ── Resampling ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Downsampler {
    Sum,
    Mean,
    Min,
    Max,
}

impl Downsampler {
    pub fn from_name(name: &str) -> Result<Self, ReduceError> {
        match name {
            "sum" => Ok(Self::Sum),
            "mean" | "avg" => Ok(Self::Mean),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(ReduceError::UnknownDownsampler(other.to_owned())),
        }
    }

    #[must_use]
    pub fn apply(self, values: &[Option<f64>]) -> Option<f64> {
        let present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
        if present.is_empty() {
            return None;
        }
        Some(match self {
            Self::Sum => present.iter().sum(),
            Self::Mean => present.iter().sum::<f64>() / present.len() as f64,
            Self::Min => present.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => present.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Upsampler {
    Pad,
    Backfilling,
    Fillna,
}

impl Upsampler {
    pub fn from_name(name: &str) -> Result<Self, ReduceError> {
        match name {
            "pad" => Ok(Self::Pad),
            "backfilling" => Ok(Self::Backfilling),
            "fillna" => Ok(Self::Fillna),
            other => Err(ReduceError::UnknownUpsampler(other.to_owned())),
        }
    }
}

/// Parse a pandas-style offset rule like "5T", "90S", or "1H". A missing
/// leading count means 1.
pub fn parse_rule(rule: &str) -> Result<Duration, ReduceError> {
    let split = rule.find(|c: char| !c.is_ascii_digit()).unwrap_or(rule.len());
    let (count_text, unit) = rule.split_at(split);
    let count: i64 = if count_text.is_empty() {
        1
    } else {
        count_text
            .parse()
            .map_err(|_| ReduceError::InvalidRule(rule.to_owned()))?
    };

    let unit_ns: i64 = match unit {
        "N" => 1,
        "U" | "us" => 1_000,
        "L" | "ms" => 1_000_000,
        "S" => 1_000_000_000,
        "T" | "min" => 60 * 1_000_000_000,
        "H" => 3_600 * 1_000_000_000,
        "D" => 86_400 * 1_000_000_000,
        "W" => 7 * 86_400 * 1_000_000_000,
        "MS" => 30 * 86_400 * 1_000_000_000,
        "Y" => 365 * 86_400 * 1_000_000_000,
        _ => return Err(ReduceError::InvalidRule(rule.to_owned())),
    };

    count
        .checked_mul(unit_ns)
        .filter(|ns| *ns > 0)
        .map(Duration::nanoseconds)
        .ok_or_else(|| ReduceError::InvalidRule(rule.to_owned()))
}

/// Re-bucket a series onto a regular grid over the evaluation window.
/// Buckets are stamped at `from + i * interval`; a bucket takes every
/// original point at or before its stamp that no earlier bucket consumed.
/// Empty buckets fall to the upsampler.
pub fn resample(
    series: &Series,
    rule: Duration,
    downsampler: Downsampler,
    upsampler: Upsampler,
    time_range: TimeRange,
) -> Result<Series, ReduceError> {
    // Callers may hand in any Duration, not just parse_rule output.
    let interval_ns = rule
        .num_nanoseconds()
        .filter(|ns| *ns > 0)
        .ok_or(ReduceError::RangeTooShort)?;
    let total_ns = time_range
        .duration()
        .num_nanoseconds()
        .ok_or(ReduceError::RangeTooShort)?;
    let buckets = total_ns / interval_ns;
    if buckets <= 0 {
        return Err(ReduceError::RangeTooShort);
    }

    let mut sorted = series.points.clone();
    sorted.sort_by_key(|p| p.time);

    let mut points = Vec::with_capacity(buckets as usize + 1);
    let mut idx = 0;
    let mut last_seen: Option<Option<f64>> = None;
    for i in 0..=buckets {
        let time = time_range.from + Duration::nanoseconds(interval_ns * i);

        let mut bucket = Vec::new();
        while idx < sorted.len() && sorted[idx].time <= time {
            bucket.push(sorted[idx].value);
            last_seen = Some(sorted[idx].value);
            idx += 1;
        }

        let value = if bucket.is_empty() {
            match upsampler {
                Upsampler::Pad => last_seen.flatten(),
                Upsampler::Backfilling => sorted.get(idx).and_then(|p| p.value),
                Upsampler::Fillna => None,
            }
        } else {
            downsampler.apply(&bucket)
        };

        points.push(Point { time, value });
    }

    Ok(Series::new(series.labels.clone(), points))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use ep_value::{Labels, Point, Series, TimeRange};

    use super::{
        ClassicReducer, Downsampler, ReduceError, ReduceMapper, StrictReducer, Upsampler,
        parse_rule, resample,
    };

    fn ts(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(seconds, 0).expect("timestamp")
    }

    fn series(values: &[(i64, Option<f64>)]) -> Series {
        Series::new(
            Labels::from_pairs([("host", "h1")]),
            values
                .iter()
                .map(|(t, v)| Point {
                    time: ts(*t),
                    value: *v,
                })
                .collect(),
        )
    }

    #[test]
    fn strict_reducers_over_clean_input() {
        let s = series(&[(1, Some(1.0)), (2, Some(2.0)), (3, Some(6.0))]);
        assert_eq!(StrictReducer::Sum.reduce(&s).value, Some(9.0));
        assert_eq!(StrictReducer::Mean.reduce(&s).value, Some(3.0));
        assert_eq!(StrictReducer::Min.reduce(&s).value, Some(1.0));
        assert_eq!(StrictReducer::Max.reduce(&s).value, Some(6.0));
        assert_eq!(StrictReducer::Count.reduce(&s).value, Some(3.0));
        assert_eq!(StrictReducer::Last.reduce(&s).value, Some(6.0));
        assert_eq!(StrictReducer::Median.reduce(&s).value, Some(2.0));
    }

    #[test]
    fn strict_reducers_poisoned_by_null() {
        let s = series(&[(1, Some(1.0)), (2, None), (3, Some(6.0))]);
        for reducer in [
            StrictReducer::Sum,
            StrictReducer::Mean,
            StrictReducer::Min,
            StrictReducer::Max,
            StrictReducer::Median,
        ] {
            let out = reducer.reduce(&s).value.expect("always present");
            assert!(out.is_nan(), "{reducer:?} should be NaN");
        }
        // Count ignores validity; Last reports the final raw value.
        assert_eq!(StrictReducer::Count.reduce(&s).value, Some(3.0));
        assert_eq!(StrictReducer::Last.reduce(&s).value, Some(6.0));
    }

    #[test]
    fn strict_reducers_over_empty_series() {
        let s = series(&[]);
        assert_eq!(StrictReducer::Sum.reduce(&s).value, Some(0.0));
        assert_eq!(StrictReducer::Count.reduce(&s).value, Some(0.0));
        for reducer in [
            StrictReducer::Mean,
            StrictReducer::Min,
            StrictReducer::Max,
            StrictReducer::Last,
            StrictReducer::Median,
        ] {
            let out = reducer.reduce(&s).value.expect("always present");
            assert!(out.is_nan(), "{reducer:?} should be NaN on empty input");
        }
    }

    #[test]
    fn reduce_preserves_labels() {
        let s = series(&[(1, Some(4.0))]);
        assert_eq!(StrictReducer::Sum.reduce(&s).labels, s.labels);
    }

    #[test]
    fn mapper_drop_non_number() {
        let s = series(&[
            (1, Some(1.0)),
            (2, None),
            (3, Some(f64::NAN)),
            (4, Some(f64::INFINITY)),
            (5, Some(5.0)),
        ]);
        let filtered = ReduceMapper::DropNonNumber.apply(&s);
        assert_eq!(filtered.points.len(), 2);
        assert_eq!(StrictReducer::Sum.reduce(&filtered).value, Some(6.0));
    }

    #[test]
    fn mapper_replace_non_number() {
        let s = series(&[(1, Some(1.0)), (2, None), (3, Some(f64::NAN))]);
        let replaced = ReduceMapper::ReplaceNonNumberWithValue(0.0).apply(&s);
        assert_eq!(replaced.points.len(), 3);
        assert_eq!(StrictReducer::Sum.reduce(&replaced).value, Some(1.0));
    }

    #[test]
    fn classic_reducers_skip_invalid_points() {
        let s = series(&[(1, Some(1.0)), (2, None), (3, Some(f64::NAN)), (4, Some(5.0))]);
        assert_eq!(ClassicReducer::Sum.reduce(&s), Some(6.0));
        assert_eq!(ClassicReducer::Avg.reduce(&s), Some(3.0));
        assert_eq!(ClassicReducer::Min.reduce(&s), Some(1.0));
        assert_eq!(ClassicReducer::Max.reduce(&s), Some(5.0));
        assert_eq!(ClassicReducer::Count.reduce(&s), Some(4.0));
        assert_eq!(ClassicReducer::CountNonNull.reduce(&s), Some(3.0));
    }

    #[test]
    fn classic_avg_of_no_valid_points_is_absent() {
        let s = series(&[(1, None), (2, Some(f64::NAN))]);
        assert_eq!(ClassicReducer::Avg.reduce(&s), None);
        assert_eq!(ClassicReducer::Median.reduce(&s), None);
        assert_eq!(ClassicReducer::Sum.reduce(&s), Some(0.0));
        assert_eq!(ClassicReducer::Min.reduce(&s), Some(0.0));
        assert_eq!(ClassicReducer::Max.reduce(&s), Some(0.0));
    }

    #[test]
    fn classic_last_reports_raw_final_value() {
        assert_eq!(ClassicReducer::Last.reduce(&series(&[(1, Some(2.0)), (2, None)])), None);
        assert_eq!(ClassicReducer::Last.reduce(&series(&[])), None);
    }

    #[test]
    fn classic_diff_family() {
        let s = series(&[(1, Some(10.0)), (2, None), (3, Some(4.0))]);
        assert_eq!(ClassicReducer::Diff.reduce(&s), Some(-6.0));
        assert_eq!(ClassicReducer::DiffAbs.reduce(&s), Some(6.0));
        assert_eq!(ClassicReducer::PercentDiff.reduce(&s), Some(-60.0));
        assert_eq!(ClassicReducer::PercentDiffAbs.reduce(&s), Some(60.0));

        let empty = series(&[(1, None)]);
        assert_eq!(ClassicReducer::Diff.reduce(&empty), Some(0.0));
    }

    #[test]
    fn classic_diff_family_defaults_to_zero_below_two_valid_points() {
        let all_null = series(&[(1, None), (2, Some(f64::NAN))]);
        for reducer in [
            ClassicReducer::Diff,
            ClassicReducer::DiffAbs,
            ClassicReducer::PercentDiff,
            ClassicReducer::PercentDiffAbs,
        ] {
            assert_eq!(reducer.reduce(&all_null), Some(0.0), "{reducer:?}");
        }

        // A lone zero must not turn into 0/0.
        let lone_zero = series(&[(1, Some(0.0))]);
        assert_eq!(ClassicReducer::PercentDiff.reduce(&lone_zero), Some(0.0));
        assert_eq!(ClassicReducer::PercentDiffAbs.reduce(&lone_zero), Some(0.0));
    }

    #[test]
    fn classic_median_even_count_averages_middle_pair() {
        let s = series(&[(1, Some(1.0)), (2, Some(3.0)), (3, Some(5.0)), (4, Some(7.0))]);
        assert_eq!(ClassicReducer::Median.reduce(&s), Some(4.0));
    }

    #[test]
    fn rule_parsing_covers_units_and_counts() {
        assert_eq!(parse_rule("S").expect("parse").num_seconds(), 1);
        assert_eq!(parse_rule("90S").expect("parse").num_seconds(), 90);
        assert_eq!(parse_rule("5T").expect("parse").num_seconds(), 300);
        assert_eq!(parse_rule("2min").expect("parse").num_seconds(), 120);
        assert_eq!(parse_rule("1H").expect("parse").num_seconds(), 3600);
        assert_eq!(parse_rule("1D").expect("parse").num_seconds(), 86_400);
        assert_eq!(parse_rule("MS").expect("parse").num_days(), 30);
        assert_eq!(parse_rule("Y").expect("parse").num_days(), 365);
        assert_eq!(parse_rule("250ms").expect("parse").num_milliseconds(), 250);
        assert!(matches!(
            parse_rule("5X"),
            Err(ReduceError::InvalidRule(_))
        ));
        assert!(matches!(parse_rule(""), Err(ReduceError::InvalidRule(_))));
    }

    #[test]
    fn resample_rejects_rule_longer_than_window() {
        let range = TimeRange {
            from: ts(0),
            to: ts(30),
        };
        let err = resample(
            &series(&[(5, Some(1.0))]),
            parse_rule("1T").expect("parse"),
            Downsampler::Mean,
            Upsampler::Fillna,
            range,
        )
        .expect_err("must fail");
        assert_eq!(err, ReduceError::RangeTooShort);
    }

    #[test]
    fn resample_rejects_non_positive_rule() {
        let range = TimeRange {
            from: ts(0),
            to: ts(30),
        };
        for rule in [Duration::zero(), Duration::seconds(-10)] {
            let err = resample(
                &series(&[(5, Some(1.0))]),
                rule,
                Downsampler::Mean,
                Upsampler::Fillna,
                range,
            )
            .expect_err("must fail");
            assert_eq!(err, ReduceError::RangeTooShort);
        }
    }

    #[test]
    fn resample_downsamples_into_buckets() {
        let range = TimeRange {
            from: ts(0),
            to: ts(20),
        };
        let s = series(&[(2, Some(1.0)), (8, Some(3.0)), (12, Some(10.0))]);
        let out = resample(
            &s,
            parse_rule("10S").expect("parse"),
            Downsampler::Sum,
            Upsampler::Fillna,
            range,
        )
        .expect("resample");

        assert_eq!(out.points.len(), 3);
        assert_eq!(out.points[0].time, ts(0));
        assert_eq!(out.points[0].value, None);
        assert_eq!(out.points[1].value, Some(4.0));
        assert_eq!(out.points[2].value, Some(10.0));
        assert_eq!(out.labels, s.labels);
    }

    #[test]
    fn resample_pad_carries_last_observation_forward() {
        let range = TimeRange {
            from: ts(0),
            to: ts(40),
        };
        let s = series(&[(5, Some(2.0))]);
        let out = resample(
            &s,
            parse_rule("10S").expect("parse"),
            Downsampler::Mean,
            Upsampler::Pad,
            range,
        )
        .expect("resample");

        let values: Vec<Option<f64>> = out.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![None, Some(2.0), Some(2.0), Some(2.0), Some(2.0)]);
    }

    #[test]
    fn resample_backfilling_pulls_next_observation() {
        let range = TimeRange {
            from: ts(0),
            to: ts(30),
        };
        let s = series(&[(5, Some(9.0))]);
        let out = resample(
            &s,
            parse_rule("10S").expect("parse"),
            Downsampler::Mean,
            Upsampler::Backfilling,
            range,
        )
        .expect("resample");

        // t=0 backfills from the upcoming point; once the point is
        // consumed there is nothing ahead, so later buckets stay null.
        let values: Vec<Option<f64>> = out.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![Some(9.0), Some(9.0), None, None]);
    }

    #[test]
    fn resample_all_null_bucket_stays_null() {
        let range = TimeRange {
            from: ts(0),
            to: ts(10),
        };
        let s = series(&[(5, None), (7, None)]);
        let out = resample(
            &s,
            parse_rule("10S").expect("parse"),
            Downsampler::Sum,
            Upsampler::Fillna,
            range,
        )
        .expect("resample");
        assert_eq!(out.points[1].value, None);
    }
}
