use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use fnrun_common::{FnrunError, FunctionId, Metric};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

pub const DEFAULT_METRIC_LIMIT: usize = 100;

/// Selection over a function's metric history. Results are newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricFilter {
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_METRIC_LIMIT
}

impl Default for MetricFilter {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            success: None,
            skip: 0,
            limit: DEFAULT_METRIC_LIMIT,
        }
    }
}

impl MetricFilter {
    /// Window covering the last `days` days, unbounded in count. A window
    /// reaching past the earliest representable time covers all history.
    pub fn last_days(days: u32) -> Self {
        let since = Duration::try_days(i64::from(days))
            .and_then(|window| Utc::now().checked_sub_signed(window));
        Self {
            since,
            limit: usize::MAX,
            ..Default::default()
        }
    }

    pub fn unbounded() -> Self {
        Self {
            limit: usize::MAX,
            ..Default::default()
        }
    }

    pub fn matches(&self, metric: &Metric) -> bool {
        if let Some(since) = self.since {
            if metric.started_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if metric.started_at > until {
                return false;
            }
        }
        if let Some(success) = self.success {
            if metric.success != success {
                return false;
            }
        }
        true
    }

    /// Filters, orders newest first and paginates rows already scoped to one function.
    pub fn apply<'a, I>(&self, metrics: I) -> Vec<Metric>
    where
        I: IntoIterator<Item = &'a Metric>,
    {
        let mut selected: Vec<Metric> = metrics
            .into_iter()
            .filter(|m| self.matches(m))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        selected.into_iter().skip(self.skip).take(self.limit).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub function_id: FunctionId,
    pub function_name: String,
    pub total_executions: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
}

impl MetricSummary {
    pub fn from_metrics(function_id: FunctionId, function_name: &str, metrics: &[Metric]) -> Self {
        let mut summary = Self {
            function_id,
            function_name: function_name.to_string(),
            total_executions: metrics.len() as u64,
            success_count: 0,
            error_count: 0,
            avg_duration_ms: 0.0,
            min_duration_ms: 0.0,
            max_duration_ms: 0.0,
        };
        if metrics.is_empty() {
            return summary;
        }

        let mut total = 0.0;
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        for metric in metrics {
            if metric.success {
                summary.success_count += 1;
            } else {
                summary.error_count += 1;
            }
            total += metric.duration_ms;
            min = min.min(metric.duration_ms);
            max = max.max(metric.duration_ms);
        }
        summary.avg_duration_ms = total / metrics.len() as f64;
        summary.min_duration_ms = min;
        summary.max_duration_ms = max;
        summary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Hourly,
    Daily,
    Weekly,
}

impl Period {
    /// Start of the bucket containing `ts`. Weeks start on Monday.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let date = ts.date_naive();
        let naive = match self {
            Period::Hourly => date.and_hms_opt(ts.hour(), 0, 0),
            Period::Daily => date.and_hms_opt(0, 0, 0),
            Period::Weekly => {
                let back = ts.weekday().num_days_from_monday() as i64;
                (date - Duration::days(back)).and_hms_opt(0, 0, 0)
            }
        };
        naive
            .map(|n| Utc.from_utc_datetime(&n))
            .unwrap_or(ts)
    }
}

impl FromStr for Period {
    type Err = FnrunError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Period::Hourly),
            "daily" => Ok(Period::Daily),
            "weekly" => Ok(Period::Weekly),
            other => Err(FnrunError::Config(format!(
                "period must be hourly, daily, or weekly (got {other})"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBucket {
    pub period_start: DateTime<Utc>,
    pub invocations: u64,
    pub errors: u64,
    pub avg_duration_ms: f64,
}

/// Aggregates metric rows into time buckets, oldest first.
pub fn timeseries(metrics: &[Metric], period: Period) -> Vec<TimeBucket> {
    let mut buckets: BTreeMap<DateTime<Utc>, (u64, u64, f64)> = BTreeMap::new();
    for metric in metrics {
        let entry = buckets
            .entry(period.bucket_start(metric.started_at))
            .or_insert((0, 0, 0.0));
        entry.0 += 1;
        if !metric.success {
            entry.1 += 1;
        }
        entry.2 += metric.duration_ms;
    }

    buckets
        .into_iter()
        .map(|(period_start, (invocations, errors, total_ms))| TimeBucket {
            period_start,
            invocations,
            errors,
            avg_duration_ms: total_ms / invocations as f64,
        })
        .collect()
}
