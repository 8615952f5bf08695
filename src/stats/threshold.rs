use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::{tag_key, StatsAggregator};
use crate::utils::parse_duration_str;

#[derive(Debug, Error, PartialEq)]
pub enum ThresholdError {
    #[error("unknown metric '{0}'")]
    UnknownMetric(String),
    #[error("invalid metric selector '{0}', expected name or name{{tag:value}}")]
    InvalidSelector(String),
    #[error("invalid threshold expression '{0}', expected e.g. 'p(95)<500' or 'rate<0.01'")]
    InvalidExpression(String),
    #[error("'{aggregation}' cannot be applied to metric '{metric}'")]
    UnsupportedAggregation { metric: String, aggregation: String },
    #[error("invalid abort delay '{0}'")]
    InvalidDelay(String),
}

/// One threshold as written in the config: either a bare expression string
/// (evaluated at end of run) or an object with abort settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Simple(String),
    Detailed(DetailedThreshold),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DetailedThreshold {
    pub threshold: String,
    #[serde(default, alias = "abortOnFail")]
    pub abort_on_fail: bool,
    /// Grace period between the first breach and the abort, e.g. "10s".
    #[serde(
        default,
        alias = "delayAbortEval",
        alias = "delayAbortFail",
        alias = "delay_abort_fail"
    )]
    pub delay_abort_eval: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    HttpReqDuration,
    HttpReqFailed,
    HttpReqs,
    Checks,
    Iterations,
    IterationDuration,
}

impl MetricKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "http_req_duration" => Some(MetricKind::HttpReqDuration),
            "http_req_failed" => Some(MetricKind::HttpReqFailed),
            "http_reqs" => Some(MetricKind::HttpReqs),
            "checks" => Some(MetricKind::Checks),
            "iterations" => Some(MetricKind::Iterations),
            "iteration_duration" => Some(MetricKind::IterationDuration),
            _ => None,
        }
    }

    fn accepts(&self, aggregation: Aggregation) -> bool {
        match self {
            MetricKind::HttpReqDuration | MetricKind::IterationDuration => {
                aggregation != Aggregation::Rate
            }
            MetricKind::HttpReqFailed | MetricKind::Checks => {
                matches!(aggregation, Aggregation::Rate | Aggregation::Count)
            }
            MetricKind::HttpReqs | MetricKind::Iterations => aggregation == Aggregation::Count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSelector {
    pub kind: MetricKind,
    /// `(tag, value)` narrowing, as in `http_req_duration{scenario:load}`.
    pub tag: Option<(String, String)>,
}

impl MetricSelector {
    pub fn parse(raw: &str) -> Result<Self, ThresholdError> {
        static SELECTOR: OnceLock<Regex> = OnceLock::new();
        let re = SELECTOR.get_or_init(|| {
            Regex::new(r"^\s*([a-z_]+)\s*(?:\{\s*([^:{}]+?)\s*:\s*([^{}]*?)\s*\})?\s*$")
                .expect("selector pattern compiles")
        });
        let caps = re
            .captures(raw)
            .ok_or_else(|| ThresholdError::InvalidSelector(raw.to_string()))?;
        let kind = MetricKind::from_name(&caps[1])
            .ok_or_else(|| ThresholdError::UnknownMetric(caps[1].to_string()))?;
        let tag = match (caps.get(2), caps.get(3)) {
            (Some(k), Some(v)) => Some((k.as_str().to_string(), v.as_str().to_string())),
            _ => None,
        };
        Ok(Self { kind, tag })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    /// Percentile in (0, 100].
    Percentile(f64),
    Avg,
    Min,
    Max,
    Med,
    Rate,
    Count,
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Percentile(p) => write!(f, "p({})", p),
            Aggregation::Avg => write!(f, "avg"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Med => write!(f, "med"),
            Aggregation::Rate => write!(f, "rate"),
            Aggregation::Count => write!(f, "count"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "<" => Some(Comparison::Lt),
            "<=" => Some(Comparison::Le),
            ">" => Some(Comparison::Gt),
            ">=" => Some(Comparison::Ge),
            "==" => Some(Comparison::Eq),
            "!=" => Some(Comparison::Ne),
            _ => None,
        }
    }

    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => (observed - bound).abs() < 1e-9,
            Comparison::Ne => (observed - bound).abs() >= 1e-9,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    /// Expression as written, used in reports.
    pub expression: String,
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
    pub abort_on_fail: bool,
    pub abort_grace: Duration,
}

impl ThresholdRule {
    pub fn parse(expression: &str) -> Result<Self, ThresholdError> {
        static EXPRESSION: OnceLock<Regex> = OnceLock::new();
        let re = EXPRESSION.get_or_init(|| {
            Regex::new(
                r"^\s*(?:p\(\s*(\d+(?:\.\d+)?)\s*\)|p(\d+(?:\.\d+)?)|(avg|min|max|med|rate|count))\s*(<=|>=|==|!=|<|>)\s*(-?\d+(?:\.\d+)?)\s*$",
            )
            .expect("threshold pattern compiles")
        });
        let invalid = || ThresholdError::InvalidExpression(expression.to_string());
        let caps = re.captures(expression).ok_or_else(invalid)?;

        let aggregation = match (caps.get(1).or(caps.get(2)), caps.get(3)) {
            (Some(p), _) => {
                let p: f64 = p.as_str().parse().map_err(|_| invalid())?;
                if p <= 0.0 || p > 100.0 {
                    return Err(invalid());
                }
                Aggregation::Percentile(p)
            }
            (None, Some(name)) => match name.as_str() {
                "avg" => Aggregation::Avg,
                "min" => Aggregation::Min,
                "max" => Aggregation::Max,
                "med" => Aggregation::Med,
                "rate" => Aggregation::Rate,
                _ => Aggregation::Count,
            },
            (None, None) => return Err(invalid()),
        };
        let comparison = Comparison::parse(&caps[4]).ok_or_else(invalid)?;
        let bound: f64 = caps[5].parse().map_err(|_| invalid())?;

        Ok(Self {
            expression: expression.trim().to_string(),
            aggregation,
            comparison,
            bound,
            abort_on_fail: false,
            abort_grace: Duration::ZERO,
        })
    }

    fn from_entry(entry: &ThresholdEntry) -> Result<Self, ThresholdError> {
        match entry {
            ThresholdEntry::Simple(expression) => Self::parse(expression),
            ThresholdEntry::Detailed(detail) => {
                let mut rule = Self::parse(&detail.threshold)?;
                rule.abort_on_fail = detail.abort_on_fail;
                if let Some(delay) = &detail.delay_abort_eval {
                    rule.abort_grace = parse_duration_str(delay)
                        .ok_or_else(|| ThresholdError::InvalidDelay(delay.clone()))?;
                }
                Ok(rule)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSpec {
    /// Selector as written, e.g. `http_req_duration{scenario:load}`.
    pub metric: String,
    pub selector: MetricSelector,
    pub rules: Vec<ThresholdRule>,
}

impl ThresholdSpec {
    pub fn parse(metric: &str, entries: &[ThresholdEntry]) -> Result<Self, ThresholdError> {
        let selector = MetricSelector::parse(metric)?;
        let rules = entries
            .iter()
            .map(ThresholdRule::from_entry)
            .collect::<Result<Vec<_>, _>>()?;
        for rule in &rules {
            if !selector.kind.accepts(rule.aggregation) {
                return Err(ThresholdError::UnsupportedAggregation {
                    metric: metric.to_string(),
                    aggregation: rule.aggregation.to_string(),
                });
            }
        }
        Ok(Self {
            metric: metric.trim().to_string(),
            selector,
            rules,
        })
    }
}

/// Parse a whole threshold table. Specs come back sorted by metric so reports are stable.
pub fn parse_thresholds(
    table: &HashMap<String, Vec<ThresholdEntry>>,
) -> Result<Vec<ThresholdSpec>, ThresholdError> {
    let mut specs = table
        .iter()
        .map(|(metric, entries)| ThresholdSpec::parse(metric, entries))
        .collect::<Result<Vec<_>, _>>()?;
    specs.sort_by(|a, b| a.metric.cmp(&b.metric));
    Ok(specs)
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Current value of `aggregation` over the selected metric, or `None` while
/// the metric has no samples.
pub fn observe(
    agg: &StatsAggregator,
    selector: &MetricSelector,
    aggregation: Aggregation,
) -> Option<f64> {
    let key = selector.tag.as_ref().map(|(k, v)| tag_key(k, v));

    let trend = match selector.kind {
        MetricKind::HttpReqDuration | MetricKind::HttpReqs => match &key {
            Some(key) => agg.tagged.get(key).map(|t| &t.trend),
            None => Some(&agg.latency),
        },
        MetricKind::IterationDuration | MetricKind::Iterations => match &key {
            Some(key) => agg.tagged_iterations.get(key),
            None => Some(&agg.iterations),
        },
        MetricKind::HttpReqFailed => {
            let (failed, total) = match &key {
                Some(key) => agg
                    .tagged
                    .get(key)
                    .map(|t| (t.failed, t.trend.count as usize))?,
                None => (agg.failed_requests, agg.total_requests),
            };
            if total == 0 {
                return None;
            }
            return Some(match aggregation {
                Aggregation::Count => failed as f64,
                _ => ratio(failed, total),
            });
        }
        MetricKind::Checks => {
            let (total, passes) = match &key {
                Some(key) => *agg.tagged_checks.get(key)?,
                None => agg.check_totals(),
            };
            if total == 0 {
                return None;
            }
            return Some(match aggregation {
                Aggregation::Count => passes as f64,
                _ => ratio(passes, total),
            });
        }
    }?;

    if trend.count == 0 {
        return None;
    }
    Some(match aggregation {
        Aggregation::Percentile(p) => trend.percentile_ms(p / 100.0),
        Aggregation::Med => trend.percentile_ms(0.5),
        Aggregation::Avg => trend.avg_ms(),
        Aggregation::Min => trend.min_ms(),
        Aggregation::Max => trend.max_ms(),
        Aggregation::Count => trend.count as f64,
        Aggregation::Rate => 0.0,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdVerdict {
    pub metric: String,
    pub expression: String,
    pub observed: f64,
    pub passed: bool,
    pub abort_on_fail: bool,
}

/// End-of-run verdict for every rule. Metrics without samples observe as 0.
pub fn evaluate(specs: &[ThresholdSpec], agg: &StatsAggregator) -> Vec<ThresholdVerdict> {
    specs
        .iter()
        .flat_map(|spec| {
            spec.rules.iter().map(move |rule| {
                let observed = observe(agg, &spec.selector, rule.aggregation).unwrap_or(0.0);
                ThresholdVerdict {
                    metric: spec.metric.clone(),
                    expression: rule.expression.clone(),
                    observed,
                    passed: rule.comparison.holds(observed, rule.bound),
                    abort_on_fail: rule.abort_on_fail,
                }
            })
        })
        .collect()
}

/// Mid-run evaluation of abort-on-fail rules.
///
/// The first breach of a rule at time `T` arms an abort for `T + grace`. Once
/// armed, the abort fires when its deadline passes even if the metric has
/// recovered in the meantime. With several breached rules the earliest
/// deadline wins.
pub struct ThresholdWatcher {
    specs: Vec<ThresholdSpec>,
    deadline: Option<(Instant, String)>,
}

impl ThresholdWatcher {
    pub fn new(specs: &[ThresholdSpec]) -> Self {
        let specs = specs
            .iter()
            .filter_map(|spec| {
                let rules: Vec<_> = spec
                    .rules
                    .iter()
                    .filter(|r| r.abort_on_fail)
                    .cloned()
                    .collect();
                (!rules.is_empty()).then(|| ThresholdSpec {
                    rules,
                    ..spec.clone()
                })
            })
            .collect();
        Self {
            specs,
            deadline: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn armed_deadline(&self) -> Option<Instant> {
        self.deadline.as_ref().map(|(at, _)| *at)
    }

    /// Returns the reason once the abort should take effect.
    pub fn poll(&mut self, agg: &StatsAggregator, now: Instant) -> Option<String> {
        for spec in &self.specs {
            for rule in &spec.rules {
                let Some(observed) = observe(agg, &spec.selector, rule.aggregation) else {
                    continue;
                };
                if rule.comparison.holds(observed, rule.bound) {
                    continue;
                }
                let candidate = now + rule.abort_grace;
                if self.deadline.as_ref().map_or(true, |(at, _)| candidate < *at) {
                    tracing::warn!(
                        metric = %spec.metric,
                        threshold = %rule.expression,
                        observed,
                        grace = ?rule.abort_grace,
                        "threshold breached, abort armed"
                    );
                    self.deadline = Some((
                        candidate,
                        format!(
                            "threshold '{}' on {} breached (observed {:.4})",
                            rule.expression, spec.metric, observed
                        ),
                    ));
                }
            }
        }

        match &self.deadline {
            Some((at, reason)) if now >= *at => Some(reason.clone()),
            _ => None,
        }
    }
}
