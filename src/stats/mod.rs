use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod csv;
pub mod threshold;

use threshold::ThresholdVerdict;

pub type SharedAggregator = Arc<RwLock<StatsAggregator>>;

/// Highest latency the histograms track: one hour, in microseconds.
const MAX_TRACKABLE_MICROS: u64 = 60 * 60 * 1000 * 1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct RequestTimings {
    pub waiting: Duration,
    pub receiving: Duration,
    pub duration: Duration,
    pub request_size: usize,
    pub response_size: usize,
}

/// Append-only events sent by workers. Nothing ever retracts one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Metric {
    Request {
        name: String,
        timings: RequestTimings,
        status: u16,
        error: Option<String>,
        tags: HashMap<String, String>,
    },
    Check {
        name: String,
        success: bool,
        tags: HashMap<String, String>,
    },
    Iteration {
        duration: Duration,
        tags: HashMap<String, String>,
    },
}

/// A request counts against `http_req_failed` when it errored or got a 4xx/5xx.
pub fn is_failed_request(status: u16, error: Option<&str>) -> bool {
    error.is_some() || status == 0 || status >= 400
}

/// Latency distribution with exact count/sum/min/max next to the histogram.
pub struct Trend {
    pub count: u64,
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Duration,
    pub histogram: Histogram<u64>,
}

impl Trend {
    pub fn new() -> Self {
        Self {
            count: 0,
            total: Duration::ZERO,
            min: None,
            max: Duration::ZERO,
            histogram: Histogram::<u64>::new_with_bounds(1, MAX_TRACKABLE_MICROS, 3)
                .expect("static histogram bounds are valid"),
        }
    }

    pub fn record(&mut self, d: Duration) {
        self.count += 1;
        self.total += d;
        if self.min.map_or(true, |min| d < min) {
            self.min = Some(d);
        }
        if d > self.max {
            self.max = d;
        }
        let micros = (d.as_micros() as u64).clamp(1, MAX_TRACKABLE_MICROS);
        let _ = self.histogram.record(micros);
    }

    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total.as_secs_f64() * 1000.0 / self.count as f64
        }
    }

    pub fn min_ms(&self) -> f64 {
        self.min.unwrap_or_default().as_secs_f64() * 1000.0
    }

    pub fn max_ms(&self) -> f64 {
        self.max.as_secs_f64() * 1000.0
    }

    /// `quantile` in 0..=1.
    pub fn percentile_ms(&self, quantile: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.histogram.value_at_quantile(quantile) as f64 / 1000.0
    }
}

impl Default for Trend {
    fn default() -> Self {
        Self::new()
    }
}

/// Per request name (and tag set) statistics.
#[derive(Default)]
pub struct RequestStats {
    pub trend: Trend,
    pub error_count: usize,
    pub total_waiting: Duration,
    pub total_receiving: Duration,
    pub total_response_size: u64,
    pub total_request_size: u64,
}

/// Request counters for one `tag:value` pair, used by tagged thresholds.
#[derive(Default)]
pub struct TaggedStats {
    pub trend: Trend,
    pub failed: usize,
}

pub struct StatsAggregator {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub latency: Trend,
    pub status_codes: HashMap<u16, usize>,
    pub errors: HashMap<String, usize>,
    /// (total, passes) per check name.
    pub checks: HashMap<String, (usize, usize)>,
    pub requests: HashMap<String, RequestStats>,
    pub tagged: HashMap<String, TaggedStats>,
    /// (total, passes) per `tag:value`.
    pub tagged_checks: HashMap<String, (usize, usize)>,
    pub iterations: Trend,
    pub tagged_iterations: HashMap<String, Trend>,
    pub total_data_sent: u64,
    pub total_data_received: u64,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// `name{k:v,...}` with tags sorted by key.
fn grouped_name(name: &str, tags: &HashMap<String, String>) -> String {
    let mut full_name = name.to_string();
    if !tags.is_empty() {
        let mut sorted_tags: Vec<_> = tags.iter().collect();
        sorted_tags.sort_by_key(|a| a.0);
        full_name.push('{');
        for (i, (k, v)) in sorted_tags.iter().enumerate() {
            if i > 0 {
                full_name.push(',');
            }
            full_name.push_str(k);
            full_name.push(':');
            full_name.push_str(v);
        }
        full_name.push('}');
    }
    full_name
}

pub fn tag_key(key: &str, value: &str) -> String {
    format!("{}:{}", key, value)
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            total_requests: 0,
            failed_requests: 0,
            latency: Trend::new(),
            status_codes: HashMap::new(),
            errors: HashMap::new(),
            checks: HashMap::new(),
            requests: HashMap::new(),
            tagged: HashMap::new(),
            tagged_checks: HashMap::new(),
            iterations: Trend::new(),
            tagged_iterations: HashMap::new(),
            total_data_sent: 0,
            total_data_received: 0,
        }
    }

    pub fn shared() -> SharedAggregator {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn add(&mut self, metric: Metric) {
        match metric {
            Metric::Request {
                name,
                timings,
                status,
                error,
                tags,
            } => {
                let failed = is_failed_request(status, error.as_deref());
                self.total_requests += 1;
                if failed {
                    self.failed_requests += 1;
                }
                self.latency.record(timings.duration);
                *self.status_codes.entry(status).or_insert(0) += 1;
                if let Some(err) = &error {
                    *self.errors.entry(err.clone()).or_insert(0) += 1;
                }

                let index_keys = tags
                    .iter()
                    .map(|(k, v)| tag_key(k, v))
                    .chain(std::iter::once(tag_key("name", &name)));
                for key in index_keys {
                    let tagged = self.tagged.entry(key).or_default();
                    tagged.trend.record(timings.duration);
                    if failed {
                        tagged.failed += 1;
                    }
                }

                let req_stats = self.requests.entry(grouped_name(&name, &tags)).or_default();
                req_stats.trend.record(timings.duration);
                if failed {
                    req_stats.error_count += 1;
                }
                req_stats.total_waiting += timings.waiting;
                req_stats.total_receiving += timings.receiving;
                req_stats.total_response_size += timings.response_size as u64;
                req_stats.total_request_size += timings.request_size as u64;

                self.total_data_sent += timings.request_size as u64;
                self.total_data_received += timings.response_size as u64;
            }
            Metric::Check {
                name,
                success,
                tags,
            } => {
                let index_keys = tags
                    .iter()
                    .map(|(k, v)| tag_key(k, v))
                    .chain(std::iter::once(tag_key("check", &name)));
                for key in index_keys {
                    let entry = self.tagged_checks.entry(key).or_insert((0, 0));
                    entry.0 += 1;
                    if success {
                        entry.1 += 1;
                    }
                }
                let entry = self.checks.entry(name).or_insert((0, 0));
                entry.0 += 1;
                if success {
                    entry.1 += 1;
                }
            }
            Metric::Iteration { duration, tags } => {
                for (k, v) in &tags {
                    self.tagged_iterations
                        .entry(tag_key(k, v))
                        .or_default()
                        .record(duration);
                }
                self.iterations.record(duration);
            }
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }

    /// `(total, passes)` summed over every check name.
    pub fn check_totals(&self) -> (usize, usize) {
        self.checks
            .values()
            .fold((0, 0), |(t, p), (total, passes)| (t + total, p + passes))
    }

    pub fn check_pass_rate(&self) -> f64 {
        let (total, passes) = self.check_totals();
        if total == 0 {
            0.0
        } else {
            passes as f64 / total as f64
        }
    }

    pub fn to_report(&self) -> ReportStats {
        let mut grouped_requests = HashMap::new();
        for (name, stats) in &self.requests {
            let count = stats.trend.count.max(1) as f64;
            grouped_requests.insert(
                name.clone(),
                RequestReport {
                    total_requests: stats.trend.count as usize,
                    min_latency_ms: stats.trend.min_ms(),
                    max_latency_ms: stats.trend.max_ms(),
                    avg_latency_ms: stats.trend.avg_ms(),
                    p95_latency_ms: stats.trend.percentile_ms(0.95),
                    p99_latency_ms: stats.trend.percentile_ms(0.99),
                    error_count: stats.error_count,
                    avg_waiting_ms: stats.total_waiting.as_secs_f64() * 1000.0 / count,
                    avg_receiving_ms: stats.total_receiving.as_secs_f64() * 1000.0 / count,
                    avg_response_size: stats.total_response_size as f64 / count,
                },
            );
        }

        ReportStats {
            total_requests: self.total_requests,
            failed_requests: self.failed_requests,
            failure_rate: self.failure_rate(),
            avg_latency_ms: self.latency.avg_ms(),
            min_latency_ms: self.latency.min_ms(),
            max_latency_ms: self.latency.max_ms(),
            p50_latency_ms: self.latency.percentile_ms(0.5),
            p90_latency_ms: self.latency.percentile_ms(0.9),
            p95_latency_ms: self.latency.percentile_ms(0.95),
            p99_latency_ms: self.latency.percentile_ms(0.99),
            iterations: self.iterations.count,
            avg_iteration_ms: self.iterations.avg_ms(),
            status_codes: self.status_codes.clone(),
            errors: self.errors.clone(),
            checks: self.checks.clone(),
            check_pass_rate: self.check_pass_rate(),
            grouped_requests,
            total_data_sent: self.total_data_sent,
            total_data_received: self.total_data_received,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestReport {
    pub total_requests: usize,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub error_count: usize,
    pub avg_waiting_ms: f64,
    pub avg_receiving_ms: f64,
    pub avg_response_size: f64,
}

/// Worker accounting for one scenario.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ScenarioReport {
    pub name: String,
    pub peak_workers: usize,
    pub workers_started: u64,
    /// Workers still busy when the graceful stop period ran out.
    pub aborted_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportStats {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub failure_rate: f64,
    pub run_duration_ms: u128,
    pub rps: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p90_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub iterations: u64,
    pub avg_iteration_ms: f64,
    pub status_codes: HashMap<u16, usize>,
    pub errors: HashMap<String, usize>,
    pub checks: HashMap<String, (usize, usize)>,
    pub check_pass_rate: f64,
    pub grouped_requests: HashMap<String, RequestReport>,
    pub total_data_sent: u64,
    pub total_data_received: u64,
    pub thresholds: Vec<ThresholdVerdict>,
    /// Set when an abort-on-fail threshold stopped the run early.
    pub aborted: bool,
    pub abort_reason: Option<String>,
    pub scenarios: Vec<ScenarioReport>,
}

impl ReportStats {
    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Human readable end-of-run summary on stdout.
    pub fn print_summary(&self) {
        println!("\n--- Test Summary ---");
        if self.total_requests == 0 && self.checks.is_empty() {
            println!("No metrics collected.");
        }

        if self.total_requests > 0 {
            println!("Total Requests: {}", self.total_requests);
            println!(
                "Failed:         {} ({:.2}%)",
                self.failed_requests,
                self.failure_rate * 100.0
            );
            println!("Throughput:     {:.2} req/s", self.rps);
            println!("Avg Latency:    {:.2} ms", self.avg_latency_ms);
            println!("Min Latency:    {:.2} ms", self.min_latency_ms);
            println!("Max Latency:    {:.2} ms", self.max_latency_ms);
            println!("P50 Latency:    {:.2} ms", self.p50_latency_ms);
            println!("P90 Latency:    {:.2} ms", self.p90_latency_ms);
            println!("P95 Latency:    {:.2} ms", self.p95_latency_ms);
            println!("P99 Latency:    {:.2} ms", self.p99_latency_ms);
            println!("Iterations:     {}", self.iterations);

            println!("\nStatus Codes:");
            let mut codes: Vec<_> = self.status_codes.iter().collect();
            codes.sort_by_key(|a| a.0);
            for (code, count) in codes {
                println!("  {}: {}", code, count);
            }

            let mb_sent = self.total_data_sent as f64 / 1_048_576.0;
            let mb_recv = self.total_data_received as f64 / 1_048_576.0;
            println!("\nData Transfer:");
            println!("  Sent:     {:.2} MB", mb_sent);
            println!("  Received: {:.2} MB", mb_recv);
        }

        if !self.grouped_requests.is_empty() {
            println!("\nGrouped Requests:");
            let mut groups: Vec<_> = self.grouped_requests.iter().collect();
            groups.sort_by_key(|a| a.0);
            for (name, stats) in groups {
                println!("  Request: {}", name);
                println!("    Count: {}", stats.total_requests);
                println!("    P95:   {:.2} ms", stats.p95_latency_ms);
                if stats.error_count > 0 {
                    println!("    Errors: {}", stats.error_count);
                }
            }
        }

        if !self.errors.is_empty() {
            println!("\nErrors:");
            let mut errors: Vec<_> = self.errors.iter().collect();
            errors.sort_by(|a, b| b.1.cmp(a.1));
            for (err, count) in errors {
                println!("  {}: {}", err, count);
            }
        }

        if !self.scenarios.is_empty() {
            println!("\nScenarios:");
            for scenario in &self.scenarios {
                print!(
                    "  {}: peak {} worker(s), {} started",
                    scenario.name, scenario.peak_workers, scenario.workers_started
                );
                if scenario.aborted_workers > 0 {
                    print!(", {} cut off at graceful stop", scenario.aborted_workers);
                }
                println!();
            }
        }

        if !self.checks.is_empty() {
            println!("\nChecks: {:.2}% passed", self.check_pass_rate * 100.0);
            let mut checks: Vec<_> = self.checks.iter().collect();
            checks.sort_by_key(|a| a.0);
            for (name, (total, passes)) in checks {
                let fail = total - passes;
                if fail > 0 {
                    let percent = (*passes as f64 / *total as f64) * 100.0;
                    println!(
                        "  ✗ {} : {:.2}% ({} passed, {} failed)",
                        name, percent, passes, fail
                    );
                } else {
                    println!("  ✓ {} : 100% ({} passed)", name, passes);
                }
            }
        }

        if !self.thresholds.is_empty() {
            println!("\nThresholds:");
            for verdict in &self.thresholds {
                let mark = if verdict.passed { "✓" } else { "✗" };
                println!(
                    "  {} {} {} (observed: {:.4})",
                    mark, verdict.metric, verdict.expression, verdict.observed
                );
            }
        }

        if self.aborted {
            match &self.abort_reason {
                Some(reason) => println!("\nRun aborted early: {}", reason),
                None => println!("\nRun aborted early: an abort-on-fail threshold was breached."),
            }
        }

        println!("--------------------\n");
    }
}
