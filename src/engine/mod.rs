use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::engine::control::{ControlState, HaltReason};
use crate::engine::http_client::HttpClient;
use crate::engine::plan::PlanKind;
use crate::engine::scenario::Scenario;
use crate::engine::scheduler::{run_schedule, ScheduleOptions};
use crate::engine::worker::{run_worker, WorkerContext};
use crate::stats::threshold::{self, ThresholdSpec, ThresholdWatcher};
use crate::stats::{Metric, ReportStats, ScenarioReport, SharedAggregator, StatsAggregator};

pub mod check;
pub mod control;
pub mod http_client;
pub mod plan;
pub mod scenario;
pub mod scheduler;
pub mod worker;

/// A fully validated run: what `cli::config` produces and the engine consumes.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub base_url: String,
    pub default_scenario: String,
    pub default_plan: PlanKind,
    pub token: Option<String>,
    pub request_timeout: Duration,
    pub tick: Duration,
    pub graceful_stop: Duration,
    pub scenarios: Vec<Scenario>,
    pub thresholds: Vec<ThresholdSpec>,
}

impl RunSettings {
    /// Offset at which the last scenario's schedule ends.
    pub fn run_length(&self) -> Duration {
        self.scenarios
            .iter()
            .map(Scenario::end_offset)
            .max()
            .unwrap_or_default()
    }

    pub fn peak_workers(&self) -> usize {
        self.scenarios.iter().map(|s| s.mode.peak_workers()).sum()
    }
}

pub struct Engine {
    control: Arc<ControlState>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        HttpClient::install_crypto_provider();
        Self {
            control: ControlState::shared(),
        }
    }

    /// Handle for stopping or aborting the run from outside.
    pub fn control(&self) -> Arc<ControlState> {
        self.control.clone()
    }

    /// Run to completion on a dedicated multi-thread runtime. Ctrl-C stops the
    /// run gracefully and still produces a report.
    pub fn run(&self, settings: RunSettings) -> Result<ReportStats> {
        let worker_threads = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(8)
            .max(4);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .enable_all()
            .build()?;

        runtime.block_on(async {
            let control = self.control.clone();
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, stopping workers");
                    control.stop();
                }
            });
            let report = self.run_async(settings).await;
            interrupt.abort();
            report
        })
    }

    pub async fn run_async(&self, settings: RunSettings) -> Result<ReportStats> {
        let run_length = settings.run_length();
        let peak_workers = settings.peak_workers();
        let RunSettings {
            base_url,
            default_scenario,
            default_plan,
            token,
            request_timeout,
            tick,
            graceful_stop,
            scenarios,
            thresholds,
        } = settings;

        tracing::info!(
            base_url = %base_url,
            scenarios = scenarios.len(),
            peak_workers,
            duration = %crate::utils::format_duration(run_length),
            "starting run"
        );

        let aggregator = StatsAggregator::shared();
        let (tx, rx): (Sender<Metric>, Receiver<Metric>) = crossbeam_channel::unbounded();
        let agg_thread = {
            let aggregator = aggregator.clone();
            std::thread::spawn(move || {
                while let Ok(metric) = rx.recv() {
                    aggregator.write().add(metric);
                }
            })
        };

        let run_start = Instant::now();
        let deadline = run_start
            .checked_add(run_length)
            .ok_or_else(|| anyhow::anyhow!("run length {:?} is out of range", run_length))?;
        let pool_size = (peak_workers / 5).clamp(64, 2000);
        let ctx = Arc::new(WorkerContext {
            client: HttpClient::with_pool_size(pool_size),
            base_url,
            default_scenario,
            default_plan,
            token,
            request_timeout,
            metrics: tx,
            deadline,
        });

        let watcher = self.spawn_threshold_watcher(&thresholds, aggregator.clone(), tick);

        let mut schedules = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            let scenario = Arc::new(scenario);
            let ctx = ctx.clone();
            let control = self.control.clone();
            let options = ScheduleOptions {
                run_start,
                start_time: scenario.start_time,
                tick,
                graceful_stop,
            };
            let name = scenario.name.clone();
            schedules.push((name, tokio::spawn(async move {
                let worker_scenario = scenario.clone();
                run_schedule(&scenario.name, &scenario.mode, options, control, move |id, cancel| {
                    tokio::spawn(run_worker(id, worker_scenario.clone(), ctx.clone(), cancel))
                })
                .await
            })));
        }

        let mut scenario_reports = Vec::with_capacity(schedules.len());
        for (name, schedule) in schedules {
            let summary = schedule.await?;
            scenario_reports.push(ScenarioReport {
                name,
                peak_workers: summary.peak_workers,
                workers_started: summary.spawned,
                aborted_workers: summary.aborted_workers,
            });
        }
        scenario_reports.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        // Closing the last sender lets the aggregator thread drain and exit.
        drop(ctx);
        tokio::task::spawn_blocking(move || agg_thread.join())
            .await?
            .map_err(|_| anyhow::anyhow!("metric aggregator thread panicked"))?;

        let elapsed = run_start.elapsed();
        let agg = aggregator.read();
        let mut report = agg.to_report();
        report.thresholds = threshold::evaluate(&thresholds, &agg);
        report.aborted = self.control.is_aborted();
        if let Some(HaltReason::Aborted(reason)) = self.control.reason() {
            report.abort_reason = Some(reason);
        }
        report.scenarios = scenario_reports;
        report.run_duration_ms = elapsed.as_millis();
        report.rps = if elapsed.as_secs_f64() > 0.0 {
            report.total_requests as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        for verdict in report.thresholds.iter().filter(|v| !v.passed) {
            tracing::warn!(
                metric = %verdict.metric,
                threshold = %verdict.expression,
                observed = verdict.observed,
                "threshold failed"
            );
        }
        tracing::info!(
            requests = report.total_requests,
            iterations = report.iterations,
            elapsed = %crate::utils::format_duration(elapsed),
            aborted = report.aborted,
            "run finished"
        );
        Ok(report)
    }

    fn spawn_threshold_watcher(
        &self,
        thresholds: &[ThresholdSpec],
        aggregator: SharedAggregator,
        tick: Duration,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let mut watcher = ThresholdWatcher::new(thresholds);
        if watcher.is_idle() {
            return None;
        }
        let control = self.control.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = control.halted() => break,
                }
                let now = Instant::now().into_std();
                let fired = watcher.poll(&aggregator.read(), now);
                if let Some(reason) = fired {
                    tracing::error!(reason = %reason, "aborting run");
                    control.abort(reason);
                    break;
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::plan::SCENARIO_ENV_KEY;
    use crate::engine::scenario::{ExecutionMode, Stage, ThinkTime};
    use crate::stats::threshold::{parse_thresholds, DetailedThreshold, ThresholdEntry};
    use crate::stats::RequestTimings;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scenario(identifier: &str, mode: ExecutionMode) -> Scenario {
        Scenario {
            name: identifier.to_string(),
            mode,
            start_time: Duration::ZERO,
            env: HashMap::from([(SCENARIO_ENV_KEY.to_string(), identifier.to_string())]),
            tags: HashMap::from([("scenario".to_string(), identifier.to_string())]),
            think_time: ThinkTime::Fixed(Duration::from_millis(50)),
            latency_budget: Duration::from_secs(2),
            plan: None,
            checks: Vec::new(),
        }
    }

    fn settings(base_url: String, scenarios: Vec<Scenario>) -> RunSettings {
        RunSettings {
            base_url,
            default_scenario: "smoke".to_string(),
            default_plan: PlanKind::HealthCheck,
            token: None,
            request_timeout: Duration::from_secs(5),
            tick: Duration::from_millis(50),
            graceful_stop: Duration::from_secs(5),
            scenarios,
            thresholds: Vec::new(),
        }
    }

    fn simple(metric: &str, expr: &str) -> (String, Vec<ThresholdEntry>) {
        (metric.to_string(), vec![ThresholdEntry::Simple(expr.to_string())])
    }

    #[test]
    fn test_run_length_spans_start_times() {
        let mut late = scenario(
            "soak",
            ExecutionMode::ConstantWorkers {
                workers: 1,
                duration: Duration::from_secs(10),
            },
        );
        late.start_time = Duration::from_secs(5);
        let ramp = scenario(
            "load",
            ExecutionMode::RampingWorkers {
                start_workers: 0,
                stages: vec![Stage::new(Duration::from_secs(12), 3)],
            },
        );
        let settings = settings("http://localhost:3000".to_string(), vec![late, ramp]);
        assert_eq!(settings.run_length(), Duration::from_secs(15));
        assert_eq!(settings.peak_workers(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_smoke_run_against_companion_server() {
        let addr = crate::server::spawn_ephemeral(1000).await;
        let mut settings = settings(
            format!("http://{}", addr),
            vec![scenario(
                "smoke",
                ExecutionMode::ConstantWorkers {
                    workers: 2,
                    duration: Duration::from_secs(1),
                },
            )],
        );
        settings.thresholds = parse_thresholds(&HashMap::from([
            simple("http_req_failed", "rate<0.01"),
            simple("checks", "rate>0.99"),
            simple("http_req_duration", "p(95)<2000"),
        ]))
        .unwrap();

        let report = Engine::new().run_async(settings).await.unwrap();
        assert!(report.total_requests >= 2, "only {} requests", report.total_requests);
        assert_eq!(report.failed_requests, 0);
        assert_eq!(report.thresholds.len(), 3);
        assert!(report.thresholds_passed(), "{:?}", report.thresholds);
        assert!(!report.aborted);
        assert!(report.abort_reason.is_none());
        assert!(report.iterations >= 2);
        assert_eq!(report.scenarios.len(), 1);
        assert_eq!(report.scenarios[0].name, "smoke");
        assert_eq!(report.scenarios[0].peak_workers, 2);
        assert_eq!(report.scenarios[0].workers_started, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_scenarios_share_one_report() {
        let addr = crate::server::spawn_ephemeral(1000).await;
        let ramp = scenario(
            "load",
            ExecutionMode::RampingWorkers {
                start_workers: 1,
                stages: vec![Stage::new(Duration::from_millis(600), 3)],
            },
        );
        let spike = scenario(
            "spike",
            ExecutionMode::ConstantWorkers {
                workers: 1,
                duration: Duration::from_millis(600),
            },
        );
        let report = Engine::new()
            .run_async(settings(format!("http://{}", addr), vec![ramp, spike]))
            .await
            .unwrap();

        assert_eq!(report.failed_requests, 0);
        assert!(report.grouped_requests.contains_key("GET /api/status{scenario:load}"));
        assert!(report.grouped_requests.contains_key("POST /api/items{scenario:spike}"));
        assert_eq!(report.checks["status is 201"].0, report.checks["status is 201"].1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abort_on_fail_ends_run_early() {
        let addr = crate::server::spawn_ephemeral(1000).await;
        let mut settings = settings(
            format!("http://{}", addr),
            vec![scenario(
                "smoke",
                ExecutionMode::ConstantWorkers {
                    workers: 2,
                    duration: Duration::from_secs(30),
                },
            )],
        );
        settings.thresholds = parse_thresholds(&HashMap::from([(
            "http_req_duration".to_string(),
            vec![ThresholdEntry::Detailed(DetailedThreshold {
                threshold: "max<0".to_string(),
                abort_on_fail: true,
                delay_abort_eval: Some("200ms".to_string()),
            })],
        )]))
        .unwrap();

        let engine = Engine::new();
        let started = std::time::Instant::now();
        let report = engine.run_async(settings).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(report.aborted);
        let reason = report.abort_reason.as_deref().unwrap();
        assert!(reason.contains("max<0"), "{}", reason);
        assert!(reason.contains("http_req_duration"), "{}", reason);
        assert!(engine.control().is_aborted());
        assert!(!report.thresholds_passed());
        assert!(report.total_requests > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_grace_bounds_ramp_down() {
        let engine = Engine::new();
        let control = engine.control();
        let tick = Duration::from_millis(100);
        let grace = Duration::from_secs(2);
        let specs = parse_thresholds(&HashMap::from([(
            "http_req_duration".to_string(),
            vec![ThresholdEntry::Detailed(DetailedThreshold {
                threshold: "max<100".to_string(),
                abort_on_fail: true,
                delay_abort_eval: Some("2s".to_string()),
            })],
        )]))
        .unwrap();
        let aggregator = StatsAggregator::shared();
        let watcher = engine
            .spawn_threshold_watcher(&specs, aggregator.clone(), tick)
            .unwrap();

        let live = Arc::new(AtomicUsize::new(0));
        let schedule = {
            let live = live.clone();
            let control = control.clone();
            let mode = ExecutionMode::ConstantWorkers {
                workers: 4,
                duration: Duration::from_secs(3600),
            };
            let options = ScheduleOptions {
                run_start: Instant::now(),
                start_time: Duration::ZERO,
                tick,
                graceful_stop: Duration::from_secs(1),
            };
            tokio::spawn(async move {
                run_schedule("soak", &mode, options, control, move |_, cancel| {
                    let live = live.clone();
                    live.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        cancel.cancelled().await;
                        live.fetch_sub(1, Ordering::SeqCst);
                    })
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(live.load(Ordering::SeqCst), 4);

        aggregator.write().add(Metric::Request {
            name: "GET /health".to_string(),
            timings: RequestTimings {
                duration: Duration::from_millis(500),
                ..Default::default()
            },
            status: 200,
            error: None,
            tags: HashMap::new(),
        });
        let breach = Instant::now();

        // The watcher notices the breach on its next tick and the abort lands
        // on the first tick past the grace period.
        tokio::time::sleep_until(breach + grace - Duration::from_millis(10)).await;
        assert!(!control.is_halted());
        assert_eq!(live.load(Ordering::SeqCst), 4);

        tokio::time::sleep_until(breach + grace + tick * 2).await;
        assert!(control.is_aborted());
        assert_eq!(live.load(Ordering::SeqCst), 0);

        let summary = schedule.await.unwrap();
        assert_eq!(summary.peak_workers, 4);
        assert_eq!(summary.aborted_workers, 0);
        watcher.await.unwrap();
        assert!(matches!(control.reason(), Some(HaltReason::Aborted(r)) if r.contains("max<100")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unreachable_target_fails_thresholds_without_aborting() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut settings = settings(
            format!("http://{}", addr),
            vec![scenario(
                "smoke",
                ExecutionMode::ConstantWorkers {
                    workers: 1,
                    duration: Duration::from_millis(400),
                },
            )],
        );
        settings.thresholds =
            parse_thresholds(&HashMap::from([simple("http_req_failed", "rate<0.01")])).unwrap();

        let report = Engine::new().run_async(settings).await.unwrap();
        assert!(report.total_requests > 0);
        assert_eq!(report.failed_requests, report.total_requests);
        assert!(!report.aborted);
        assert!(!report.thresholds_passed());
        assert!((report.thresholds[0].observed - 1.0).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_produces_partial_report() {
        let addr = crate::server::spawn_ephemeral(1000).await;
        let settings = settings(
            format!("http://{}", addr),
            vec![scenario(
                "soak",
                ExecutionMode::ConstantWorkers {
                    workers: 2,
                    duration: Duration::from_secs(3600),
                },
            )],
        );
        let engine = Engine::new();
        let control = engine.control();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            control.stop();
        });

        let report = tokio::time::timeout(Duration::from_secs(10), engine.run_async(settings))
            .await
            .expect("stopped run finished")
            .unwrap();
        assert!(report.total_requests > 0);
        assert!(!report.aborted);
    }
}
