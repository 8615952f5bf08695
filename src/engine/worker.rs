use crossbeam_channel::Sender;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::engine::check::{self, ResponseDescriptor};
use crate::engine::http_client::HttpClient;
use crate::engine::plan::{self, Dispatch, PlanContext, PlanKind, RequestDescriptor};
use crate::engine::scenario::Scenario;
use crate::stats::{Metric, RequestTimings};

/// Everything a worker needs that is shared across the whole run.
pub struct WorkerContext {
    pub client: HttpClient,
    pub base_url: String,
    pub default_scenario: String,
    pub default_plan: PlanKind,
    pub token: Option<String>,
    pub request_timeout: Duration,
    pub metrics: Sender<Metric>,
    /// Hard end of the run. No iteration starts after it.
    pub deadline: Instant,
}

/// One virtual worker: iterate until cancelled or past the run deadline.
///
/// Cancellation is only observed between requests and during think time, so a
/// request that is already on the wire always completes (or times out).
pub async fn run_worker(
    id: u64,
    scenario: Arc<Scenario>,
    ctx: Arc<WorkerContext>,
    cancel: CancellationToken,
) {
    tracing::trace!(scenario = %scenario.name, worker = id, "worker started");
    let mut iteration: u64 = 0;

    loop {
        if cancel.is_cancelled() || Instant::now() >= ctx.deadline {
            break;
        }

        run_iteration(&scenario, &ctx, iteration).await;
        iteration += 1;

        let wake = (Instant::now() + scenario.think_time.sample()).min(ctx.deadline);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(wake) => {}
        }
    }

    tracing::trace!(scenario = %scenario.name, worker = id, iterations = iteration, "worker stopped");
}

/// Build the plan, send its requests, check every response and report.
pub async fn run_iteration(scenario: &Scenario, ctx: &WorkerContext, iteration: u64) {
    let iteration_start = Instant::now();
    let plan_ctx = PlanContext {
        env: &scenario.env,
        default_scenario: &ctx.default_scenario,
        default_plan: ctx.default_plan,
        explicit_plan: scenario.plan,
        bearer_token: ctx.token.as_deref(),
    };
    let plan = plan::build(&plan_ctx, iteration);

    match plan.dispatch {
        Dispatch::Sequential => {
            for request in &plan.requests {
                execute(scenario, ctx, request).await;
            }
        }
        Dispatch::Batch => {
            futures::future::join_all(
                plan.requests
                    .iter()
                    .map(|request| execute(scenario, ctx, request)),
            )
            .await;
        }
    }

    let _ = ctx.metrics.send(Metric::Iteration {
        duration: iteration_start.elapsed(),
        tags: scenario.tags.clone(),
    });
}

async fn execute(scenario: &Scenario, ctx: &WorkerContext, request: &RequestDescriptor) {
    let url = plan::join_url(&ctx.base_url, &request.path);
    let start = Instant::now();
    let result = ctx
        .client
        .request(
            request.method.clone(),
            &url,
            &request.headers,
            request.body.as_deref(),
            ctx.request_timeout,
        )
        .await;

    let (response, timings, error) = match result {
        Ok(resp) => (
            ResponseDescriptor {
                status: resp.status,
                latency: resp.timings.duration,
                body: Some(String::from_utf8_lossy(&resp.body).into_owned()),
            },
            resp.timings,
            None,
        ),
        Err(e) => {
            let latency = start.elapsed();
            tracing::debug!(scenario = %scenario.name, request = %request.name, error = %e, "request failed");
            (
                ResponseDescriptor::failed(latency),
                RequestTimings {
                    duration: latency,
                    ..Default::default()
                },
                Some(e.to_string()),
            )
        }
    };

    let _ = ctx.metrics.send(Metric::Request {
        name: request.name.clone(),
        timings,
        status: response.status,
        error,
        tags: scenario.tags.clone(),
    });

    let mut checks = check::default_checks(request.expected_status, scenario.latency_budget);
    checks.extend(scenario.checks.iter().cloned());
    for (name, success) in check::evaluate(&checks, &response).outcomes {
        let _ = ctx.metrics.send(Metric::Check {
            name,
            success,
            tags: scenario.tags.clone(),
        });
    }
}
