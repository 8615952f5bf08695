use std::sync::Arc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::engine::control::ControlState;
use crate::engine::scenario::ExecutionMode;

struct WorkerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The live workers of one scenario, oldest first.
pub struct WorkerPool {
    active: Vec<WorkerHandle>,
    retired: Vec<JoinHandle<()>>,
    next_id: u64,
    spawned: u64,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            active: Vec::new(),
            retired: Vec::new(),
            next_id: 1,
            spawned: 0,
        }
    }

    pub fn active(&self) -> usize {
        self.active.len()
    }

    /// Total workers ever started by this pool.
    pub fn spawned(&self) -> u64 {
        self.spawned
    }

    /// Start or retire workers until exactly `target` are active. Retired
    /// workers are the newest ones; they are cancelled, not aborted, so they
    /// finish the request they are in.
    pub fn reconcile<F>(&mut self, target: usize, mut spawn: F)
    where
        F: FnMut(u64, CancellationToken) -> JoinHandle<()>,
    {
        self.active.retain(|w| !w.task.is_finished());
        self.retired.retain(|t| !t.is_finished());

        while self.active.len() < target {
            let cancel = CancellationToken::new();
            let task = spawn(self.next_id, cancel.clone());
            self.next_id += 1;
            self.spawned += 1;
            self.active.push(WorkerHandle { cancel, task });
        }

        while self.active.len() > target {
            if let Some(worker) = self.active.pop() {
                worker.cancel.cancel();
                self.retired.push(worker.task);
            }
        }
    }

    /// Retire everything, give the workers `grace` to wind down, then abort
    /// the stragglers. Returns how many had to be aborted.
    pub async fn drain(mut self, grace: Duration) -> usize {
        for worker in self.active.drain(..) {
            worker.cancel.cancel();
            self.retired.push(worker.task);
        }
        let aborts: Vec<AbortHandle> = self.retired.iter().map(|t| t.abort_handle()).collect();
        let tasks = std::mem::take(&mut self.retired);

        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_ok()
        {
            return 0;
        }

        let mut aborted = 0;
        for handle in aborts {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleOptions {
    /// Common reference for every scenario and for the workers' run deadline.
    pub run_start: Instant,
    /// Delay from `run_start` to the scenario's first tick.
    pub start_time: Duration,
    pub tick: Duration,
    /// How long workers get to finish once the schedule is over.
    pub graceful_stop: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub peak_workers: usize,
    pub spawned: u64,
    pub aborted_workers: usize,
}

/// Drive one scenario's worker pool along `mode`, re-evaluating the target
/// every tick. A halted run targets zero workers.
pub async fn run_schedule<F>(
    scenario: &str,
    mode: &ExecutionMode,
    options: ScheduleOptions,
    control: Arc<ControlState>,
    mut spawn: F,
) -> ScheduleSummary
where
    F: FnMut(u64, CancellationToken) -> JoinHandle<()>,
{
    let scenario_start = options.run_start + options.start_time;
    if scenario_start > Instant::now() {
        tokio::select! {
            _ = tokio::time::sleep_until(scenario_start) => {}
            _ = control.halted() => {
                tracing::debug!(scenario, "run halted before scenario start");
                return ScheduleSummary::default();
            }
        }
    }

    tracing::info!(
        scenario,
        duration = ?mode.total_duration(),
        peak = mode.peak_workers(),
        "scenario started"
    );

    let total = mode.total_duration();
    let mut pool = WorkerPool::new();
    let mut summary = ScheduleSummary::default();
    let mut last_target = None;

    let mut ticker = tokio::time::interval(options.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = control.halted() => {}
        }
        let elapsed = Instant::now().saturating_duration_since(scenario_start);
        let halted = control.is_halted();
        // No worker starts at or past the scenario end.
        let finished = elapsed >= total;
        let target = if halted || finished { 0 } else { mode.target_at(elapsed) };

        if last_target != Some(target) {
            tracing::debug!(scenario, target, elapsed = ?elapsed, "worker target changed");
            last_target = Some(target);
        }
        pool.reconcile(target, &mut spawn);
        summary.peak_workers = summary.peak_workers.max(pool.active());

        if halted || finished {
            break;
        }
    }

    summary.spawned = pool.spawned();
    summary.aborted_workers = pool.drain(options.graceful_stop).await;
    if summary.aborted_workers > 0 {
        tracing::warn!(
            scenario,
            aborted = summary.aborted_workers,
            "workers did not finish within the graceful stop period"
        );
    }
    tracing::info!(scenario, peak = summary.peak_workers, "scenario finished");
    summary
}
