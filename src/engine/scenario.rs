use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

use crate::engine::check::CheckSpec;
use crate::engine::plan::PlanKind;

/// One timed segment of a ramp schedule: reach `target` workers after `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// How a scenario's worker count evolves over time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// `workers` for the whole `duration`, then nothing (k6: constant-vus).
    ConstantWorkers { workers: usize, duration: Duration },
    /// Linear ramps between stage targets starting from `start_workers` (k6: ramping-vus).
    RampingWorkers { start_workers: usize, stages: Vec<Stage> },
}

impl ExecutionMode {
    /// Length of the schedule. Past this point the target is always zero.
    pub fn total_duration(&self) -> Duration {
        self.checked_duration().unwrap_or(Duration::MAX)
    }

    /// Length of the schedule, or `None` if the stages do not fit in a `Duration`.
    pub fn checked_duration(&self) -> Option<Duration> {
        match self {
            ExecutionMode::ConstantWorkers { duration, .. } => Some(*duration),
            ExecutionMode::RampingWorkers { stages, .. } => stages
                .iter()
                .try_fold(Duration::ZERO, |total, s| total.checked_add(s.duration)),
        }
    }

    /// Highest worker count the schedule ever asks for.
    pub fn peak_workers(&self) -> usize {
        match self {
            ExecutionMode::ConstantWorkers { workers, .. } => *workers,
            ExecutionMode::RampingWorkers { start_workers, stages } => stages
                .iter()
                .map(|s| s.target)
                .max()
                .unwrap_or(0)
                .max(*start_workers),
        }
    }

    /// Target number of concurrent workers at `elapsed` since the scenario started.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        match self {
            ExecutionMode::ConstantWorkers { workers, duration } => {
                if elapsed <= *duration {
                    *workers
                } else {
                    0
                }
            }
            ExecutionMode::RampingWorkers { start_workers, stages } => {
                let mut stage_start = Duration::ZERO;
                let mut from = *start_workers;
                for stage in stages {
                    let stage_end = stage_start.saturating_add(stage.duration);
                    if elapsed <= stage_end {
                        let progress = if stage.duration.is_zero() {
                            1.0
                        } else {
                            (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64()
                        };
                        return interpolate(from, stage.target, progress);
                    }
                    stage_start = stage_end;
                    from = stage.target;
                }
                0
            }
        }
    }
}

/// Linear interpolation rounded to the nearest worker. Exact halves round
/// toward the stage's direction of travel so a ramp never oscillates.
fn interpolate(from: usize, to: usize, progress: f64) -> usize {
    if progress >= 1.0 {
        return to;
    }
    let exact = from as f64 + (to as f64 - from as f64) * progress.max(0.0);
    let floor = exact.floor();
    let frac = exact - floor;
    let rounded = if frac > 0.5 {
        floor + 1.0
    } else if frac < 0.5 {
        floor
    } else if to > from {
        floor + 1.0
    } else {
        floor
    };
    rounded as usize
}

/// Pause between two iterations of a worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThinkTime {
    Fixed(Duration),
    Uniform { min: Duration, max: Duration },
}

impl ThinkTime {
    pub fn sample(&self) -> Duration {
        match *self {
            ThinkTime::Fixed(d) => d,
            ThinkTime::Uniform { min, max } => {
                if max <= min {
                    return min;
                }
                let secs = rand::thread_rng().gen_range(min.as_secs_f64()..=max.as_secs_f64());
                Duration::from_secs_f64(secs)
            }
        }
    }
}

/// A named traffic profile, fully resolved and immutable for the run.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub mode: ExecutionMode,
    /// Delay between run start and this scenario's first tick.
    pub start_time: Duration,
    pub env: HashMap<String, String>,
    pub tags: HashMap<String, String>,
    pub think_time: ThinkTime,
    /// Bound used by the "response time OK" check.
    pub latency_budget: Duration,
    /// Explicit plan; when absent the plan follows the scenario identifier.
    pub plan: Option<PlanKind>,
    /// Checks applied to every response on top of the defaults.
    pub checks: Vec<CheckSpec>,
}

impl Scenario {
    /// Offset from run start after which this scenario wants no workers.
    pub fn end_offset(&self) -> Duration {
        self.start_time.saturating_add(self.mode.total_duration())
    }
}

/// Built-in pacing and latency budget per well-known profile name.
pub fn builtin_think_time(name: &str) -> ThinkTime {
    match name {
        "smoke" => ThinkTime::Fixed(Duration::from_secs(1)),
        "load" => ThinkTime::Uniform {
            min: Duration::from_secs(1),
            max: Duration::from_secs(3),
        },
        "stress" => ThinkTime::Uniform {
            min: Duration::from_millis(500),
            max: Duration::from_millis(1500),
        },
        "spike" => ThinkTime::Fixed(Duration::from_millis(100)),
        "soak" => ThinkTime::Uniform {
            min: Duration::from_secs(2),
            max: Duration::from_secs(5),
        },
        _ => ThinkTime::Fixed(Duration::from_secs(1)),
    }
}

pub fn builtin_latency_budget(name: &str) -> Duration {
    match name {
        "smoke" => Duration::from_millis(200),
        "stress" => Duration::from_secs(1),
        "spike" => Duration::from_secs(2),
        _ => Duration::from_millis(500),
    }
}
