use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::check::{CheckSpec, Predicate};
use crate::engine::plan::{self, PlanKind};
use crate::engine::scenario::{
    builtin_latency_budget, builtin_think_time, ExecutionMode, Scenario, Stage, ThinkTime,
};
use crate::engine::RunSettings;
use crate::stats::threshold::{parse_thresholds, ThresholdEntry, ThresholdError};
use crate::utils::{parse_duration_str, MAX_DURATION};

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_SCENARIO: &str = "smoke";
/// Scenario name used when the config has top-level `workers`/`schedule` instead of `scenarios`.
pub const IMPLICIT_SCENARIO: &str = "default";

/// Everything that can be wrong with a run configuration. All of these are
/// reported before a single worker starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("no scenarios configured")]
    NoScenarios,
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error("scenario '{scenario}': unknown executor '{executor}' (expected constant-vus or ramping-vus)")]
    UnknownExecutor { scenario: String, executor: String },
    #[error("scenario '{0}': a constant executor needs a duration")]
    MissingDuration(String),
    #[error("scenario '{0}': a ramping executor needs at least one stage")]
    EmptySchedule(String),
    #[error("invalid duration '{value}' for {field}")]
    InvalidDuration { field: String, value: String },
    #[error("scenario '{0}': sleep range has min greater than max")]
    InvalidThinkTime(String),
    #[error("scenario '{scenario}': check '{check}' is invalid: {reason}")]
    InvalidCheck {
        scenario: String,
        check: String,
        reason: String,
    },
    #[error("invalid base URL '{0}': expected http(s)://host[:port]")]
    InvalidBaseUrl(String),
    #[error("invalid threshold: {0}")]
    Threshold(#[from] ThresholdError),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ScheduleStep {
    pub duration: String,
    pub target: usize,
}

/// Pause between iterations: a fixed duration or a uniform range.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum SleepConfig {
    Fixed(String),
    Range { min: String, max: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PredicateConfig {
    /// Response status must equal this code.
    Status(u16),
    /// Response must arrive within this duration (e.g. "300ms").
    LatencyBelow(String),
    /// A JSON body field (dotted path) must equal a value.
    BodyField { field: String, equals: Value },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct CheckConfig {
    pub name: String,
    #[serde(flatten)]
    pub predicate: PredicateConfig,
}

/// Configuration for a single named scenario.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct ScenarioConfig {
    /// constant-vus (alias constant-workers) or ramping-vus (alias ramping-workers).
    /// Inferred from the presence of `schedule` when omitted.
    pub executor: Option<String>,
    /// Concurrent workers for a constant executor (k6: vus)
    #[serde(alias = "vus")]
    pub workers: Option<usize>,
    /// Duration of a constant executor (e.g. "30s", "2h")
    pub duration: Option<String>,
    /// Workers before the first stage of a ramping executor (k6: startVUs)
    #[serde(alias = "startVUs", alias = "start_vus")]
    pub start_workers: Option<usize>,
    /// Ramping schedule (k6: stages)
    #[serde(alias = "stages")]
    pub schedule: Option<Vec<ScheduleStep>>,
    /// Delay before starting this scenario (e.g., "30s")
    #[serde(alias = "startTime")]
    pub start_time: Option<String>,
    /// Environment bindings passed to the scenario's workers
    pub env: Option<HashMap<String, String>>,
    /// Tags attached to every metric of this scenario
    pub tags: Option<HashMap<String, String>>,
    /// Force a request plan instead of deriving it from the scenario identifier
    pub plan: Option<PlanKind>,
    /// Think time between iterations
    pub sleep: Option<SleepConfig>,
    /// Bound for the "response time OK" check
    #[serde(alias = "latencyBudget")]
    pub latency_budget: Option<String>,
    /// Extra checks applied to every response
    pub checks: Option<Vec<CheckConfig>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct Config {
    /// Target base URL (default: http://localhost:3000)
    #[serde(alias = "baseUrl")]
    pub base_url: Option<String>,
    /// Scenario identifier for workers without a SCENARIO env binding (default: smoke)
    #[serde(alias = "defaultScenario")]
    pub default_scenario: Option<String>,
    /// Plan for identifiers with no built-in plan (default: health-check)
    #[serde(alias = "defaultPlan")]
    pub default_plan: Option<PlanKind>,
    /// Bearer token sent with every request
    pub token: Option<String>,
    /// Per-request timeout (default: 30s)
    #[serde(alias = "requestTimeout")]
    pub request_timeout: Option<String>,
    /// Scheduling tick (default: 100ms)
    pub tick: Option<String>,
    /// Graceful shutdown wait time (default: 30s)
    #[serde(alias = "gracefulStop")]
    pub stop: Option<String>,
    /// Environment bindings shared by every scenario
    pub env: Option<HashMap<String, String>>,
    /// Concurrent workers for the implicit single scenario
    #[serde(alias = "vus")]
    pub workers: Option<usize>,
    /// Duration for the implicit single scenario
    pub duration: Option<String>,
    /// Ramping schedule for the implicit single scenario (k6: stages)
    #[serde(alias = "stages")]
    pub schedule: Option<Vec<ScheduleStep>>,
    /// Named scenarios running concurrently
    pub scenarios: Option<BTreeMap<String, ScenarioConfig>>,
    /// Pass/Fail criteria (k6: thresholds)
    #[serde(alias = "thresholds")]
    pub criteria: Option<HashMap<String, Vec<ThresholdEntry>>>,
}

/// Values that take precedence over the file, gathered from flags and
/// environment variables in `main`.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub token: Option<String>,
    /// Run only these scenarios. Empty means all.
    pub scenarios: Vec<String>,
}

fn duration_field(field: impl Into<String>, value: &str) -> Result<Duration, ConfigError> {
    parse_duration_str(value).ok_or_else(|| ConfigError::InvalidDuration {
        field: field.into(),
        value: value.to_string(),
    })
}

fn optional_duration(
    field: &str,
    value: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    value.map_or(Ok(default), |v| duration_field(field, v))
}

fn validate_base_url(url: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidBaseUrl(url.to_string());
    let uri: http::Uri = url.parse().map_err(|_| invalid())?;
    match (uri.scheme_str(), uri.authority()) {
        (Some("http" | "https"), Some(_)) => Ok(url.trim_end_matches('/').to_string()),
        _ => Err(invalid()),
    }
}

impl Config {
    /// Load from YAML, or JSON when the extension is `.json`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parsed = if ext == "json" {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Scenario table, with top-level `workers`/`duration`/`schedule` folded
    /// into a single implicit scenario when no table is given.
    fn scenario_table(&self) -> BTreeMap<String, ScenarioConfig> {
        if let Some(scenarios) = &self.scenarios {
            return scenarios.clone();
        }
        if self.workers.is_none() && self.duration.is_none() && self.schedule.is_none() {
            return BTreeMap::new();
        }
        let implicit = ScenarioConfig {
            workers: self.workers,
            duration: self.duration.clone(),
            schedule: self.schedule.clone(),
            ..Default::default()
        };
        BTreeMap::from([(IMPLICIT_SCENARIO.to_string(), implicit)])
    }

    /// Validate everything and resolve the typed run settings.
    pub fn into_settings(self, overrides: &Overrides) -> Result<RunSettings, ConfigError> {
        let base_url = validate_base_url(
            overrides
                .base_url
                .as_deref()
                .or(self.base_url.as_deref())
                .unwrap_or(DEFAULT_BASE_URL),
        )?;
        let default_scenario = self
            .default_scenario
            .clone()
            .unwrap_or_else(|| DEFAULT_SCENARIO.to_string());
        let run_env = self.env.clone().unwrap_or_default();

        let mut table = self.scenario_table();
        if !overrides.scenarios.is_empty() {
            for name in &overrides.scenarios {
                if !table.contains_key(name) {
                    return Err(ConfigError::UnknownScenario(name.clone()));
                }
            }
            table.retain(|name, _| overrides.scenarios.contains(name));
        }
        if table.is_empty() {
            return Err(ConfigError::NoScenarios);
        }

        let scenarios = table
            .into_iter()
            .map(|(name, cfg)| build_scenario(name, cfg, &run_env, &default_scenario))
            .collect::<Result<Vec<_>, _>>()?;

        let thresholds = match &self.criteria {
            Some(criteria) => parse_thresholds(criteria)?,
            None => Vec::new(),
        };

        Ok(RunSettings {
            base_url,
            default_scenario,
            default_plan: self.default_plan.unwrap_or(PlanKind::HealthCheck),
            token: overrides.token.clone().or(self.token),
            request_timeout: optional_duration(
                "request_timeout",
                self.request_timeout.as_deref(),
                Duration::from_secs(30),
            )?,
            tick: optional_duration("tick", self.tick.as_deref(), Duration::from_millis(100))?
                .max(Duration::from_millis(1)),
            graceful_stop: optional_duration("stop", self.stop.as_deref(), Duration::from_secs(30))?,
            scenarios,
            thresholds,
        })
    }
}

fn build_scenario(
    name: String,
    cfg: ScenarioConfig,
    run_env: &HashMap<String, String>,
    default_scenario: &str,
) -> Result<Scenario, ConfigError> {
    let field = |f: &str| format!("scenarios.{}.{}", name, f);
    let start_time = optional_duration(&field("start_time"), cfg.start_time.as_deref(), Duration::ZERO)?;

    let ramping = match cfg.executor.as_deref() {
        None => cfg.schedule.is_some(),
        Some("ramping-vus" | "ramping-workers") => true,
        Some("constant-vus" | "constant-workers") => false,
        Some(other) => {
            return Err(ConfigError::UnknownExecutor {
                scenario: name.clone(),
                executor: other.to_string(),
            })
        }
    };

    let mode = if ramping {
        let steps = cfg.schedule.as_deref().unwrap_or_default();
        if steps.is_empty() {
            return Err(ConfigError::EmptySchedule(name.clone()));
        }
        let stages = steps
            .iter()
            .map(|s| Ok(Stage::new(duration_field(field("schedule"), &s.duration)?, s.target)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        ExecutionMode::RampingWorkers {
            start_workers: cfg.start_workers.unwrap_or(0),
            stages,
        }
    } else {
        let duration = cfg
            .duration
            .as_deref()
            .ok_or_else(|| ConfigError::MissingDuration(name.clone()))?;
        ExecutionMode::ConstantWorkers {
            workers: cfg.workers.unwrap_or(1),
            duration: duration_field(field("duration"), duration)?,
        }
    };

    let end_offset = mode
        .checked_duration()
        .and_then(|length| start_time.checked_add(length));
    if end_offset.map_or(true, |end| end > MAX_DURATION) {
        return Err(ConfigError::InvalidDuration {
            field: field("schedule"),
            value: "start_time plus schedule length exceeds 584 years".to_string(),
        });
    }

    let mut env = run_env.clone();
    env.extend(cfg.env.unwrap_or_default());
    let mut tags = cfg.tags.unwrap_or_default();
    tags.entry("scenario".to_string())
        .or_insert_with(|| name.clone());

    let identifier = plan::identifier(&env, default_scenario).to_string();
    let think_time = match &cfg.sleep {
        None => builtin_think_time(&identifier),
        Some(SleepConfig::Fixed(d)) => ThinkTime::Fixed(duration_field(field("sleep"), d)?),
        Some(SleepConfig::Range { min, max }) => {
            let min = duration_field(field("sleep.min"), min)?;
            let max = duration_field(field("sleep.max"), max)?;
            if min > max {
                return Err(ConfigError::InvalidThinkTime(name.clone()));
            }
            ThinkTime::Uniform { min, max }
        }
    };
    let latency_budget = match &cfg.latency_budget {
        Some(d) => duration_field(field("latency_budget"), d)?,
        None => builtin_latency_budget(&identifier),
    };

    let checks = cfg
        .checks
        .unwrap_or_default()
        .into_iter()
        .map(|c| {
            let predicate = match c.predicate {
                PredicateConfig::Status(code) => Predicate::StatusEquals(code),
                PredicateConfig::LatencyBelow(bound) => Predicate::LatencyBelow(
                    parse_duration_str(&bound).ok_or_else(|| ConfigError::InvalidCheck {
                        scenario: name.clone(),
                        check: c.name.clone(),
                        reason: format!("invalid duration '{}'", bound),
                    })?,
                ),
                PredicateConfig::BodyField { field, equals } => {
                    if field.trim().is_empty() {
                        return Err(ConfigError::InvalidCheck {
                            scenario: name.clone(),
                            check: c.name.clone(),
                            reason: "empty body field path".to_string(),
                        });
                    }
                    Predicate::BodyFieldEquals {
                        field,
                        expected: equals,
                    }
                }
            };
            Ok(CheckSpec::new(c.name, predicate))
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    Ok(Scenario {
        name,
        start_time,
        mode,
        env,
        tags,
        think_time,
        latency_budget,
        plan: cfg.plan,
        checks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::schema_for;
    use tempfile::TempDir;

    fn settings(yaml: &str) -> Result<RunSettings, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.into_settings(&Overrides::default())
    }

    const PROFILE_TABLE: &str = r#"
base_url: "http://localhost:3000"
scenarios:
  load:
    executor: ramping-vus
    startVUs: 0
    stages:
      - { duration: "2m", target: 100 }
      - { duration: "5m", target: 100 }
      - { duration: "2m", target: 0 }
    env: { SCENARIO: load }
    tags: { scenario: load }
  soak:
    executor: constant-vus
    vus: 50
    duration: "2h"
    startTime: "10m"
    env: { SCENARIO: soak }
thresholds:
  http_req_duration: ["p(95)<500"]
  http_req_failed: ["rate<0.01"]
"#;

    #[test]
    fn test_config_schema() {
        let schema = schema_for!(Config);
        let schema_json = serde_json::to_string(&schema).unwrap();
        assert!(schema_json.contains("scenarios"));
        assert!(schema_json.contains("schedule"));
        assert!(schema_json.contains("criteria"));
    }

    #[test]
    fn test_k6_style_profile_table() {
        let settings = settings(PROFILE_TABLE).unwrap();
        assert_eq!(settings.scenarios.len(), 2);

        let load = &settings.scenarios[0];
        assert_eq!(load.name, "load");
        assert_eq!(load.mode.total_duration(), Duration::from_secs(9 * 60));
        assert_eq!(load.mode.peak_workers(), 100);
        assert_eq!(load.think_time, builtin_think_time("load"));

        let soak = &settings.scenarios[1];
        assert_eq!(
            soak.mode,
            ExecutionMode::ConstantWorkers {
                workers: 50,
                duration: Duration::from_secs(7200)
            }
        );
        assert_eq!(soak.start_time, Duration::from_secs(600));
        assert_eq!(soak.tags["scenario"], "soak");

        assert_eq!(settings.thresholds.len(), 2);
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.tick, Duration::from_millis(100));
        assert_eq!(settings.graceful_stop, Duration::from_secs(30));
    }

    #[test]
    fn test_json_config() {
        let json = r#"{"scenarios":{"smoke":{"vus":1,"duration":"30s","env":{"SCENARIO":"smoke"}}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let settings = config.into_settings(&Overrides::default()).unwrap();
        assert_eq!(settings.scenarios[0].latency_budget, Duration::from_millis(200));
    }

    #[test]
    fn test_implicit_single_scenario() {
        let settings = settings("workers: 10\nduration: 30s\n").unwrap();
        assert_eq!(settings.scenarios.len(), 1);
        assert_eq!(settings.scenarios[0].name, IMPLICIT_SCENARIO);
        assert_eq!(settings.scenarios[0].mode.peak_workers(), 10);
    }

    #[test]
    fn test_empty_config_has_no_scenarios() {
        assert!(matches!(settings("{}"), Err(ConfigError::NoScenarios)));
    }

    #[test]
    fn test_scenario_selection() {
        let config: Config = serde_yaml::from_str(PROFILE_TABLE).unwrap();
        let overrides = Overrides {
            scenarios: vec!["soak".to_string()],
            ..Default::default()
        };
        let settings = config.clone().into_settings(&overrides).unwrap();
        assert_eq!(settings.scenarios.len(), 1);
        assert_eq!(settings.scenarios[0].name, "soak");

        let overrides = Overrides {
            scenarios: vec!["breakpoint".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            config.into_settings(&overrides),
            Err(ConfigError::UnknownScenario(name)) if name == "breakpoint"
        ));
    }

    #[test]
    fn test_overrides_win() {
        let config: Config = serde_yaml::from_str(PROFILE_TABLE).unwrap();
        let overrides = Overrides {
            base_url: Some("https://staging.example.com/".to_string()),
            token: Some("secret".to_string()),
            scenarios: Vec::new(),
        };
        let settings = config.into_settings(&overrides).unwrap();
        assert_eq!(settings.base_url, "https://staging.example.com");
        assert_eq!(settings.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_run_env_is_merged_under_scenario_env() {
        let settings = settings(
            r#"
env: { SCENARIO: stress, REGION: eu }
scenarios:
  a: { duration: 1s }
  b: { duration: 1s, env: { SCENARIO: spike } }
"#,
        )
        .unwrap();
        assert_eq!(settings.scenarios[0].env["SCENARIO"], "stress");
        assert_eq!(settings.scenarios[1].env["SCENARIO"], "spike");
        assert_eq!(settings.scenarios[1].env["REGION"], "eu");
        assert_eq!(settings.scenarios[1].think_time, builtin_think_time("spike"));
    }

    #[test]
    fn test_invalid_configs() {
        let cases = [
            ("scenarios: { a: { executor: ramping-vus } }", "EmptySchedule"),
            ("scenarios: { a: { executor: per-vu-iterations, duration: 1s } }", "UnknownExecutor"),
            ("scenarios: { a: { workers: 3 } }", "MissingDuration"),
            ("scenarios: { a: { duration: forever } }", "InvalidDuration"),
            ("scenarios: { a: { duration: 6000000h } }", "InvalidDuration"),
            (
                "scenarios: { a: { stages: [{ duration: \"18446744073709551615\", target: 1 }, { duration: \"18446744073709551615\", target: 0 }] } }",
                "InvalidDuration",
            ),
            (
                "scenarios: { a: { stages: [{ duration: 4000000h, target: 1 }, { duration: 4000000h, target: 0 }] } }",
                "InvalidDuration",
            ),
            (
                "scenarios: { a: { startTime: 4000000h, duration: 4000000h } }",
                "InvalidDuration",
            ),
            ("scenarios: { a: { duration: 1s, sleep: { min: 3s, max: 1s } } }", "InvalidThinkTime"),
            ("base_url: localhost\nscenarios: { a: { duration: 1s } }", "InvalidBaseUrl"),
            ("scenarios: { a: { duration: 1s } }\nthresholds: { http_req_duration: [\"p95 ~ 3\"] }", "Threshold"),
            ("scenarios: { a: { duration: 1s } }\nthresholds: { vus: [\"value<3\"] }", "Threshold"),
        ];
        for (yaml, expected) in cases {
            let err = settings(yaml).unwrap_err();
            assert!(
                format!("{:?}", err).starts_with(expected),
                "{} gave {:?}",
                yaml,
                err
            );
        }
    }

    #[test]
    fn test_sleep_and_checks() {
        let run = settings(
            r#"
scenarios:
  smoke:
    duration: 10s
    sleep: 250ms
    latency_budget: 150ms
    plan: create-item
    checks:
      - name: has id
        body_field: { field: id, equals: 1 }
      - name: created
        status: 201
      - name: fast
        latency_below: 50ms
"#,
        )
        .unwrap();
        let smoke = &run.scenarios[0];
        assert_eq!(smoke.think_time, ThinkTime::Fixed(Duration::from_millis(250)));
        assert_eq!(smoke.latency_budget, Duration::from_millis(150));
        assert_eq!(smoke.plan, Some(PlanKind::CreateItem));
        assert_eq!(smoke.checks.len(), 3);
        assert_eq!(smoke.checks[1].predicate, Predicate::StatusEquals(201));
        assert_eq!(
            smoke.checks[2].predicate,
            Predicate::LatencyBelow(Duration::from_millis(50))
        );

        let ranged = settings("scenarios: { a: { duration: 1s, sleep: { min: 1s, max: 3s } } }").unwrap();
        assert_eq!(
            ranged.scenarios[0].think_time,
            ThinkTime::Uniform {
                min: Duration::from_secs(1),
                max: Duration::from_secs(3)
            }
        );
    }

    #[test]
    fn test_load_from_files() {
        let dir = TempDir::new().unwrap();
        let yaml_path = dir.path().join("volley.yaml");
        std::fs::write(&yaml_path, PROFILE_TABLE).unwrap();
        assert!(Config::load(&yaml_path).unwrap().scenarios.is_some());

        let json_path = dir.path().join("volley.json");
        std::fs::write(&json_path, r#"{"workers": 2, "duration": "5s"}"#).unwrap();
        assert_eq!(Config::load(&json_path).unwrap().workers, Some(2));

        let broken = dir.path().join("broken.yaml");
        std::fs::write(&broken, "invalid: [yaml: content").unwrap();
        assert!(matches!(Config::load(&broken), Err(ConfigError::Parse { .. })));

        assert!(matches!(
            Config::load(&dir.path().join("missing.yaml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
