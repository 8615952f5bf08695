use anyhow::Result;
use std::path::Path;

use crate::cli::config::{Config, Overrides};
use crate::engine::scenario::ExecutionMode;
use crate::utils::format_duration;

/// Validate a profile table without running it: parse the file, resolve
/// every scenario and threshold, and print what a run would do.
pub fn run_validate(config_path: &Path, overrides: &Overrides) -> Result<()> {
    println!("Validating {}...", config_path.display());

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("  ✗ {}", e);
            return Err(e.into());
        }
    };
    println!("  ✓ Config file parsed");

    let settings = match config.into_settings(overrides) {
        Ok(settings) => settings,
        Err(e) => {
            println!("  ✗ Validation failed: {}", e);
            return Err(e.into());
        }
    };

    println!("    base_url: {}", settings.base_url);
    for scenario in &settings.scenarios {
        let shape = match &scenario.mode {
            ExecutionMode::ConstantWorkers { workers, duration } => {
                format!("{} worker(s) for {}", workers, format_duration(*duration))
            }
            ExecutionMode::RampingWorkers { stages, .. } => format!(
                "{} stage(s), peak {} worker(s) over {}",
                stages.len(),
                scenario.mode.peak_workers(),
                format_duration(scenario.mode.total_duration())
            ),
        };
        println!("    scenario {}: {}", scenario.name, shape);
    }
    let rules: usize = settings.thresholds.iter().map(|t| t.rules.len()).sum();
    println!("    thresholds: {} rule(s)", rules);
    println!(
        "  ✓ Configuration valid (total run length {})",
        format_duration(settings.run_length())
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const VALID_CONFIG: &str = r#"
scenarios:
  smoke:
    vus: 1
    duration: 30s
    env: { SCENARIO: smoke }
thresholds:
  http_req_duration: ["p(95)<500"]
"#;

    #[test]
    fn test_validate_valid_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("volley.yaml");
        fs::write(&path, VALID_CONFIG).unwrap();

        assert!(run_validate(&path, &Overrides::default()).is_ok());
    }

    #[test]
    fn test_validate_missing_file() {
        let path = Path::new("/nonexistent/volley.yaml");
        assert!(run_validate(path, &Overrides::default()).is_err());
    }

    #[test]
    fn test_validate_with_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("volley.yaml");
        fs::write(&path, "invalid: [yaml: content").unwrap();

        assert!(run_validate(&path, &Overrides::default()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("volley.yaml");
        fs::write(
            &path,
            "scenarios: { smoke: { duration: 1s } }\nthresholds: { http_req_duration: [\"fast\"] }\n",
        )
        .unwrap();

        assert!(run_validate(&path, &Overrides::default()).is_err());
    }

    #[test]
    fn test_validate_unknown_selected_scenario() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("volley.yaml");
        fs::write(&path, VALID_CONFIG).unwrap();

        let overrides = Overrides {
            scenarios: vec!["breakpoint".to_string()],
            ..Default::default()
        };
        assert!(run_validate(&path, &overrides).is_err());
    }
}
