use anyhow::Result;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "volley.yaml";

const DEFAULT_CONFIG: &str = r#"# volley profile table
# Run all profiles:      volley run volley.yaml
# Run a single profile:  volley run volley.yaml --scenario smoke
# Start a local target:  volley serve --port 3000

base_url: http://localhost:3000
default_scenario: smoke
request_timeout: 30s
stop: 30s

scenarios:
  # Quick sanity pass with minimal load
  smoke:
    executor: constant-vus
    vus: 1
    duration: 1m
    env: { SCENARIO: smoke }
    tags: { scenario: smoke }

  # Sustained moderate load
  load:
    executor: ramping-vus
    startVUs: 0
    stages:
      - { duration: 2m, target: 100 }
      - { duration: 5m, target: 100 }
      - { duration: 2m, target: 0 }
    env: { SCENARIO: load }
    tags: { scenario: load }

  # Heavy load to find breaking points
  stress:
    executor: ramping-vus
    startVUs: 0
    stages:
      - { duration: 3m, target: 200 }
      - { duration: 5m, target: 200 }
      - { duration: 3m, target: 300 }
      - { duration: 2m, target: 0 }
    env: { SCENARIO: stress }
    tags: { scenario: stress }

  # Sudden burst of traffic
  spike:
    executor: ramping-vus
    startVUs: 0
    stages:
      - { duration: 30s, target: 0 }
      - { duration: 30s, target: 500 }
      - { duration: 1m, target: 500 }
      - { duration: 30s, target: 0 }
    env: { SCENARIO: spike }
    tags: { scenario: spike }

  # Long run at steady load
  soak:
    executor: constant-vus
    vus: 50
    duration: 2h
    env: { SCENARIO: soak }
    tags: { scenario: soak }

# Pass/fail criteria
thresholds:
  http_req_duration:
    - threshold: p(95)<500
      abortOnFail: true
      delayAbortEval: 10s
    - p(95)<1000
  http_req_failed:
    - rate<0.01
"#;

/// Write a starter profile table.
pub fn run_init(output: Option<&Path>) -> Result<()> {
    let config_path = output.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));

    if config_path.exists() {
        anyhow::bail!(
            "File already exists: {:?}. Remove it first or choose a different output path.",
            config_path
        );
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    fs::write(config_path, DEFAULT_CONFIG)?;
    println!("✓ Created {}", config_path.display());

    println!("\nRun a profile with:");
    println!("  volley run {} --scenario smoke", config_path.display());

    Ok(())
}
