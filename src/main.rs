use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use volley::cli::config::{Config, Overrides};
use volley::engine::Engine;
use volley::server::DEFAULT_CAPACITY;

/// Exit code for a run that completed but failed its thresholds.
const THRESHOLDS_FAILED_EXIT_CODE: i32 = 99;

#[derive(Parser)]
#[command(name = "volley")]
#[command(about = "Traffic-profile driven HTTP load generator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct OverrideArgs {
    /// Run only these scenarios (comma separated)
    #[arg(short, long = "scenario", env = "VOLLEY_SCENARIO", value_delimiter = ',')]
    scenarios: Vec<String>,
    /// Target base URL, overriding the config file
    #[arg(long, env = "VOLLEY_BASE_URL")]
    base_url: Option<String>,
    /// Bearer token sent with every request
    #[arg(long, env = "VOLLEY_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl From<OverrideArgs> for Overrides {
    fn from(args: OverrideArgs) -> Self {
        Overrides {
            base_url: args.base_url,
            token: args.token,
            scenarios: args.scenarios,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scenarios of a profile table
    Run {
        /// Path to the profile table (YAML/JSON)
        config: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
        /// Print the final summary as JSON instead of text
        #[arg(long)]
        json: bool,
        /// Export final summary to a JSON file
        #[arg(long)]
        export_json: Option<PathBuf>,
        /// Output configuration (e.g., --out csv=results.csv)
        #[arg(long)]
        out: Option<String>,
    },
    /// Start the companion test server
    Serve {
        #[arg(short, long, env = "PORT", default_value_t = 3000)]
        port: u16,
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,
        /// Maximum number of stored items; the oldest are evicted
        #[arg(long, default_value_t = DEFAULT_CAPACITY)]
        capacity: usize,
    },
    /// Validate a profile table without running it
    Validate {
        config: PathBuf,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Write a starter profile table
    Init {
        /// Output file path (default: volley.yaml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the JSON schema of the profile table
    Schema {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Run {
            config,
            overrides,
            json,
            export_json,
            out,
        } => {
            let settings = Config::load(&config)?.into_settings(&overrides.into())?;
            let engine = Engine::new();
            let report = engine.run(settings)?;

            if json {
                println!("{}", report.to_json());
            } else {
                report.print_summary();
            }

            if let Some(path) = export_json {
                std::fs::write(&path, report.to_json())?;
                println!("Summary written to {}", path.display());
            }

            if let Some(out_config) = out {
                if let Some(path) = out_config.strip_prefix("csv=") {
                    println!("Exporting metrics to CSV: {}", path);
                    let csv_content = volley::stats::csv::generate_csv(&report);
                    if let Err(e) = std::fs::write(path, csv_content) {
                        eprintln!("CSV export failed: {}", e);
                    } else {
                        println!("CSV export successful!");
                    }
                } else {
                    eprintln!("Unsupported output '{}'. Expected csv=<path>", out_config);
                }
            }

            if !report.thresholds_passed() {
                eprintln!("Thresholds failed.");
                std::process::exit(THRESHOLDS_FAILED_EXIT_CODE);
            }
            Ok(())
        }
        Commands::Serve {
            port,
            host,
            capacity,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(volley::server::run(SocketAddr::new(host, port), capacity))
        }
        Commands::Validate { config, overrides } => {
            volley::cli::validate::run_validate(&config, &overrides.into())
        }
        Commands::Init { output } => volley::cli::init::run_init(output.as_deref()),
        Commands::Schema { output } => {
            let schema = schemars::schema_for!(Config);
            let schema_json = serde_json::to_string_pretty(&schema)?;
            if let Some(out_path) = output {
                std::fs::write(&out_path, schema_json)?;
                println!("JSON Schema written to {:?}", out_path);
            } else {
                println!("{}", schema_json);
            }
            Ok(())
        }
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "volley", &mut std::io::stdout());
            Ok(())
        }
    }
}
