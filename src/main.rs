use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use warden::alerts::AlertId;
use warden::config::Config;
use warden::error::{AlertError, ConfigError, PipelineError};
use warden::events::{HealthEvent, Observation};
use warden::notify::LogNotifier;
use warden::pipeline::{PipelineOutcome, RemediationPipeline};

/// Command-line arguments for the remediation engine
#[derive(Parser)]
#[command(
    name = "warden",
    about = "Closed-loop infrastructure remediation engine",
    long_about = "Reads observations and health events as JSON lines, groups them into alerts, \
                  diagnoses them with language models, and runs guarded remediation actions \
                  with a full audit trail."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Never run disruptive actions
    #[arg(long, help = "Simulate disruptive actions instead of running them")]
    dry_run: bool,

    /// Read input records from a file instead of stdin
    #[arg(short, long, value_name = "FILE", help = "JSON lines input file (default: stdin)")]
    input: Option<PathBuf>,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// # Returns
    ///
    /// `Ok(())` if all arguments are valid, `Err(String)` with error message otherwise
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            // Missing files fall back to defaults in load_config
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }

        if let Some(ref input) = self.input {
            if !input.is_file() {
                return Err(format!("Input file not found: {}", input.display()));
            }
        }

        Ok(())
    }

    /// Convert config path to string safely, handling non-UTF-8 paths
    ///
    /// # Returns
    ///
    /// `Ok(Some(path_str))` if config is provided and valid UTF-8,
    /// `Ok(None)` if no config provided,
    /// `Err(String)` if config path contains invalid UTF-8
    fn config_path_str(&self) -> Result<Option<&str>, String> {
        match &self.config {
            Some(path) => match path.to_str() {
                Some(path_str) => Ok(Some(path_str)),
                None => Err(format!(
                    "Configuration file path contains invalid UTF-8 characters: {}",
                    path.display()
                )),
            },
            None => Ok(None),
        }
    }
}

/// One line of input
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputRecord {
    Observation(Observation),
    Health(HealthEvent),
    Approve {
        alert_id: AlertId,
        by: String,
    },
    Reject {
        alert_id: AlertId,
        by: String,
        #[serde(default)]
        reason: String,
    },
    Acknowledge {
        alert_id: AlertId,
        by: String,
    },
    Resolve {
        alert_id: AlertId,
        by: String,
        #[serde(default)]
        reason: String,
    },
    Reanalyze {
        alert_id: AlertId,
    },
}

type ChainResult = Result<PipelineOutcome, PipelineError>;

/// Wires the pipeline to its input stream, ticker and shutdown signal
struct Warden {
    pipeline: Arc<RemediationPipeline>,
    tick_interval: Duration,
    chains: JoinSet<ChainResult>,
}

impl Warden {
    /// Create the pipeline described by `config`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the remediation target, a model backend or
    /// the audit file cannot be set up.
    fn new(config: Config) -> Result<Self, ConfigError> {
        info!(
            "Initializing pipeline ({} backend(s), dry_run={})",
            config.llm.backends.len(),
            config.executor.dry_run
        );
        let target = Arc::new(config.executor.command_target()?);
        let pipeline = RemediationPipeline::from_config(&config, target, Arc::new(LogNotifier))?;

        Ok(Self {
            pipeline: Arc::new(pipeline),
            tick_interval: Duration::from_secs(config.pipeline.tick_interval_secs),
            chains: JoinSet::new(),
        })
    }

    /// Load configuration from file or use defaults
    ///
    /// # Arguments
    ///
    /// * `config_path` - Optional path to configuration file
    ///
    /// # Returns
    ///
    /// Loaded configuration or default configuration if file not found or invalid
    fn load_config(config_path: Option<&str>) -> Result<Config, ConfigError> {
        match config_path {
            Some(path) => {
                info!("Loading configuration from: {}", path);
                match Config::from_file(std::path::Path::new(path)) {
                    Ok(config) => Ok(config),
                    Err(ConfigError::ReadError(_)) => {
                        warn!(
                            "Configuration file '{}' not found or unreadable, using defaults",
                            path
                        );
                        Ok(Config::default())
                    }
                    Err(e) => {
                        error!("Configuration error in '{}': {}", path, e);
                        warn!("Using default configuration due to invalid config file");
                        Ok(Config::default())
                    }
                }
            }
            None => {
                info!("Using default configuration");
                let mut config = Config::default();
                config.apply_env();
                Ok(config)
            }
        }
    }

    /// Process input until it ends or a shutdown is requested
    ///
    /// Chains still running when the input ends are awaited; a shutdown
    /// abandons them.
    async fn run(
        &mut self,
        input: Box<dyn AsyncRead + Unpin + Send>,
        shutdown: Arc<Notify>,
    ) -> anyhow::Result<()> {
        let mut lines = BufReader::new(input).lines();
        let mut ticker = tokio::time::interval(self.tick_interval);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Shutdown signal received");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let report = self.pipeline.tick(Utc::now());
                    debug!(
                        "Telemetry: {} observation(s)/min, {} action(s) allowed, {} heuristic diagnoses",
                        report.telemetry.observations_per_minute,
                        report.telemetry.actions_allowed,
                        report.telemetry.heuristic_diagnoses
                    );
                }
                Some(joined) = self.chains.join_next(), if !self.chains.is_empty() => {
                    log_chain_result(joined);
                }
                line = lines.next_line() => match line.context("reading input")? {
                    Some(line) => self.dispatch(&line),
                    None => break,
                },
            }
        }

        info!(
            "Input closed, waiting for {} running chain(s)",
            self.chains.len()
        );
        while !self.chains.is_empty() {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Shutdown signal received");
                    break;
                }
                Some(joined) = self.chains.join_next() => log_chain_result(joined),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let record: InputRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping malformed input line: {}", e);
                return;
            }
        };

        let pipeline = Arc::clone(&self.pipeline);
        match record {
            InputRecord::Observation(observation) => {
                self.chains
                    .spawn(async move { pipeline.process(observation).await });
            }
            InputRecord::Health(event) => {
                self.chains
                    .spawn(async move { pipeline.health_changed(event).await });
            }
            InputRecord::Reanalyze { alert_id } => {
                self.chains
                    .spawn(async move { pipeline.reanalyze(alert_id).await });
            }
            InputRecord::Approve { alert_id, by } => {
                report("approve", alert_id, pipeline.approve(alert_id, &by).map(|_| ()));
            }
            InputRecord::Reject {
                alert_id,
                by,
                reason,
            } => {
                report(
                    "reject",
                    alert_id,
                    pipeline.reject(alert_id, &by, &reason).map(|_| ()),
                );
            }
            InputRecord::Acknowledge { alert_id, by } => {
                report(
                    "acknowledge",
                    alert_id,
                    pipeline.acknowledge(alert_id, &by).map(|_| ()),
                );
            }
            InputRecord::Resolve {
                alert_id,
                by,
                reason,
            } => {
                report(
                    "resolve",
                    alert_id,
                    pipeline.resolve(alert_id, &by, &reason).map(|_| ()),
                );
            }
        }
    }

    /// Abandon running chains and close the audit trail
    fn stop(&mut self) {
        if !self.chains.is_empty() {
            warn!("Abandoning {} running chain(s)", self.chains.len());
            self.chains.abort_all();
        }
        self.pipeline.shutdown();

        let counts = self.pipeline.audit().counts();
        info!("Audit summary: {:?}", counts);
        let stats = self.pipeline.alerts().stats();
        info!(
            "Alerts: {} open, {} acknowledged, {} archived",
            stats.open, stats.acknowledged, stats.archived
        );
    }
}

fn report(command: &str, alert_id: AlertId, result: Result<(), PipelineError>) {
    match result {
        Ok(()) => info!("{} for alert {} applied", command, alert_id),
        Err(e) => warn!("{} for alert {} failed: {}", command, alert_id, e),
    }
}

fn log_chain_result(joined: Result<ChainResult, JoinError>) {
    match joined {
        Ok(Ok(PipelineOutcome::Executed(record))) => info!(
            "Alert {}: {} on {} -> {}",
            record.alert_id,
            record.proposal.kind,
            record.proposal.target,
            record
                .result
                .as_ref()
                .map(|r| r.detail.as_str())
                .unwrap_or("no result")
        ),
        Ok(Ok(PipelineOutcome::Denied(record))) => {
            info!(
                "Alert {}: {} on {} denied",
                record.alert_id, record.proposal.kind, record.proposal.target
            )
        }
        Ok(Ok(outcome)) => debug!("Chain finished: {:?}", outcome),
        Ok(Err(PipelineError::Alert(AlertError::Suppressed(service)))) => {
            debug!("Observation for suppressed service {} dropped", service)
        }
        Ok(Err(e)) => warn!("Chain failed: {}", e),
        Err(e) if e.is_cancelled() => debug!("Chain cancelled"),
        Err(e) => error!("Chain task panicked: {}", e),
    }
}

async fn open_input(path: Option<&PathBuf>) -> anyhow::Result<Box<dyn AsyncRead + Unpin + Send>> {
    match path {
        Some(path) => {
            info!("Reading input from {}", path.display());
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?;
            Ok(Box::new(file))
        }
        None => {
            info!("Reading input from stdin");
            Ok(Box::new(tokio::io::stdin()))
        }
    }
}

#[tokio::main]
async fn main() {
    // Parse command-line arguments
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting warden");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let config_path = match cli.config_path_str() {
        Ok(path) => path,
        Err(e) => {
            error!("Invalid configuration path: {}", e);
            std::process::exit(1);
        }
    };

    let mut config = match Warden::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if cli.dry_run {
        config.executor.dry_run = true;
    }

    let mut warden = match Warden::new(config) {
        Ok(warden) => warden,
        Err(e) => {
            error!("Failed to initialize pipeline: {}", e);
            std::process::exit(1);
        }
    };

    let input = match open_input(cli.input.as_ref()).await {
        Ok(input) => input,
        Err(e) => {
            error!("Failed to open input: {:#}", e);
            std::process::exit(1);
        }
    };

    // SIGINT only; the pipeline drains on input EOF otherwise
    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        signal.notify_one();
    }) {
        error!("Error setting SIGINT handler: {}", e);
        std::process::exit(1);
    }

    info!("Warden is running. Press Ctrl+C to stop.");

    if let Err(e) = warden.run(input, shutdown).await {
        error!("Input stopped: {:#}", e);
    }

    warden.stop();
    info!("Warden shutdown complete");
}
