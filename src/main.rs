use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use emergency_reasoning::{
    config::{Config, LogFormat},
    error::{PipelineError, StageError},
    graph::SelectionPolicy,
    incident::SAMPLE_INCIDENT,
    inference::{ChatCompletionsClient, InferenceAdapter},
    prompts::ChemicalPromptBuilder,
    schema::chemical_schemas,
    DebugDump, Pipeline, PipelineRun, Report, RunFailure,
};

const EXIT_INPUT: u8 = 1;
const EXIT_STAGE: u8 = 2;
const EXIT_CANCELLED: u8 = 3;
const EXIT_REPORT: u8 = 4;

/// Produce a validated emergency response plan for a chemical accident.
#[derive(Debug, Parser)]
#[command(name = "emergency-reasoning", version, about)]
struct Cli {
    /// Incident description file, or `-` to read standard input.
    #[arg(short, long, value_name = "PATH", required_unless_present = "sample")]
    input: Option<PathBuf>,

    /// Use the built-in sample incident instead of --input.
    #[arg(long, conflicts_with = "input")]
    sample: bool,

    /// Report path (overrides OUTPUT_PATH).
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Write the run event log as JSON Lines.
    #[arg(long, value_name = "PATH")]
    run_log: Option<PathBuf>,

    /// Write every stage's document and nodes as JSON, even on failure.
    #[arg(long, value_name = "PATH")]
    debug_dump: Option<PathBuf>,

    /// Reuse completions for repeated prompts (sets INFERENCE_CACHE).
    #[arg(long)]
    cache: bool,

    #[arg(long)]
    branching_factor: Option<usize>,

    #[arg(long)]
    keep_best_k: Option<usize>,

    /// `clamp` or `strict`.
    #[arg(long)]
    selection_policy: Option<SelectionPolicy>,

    #[arg(long)]
    max_concurrency: Option<usize>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if self.cache {
            config.request.cache_responses = true;
        }
        let pipeline = &mut config.pipeline;
        if let Some(path) = &self.output {
            pipeline.output_path = path.clone();
        }
        if let Some(b) = self.branching_factor {
            pipeline.branching_factor = b;
        }
        if let Some(k) = self.keep_best_k {
            pipeline.keep_best_k = k;
        }
        if let Some(policy) = self.selection_policy {
            pipeline.selection_policy = policy;
        }
        if let Some(n) = self.max_concurrency {
            pipeline.max_concurrency = n;
        }
    }

    fn read_incident(&self) -> anyhow::Result<String> {
        if self.sample {
            return Ok(SAMPLE_INCIDENT.to_string());
        }
        match self.input.as_deref() {
            Some(path) if path.as_os_str() == "-" => {
                let mut text = String::new();
                std::io::stdin()
                    .read_to_string(&mut text)
                    .context("failed to read incident from stdin")?;
                Ok(text)
            }
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read incident from {}", path.display())),
            None => anyhow::bail!("no incident given; use --input or --sample"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(EXIT_INPUT);
        }
    };
    cli.apply(&mut config);

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        model = %config.inference.model,
        "Emergency reasoning starting..."
    );

    match run(&cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

async fn run(cli: &Cli, config: Config) -> Result<(), u8> {
    let incident = cli.read_incident().map_err(|e| {
        eprintln!("Input error: {:#}", e);
        EXIT_INPUT
    })?;

    let client = ChatCompletionsClient::new(&config.inference, &config.request).map_err(|e| {
        error!(error = %e, "Failed to initialize inference client");
        eprintln!("Configuration error: {}", e);
        EXIT_INPUT
    })?;
    info!(base_url = %client.base_url(), "Inference client initialized");

    let adapter = InferenceAdapter::from_config(
        Arc::new(client),
        &config.inference,
        &config.request,
        &config.pipeline,
    );
    let schemas = chemical_schemas().map_err(|e| {
        eprintln!("Schema error: {}", e);
        EXIT_INPUT
    })?;

    let cancel = CancellationToken::new();
    let pipeline = Pipeline::new(
        config.pipeline.clone(),
        Arc::new(adapter),
        Arc::new(ChemicalPromptBuilder::new()),
        schemas,
    )
    .map_err(|e| {
        eprintln!("Configuration error: {}", e);
        EXIT_INPUT
    })?
    .with_cancellation(cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    match pipeline.run(&incident).await {
        Ok(run) => {
            dump_run_log(cli, &run);
            dump_debug(cli, &run);
            log_usage(&run);
            let report = Report::from_run(&run).map_err(|e| {
                eprintln!("Report error: {}", e);
                EXIT_REPORT
            })?;
            report
                .write_atomic(&config.pipeline.output_path)
                .map_err(|e| {
                    eprintln!("Report error: {}", e);
                    EXIT_REPORT
                })?;
            eprintln!(
                "Emergency response plan written to {}",
                config.pipeline.output_path.display()
            );
            Ok(())
        }
        Err(failure) => {
            dump_run_log(cli, &failure.run);
            dump_debug(cli, &failure.run);
            log_usage(&failure.run);
            Err(report_failure(&failure))
        }
    }
}

/// Print what failed and where, and pick the exit code.
fn report_failure(failure: &RunFailure) -> u8 {
    eprintln!("Run failed: {}", failure.error);
    if let Some(stage) = failure.error.stage() {
        eprintln!("  stage: {}", stage);
    }
    if let PipelineError::Stage { source, .. } = &failure.error {
        if let Some(label) = source.operation_label() {
            eprintln!("  operation: {}", label);
        }
        if let StageError::Schema(violation) = source {
            for issue in &violation.issues {
                eprintln!("  {:?} {}: {}", issue.kind, issue.path, issue.message);
            }
        }
    }

    match &failure.error {
        PipelineError::InvalidInput { .. } => EXIT_INPUT,
        PipelineError::Stage {
            source: StageError::Graph(_),
            ..
        } => EXIT_INPUT,
        PipelineError::Stage { .. } => EXIT_STAGE,
        PipelineError::Cancelled { .. } => EXIT_CANCELLED,
        PipelineError::Report { .. } => EXIT_REPORT,
    }
}

fn dump_run_log(cli: &Cli, run: &PipelineRun) {
    if let Some(path) = &cli.run_log {
        match run.log().write_jsonl(path) {
            Ok(()) => info!(path = %path.display(), events = run.log().len(), "Run log written"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write run log"),
        }
    }
}

fn dump_debug(cli: &Cli, run: &PipelineRun) {
    if let Some(path) = &cli.debug_dump {
        if let Err(e) = DebugDump::from_run(run).write_atomic(path) {
            warn!(path = %path.display(), error = %e, "Failed to write debug dump");
        }
    }
}

fn log_usage(run: &PipelineRun) {
    if let Some(usage) = run.usage {
        info!(
            run_id = %run.id,
            status = ?run.status,
            calls = usage.calls,
            failed_calls = usage.failed_calls,
            retries = usage.retries,
            cache_hits = usage.cache_hits,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            cost = usage.cost,
            "Inference usage"
        );
    }
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
