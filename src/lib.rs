//! # Emergency Reasoning
//!
//! A Graph-of-Thoughts orchestrator that turns a free-form chemical
//! accident description into a validated emergency response report.
//!
//! ## Features
//!
//! - **Thought graphs**: one DAG of operations per stage, executed in
//!   dependency order with independent operations dispatched concurrently
//! - **Operation library**: `generate`, `aggregate`, `score`,
//!   `keep-best-k` and `refine`, extensible through a handler registry
//! - **Fan-out resilience**: failed candidates are absorbed as long as
//!   enough siblings survive selection
//! - **Inference adapter**: bounded concurrency, per-call timeout, retry
//!   with exponential backoff and jitter, token and cost accounting
//! - **Schema enforcement**: every stage document is validated before the
//!   next stage starts, with one targeted repair pass on violation
//!
//! ## Architecture
//!
//! ```text
//! incident text → situation analysis → impact assessment → response plan → report
//!                      (graph)              (graph)             (graph)
//!                         ↓                    ↓                   ↓
//!                            Inference Adapter → chat completions (HTTP)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use emergency_reasoning::{Config, Pipeline, Report};
//! use emergency_reasoning::inference::{ChatCompletionsClient, InferenceAdapter};
//! use emergency_reasoning::prompts::ChemicalPromptBuilder;
//! use emergency_reasoning::schema::chemical_schemas;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let client = ChatCompletionsClient::new(&config.inference, &config.request)?;
//!     let adapter = InferenceAdapter::from_config(
//!         Arc::new(client),
//!         &config.inference,
//!         &config.request,
//!         &config.pipeline,
//!     );
//!     let pipeline = Pipeline::new(
//!         config.pipeline.clone(),
//!         Arc::new(adapter),
//!         Arc::new(ChemicalPromptBuilder::new()),
//!         chemical_schemas()?,
//!     )?;
//!     let run = pipeline.run("Chlorine leak at ...").await?;
//!     Report::from_run(&run)?.write_atomic(&config.pipeline.output_path)?;
//!     Ok(())
//! }
//! ```

/// Configuration management.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Scheduler/executor for a single stage graph.
pub mod executor;
/// Thought graph and operation descriptions.
pub mod graph;
/// Incident description checks.
pub mod incident;
/// Inference adapter, chat-completions client and retry policy.
pub mod inference;
/// Operation library and handler registry.
pub mod operations;
/// Three-stage pipeline with targeted repair.
pub mod pipeline;
/// Prompt construction for the chemical emergency domain.
pub mod prompts;
/// Final report artifact.
pub mod report;
/// Append-only run event log.
pub mod runlog;
/// Stage document assembly and schema validation.
pub mod schema;
/// Thought nodes and the node store.
pub mod thought;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use pipeline::{Pipeline, PipelineRun, RunFailure, RunStatus, StageResult};
pub use report::{DebugDump, Report};
