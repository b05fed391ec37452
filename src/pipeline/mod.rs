//! Three-stage reasoning pipeline.
//!
//! Stages run strictly in order. Each stage executes its own graph,
//! assembles the terminal outputs into a document and validates it before
//! the next stage may start. A rejected document gets one targeted repair:
//! only the terminal operations responsible for the violation are re-run,
//! with the violation passed to their prompts.

mod stages;

pub use stages::{default_graph, RESPONSE_PLAN_CRITIQUE};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{GraphError, GraphResult, PipelineError, SchemaViolation, StageError};
use crate::executor::{Executor, StageContext, StageExecution, StagePlan};
use crate::graph::{OperationId, ThoughtGraph};
use crate::incident::Incident;
use crate::inference::{InferenceAdapter, UsageSummary};
use crate::operations::OperationRegistry;
use crate::prompts::PromptBuilder;
use crate::runlog::{RunEventKind, RunLog};
use crate::schema::{assemble, responsible_operations, Contribution, SchemaSet};
use crate::thought::{NodeId, Payload, StageKind, ThoughtNode, ThoughtStore};

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Validated document of one stage. Never recomputed once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub document: Value,
    /// 1 when the first attempt validated, 2 after a repair.
    pub attempts: u32,
}

impl StageResult {
    /// Validate the document again. Leaves the result untouched.
    pub fn revalidate(&self, schemas: &SchemaSet) -> Result<(), SchemaViolation> {
        schemas.validate(self.stage, &self.document)
    }
}

/// One invocation of the pipeline and everything it produced.
#[derive(Debug)]
pub struct PipelineRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub results: BTreeMap<StageKind, StageResult>,
    /// Adapter totals when the run finished.
    pub usage: Option<UsageSummary>,
    store: Arc<ThoughtStore>,
    log: Arc<RunLog>,
}

impl PipelineRun {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            results: BTreeMap::new(),
            usage: None,
            store: Arc::new(ThoughtStore::new()),
            log: Arc::new(RunLog::new()),
        }
    }

    /// Every node recorded during the run, including failed ones.
    pub fn store(&self) -> &Arc<ThoughtStore> {
        &self.store
    }

    pub fn log(&self) -> &Arc<RunLog> {
        &self.log
    }

    pub fn result(&self, stage: StageKind) -> Option<&StageResult> {
        self.results.get(&stage)
    }

    /// True once every stage has a validated result.
    pub fn is_complete(&self) -> bool {
        StageKind::ALL.iter().all(|s| self.results.contains_key(s))
    }

    fn finish(&mut self, status: RunStatus, usage: UsageSummary) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.usage = Some(usage);
        self.log.record(None, RunEventKind::RunFinished { status });
    }
}

/// A run that ended without a validated report. Carries the run so its
/// nodes and log remain available for diagnostics.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    pub run: Box<PipelineRun>,
    #[source]
    pub error: PipelineError,
}

/// Runs the three stages over an incident description.
pub struct Pipeline {
    config: PipelineConfig,
    adapter: Arc<InferenceAdapter>,
    registry: Arc<OperationRegistry>,
    prompts: Arc<dyn PromptBuilder>,
    schemas: Arc<SchemaSet>,
    graphs: BTreeMap<StageKind, ThoughtGraph>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Pipeline with the built-in operations and default stage graphs.
    pub fn new(
        config: PipelineConfig,
        adapter: Arc<InferenceAdapter>,
        prompts: Arc<dyn PromptBuilder>,
        schemas: SchemaSet,
    ) -> GraphResult<Self> {
        let graphs = StageKind::ALL
            .into_iter()
            .map(|stage| default_graph(stage, &config).map(|graph| (stage, graph)))
            .collect::<GraphResult<BTreeMap<_, _>>>()?;

        Ok(Self {
            config,
            adapter,
            registry: Arc::new(OperationRegistry::with_builtins()),
            prompts,
            schemas: Arc::new(schemas),
            graphs,
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the operation registry, e.g. to add custom kinds.
    pub fn with_registry(mut self, registry: OperationRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Replace the graph of the stage `graph` belongs to.
    pub fn with_graph(mut self, graph: ThoughtGraph) -> Self {
        self.graphs.insert(graph.stage(), graph);
        self
    }

    /// Token that aborts runs when cancelled.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn graph(&self, stage: StageKind) -> Option<&ThoughtGraph> {
        self.graphs.get(&stage)
    }

    pub fn schemas(&self) -> &SchemaSet {
        &self.schemas
    }

    pub fn adapter(&self) -> &Arc<InferenceAdapter> {
        &self.adapter
    }

    /// Run all stages over `incident`.
    ///
    /// Returns the completed run, or the failed run together with the
    /// error that ended it.
    pub async fn run(&self, incident: &str) -> Result<PipelineRun, RunFailure> {
        let mut run = PipelineRun::new();
        run.log.record(None, RunEventKind::RunStarted { run_id: run.id });
        // Runs sharing this adapter concurrently are not separated.
        let usage_at_start = self.adapter.usage();

        let cancel = self.cancel.child_token();
        let deadline = {
            let cancel = cancel.clone();
            let timeout = self.config.run_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(timeout_secs = timeout.as_secs(), "Run deadline reached, cancelling");
                cancel.cancel();
            })
        };

        let outcome = self.run_stages(&mut run, incident, cancel).await;
        deadline.abort();

        let usage = self.adapter.usage().since(&usage_at_start);
        match outcome {
            Ok(()) => {
                run.finish(RunStatus::Completed, usage);
                info!(
                    run_id = %run.id,
                    nodes = run.store.len(),
                    calls = usage.calls,
                    "Pipeline run completed"
                );
                Ok(run)
            }
            Err(error) => {
                let status = match error {
                    PipelineError::Cancelled { .. } => RunStatus::Cancelled,
                    _ => RunStatus::Failed,
                };
                run.finish(status, usage);
                warn!(run_id = %run.id, error = %error, "Pipeline run failed");
                Err(RunFailure {
                    run: Box::new(run),
                    error,
                })
            }
        }
    }

    async fn run_stages(
        &self,
        run: &mut PipelineRun,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let incident = Incident::parse(text)?;
        let executor = Executor::new(
            Arc::clone(&self.adapter),
            Arc::clone(&self.registry),
            Arc::clone(&self.prompts),
        )
        .with_selection_policy(self.config.selection_policy)
        .with_runlog(Arc::clone(&run.log))
        .with_cancellation(cancel.clone());

        let mut prior: BTreeMap<StageKind, Value> = BTreeMap::new();
        for stage in StageKind::ALL {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled { stage });
            }
            match self
                .run_stage(stage, &executor, &run.store, &incident, &prior)
                .await
            {
                Ok(result) => {
                    prior.insert(stage, result.document.clone());
                    run.results.insert(stage, result);
                }
                Err(StageError::Cancelled) => {
                    run.log.record(
                        Some(stage),
                        RunEventKind::StageFailed {
                            error: StageError::Cancelled.to_string(),
                        },
                    );
                    return Err(PipelineError::Cancelled { stage });
                }
                Err(source) => {
                    run.log.record(
                        Some(stage),
                        RunEventKind::StageFailed {
                            error: source.to_string(),
                        },
                    );
                    return Err(PipelineError::Stage { stage, source });
                }
            }
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        stage: StageKind,
        executor: &Executor,
        store: &Arc<ThoughtStore>,
        incident: &Incident,
        prior: &BTreeMap<StageKind, Value>,
    ) -> Result<StageResult, StageError> {
        let graph = self.graphs.get(&stage).ok_or_else(|| GraphError::Config {
            operation: stage.to_string(),
            message: "no graph configured for stage".to_string(),
        })?;

        store.insert(ThoughtNode::seed(stage, seed_payload(incident, prior)))?;
        let context = StageContext::new(incident.text(), prior.clone());

        let execution = executor
            .run(graph, store, &context, &StagePlan::full())
            .await?;
        let document = stage_document(graph, store, &execution)?;

        let violation = match self.schemas.validate(stage, &document) {
            Ok(()) => {
                executor.runlog().record(
                    Some(stage),
                    RunEventKind::StageValidated {
                        attempt: execution.attempt,
                    },
                );
                return Ok(StageResult {
                    stage,
                    document,
                    attempts: 1,
                });
            }
            Err(violation) => violation,
        };

        executor.runlog().record(
            Some(stage),
            RunEventKind::StageRejected {
                attempt: execution.attempt,
                issues: violation.issues.clone(),
            },
        );

        let responsible = responsible_operations(graph, &violation);
        executor.runlog().record(
            Some(stage),
            RunEventKind::RepairScheduled {
                operations: responsible.iter().copied().collect(),
            },
        );

        let plan = repair_plan(&execution, responsible);
        let repair_context = context.for_repair(violation);
        let repaired = executor.run(graph, store, &repair_context, &plan).await?;
        let document = stage_document(graph, store, &repaired)?;

        if let Err(violation) = self.schemas.validate(stage, &document) {
            executor.runlog().record(
                Some(stage),
                RunEventKind::StageRejected {
                    attempt: repaired.attempt,
                    issues: violation.issues.clone(),
                },
            );
            return Err(violation.into());
        }

        executor.runlog().record(
            Some(stage),
            RunEventKind::StageValidated {
                attempt: repaired.attempt,
            },
        );
        Ok(StageResult {
            stage,
            document,
            attempts: 2,
        })
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("stages", &self.graphs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Stage 1 starts from the incident text; later stages from the documents
/// validated so far.
fn seed_payload(incident: &Incident, prior: &BTreeMap<StageKind, Value>) -> Payload {
    if prior.is_empty() {
        return Payload::Text(incident.text().to_string());
    }
    let documents: Map<String, Value> = prior
        .iter()
        .map(|(stage, doc)| (stage.as_str().to_string(), doc.clone()))
        .collect();
    Payload::Json(Value::Object(documents))
}

/// Assemble the document from the graph's terminal operations.
fn stage_document(
    graph: &ThoughtGraph,
    store: &ThoughtStore,
    execution: &StageExecution,
) -> Result<Value, StageError> {
    let mut contributions = Vec::new();
    for id in graph.terminal_operations() {
        let ids: &[NodeId] = execution.outputs.get(&id).map_or(&[], Vec::as_slice);
        contributions.push(Contribution {
            operation: id,
            section: graph.operation(id).and_then(|op| op.config.section.clone()),
            nodes: store.get_many(ids)?,
        });
    }
    Ok(assemble(&contributions))
}

/// Re-run `responsible`, keeping everything else as recorded.
fn repair_plan(execution: &StageExecution, responsible: BTreeSet<OperationId>) -> StagePlan {
    let prior_outputs = execution
        .outputs
        .iter()
        .filter(|(id, _)| !responsible.contains(id))
        .map(|(id, nodes)| (*id, nodes.clone()))
        .collect();
    StagePlan::partial(responsible, prior_outputs)
}
