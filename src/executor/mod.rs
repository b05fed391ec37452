//! Scheduler/Executor for one stage graph.
//!
//! The executor walks a [`ThoughtGraph`] in dependency order. Every
//! operation whose dependencies have all succeeded is dispatched at once;
//! the inference adapter's concurrency limit bounds how many calls are
//! actually in flight. Results are recorded in the [`ThoughtStore`] before
//! readiness is recomputed, so no operation ever observes output that has
//! not been fully recorded.
//!
//! Failure handling: a multi-output operation succeeds while at least one
//! of its outputs does, which lets a `keep-best-k` downstream absorb failed
//! siblings. When an operation fails outright the stage fails, nothing
//! new is dispatched, and in-flight operations are drained.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GraphError, OperationError, SchemaViolation, StageError};
use crate::graph::{Operation, OperationId, SelectionPolicy, ThoughtGraph};
use crate::inference::InferenceAdapter;
use crate::operations::{OperationContext, OperationHandler, OperationOutput, OperationRegistry};
use crate::prompts::PromptBuilder;
use crate::runlog::{RunEventKind, RunLog};
use crate::thought::{
    NodeId, NodeOrigin, NodeStatus, Resolution, StageKind, ThoughtNode, ThoughtStore,
};

/// Executor state for one graph run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Inputs shared by every operation of one stage attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub incident: Arc<str>,
    /// Validated documents of earlier stages.
    pub prior: Arc<BTreeMap<StageKind, Value>>,
    /// 0 for the first run, incremented for each repair.
    pub attempt: u32,
    pub repair: Option<Arc<SchemaViolation>>,
}

impl StageContext {
    pub fn new(incident: impl Into<Arc<str>>, prior: BTreeMap<StageKind, Value>) -> Self {
        Self {
            incident: incident.into(),
            prior: Arc::new(prior),
            attempt: 0,
            repair: None,
        }
    }

    /// Context for a repair attempt of the same stage.
    pub fn for_repair(&self, violation: SchemaViolation) -> Self {
        Self {
            attempt: self.attempt + 1,
            repair: Some(Arc::new(violation)),
            ..self.clone()
        }
    }
}

/// Which operations to run.
///
/// The default plan runs everything. A repair plan runs a subset and
/// reuses the recorded outputs of the rest.
#[derive(Debug, Clone, Default)]
pub struct StagePlan {
    include: Option<BTreeSet<OperationId>>,
    prior_outputs: BTreeMap<OperationId, Vec<NodeId>>,
}

impl StagePlan {
    pub fn full() -> Self {
        Self::default()
    }

    /// Run only `include`; every other operation must have an entry in
    /// `prior_outputs`.
    pub fn partial(
        include: BTreeSet<OperationId>,
        prior_outputs: BTreeMap<OperationId, Vec<NodeId>>,
    ) -> Self {
        Self {
            include: Some(include),
            prior_outputs,
        }
    }

    pub fn includes(&self, id: OperationId) -> bool {
        self.include.as_ref().map_or(true, |set| set.contains(&id))
    }
}

/// Outcome of a completed graph run.
#[derive(Debug, Clone)]
pub struct StageExecution {
    pub stage: StageKind,
    pub attempt: u32,
    pub state: ExecutorState,
    /// Surviving output nodes of every operation, ascending by id.
    pub outputs: BTreeMap<OperationId, Vec<NodeId>>,
    /// Operations actually executed in this run.
    pub executed: BTreeSet<OperationId>,
}

struct Planned {
    operation: Operation,
    handler: Arc<dyn OperationHandler>,
    nominal_inputs: usize,
}

type TaskResult = (OperationId, Result<OperationOutput, OperationError>);

/// Drives stage graphs to completion.
pub struct Executor {
    adapter: Arc<InferenceAdapter>,
    registry: Arc<OperationRegistry>,
    prompts: Arc<dyn PromptBuilder>,
    selection: SelectionPolicy,
    runlog: Arc<RunLog>,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        adapter: Arc<InferenceAdapter>,
        registry: Arc<OperationRegistry>,
        prompts: Arc<dyn PromptBuilder>,
    ) -> Self {
        Self {
            adapter,
            registry,
            prompts,
            selection: SelectionPolicy::default(),
            runlog: Arc::new(RunLog::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Default keep-best-k policy for operations that do not set one.
    pub fn with_selection_policy(mut self, policy: SelectionPolicy) -> Self {
        self.selection = policy;
        self
    }

    pub fn with_runlog(mut self, runlog: Arc<RunLog>) -> Self {
        self.runlog = runlog;
        self
    }

    /// Token that stops further dispatch when cancelled.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn adapter(&self) -> &Arc<InferenceAdapter> {
        &self.adapter
    }

    pub fn runlog(&self) -> &Arc<RunLog> {
        &self.runlog
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolve handlers, effective policies and nominal arities for every
    /// operation. Rejects configurations that can never succeed before any
    /// external call is made.
    fn plan(&self, graph: &ThoughtGraph) -> Result<BTreeMap<OperationId, Planned>, StageError> {
        let mut planned: BTreeMap<OperationId, Planned> = BTreeMap::new();
        let mut nominal_outputs: BTreeMap<OperationId, usize> = BTreeMap::new();

        for id in graph.topological_order() {
            let mut operation = graph
                .operation(id)
                .cloned()
                .ok_or(GraphError::UnknownOperation(id))?;
            operation.config.selection = Some(operation.config.selection.unwrap_or(self.selection));

            let handler = self.registry.get(&operation.kind).map_err(|e| GraphError::Config {
                operation: operation.display_name(),
                message: e.to_string(),
            })?;

            let mut deps = graph.dependencies(id).peekable();
            let nominal_inputs = if deps.peek().is_none() {
                1
            } else {
                deps.map(|d| nominal_outputs.get(d).copied().unwrap_or(0)).sum()
            };
            let outputs = handler.nominal_outputs(&operation, nominal_inputs)?;

            nominal_outputs.insert(id, outputs);
            planned.insert(
                id,
                Planned {
                    operation,
                    handler,
                    nominal_inputs,
                },
            );
        }

        if planned.len() != graph.len() {
            return Err(GraphError::Config {
                operation: graph.stage().to_string(),
                message: "graph has no topological order".to_string(),
            }
            .into());
        }
        Ok(planned)
    }

    /// Execute `graph` according to `plan`, recording every node in `store`.
    ///
    /// The stage's seed node must already be in the store.
    pub async fn run(
        &self,
        graph: &ThoughtGraph,
        store: &Arc<ThoughtStore>,
        context: &StageContext,
        plan: &StagePlan,
    ) -> Result<StageExecution, StageError> {
        let stage = graph.stage();
        let mut state = ExecutorState::Idle;
        let planned = self.plan(graph)?;

        let seed = NodeId::seed(stage);
        if store.get(seed).is_none() {
            return Err(crate::error::StoreError::NodeNotFound(seed).into());
        }

        let mut completed: BTreeSet<OperationId> = BTreeSet::new();
        let mut outputs: BTreeMap<OperationId, Vec<NodeId>> = BTreeMap::new();
        for id in graph.operation_ids().filter(|id| !plan.includes(*id)) {
            let reused = plan.prior_outputs.get(&id).cloned().ok_or_else(|| GraphError::Config {
                operation: id.to_string(),
                message: "excluded from the plan without prior outputs".to_string(),
            })?;
            outputs.insert(id, reused);
            completed.insert(id);
        }

        self.runlog.record(
            Some(stage),
            RunEventKind::StageStarted {
                attempt: context.attempt,
                operations: graph.len() - completed.len(),
            },
        );
        debug!(stage = %stage, from = ?state, to = ?ExecutorState::Running, "Executor state change");
        state = ExecutorState::Running;

        let mut executed: BTreeSet<OperationId> = BTreeSet::new();
        let mut in_flight: BTreeMap<OperationId, Vec<NodeId>> = BTreeMap::new();
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut failure: Option<StageError> = None;

        loop {
            if failure.is_none() && !self.cancel.is_cancelled() {
                for id in graph.ready_operations(&completed) {
                    if in_flight.contains_key(&id) {
                        continue;
                    }
                    let Some(entry) = planned.get(&id) else {
                        continue;
                    };
                    match self.dispatch(id, entry, graph, store, context, &outputs, &mut tasks) {
                        Ok(planned_nodes) => {
                            in_flight.insert(id, planned_nodes);
                            executed.insert(id);
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            let (id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(stage = %stage, error = %e, "Operation task aborted");
                    failure.get_or_insert(StageError::Cancelled);
                    continue;
                }
            };
            let planned_nodes = in_flight.remove(&id).unwrap_or_default();

            let Some(entry) = planned.get(&id) else {
                continue;
            };
            match self.record(stage, id, entry, store, planned_nodes, result) {
                Ok(survivors) => {
                    outputs.insert(id, survivors);
                    completed.insert(id);
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(error) = failure {
            state = ExecutorState::Failed;
            debug!(stage = %stage, state = ?state, "Executor finished");
            return Err(error);
        }
        if completed.len() != graph.len() {
            info!(
                stage = %stage,
                completed = completed.len(),
                total = graph.len(),
                "Stage cancelled before completion"
            );
            return Err(StageError::Cancelled);
        }

        state = ExecutorState::Completed;
        debug!(stage = %stage, state = ?state, "Executor finished");
        Ok(StageExecution {
            stage,
            attempt: context.attempt,
            state,
            outputs,
            executed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        id: OperationId,
        entry: &Planned,
        graph: &ThoughtGraph,
        store: &Arc<ThoughtStore>,
        context: &StageContext,
        outputs: &BTreeMap<OperationId, Vec<NodeId>>,
        tasks: &mut JoinSet<TaskResult>,
    ) -> Result<Vec<NodeId>, StageError> {
        let stage = graph.stage();
        let mut input_ids: Vec<NodeId> = graph
            .dependencies(id)
            .flat_map(|dep| outputs.get(dep).cloned().unwrap_or_default())
            .collect();
        if graph.dependencies(id).next().is_none() {
            input_ids.push(NodeId::seed(stage));
        }
        input_ids.sort();
        input_ids.dedup();

        let inputs: Vec<_> = store
            .get_many(&input_ids)?
            .into_iter()
            .filter(|n| n.is_succeeded())
            .collect();

        self.runlog.record(
            Some(stage),
            RunEventKind::OperationDispatched {
                operation: id,
                label: entry.operation.label.clone(),
                kind: entry.operation.kind.clone(),
                inputs: inputs.len(),
            },
        );

        let ctx = Arc::new(OperationContext {
            stage,
            attempt: context.attempt,
            operation_id: id,
            selection: entry.operation.config.selection.unwrap_or(self.selection),
            operation: entry.operation.clone(),
            inputs,
            nominal_inputs: entry.nominal_inputs,
            incident: Arc::clone(&context.incident),
            prior: Arc::clone(&context.prior),
            repair: context.repair.clone(),
            adapter: Arc::clone(&self.adapter),
            prompts: Arc::clone(&self.prompts),
        });

        let origin = NodeOrigin::Operation {
            id,
            kind: entry.operation.kind.clone(),
        };
        let mut planned_nodes = Vec::new();
        for (node_id, provenance) in entry.handler.planned_nodes(&ctx) {
            store.insert(ThoughtNode::pending(node_id, origin.clone(), provenance))?;
            store.mark_ready(node_id)?;
            planned_nodes.push(node_id);
        }

        let handler = Arc::clone(&entry.handler);
        tasks.spawn(async move {
            // A panicking handler fails its own operation.
            let result = match tokio::spawn(async move { handler.execute(ctx).await }).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(OperationError::Internal {
                    message: format!("operation task panicked: {}", e),
                }),
                Err(e) => Err(OperationError::Internal {
                    message: format!("operation task aborted: {}", e),
                }),
            };
            (id, result)
        });
        Ok(planned_nodes)
    }

    /// Record a finished operation's nodes and return its survivors.
    fn record(
        &self,
        stage: StageKind,
        id: OperationId,
        entry: &Planned,
        store: &ThoughtStore,
        planned_nodes: Vec<NodeId>,
        result: Result<OperationOutput, OperationError>,
    ) -> Result<Vec<NodeId>, StageError> {
        let operation = &entry.operation;
        // Planned nodes the handler did not produce fail with `reason`.
        let abandon = |reason: &str| -> Result<(), StageError> {
            for node_id in &planned_nodes {
                if store.get(*node_id).is_some_and(|n| n.status == NodeStatus::Ready) {
                    store.resolve(
                        *node_id,
                        Resolution::Failed {
                            error: reason.to_string(),
                        },
                    )?;
                }
            }
            Ok(())
        };
        let fail = |source: OperationError| {
            self.runlog.record(
                Some(stage),
                RunEventKind::OperationFailed {
                    operation: id,
                    label: operation.label.clone(),
                    error: source.to_string(),
                },
            );
            StageError::OperationFailed {
                operation: id,
                label: operation.label.clone(),
                source,
            }
        };

        let output = match result {
            Ok(output) => output,
            Err(source) => {
                abandon(&source.to_string())?;
                return Err(fail(source));
            }
        };

        let origin = NodeOrigin::Operation {
            id,
            kind: operation.kind.clone(),
        };
        let mut survivors = output.passthrough;
        let mut first_error: Option<OperationError> = None;
        let mut failed_outputs = 0;

        for draft in output.nodes {
            let resolution = match draft.outcome {
                Ok(payload) => Resolution::Succeeded {
                    payload,
                    score: draft.score,
                },
                Err(error) => {
                    let resolution = Resolution::Failed {
                        error: error.to_string(),
                    };
                    first_error.get_or_insert(error);
                    resolution
                }
            };
            let node = store.settle(draft.id, origin.clone(), draft.provenance, resolution)?;
            if node.is_succeeded() {
                survivors.push(node.id);
            } else {
                failed_outputs += 1;
            }
        }

        abandon("operation produced no output for this node")?;

        if survivors.is_empty() {
            let source = first_error.unwrap_or_else(|| OperationError::Internal {
                message: "operation produced no output".to_string(),
            });
            return Err(fail(source));
        }

        survivors.sort();
        self.runlog.record(
            Some(stage),
            RunEventKind::OperationSucceeded {
                operation: id,
                label: operation.label.clone(),
                outputs: survivors.len(),
                failed_outputs,
            },
        );
        Ok(survivors)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("registry", &self.registry)
            .field("selection", &self.selection)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod executor_tests;
