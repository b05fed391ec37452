use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::*;
use crate::error::{InferenceError, InferenceResult};
use crate::graph::OperationKind;
use crate::inference::{Completion, CompletionRequest, InferenceBackend, RetryPolicy};
use crate::prompts::PromptRequest;
use crate::thought::{Payload, ThoughtNode};

const STAGE: StageKind = StageKind::SituationAnalysis;

/// Renders `kind|branch|inputs` so the backend can answer per operation.
struct TracePrompts;

impl PromptBuilder for TracePrompts {
    fn build(&self, request: &PromptRequest<'_>) -> String {
        let inputs: Vec<String> = request
            .inputs
            .iter()
            .map(|n| n.prompt_text().replace('\n', ""))
            .collect();
        format!(
            "{}|{}|{}",
            request.kind,
            request.branch.map(|b| b.to_string()).unwrap_or_default(),
            inputs.join(";")
        )
    }
}

/// Generate returns `{"draft": branch}`; score scores a draft by its
/// number; anything else reports how many inputs it saw.
#[derive(Default)]
struct ScriptedBackend {
    failing_branches: Vec<usize>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn failing(branches: &[usize]) -> Self {
        Self {
            failing_branches: branches.to_vec(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn complete(&self, request: &CompletionRequest) -> InferenceResult<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let parts: Vec<&str> = request.prompt.splitn(3, '|').collect();
        match parts[0] {
            "generate" => {
                let branch: usize = parts[1].parse().unwrap();
                if self.failing_branches.contains(&branch) {
                    return Err(InferenceError::Api {
                        status: 400,
                        message: format!("branch {} rejected", branch),
                    });
                }
                Ok(Completion::text(json!({ "draft": branch }).to_string()))
            }
            "score" => {
                let input: Value = serde_json::from_str(parts[2]).unwrap();
                Ok(Completion::text(format!("{{\"score\": {}}}", input["draft"])))
            }
            _ => Ok(Completion::text(
                json!({ "merged": parts[2].split(';').count() }).to_string(),
            )),
        }
    }
}

fn executor(backend: Arc<ScriptedBackend>) -> Executor {
    let adapter = InferenceAdapter::new(backend, RetryPolicy::none(), 4, Duration::from_secs(5));
    Executor::new(
        Arc::new(adapter),
        Arc::new(OperationRegistry::with_builtins()),
        Arc::new(TracePrompts),
    )
}

fn seeded_store() -> Arc<ThoughtStore> {
    let store = Arc::new(ThoughtStore::new());
    store
        .insert(ThoughtNode::seed(STAGE, Payload::Text("chlorine leak".into())))
        .unwrap();
    store
}

fn context() -> StageContext {
    StageContext::new("chlorine leak", BTreeMap::new())
}

/// generate(b) -> score -> keep-best-k(k) -> aggregate
fn pipeline_graph(branches: usize, k: usize) -> (ThoughtGraph, [OperationId; 4]) {
    let mut graph = ThoughtGraph::new(STAGE);
    let generate = graph.add_operation(Operation::generate(branches), []).unwrap();
    let score = graph.add_operation(Operation::score(), [generate]).unwrap();
    let keep = graph.add_operation(Operation::keep_best_k(k), [score]).unwrap();
    let aggregate = graph.add_operation(Operation::aggregate(), [keep]).unwrap();
    (graph, [generate, score, keep, aggregate])
}

fn drafts(store: &ThoughtStore, ids: &[NodeId]) -> BTreeSet<u64> {
    store
        .get_many(ids)
        .unwrap()
        .iter()
        .map(|n| n.payload.as_ref().unwrap().as_json().unwrap()["draft"].as_u64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_keep_best_k_absorbs_failed_siblings() {
    let backend = Arc::new(ScriptedBackend::failing(&[1, 3]));
    let executor = executor(Arc::clone(&backend));
    let store = seeded_store();
    let (graph, [generate, _, keep, aggregate]) = pipeline_graph(5, 3);

    let execution = executor
        .run(&graph, &store, &context(), &StagePlan::full())
        .await
        .unwrap();

    assert_eq!(execution.state, ExecutorState::Completed);
    assert_eq!(execution.outputs[&generate].len(), 3);
    assert_eq!(drafts(&store, &execution.outputs[&keep]), BTreeSet::from([0, 2, 4]));

    let merged = store.get(execution.outputs[&aggregate][0]).unwrap();
    assert_eq!(merged.payload.unwrap().as_json().unwrap()["merged"], 3);

    // Failed branches are kept as failed nodes.
    let failed: Vec<_> = store
        .stage_nodes(STAGE)
        .into_iter()
        .filter(|n| n.error.is_some())
        .collect();
    assert_eq!(failed.len(), 2);
}

#[tokio::test]
async fn test_too_few_survivors_fails_selection() {
    let backend = Arc::new(ScriptedBackend::failing(&[0, 1, 2]));
    let executor = executor(Arc::clone(&backend));
    let store = seeded_store();
    let (graph, [_, _, keep, _]) = pipeline_graph(5, 3);

    let err = executor
        .run(&graph, &store, &context(), &StagePlan::full())
        .await
        .unwrap_err();

    match err {
        StageError::OperationFailed {
            operation, source, ..
        } => {
            assert_eq!(operation, keep);
            assert!(matches!(
                source,
                OperationError::InsufficientInputs {
                    required: 3,
                    available: 2
                }
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_clamped_k_forwards_all_inputs() {
    let backend = Arc::new(ScriptedBackend::default());
    let executor = executor(Arc::clone(&backend));
    let store = seeded_store();
    let (graph, [_, _, keep, _]) = pipeline_graph(4, 10);

    let execution = executor
        .run(&graph, &store, &context(), &StagePlan::full())
        .await
        .unwrap();

    assert_eq!(execution.outputs[&keep].len(), 4);
}

#[tokio::test]
async fn test_strict_selection_rejected_before_any_call() {
    let backend = Arc::new(ScriptedBackend::default());
    let executor =
        executor(Arc::clone(&backend)).with_selection_policy(SelectionPolicy::Strict);
    let store = seeded_store();
    let (graph, _) = pipeline_graph(4, 10);

    let err = executor
        .run(&graph, &store, &context(), &StagePlan::full())
        .await
        .unwrap_err();

    assert!(matches!(err, StageError::Graph(GraphError::Config { .. })));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_unknown_kind_rejected_before_any_call() {
    let backend = Arc::new(ScriptedBackend::default());
    let executor = executor(Arc::clone(&backend));
    let store = seeded_store();
    let mut graph = ThoughtGraph::new(STAGE);
    let generate = graph.add_operation(Operation::generate(2), []).unwrap();
    graph
        .add_operation(Operation::custom("translate"), [generate])
        .unwrap();

    let err = executor
        .run(&graph, &store, &context(), &StagePlan::full())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("translate"));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_operation_stops_downstream() {
    let backend = Arc::new(ScriptedBackend::failing(&[0, 1]));
    let executor = executor(Arc::clone(&backend));
    let store = seeded_store();
    let (graph, [generate, _, _, _]) = pipeline_graph(2, 1);

    let err = executor
        .run(&graph, &store, &context(), &StagePlan::full())
        .await
        .unwrap_err();

    match &err {
        StageError::OperationFailed {
            operation, source, ..
        } => {
            assert_eq!(*operation, generate);
            assert!(matches!(
                source,
                OperationError::Inference(InferenceError::Api { status: 400, .. })
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    // Only the two generate calls were made.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dependencies_complete_before_dispatch() {
    let backend = Arc::new(ScriptedBackend::default());
    let executor = executor(Arc::clone(&backend));
    let store = seeded_store();
    let (graph, _) = pipeline_graph(3, 2);

    executor
        .run(&graph, &store, &context(), &StagePlan::full())
        .await
        .unwrap();

    let mut succeeded: BTreeSet<OperationId> = BTreeSet::new();
    for event in executor.runlog().events() {
        match event.kind {
            RunEventKind::OperationDispatched { operation, .. } => {
                for dep in graph.dependencies(operation) {
                    assert!(succeeded.contains(dep), "{operation} dispatched before {dep}");
                }
            }
            RunEventKind::OperationSucceeded { operation, .. } => {
                succeeded.insert(operation);
            }
            _ => {}
        }
    }
    assert_eq!(succeeded.len(), graph.len());
}

#[tokio::test]
async fn test_selection_is_deterministic() {
    let mut selected = Vec::new();
    for _ in 0..3 {
        let executor = executor(Arc::new(ScriptedBackend::default()));
        let store = seeded_store();
        let (graph, [_, _, keep, _]) = pipeline_graph(5, 2);
        let execution = executor
            .run(&graph, &store, &context(), &StagePlan::full())
            .await
            .unwrap();
        selected.push(execution.outputs[&keep].clone());
    }
    assert!(selected.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_partial_plan_reuses_prior_outputs() {
    let backend = Arc::new(ScriptedBackend::default());
    let executor = executor(Arc::clone(&backend));
    let store = seeded_store();
    let (graph, [_, _, _, aggregate]) = pipeline_graph(3, 2);

    let first = executor
        .run(&graph, &store, &context(), &StagePlan::full())
        .await
        .unwrap();
    let calls_before = backend.calls.load(Ordering::SeqCst);

    let prior: BTreeMap<_, _> = first
        .outputs
        .iter()
        .filter(|(id, _)| **id != aggregate)
        .map(|(id, nodes)| (*id, nodes.clone()))
        .collect();
    let plan = StagePlan::partial(BTreeSet::from([aggregate]), prior);
    let ctx = context().for_repair(crate::error::SchemaViolation {
        stage: STAGE,
        issues: Vec::new(),
    });

    let second = executor.run(&graph, &store, &ctx, &plan).await.unwrap();

    assert_eq!(second.executed, BTreeSet::from([aggregate]));
    assert_eq!(backend.calls.load(Ordering::SeqCst), calls_before + 1);
    let repaired = second.outputs[&aggregate][0];
    assert_eq!(repaired.attempt, 1);
    assert_ne!(repaired, first.outputs[&aggregate][0]);
}

#[tokio::test]
async fn test_partial_plan_requires_prior_outputs() {
    let executor = executor(Arc::new(ScriptedBackend::default()));
    let store = seeded_store();
    let (graph, [_, _, _, aggregate]) = pipeline_graph(3, 2);

    let plan = StagePlan::partial(BTreeSet::from([aggregate]), BTreeMap::new());
    let err = executor
        .run(&graph, &store, &context(), &plan)
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::Graph(GraphError::Config { .. })));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let backend = Arc::new(ScriptedBackend::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let executor = executor(Arc::clone(&backend)).with_cancellation(cancel);
    let store = seeded_store();
    let (graph, _) = pipeline_graph(3, 2);

    let err = executor
        .run(&graph, &store, &context(), &StagePlan::full())
        .await
        .unwrap_err();

    assert!(matches!(err, StageError::Cancelled));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_seed_is_reported() {
    let executor = executor(Arc::new(ScriptedBackend::default()));
    let store = Arc::new(ThoughtStore::new());
    let (graph, _) = pipeline_graph(2, 1);

    let err = executor
        .run(&graph, &store, &context(), &StagePlan::full())
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::Store(_)));
}

/// Handler that panics instead of returning.
struct PanickingHandler;

#[async_trait]
impl OperationHandler for PanickingHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::Custom("explode".to_string())
    }

    async fn execute(&self, _ctx: Arc<OperationContext>) -> Result<OperationOutput, OperationError> {
        panic!("handler bug");
    }
}

#[tokio::test]
async fn test_panicking_handler_fails_its_operation() {
    let backend = Arc::new(ScriptedBackend::default());
    let mut registry = OperationRegistry::with_builtins();
    registry.register(Arc::new(PanickingHandler));
    let adapter = InferenceAdapter::new(backend, RetryPolicy::none(), 4, Duration::from_secs(5));
    let executor = Executor::new(Arc::new(adapter), Arc::new(registry), Arc::new(TracePrompts));

    let mut graph = ThoughtGraph::new(STAGE);
    let explode = graph
        .add_operation(Operation::custom("explode"), [])
        .unwrap();

    let err = executor
        .run(&graph, &seeded_store(), &context(), &StagePlan::full())
        .await
        .unwrap_err();

    match err {
        StageError::OperationFailed {
            operation, source, ..
        } => {
            assert_eq!(operation, explode);
            match source {
                OperationError::Internal { message } => assert!(message.contains("panicked")),
                other => panic!("unexpected source: {other}"),
            }
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Holds every call until the gate is opened.
struct GatedBackend {
    entered: AtomicUsize,
    gate: tokio::sync::Semaphore,
}

#[async_trait]
impl InferenceBackend for GatedBackend {
    async fn complete(&self, _request: &CompletionRequest) -> InferenceResult<Completion> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await.map_err(|_| InferenceError::Api {
            status: 503,
            message: "gate closed".to_string(),
        })?;
        Ok(Completion::text(json!({ "draft": 0 }).to_string()))
    }
}

#[tokio::test]
async fn test_in_flight_nodes_are_recorded_at_dispatch() {
    let backend = Arc::new(GatedBackend {
        entered: AtomicUsize::new(0),
        gate: tokio::sync::Semaphore::new(0),
    });
    let adapter = InferenceAdapter::new(
        Arc::clone(&backend) as Arc<dyn InferenceBackend>,
        RetryPolicy::none(),
        4,
        Duration::from_secs(5),
    );
    let executor = Executor::new(
        Arc::new(adapter),
        Arc::new(OperationRegistry::with_builtins()),
        Arc::new(TracePrompts),
    );
    let store = seeded_store();
    let mut graph = ThoughtGraph::new(STAGE);
    let generate = graph.add_operation(Operation::generate(3), []).unwrap();

    let running = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            executor
                .run(&graph, &store, &context(), &StagePlan::full())
                .await
        })
    };

    while backend.entered.load(Ordering::SeqCst) < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let in_flight: Vec<ThoughtNode> = store
        .stage_nodes(STAGE)
        .into_iter()
        .filter(|n| n.operation() == Some(generate))
        .collect();
    assert_eq!(in_flight.len(), 3);
    assert!(in_flight.iter().all(|n| n.status == NodeStatus::Ready));
    assert!(in_flight
        .iter()
        .all(|n| n.provenance == vec![NodeId::seed(STAGE)]));

    backend.gate.add_permits(3);
    let execution = running.await.unwrap().unwrap();
    assert_eq!(execution.outputs[&generate].len(), 3);
    assert_eq!(store.count(NodeStatus::Ready), 0);
    assert_eq!(store.count(NodeStatus::Succeeded), 4);
}
