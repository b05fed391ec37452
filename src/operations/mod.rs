//! Operation Library.
//!
//! Each [`OperationKind`] is interpreted by an [`OperationHandler`] looked
//! up in the [`OperationRegistry`]. The executor never branches on the
//! kind itself, so new kinds are added by registering another handler.

mod aggregate;
mod generate;
mod refine;
mod score;
mod select;

pub use aggregate::AggregateHandler;
pub use generate::GenerateHandler;
pub use refine::RefineHandler;
pub use score::{parse_score, ScoreHandler};
pub use select::{rank_by_score, KeepBestKHandler};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinSet;

use crate::error::{GraphError, InferenceError, OperationError, SchemaViolation};
use crate::graph::{Operation, OperationId, OperationKind, SelectionPolicy};
use crate::inference::{CompletionOptions, InferenceAdapter};
use crate::prompts::{PromptBuilder, PromptRequest};
use crate::thought::{NodeId, Payload, StageKind, ThoughtNode};

/// Everything a handler needs to execute one operation.
///
/// Owned snapshot: inputs are copies of recorded nodes, collaborators are
/// shared handles, so the context can move into a spawned task.
pub struct OperationContext {
    pub stage: StageKind,
    pub attempt: u32,
    pub operation_id: OperationId,
    pub operation: Operation,
    /// Succeeded input nodes, ascending by id.
    pub inputs: Vec<ThoughtNode>,
    /// Inputs the operation would receive if nothing upstream failed.
    pub nominal_inputs: usize,
    pub incident: Arc<str>,
    /// Validated documents of earlier stages.
    pub prior: Arc<BTreeMap<StageKind, Value>>,
    /// Set when the stage is being re-run to repair a schema violation.
    pub repair: Option<Arc<SchemaViolation>>,
    /// Effective selection policy for this operation.
    pub selection: SelectionPolicy,
    pub adapter: Arc<InferenceAdapter>,
    pub prompts: Arc<dyn PromptBuilder>,
}

impl OperationContext {
    /// Id for the `seq`-th node this operation produces.
    pub fn node_id(&self, seq: usize) -> NodeId {
        NodeId::new(self.stage, self.attempt, self.operation_id, seq as u32)
    }

    /// Build a prompt for `inputs` through the injected prompt builder.
    pub fn prompt(&self, inputs: &[ThoughtNode], branch: Option<usize>) -> String {
        self.prompts.build(&PromptRequest {
            stage: self.stage,
            kind: &self.operation.kind,
            incident: &self.incident,
            prior: &self.prior,
            inputs,
            branch,
            section: self.operation.config.section.as_deref(),
            critique: self.operation.config.critique.as_deref(),
            repair: self.repair.as_deref(),
        })
    }

    /// Generation options configured on the operation.
    pub fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: self.operation.config.temperature,
            max_tokens: self.operation.config.max_tokens,
        }
    }

    pub fn input_ids(&self) -> Vec<NodeId> {
        self.inputs.iter().map(|n| n.id).collect()
    }

    /// One planned node per input, each derived from that input.
    pub fn per_input_nodes(&self) -> Vec<(NodeId, Vec<NodeId>)> {
        self.inputs
            .iter()
            .enumerate()
            .map(|(seq, input)| (self.node_id(seq), vec![input.id]))
            .collect()
    }

    /// Fail with `InsufficientInputs` unless at least `required` inputs
    /// survived.
    pub fn require_inputs(&self, required: usize) -> Result<(), OperationError> {
        if self.inputs.len() < required {
            return Err(OperationError::InsufficientInputs {
                required,
                available: self.inputs.len(),
            });
        }
        Ok(())
    }
}

/// A node an operation wants recorded. The executor assigns lifecycle
/// state and timestamps.
#[derive(Debug)]
pub struct NodeDraft {
    pub id: NodeId,
    pub outcome: Result<Payload, OperationError>,
    pub score: Option<f64>,
    pub provenance: Vec<NodeId>,
}

impl NodeDraft {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Result of a handler.
#[derive(Debug, Default)]
pub struct OperationOutput {
    /// New nodes, in sequence order.
    pub nodes: Vec<NodeDraft>,
    /// Existing nodes forwarded unchanged (selection).
    pub passthrough: Vec<NodeId>,
}

impl OperationOutput {
    pub fn nodes(nodes: Vec<NodeDraft>) -> Self {
        Self {
            nodes,
            passthrough: Vec::new(),
        }
    }

    pub fn passthrough(ids: Vec<NodeId>) -> Self {
        Self {
            nodes: Vec::new(),
            passthrough: ids,
        }
    }
}

/// Behaviour of one operation kind.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    fn kind(&self) -> OperationKind;

    /// Outputs the operation produces when all `nominal_inputs` arrive.
    /// Planning uses this to size downstream selections before any call.
    fn nominal_outputs(
        &self,
        _operation: &Operation,
        _nominal_inputs: usize,
    ) -> Result<usize, GraphError> {
        Ok(1)
    }

    /// Nodes `execute` will produce, with their provenance, when that is
    /// known before it runs. The executor records them as ready at dispatch
    /// so in-flight work shows up in the store.
    fn planned_nodes(&self, _ctx: &OperationContext) -> Vec<(NodeId, Vec<NodeId>)> {
        Vec::new()
    }

    async fn execute(&self, ctx: Arc<OperationContext>) -> Result<OperationOutput, OperationError>;
}

/// Capability-keyed dispatch table of operation handlers.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    handlers: HashMap<OperationKind, Arc<dyn OperationHandler>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `generate`, `aggregate`, `score`, `keep-best-k` and
    /// `refine`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GenerateHandler));
        registry.register(Arc::new(AggregateHandler));
        registry.register(Arc::new(ScoreHandler));
        registry.register(Arc::new(KeepBestKHandler));
        registry.register(Arc::new(RefineHandler));
        registry
    }

    /// Add or replace the handler for its kind.
    pub fn register(&mut self, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: &OperationKind) -> Result<Arc<dyn OperationHandler>, OperationError> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| OperationError::UnknownKind {
                kind: kind.to_string(),
            })
    }

    pub fn contains(&self, kind: &OperationKind) -> bool {
        self.handlers.contains_key(kind)
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(OperationKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("OperationRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

/// One inference call an operation wants made.
pub(crate) struct CallSpec {
    pub prompt: String,
    pub provenance: Vec<NodeId>,
}

/// Issue `calls` concurrently and return the raw completions in call order.
pub(crate) async fn run_calls(
    ctx: &Arc<OperationContext>,
    calls: Vec<CallSpec>,
) -> Result<Vec<(Result<String, InferenceError>, Vec<NodeId>)>, OperationError> {
    let mut set = JoinSet::new();
    let count = calls.len();
    for (seq, call) in calls.into_iter().enumerate() {
        let ctx = Arc::clone(ctx);
        set.spawn(async move {
            let result = ctx.adapter.complete(&call.prompt, ctx.options()).await;
            (seq, result, call.provenance)
        });
    }

    let mut slots: Vec<Option<(Result<String, InferenceError>, Vec<NodeId>)>> =
        (0..count).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        let (seq, result, provenance) = joined.map_err(|e| OperationError::Internal {
            message: format!("Inference task failed: {}", e),
        })?;
        slots[seq] = Some((result, provenance));
    }

    Ok(slots.into_iter().flatten().collect())
}

/// Issue `calls` concurrently and turn each completion into a JSON node.
pub(crate) async fn json_drafts(
    ctx: &Arc<OperationContext>,
    calls: Vec<CallSpec>,
) -> Result<Vec<NodeDraft>, OperationError> {
    let results = run_calls(ctx, calls).await?;
    Ok(results
        .into_iter()
        .enumerate()
        .map(|(seq, (result, provenance))| NodeDraft {
            id: ctx.node_id(seq),
            outcome: result
                .and_then(|text| parse_json_object(&text))
                .map(Payload::Json)
                .map_err(OperationError::from),
            score: None,
            provenance,
        })
        .collect())
}

/// Extract the JSON text from a completion, tolerating code fences and
/// prose around the object.
pub fn extract_json(completion: &str) -> Result<&str, String> {
    // Fast path: the whole completion is JSON
    let trimmed = completion.trim();
    let bracketed = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    if bracketed && serde_json::from_str::<serde::de::IgnoredAny>(trimmed).is_ok() {
        return Ok(trimmed);
    }

    // ```json ... ``` blocks
    if let Some(block) = completion
        .split("```json")
        .nth(1)
        .and_then(|s| s.split("```").next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return Ok(block);
    }

    // ``` ... ``` blocks
    if let Some(block) = completion
        .split("```")
        .nth(1)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return Ok(block);
    }

    // Object embedded in prose
    if let (Some(start), Some(end)) = (completion.find('{'), completion.rfind('}')) {
        if start < end {
            return Ok(&completion[start..=end]);
        }
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}

/// Parse a completion into a JSON object.
pub fn parse_json_object(completion: &str) -> Result<Value, InferenceError> {
    let text = extract_json(completion).map_err(|message| InferenceError::ResponseFormat { message })?;
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(InferenceError::ResponseFormat {
            message: format!("Expected a JSON object, got {}", json_type(&other)),
        }),
        Err(e) => Err(InferenceError::ResponseFormat {
            message: format!("Invalid JSON: {}", e),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
