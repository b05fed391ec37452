use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{
    extract_json, run_calls, CallSpec, NodeDraft, OperationContext, OperationHandler,
    OperationOutput,
};
use crate::error::{GraphError, OperationError};
use crate::graph::{Operation, OperationKind};
use crate::thought::NodeId;

/// `score`: one call per input. Each output node carries the input's
/// payload unchanged plus the score, and points back at the input.
///
/// A completion that cannot be read as a score leaves the node unscored,
/// which ranks it below every scored node during selection.
#[derive(Debug, Default)]
pub struct ScoreHandler;

#[async_trait]
impl OperationHandler for ScoreHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::Score
    }

    fn nominal_outputs(&self, _: &Operation, nominal_inputs: usize) -> Result<usize, GraphError> {
        Ok(nominal_inputs)
    }

    fn planned_nodes(&self, ctx: &OperationContext) -> Vec<(NodeId, Vec<NodeId>)> {
        ctx.per_input_nodes()
    }

    async fn execute(&self, ctx: Arc<OperationContext>) -> Result<OperationOutput, OperationError> {
        ctx.require_inputs(1)?;

        let calls = ctx
            .inputs
            .iter()
            .map(|input| CallSpec {
                prompt: ctx.prompt(std::slice::from_ref(input), None),
                provenance: vec![input.id],
            })
            .collect();
        let results = run_calls(&ctx, calls).await?;

        let mut nodes = Vec::with_capacity(results.len());
        for (seq, ((result, provenance), input)) in results.into_iter().zip(&ctx.inputs).enumerate() {
            let payload = input.payload.clone().ok_or_else(|| OperationError::Internal {
                message: format!("Input {} has no payload", input.id),
            })?;

            let (outcome, score) = match result {
                Ok(text) => {
                    let score = parse_score(&text);
                    if score.is_none() {
                        warn!(
                            node_id = %input.id,
                            completion_preview = %text.chars().take(200).collect::<String>(),
                            "Failed to parse score response, leaving node unscored"
                        );
                    }
                    (Ok(payload), score)
                }
                Err(e) => (Err(OperationError::from(e)), None),
            };

            nodes.push(NodeDraft {
                id: ctx.node_id(seq),
                outcome,
                score,
                provenance,
            });
        }

        Ok(OperationOutput::nodes(nodes))
    }
}

/// Read a score from a completion: `{"score": x}`, `{"overall_score": x}`
/// or a bare number. Non-finite values are rejected.
pub fn parse_score(completion: &str) -> Option<f64> {
    let from_json = extract_json(completion)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(text).ok())
        .and_then(|value| {
            ["score", "overall_score"]
                .iter()
                .find_map(|key| value.get(*key).and_then(number_like))
        });

    from_json
        .or_else(|| completion.trim().parse::<f64>().ok())
        .filter(|s| s.is_finite())
}

fn number_like(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
