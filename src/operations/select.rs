use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{OperationContext, OperationHandler, OperationOutput};
use crate::error::{GraphError, OperationError};
use crate::graph::{Operation, OperationKind, SelectionPolicy};
use crate::thought::ThoughtNode;

/// `keep-best-k`: pure selection, no inference call.
///
/// The required count is `k` clamped to the nominal inputs (or exactly `k`
/// under [`SelectionPolicy::Strict`], where a larger `k` is rejected during
/// planning). Fewer surviving inputs than required fails the operation.
/// When more survive, the top `min(k, survivors)` are forwarded.
#[derive(Debug, Default)]
pub struct KeepBestKHandler;

fn k_of(operation: &Operation) -> Result<usize, GraphError> {
    operation.validate()?;
    operation.config.k.ok_or_else(|| GraphError::Config {
        operation: operation.display_name(),
        message: "k is required".to_string(),
    })
}

#[async_trait]
impl OperationHandler for KeepBestKHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::KeepBestK
    }

    fn nominal_outputs(
        &self,
        operation: &Operation,
        nominal_inputs: usize,
    ) -> Result<usize, GraphError> {
        let k = k_of(operation)?;
        match operation.config.selection.unwrap_or_default() {
            SelectionPolicy::Clamp => Ok(k.min(nominal_inputs)),
            SelectionPolicy::Strict if k > nominal_inputs => Err(GraphError::Config {
                operation: operation.display_name(),
                message: format!(
                    "k = {} exceeds the {} inputs available under strict selection",
                    k, nominal_inputs
                ),
            }),
            SelectionPolicy::Strict => Ok(k),
        }
    }

    async fn execute(&self, ctx: Arc<OperationContext>) -> Result<OperationOutput, OperationError> {
        let k = k_of(&ctx.operation).map_err(|e| OperationError::Internal {
            message: e.to_string(),
        })?;
        let required = match ctx.selection {
            SelectionPolicy::Clamp => k.min(ctx.nominal_inputs),
            SelectionPolicy::Strict => k,
        };
        ctx.require_inputs(required)?;

        let selected: Vec<_> = rank_by_score(&ctx.inputs)
            .into_iter()
            .take(k)
            .map(|n| n.id)
            .collect();

        debug!(
            operation = %ctx.operation.label,
            k,
            required,
            available = ctx.inputs.len(),
            selected = selected.len(),
            "Selected best inputs"
        );

        Ok(OperationOutput::passthrough(selected))
    }
}

/// Order nodes best first: score descending, unscored last, ties by id
/// ascending.
pub fn rank_by_score(nodes: &[ThoughtNode]) -> Vec<&ThoughtNode> {
    let mut ranked: Vec<&ThoughtNode> = nodes.iter().collect();
    ranked.sort_by(|a, b| compare_scores(a.score, b.score).then_with(|| a.id.cmp(&b.id)));
    ranked
}

fn compare_scores(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.total_cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
