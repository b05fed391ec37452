use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{json_drafts, CallSpec, OperationContext, OperationHandler, OperationOutput};
use crate::error::{GraphError, OperationError};
use crate::graph::{Operation, OperationKind};
use crate::thought::NodeId;

/// `generate`: `branching_factor` independent calls over the same inputs,
/// one sibling node per call.
#[derive(Debug, Default)]
pub struct GenerateHandler;

#[async_trait]
impl OperationHandler for GenerateHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::Generate
    }

    fn nominal_outputs(&self, operation: &Operation, _: usize) -> Result<usize, GraphError> {
        Ok(operation.config.branching_factor)
    }

    fn planned_nodes(&self, ctx: &OperationContext) -> Vec<(NodeId, Vec<NodeId>)> {
        let provenance = ctx.input_ids();
        (0..ctx.operation.config.branching_factor)
            .map(|seq| (ctx.node_id(seq), provenance.clone()))
            .collect()
    }

    async fn execute(&self, ctx: Arc<OperationContext>) -> Result<OperationOutput, OperationError> {
        ctx.require_inputs(1)?;

        let branches = ctx.operation.config.branching_factor;
        let provenance = ctx.input_ids();
        debug!(
            operation = %ctx.operation.label,
            branches,
            inputs = provenance.len(),
            "Generating candidates"
        );

        let calls = (0..branches)
            .map(|branch| CallSpec {
                prompt: ctx.prompt(&ctx.inputs, Some(branch)),
                provenance: provenance.clone(),
            })
            .collect();

        Ok(OperationOutput::nodes(json_drafts(&ctx, calls).await?))
    }
}
