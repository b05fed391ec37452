use std::sync::Arc;

use async_trait::async_trait;

use super::{json_drafts, CallSpec, OperationContext, OperationHandler, OperationOutput};
use crate::error::{GraphError, OperationError};
use crate::graph::{Operation, OperationKind};
use crate::thought::NodeId;

/// `refine`: one call per input, applying the configured critique. The
/// improved node is new; its provenance points at the original.
#[derive(Debug, Default)]
pub struct RefineHandler;

#[async_trait]
impl OperationHandler for RefineHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::Refine
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

        Ok(OperationOutput::nodes(json_drafts(&ctx, calls).await?))
    }
}
