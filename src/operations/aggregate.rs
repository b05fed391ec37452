use std::sync::Arc;

use async_trait::async_trait;

use super::{json_drafts, CallSpec, OperationContext, OperationHandler, OperationOutput};
use crate::error::OperationError;
use crate::graph::OperationKind;
use crate::thought::NodeId;

/// `aggregate`: one call that merges every surviving input into one node.
#[derive(Debug, Default)]
pub struct AggregateHandler;

#[async_trait]
impl OperationHandler for AggregateHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::Aggregate
    }

    fn planned_nodes(&self, ctx: &OperationContext) -> Vec<(NodeId, Vec<NodeId>)> {
        vec![(ctx.node_id(0), ctx.input_ids())]
    }

    async fn execute(&self, ctx: Arc<OperationContext>) -> Result<OperationOutput, OperationError> {
        ctx.require_inputs(1)?;

        let call = CallSpec {
            prompt: ctx.prompt(&ctx.inputs, None),
            provenance: ctx.input_ids(),
        };
        Ok(OperationOutput::nodes(json_drafts(&ctx, vec![call]).await?))
    }
}
