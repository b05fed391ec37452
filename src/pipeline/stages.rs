//! Default per-stage graphs.

use crate::config::PipelineConfig;
use crate::error::GraphResult;
use crate::graph::{Operation, ThoughtGraph};
use crate::thought::StageKind;

/// Instruction given to the final refinement of the response plan.
pub const RESPONSE_PLAN_CRITIQUE: &str = "Make every action concrete and assign it a \
responsible party. Ensure the emergency level and evacuation plan are consistent with \
the impact assessment, and fill any section that is vague or empty.";

/// `generate(b) -> score -> keep-best-k(k) -> aggregate`
///
/// Candidate documents are explored in parallel, the best `k` survive and
/// are merged into the stage document.
fn explore_and_merge(
    stage: StageKind,
    branching_factor: usize,
    k: usize,
) -> GraphResult<ThoughtGraph> {
    let mut graph = ThoughtGraph::new(stage);
    let generate = graph.add_operation(
        Operation::generate(branching_factor).with_label(format!("{stage}.generate")),
        [],
    )?;
    let score = graph.add_operation(
        Operation::score()
            .with_label(format!("{stage}.score"))
            .with_temperature(0.0),
        [generate],
    )?;
    let keep = graph.add_operation(
        Operation::keep_best_k(k).with_label(format!("{stage}.keep_best")),
        [score],
    )?;
    graph.add_operation(
        Operation::aggregate().with_label(format!("{stage}.aggregate")),
        [keep],
    )?;
    Ok(graph)
}

/// `generate(b) -> score -> keep-best-k(1) -> refine`
///
/// A plan is not a merge of alternatives, so the single best candidate is
/// refined instead.
fn explore_and_refine(stage: StageKind, branching_factor: usize) -> GraphResult<ThoughtGraph> {
    let mut graph = ThoughtGraph::new(stage);
    let generate = graph.add_operation(
        Operation::generate(branching_factor).with_label(format!("{stage}.generate")),
        [],
    )?;
    let score = graph.add_operation(
        Operation::score()
            .with_label(format!("{stage}.score"))
            .with_temperature(0.0),
        [generate],
    )?;
    let keep = graph.add_operation(
        Operation::keep_best_k(1).with_label(format!("{stage}.keep_best")),
        [score],
    )?;
    graph.add_operation(
        Operation::refine(RESPONSE_PLAN_CRITIQUE).with_label(format!("{stage}.refine")),
        [keep],
    )?;
    Ok(graph)
}

/// Graph for `stage` sized from `config`.
pub fn default_graph(stage: StageKind, config: &PipelineConfig) -> GraphResult<ThoughtGraph> {
    let branching = config.branching_factor;
    match stage {
        StageKind::SituationAnalysis | StageKind::ImpactAssessment => {
            explore_and_merge(stage, branching, config.keep_best_k)
        }
        StageKind::ResponsePlan => explore_and_refine(stage, branching),
    }
}
