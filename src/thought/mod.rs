//! Thought nodes and the store that owns them.
//!
//! A [`ThoughtNode`] is one unit of generated or transformed content at a
//! pipeline step. Nodes are created by operations, resolved exactly once,
//! and never edited afterwards; refinement produces a new node whose
//! provenance points at the original.

mod store;

pub use store::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{OperationId, OperationKind};

/// The three top-level phases of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Extracts the structured incident picture from free text.
    SituationAnalysis,
    /// Predicts dispersion, population and secondary impacts.
    ImpactAssessment,
    /// Derives the emergency level, evacuation and response actions.
    ResponsePlan,
}

impl StageKind {
    /// All stages in execution order.
    pub const ALL: [StageKind; 3] = [
        StageKind::SituationAnalysis,
        StageKind::ImpactAssessment,
        StageKind::ResponsePlan,
    ];

    /// Report key for this stage's document.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::SituationAnalysis => "situation_analysis",
            StageKind::ImpactAssessment => "impact_assessment",
            StageKind::ResponsePlan => "response_plan",
        }
    }

    /// Stages whose validated documents this stage consumes.
    pub fn upstream(&self) -> &'static [StageKind] {
        match self {
            StageKind::SituationAnalysis => &[],
            StageKind::ImpactAssessment => &[StageKind::SituationAnalysis],
            StageKind::ResponsePlan => &[StageKind::SituationAnalysis, StageKind::ImpactAssessment],
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "situation_analysis" => Ok(StageKind::SituationAnalysis),
            "impact_assessment" => Ok(StageKind::ImpactAssessment),
            "response_plan" => Ok(StageKind::ResponsePlan),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Node identity.
///
/// Ids are derived from where a node was produced rather than from when,
/// so the same graph yields the same ids regardless of completion order.
/// Ordering is by stage, then attempt, then operation, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub stage: StageKind,
    /// Execution attempt of the stage (0 for the first run, 1 for repair).
    pub attempt: u32,
    pub operation: OperationId,
    pub seq: u32,
}

impl NodeId {
    pub fn new(stage: StageKind, attempt: u32, operation: OperationId, seq: u32) -> Self {
        Self {
            stage,
            attempt,
            operation,
            seq,
        }
    }

    /// Id of the seed node a stage's root operations consume.
    pub fn seed(stage: StageKind) -> Self {
        Self::new(stage, 0, OperationId::SEED, 0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.operation == OperationId::SEED {
            write!(f, "{}/seed", self.stage)
        } else {
            write!(
                f,
                "{}/a{}/{}/{}",
                self.stage, self.attempt, self.operation, self.seq
            )
        }
    }
}

/// Node content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    /// Render the payload for inclusion in a prompt.
    pub fn to_prompt_text(&self) -> String {
        match self {
            Payload::Text(text) => text.clone(),
            Payload::Json(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Text(_) => None,
        }
    }
}

/// Node lifecycle: `pending -> ready -> succeeded | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Succeeded,
    Failed,
}

impl NodeStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Failed)
    }
}

/// What produced a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum NodeOrigin {
    /// Stage input (incident text or upstream documents).
    Seed,
    /// Output of a graph operation.
    Operation {
        id: OperationId,
        kind: OperationKind,
    },
}

/// A unit of content produced at one pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtNode {
    pub id: NodeId,
    pub stage: StageKind,
    pub origin: NodeOrigin,
    /// Content; `None` until the node succeeds.
    pub payload: Option<Payload>,
    pub status: NodeStatus,
    /// Quality score used for selection.
    pub score: Option<f64>,
    /// Ids of the nodes this one was derived from.
    pub provenance: Vec<NodeId>,
    /// Failure reason for failed nodes.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ThoughtNode {
    /// Create a pending node.
    pub fn pending(id: NodeId, origin: NodeOrigin, provenance: Vec<NodeId>) -> Self {
        Self {
            id,
            stage: id.stage,
            origin,
            payload: None,
            status: NodeStatus::Pending,
            score: None,
            provenance,
            error: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Create an already-succeeded seed node.
    pub fn seed(stage: StageKind, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: NodeId::seed(stage),
            stage,
            origin: NodeOrigin::Seed,
            payload: Some(payload),
            status: NodeStatus::Succeeded,
            score: None,
            provenance: Vec::new(),
            error: None,
            created_at: now,
            resolved_at: Some(now),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == NodeStatus::Succeeded
    }

    /// Operation that produced the node, if any.
    pub fn operation(&self) -> Option<OperationId> {
        match &self.origin {
            NodeOrigin::Operation { id, .. } => Some(*id),
            NodeOrigin::Seed => None,
        }
    }

    /// Payload rendered for prompts; empty for unresolved nodes.
    pub fn prompt_text(&self) -> String {
        self.payload
            .as_ref()
            .map(Payload::to_prompt_text)
            .unwrap_or_default()
    }
}
