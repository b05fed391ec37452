use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::debug;

use super::{NodeId, NodeOrigin, NodeStatus, Payload, StageKind, ThoughtNode};
use crate::error::StoreError;

/// Final outcome applied to a ready node.
#[derive(Debug, Clone)]
pub enum Resolution {
    Succeeded {
        payload: Payload,
        score: Option<f64>,
    },
    Failed {
        error: String,
    },
}

/// Append-only store of thought nodes, keyed by node id.
///
/// Nodes are inserted once and only move forward through their lifecycle.
/// A resolved node never changes again. Readers receive clones, so a node
/// observed by an operation is exactly what was recorded.
#[derive(Debug, Default)]
pub struct ThoughtStore {
    nodes: RwLock<BTreeMap<NodeId, ThoughtNode>>,
}

impl ThoughtStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<NodeId, ThoughtNode>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<NodeId, ThoughtNode>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a node if no node with the same id exists.
    pub fn insert(&self, node: ThoughtNode) -> Result<(), StoreError> {
        let mut nodes = self.write();
        if nodes.contains_key(&node.id) {
            return Err(StoreError::DuplicateNode(node.id));
        }
        debug!(node_id = %node.id, status = ?node.status, "Node inserted");
        nodes.insert(node.id, node);
        Ok(())
    }

    /// Move a pending node to ready once all its inputs have succeeded.
    ///
    /// A node whose inputs have not all succeeded is failed instead, so it
    /// can never be resolved as a success on top of missing data.
    pub fn mark_ready(&self, id: NodeId) -> Result<NodeStatus, StoreError> {
        let mut nodes = self.write();
        let provenance = match nodes.get(&id) {
            Some(node) if node.status == NodeStatus::Pending => node.provenance.clone(),
            Some(_) => return Err(StoreError::Immutable(id)),
            None => return Err(StoreError::NodeNotFound(id)),
        };

        let unmet: Vec<NodeId> = provenance
            .into_iter()
            .filter(|p| !nodes.get(p).is_some_and(ThoughtNode::is_succeeded))
            .collect();

        let node = nodes.get_mut(&id).ok_or(StoreError::NodeNotFound(id))?;
        if unmet.is_empty() {
            node.status = NodeStatus::Ready;
        } else {
            node.status = NodeStatus::Failed;
            node.error = Some(format!(
                "inputs not succeeded: {}",
                unmet
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            node.resolved_at = Some(Utc::now());
        }
        Ok(node.status)
    }

    /// Resolve a ready node.
    pub fn resolve(&self, id: NodeId, resolution: Resolution) -> Result<ThoughtNode, StoreError> {
        let mut nodes = self.write();
        let node = nodes.get_mut(&id).ok_or(StoreError::NodeNotFound(id))?;
        if node.status != NodeStatus::Ready {
            return Err(StoreError::Immutable(id));
        }
        match resolution {
            Resolution::Succeeded { payload, score } => {
                node.status = NodeStatus::Succeeded;
                node.payload = Some(payload);
                node.score = score;
            }
            Resolution::Failed { error } => {
                node.status = NodeStatus::Failed;
                node.error = Some(error);
            }
        }
        node.resolved_at = Some(Utc::now());
        Ok(node.clone())
    }

    /// Insert, ready and resolve a node in one step.
    pub fn record(
        &self,
        id: NodeId,
        origin: NodeOrigin,
        provenance: Vec<NodeId>,
        resolution: Resolution,
    ) -> Result<ThoughtNode, StoreError> {
        self.insert(ThoughtNode::pending(id, origin, provenance))?;
        match self.mark_ready(id)? {
            NodeStatus::Ready => self.resolve(id, resolution),
            _ => self.get(id).ok_or(StoreError::NodeNotFound(id)),
        }
    }

    /// Resolve `id`, inserting it first unless it was already recorded as
    /// ready when its operation was dispatched.
    pub fn settle(
        &self,
        id: NodeId,
        origin: NodeOrigin,
        provenance: Vec<NodeId>,
        resolution: Resolution,
    ) -> Result<ThoughtNode, StoreError> {
        match self.get(id).map(|node| node.status) {
            None => self.record(id, origin, provenance, resolution),
            Some(NodeStatus::Ready) => self.resolve(id, resolution),
            Some(_) => Err(StoreError::DuplicateNode(id)),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<ThoughtNode> {
        self.read().get(&id).cloned()
    }

    /// Fetch several nodes, failing if any is absent.
    pub fn get_many(&self, ids: &[NodeId]) -> Result<Vec<ThoughtNode>, StoreError> {
        let nodes = self.read();
        ids.iter()
            .map(|id| nodes.get(id).cloned().ok_or(StoreError::NodeNotFound(*id)))
            .collect()
    }

    pub fn stage_nodes(&self, stage: StageKind) -> Vec<ThoughtNode> {
        self.read()
            .values()
            .filter(|n| n.stage == stage)
            .cloned()
            .collect()
    }

    /// Version history of a node: the node itself followed by the nodes
    /// it was derived from, following the first provenance link.
    pub fn lineage(&self, id: NodeId) -> Vec<ThoughtNode> {
        let nodes = self.read();
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = nodes.get(&current) else {
                break;
            };
            cursor = node.provenance.first().copied();
            chain.push(node.clone());
        }
        chain
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of nodes with the given status.
    pub fn count(&self, status: NodeStatus) -> usize {
        self.read().values().filter(|n| n.status == status).count()
    }
}
