//! Thought graph: operations plus an explicit, acyclic dependency relation.
//!
//! One graph describes one stage. Operation `B` depending on `A` means `B`
//! consumes `A`'s surviving output nodes and may not start before `A` has
//! succeeded. All queries return operations in ascending id order so that
//! replays over the same completed-set are reproducible.

mod operation;

pub use operation::*;

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{GraphError, GraphResult};
use crate::thought::StageKind;

/// DAG of operations for a single stage.
#[derive(Debug, Clone)]
pub struct ThoughtGraph {
    stage: StageKind,
    operations: BTreeMap<OperationId, Operation>,
    /// operation -> operations it depends on
    dependencies: BTreeMap<OperationId, BTreeSet<OperationId>>,
    next_id: u32,
}

impl ThoughtGraph {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            operations: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    /// Add an operation that depends on already-added operations.
    ///
    /// Fails fast on invalid configuration or unknown dependencies.
    pub fn add_operation(
        &mut self,
        mut op: Operation,
        depends_on: impl IntoIterator<Item = OperationId>,
    ) -> GraphResult<OperationId> {
        op.validate()?;

        let deps: BTreeSet<OperationId> = depends_on.into_iter().collect();
        if let Some(missing) = deps.iter().find(|d| !self.operations.contains_key(d)) {
            return Err(GraphError::UnknownOperation(*missing));
        }

        let id = OperationId(self.next_id);
        self.next_id += 1;
        if op.label.is_empty() {
            op.label = format!("{}.{}#{}", self.stage, op.kind, id.0);
        }
        self.operations.insert(id, op);
        self.dependencies.insert(id, deps);
        Ok(id)
    }

    /// Declare that `op` consumes the output of `depends_on`.
    ///
    /// Rejected with [`GraphError::Cycle`] if the edge would close a cycle.
    pub fn add_dependency(&mut self, op: OperationId, depends_on: OperationId) -> GraphResult<()> {
        for id in [op, depends_on] {
            if !self.operations.contains_key(&id) {
                return Err(GraphError::UnknownOperation(id));
            }
        }
        if op == depends_on || self.depends_transitively(depends_on, op) {
            return Err(GraphError::Cycle {
                from: depends_on,
                to: op,
            });
        }
        self.dependencies.entry(op).or_default().insert(depends_on);
        Ok(())
    }

    /// Whether `op` depends on `target` through any chain of edges.
    fn depends_transitively(&self, op: OperationId, target: OperationId) -> bool {
        let mut stack = vec![op];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            for dep in self.dependencies(current) {
                if *dep == target {
                    return true;
                }
                stack.push(*dep);
            }
        }
        false
    }

    pub fn operation(&self, id: OperationId) -> Option<&Operation> {
        self.operations.get(&id)
    }

    pub fn operations(&self) -> impl Iterator<Item = (OperationId, &Operation)> {
        self.operations.iter().map(|(id, op)| (*id, op))
    }

    pub fn operation_ids(&self) -> impl Iterator<Item = OperationId> + '_ {
        self.operations.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Direct dependencies of `id`, ascending.
    pub fn dependencies(&self, id: OperationId) -> impl Iterator<Item = &OperationId> {
        self.dependencies.get(&id).into_iter().flatten()
    }

    /// Operations that consume `id` directly, ascending.
    pub fn dependents(&self, id: OperationId) -> Vec<OperationId> {
        self.dependencies
            .iter()
            .filter(|(_, deps)| deps.contains(&id))
            .map(|(op, _)| *op)
            .collect()
    }

    /// Operations not yet in `completed` whose dependencies all are.
    pub fn ready_operations(&self, completed: &BTreeSet<OperationId>) -> Vec<OperationId> {
        self.operations
            .keys()
            .filter(|id| !completed.contains(id))
            .filter(|id| self.dependencies(**id).all(|d| completed.contains(d)))
            .copied()
            .collect()
    }

    /// Operations with no dependencies.
    pub fn roots(&self) -> Vec<OperationId> {
        self.ready_operations(&BTreeSet::new())
    }

    /// Operations nothing else consumes: they produce the stage's output.
    pub fn terminal_operations(&self) -> Vec<OperationId> {
        let consumed: BTreeSet<OperationId> =
            self.dependencies.values().flatten().copied().collect();
        self.operations
            .keys()
            .filter(|id| !consumed.contains(id))
            .copied()
            .collect()
    }

    /// Deterministic topological order (Kahn's algorithm, smallest id first).
    pub fn topological_order(&self) -> Vec<OperationId> {
        let mut completed = BTreeSet::new();
        let mut order = Vec::with_capacity(self.operations.len());
        loop {
            let Some(next) = self.ready_operations(&completed).into_iter().next() else {
                break;
            };
            completed.insert(next);
            order.push(next);
        }
        order
    }
}
