//! Schema Validator/Aggregator.
//!
//! Once a stage graph completes, the outputs of its terminal operations are
//! merged into one stage document and validated against the stage's JSON
//! Schema. A violation lists every missing or malformed field, which the
//! pipeline maps back to the operations responsible for a targeted repair.

mod chemical;

pub use chemical::{chemical_schema, chemical_schemas};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use jsonschema::error::ValidationErrorKind;
use jsonschema::JSONSchema;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult, FieldIssue, IssueKind, SchemaViolation};
use crate::graph::{OperationId, ThoughtGraph};
use crate::thought::{Payload, StageKind, ThoughtNode};

/// Compiled expected shape of one stage's document.
#[derive(Clone)]
pub struct StageSchema {
    stage: StageKind,
    schema: Value,
    compiled: Arc<JSONSchema>,
}

impl StageSchema {
    pub fn new(stage: StageKind, schema: Value) -> AppResult<Self> {
        let compiled = JSONSchema::compile(&schema).map_err(|e| AppError::Config {
            message: format!("Invalid schema for {}: {}", stage, e),
        })?;
        Ok(Self {
            stage,
            schema,
            compiled: Arc::new(compiled),
        })
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Check `document` against the schema. Never modifies the document.
    pub fn validate(&self, document: &Value) -> Result<(), SchemaViolation> {
        let result = self.compiled.validate(document);
        let errors = match result {
            Ok(()) => return Ok(()),
            Err(errors) => errors,
        };

        let mut issues: Vec<FieldIssue> = errors
            .map(|error| {
                let path = error.instance_path.to_string();
                match &error.kind {
                    ValidationErrorKind::Required { property } => FieldIssue {
                        path: format!(
                            "{}/{}",
                            path,
                            property.as_str().map(str::to_string).unwrap_or_else(|| property.to_string())
                        ),
                        kind: IssueKind::Missing,
                        message: error.to_string(),
                    },
                    _ => FieldIssue {
                        path,
                        kind: IssueKind::Malformed,
                        message: error.to_string(),
                    },
                }
            })
            .collect();
        issues.sort_by(|a, b| a.path.cmp(&b.path));
        issues.dedup_by(|a, b| a.path == b.path && a.kind == b.kind);

        debug!(stage = %self.stage, issues = issues.len(), "Stage document rejected");
        Err(SchemaViolation {
            stage: self.stage,
            issues,
        })
    }
}

impl std::fmt::Debug for StageSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSchema")
            .field("stage", &self.stage)
            .field("schema", &self.schema)
            .finish()
    }
}

/// Schemas for every stage.
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    schemas: BTreeMap<StageKind, StageSchema>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, schema: StageSchema) {
        self.schemas.insert(schema.stage(), schema);
    }

    pub fn get(&self, stage: StageKind) -> Option<&StageSchema> {
        self.schemas.get(&stage)
    }

    /// Validate a stage document. Stages without a schema accept any
    /// JSON object.
    pub fn validate(&self, stage: StageKind, document: &Value) -> Result<(), SchemaViolation> {
        match self.get(stage) {
            Some(schema) => schema.validate(document),
            None if document.is_object() => Ok(()),
            None => Err(SchemaViolation {
                stage,
                issues: vec![FieldIssue {
                    path: String::new(),
                    kind: IssueKind::Malformed,
                    message: "stage document must be a JSON object".to_string(),
                }],
            }),
        }
    }
}

/// Surviving output of one terminal operation.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub operation: OperationId,
    /// Document key the operation fills, if restricted to one.
    pub section: Option<String>,
    pub nodes: Vec<ThoughtNode>,
}

/// Merge terminal outputs into a stage document.
///
/// A contribution with a section fills `document[section]`, unwrapping a
/// payload that is itself `{section: ...}`. Other contributions merge their
/// object keys into the root. Earlier contributions win on conflicts.
pub fn assemble(contributions: &[Contribution]) -> Value {
    let mut document = Map::new();
    for contribution in contributions {
        for node in &contribution.nodes {
            let Some(Payload::Json(value)) = &node.payload else {
                warn!(node_id = %node.id, "Skipping non-JSON terminal output");
                continue;
            };
            match (&contribution.section, value) {
                (Some(section), Value::Object(map)) if map.len() == 1 && map.contains_key(section) => {
                    document
                        .entry(section.clone())
                        .or_insert_with(|| map[section].clone());
                }
                (Some(section), value) => {
                    document
                        .entry(section.clone())
                        .or_insert_with(|| value.clone());
                }
                (None, Value::Object(map)) => {
                    for (key, value) in map {
                        document.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                }
                (None, _) => {
                    warn!(node_id = %node.id, "Skipping terminal output that is not an object");
                }
            }
        }
    }
    Value::Object(document)
}

/// Terminal operations whose output caused `violation`.
///
/// Sections owned by a sectioned operation map to that operation. Anything
/// else, including root-level problems, is attributed to the operations
/// that merge into the document root, or to every terminal operation when
/// there are none.
pub fn responsible_operations(
    graph: &ThoughtGraph,
    violation: &SchemaViolation,
) -> BTreeSet<OperationId> {
    let terminals = graph.terminal_operations();
    let section_of = |id: OperationId| {
        graph
            .operation(id)
            .and_then(|op| op.config.section.as_deref())
    };
    let root_writers: BTreeSet<OperationId> = terminals
        .iter()
        .copied()
        .filter(|id| section_of(*id).is_none())
        .collect();
    let fallback = || {
        if root_writers.is_empty() {
            terminals.iter().copied().collect::<BTreeSet<_>>()
        } else {
            root_writers.clone()
        }
    };

    let mut responsible = BTreeSet::new();
    for issue in &violation.issues {
        let owners: Vec<OperationId> = match issue.section() {
            Some(section) => terminals
                .iter()
                .copied()
                .filter(|id| section_of(*id) == Some(section))
                .collect(),
            None => Vec::new(),
        };
        if owners.is_empty() {
            responsible.extend(fallback());
        } else {
            responsible.extend(owners);
        }
    }
    responsible
}
