//! Final report artifact, and the diagnostic dump of a whole run.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::info;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::inference::UsageSummary;
use crate::pipeline::{PipelineRun, RunStatus};
use crate::thought::{StageKind, ThoughtNode};

/// The three validated stage documents, and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub situation_analysis: Value,
    pub impact_assessment: Value,
    pub response_plan: Value,
}

impl Report {
    /// Build the report from a completed run.
    pub fn from_run(run: &PipelineRun) -> Result<Self, PipelineError> {
        let document = |stage: StageKind| {
            run.result(stage)
                .map(|r| r.document.clone())
                .ok_or_else(|| PipelineError::Report {
                    message: format!("run has no validated {} document", stage),
                })
        };
        Ok(Self {
            situation_analysis: document(StageKind::SituationAnalysis)?,
            impact_assessment: document(StageKind::ImpactAssessment)?,
            response_plan: document(StageKind::ResponsePlan)?,
        })
    }

    /// Write the report as pretty JSON.
    ///
    /// The file is written next to `path` and renamed into place, so
    /// readers never observe a partial report.
    pub fn write_atomic(&self, path: &Path) -> Result<(), PipelineError> {
        write_json_atomic(self, path)?;
        info!(path = %path.display(), "Report written");
        Ok(())
    }
}

/// Everything a run left behind, for post-hoc debugging: per stage the
/// validated document (if any) and every node, failed ones included.
#[derive(Debug, Clone, Serialize)]
pub struct DebugDump {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub usage: Option<UsageSummary>,
    pub stages: BTreeMap<StageKind, StageDump>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageDump {
    pub document: Option<Value>,
    pub attempts: Option<u32>,
    pub nodes: Vec<ThoughtNode>,
}

impl DebugDump {
    /// Snapshot a finished run, whether it succeeded or not.
    pub fn from_run(run: &PipelineRun) -> Self {
        let stages = StageKind::ALL
            .into_iter()
            .map(|stage| {
                let result = run.result(stage);
                let dump = StageDump {
                    document: result.map(|r| r.document.clone()),
                    attempts: result.map(|r| r.attempts),
                    nodes: run.store().stage_nodes(stage),
                };
                (stage, dump)
            })
            .collect();
        Self {
            run_id: run.id,
            status: run.status,
            started_at: run.started_at,
            finished_at: run.finished_at,
            usage: run.usage,
            stages,
        }
    }

    pub fn write_atomic(&self, path: &Path) -> Result<(), PipelineError> {
        write_json_atomic(self, path)?;
        info!(path = %path.display(), "Debug dump written");
        Ok(())
    }
}

/// Pretty JSON through a temp file in the target directory, renamed into
/// place once fully written.
fn write_json_atomic<T: Serialize>(value: &T, path: &Path) -> Result<(), PipelineError> {
    let report_error = |action: &str, e: &dyn std::fmt::Display| PipelineError::Report {
        message: format!("failed to {} {}: {}", action, path.display(), e),
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir).map_err(|e| report_error("create", &e))?;
    serde_json::to_writer_pretty(&mut file, value).map_err(|e| report_error("write", &e))?;
    file.write_all(b"\n")
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| report_error("write", &e))?;
    file.persist(path)
        .map_err(|e| report_error("persist", &e.error))?;
    Ok(())
}
