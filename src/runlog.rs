//! Append-only record of what happened during a run.
//!
//! Every event is also emitted through `tracing`. The log is kept in memory
//! for diagnostics and can be dumped as JSON Lines; nothing reads it back.

use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::FieldIssue;
use crate::graph::{OperationId, OperationKind};
use crate::pipeline::RunStatus;
use crate::thought::StageKind;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted {
        run_id: Uuid,
    },
    StageStarted {
        attempt: u32,
        operations: usize,
    },
    OperationDispatched {
        operation: OperationId,
        label: String,
        kind: OperationKind,
        inputs: usize,
    },
    OperationSucceeded {
        operation: OperationId,
        label: String,
        outputs: usize,
        failed_outputs: usize,
    },
    OperationFailed {
        operation: OperationId,
        label: String,
        error: String,
    },
    StageValidated {
        attempt: u32,
    },
    StageRejected {
        attempt: u32,
        issues: Vec<FieldIssue>,
    },
    RepairScheduled {
        operations: Vec<OperationId>,
    },
    StageFailed {
        error: String,
    },
    RunFinished {
        status: RunStatus,
    },
}

/// One log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunEvent {
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageKind>,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

/// Append-only event log shared by the pipeline and executors.
#[derive(Debug, Default)]
pub struct RunLog {
    events: Mutex<Vec<RunEvent>>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RunEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event.
    pub fn record(&self, stage: Option<StageKind>, kind: RunEventKind) {
        trace_event(stage, &kind);
        self.lock().push(RunEvent {
            at: Utc::now(),
            stage,
            kind,
        });
    }

    /// Snapshot of all events so far.
    pub fn events(&self) -> Vec<RunEvent> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Write the log as JSON Lines.
    pub fn write_jsonl(&self, path: &Path) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        for event in self.lock().iter() {
            serde_json::to_writer(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()
    }
}

fn trace_event(stage: Option<StageKind>, kind: &RunEventKind) {
    let stage = stage.map(|s| s.as_str()).unwrap_or("-");
    match kind {
        RunEventKind::RunStarted { run_id } => info!(%run_id, "Run started"),
        RunEventKind::StageStarted {
            attempt,
            operations,
        } => info!(stage, attempt, operations, "Stage started"),
        RunEventKind::OperationDispatched {
            operation,
            label,
            kind,
            inputs,
        } => debug!(stage, %operation, %label, %kind, inputs, "Operation dispatched"),
        RunEventKind::OperationSucceeded {
            operation,
            label,
            outputs,
            failed_outputs,
        } => info!(
            stage,
            %operation,
            %label,
            outputs,
            failed_outputs,
            "Operation succeeded"
        ),
        RunEventKind::OperationFailed {
            operation,
            label,
            error,
        } => warn!(stage, %operation, %label, %error, "Operation failed"),
        RunEventKind::StageValidated { attempt } => info!(stage, attempt, "Stage validated"),
        RunEventKind::StageRejected { attempt, issues } => {
            warn!(stage, attempt, issues = issues.len(), "Stage document rejected")
        }
        RunEventKind::RepairScheduled { operations } => {
            info!(stage, operations = ?operations, "Targeted repair scheduled")
        }
        RunEventKind::StageFailed { error } => warn!(stage, %error, "Stage failed"),
        RunEventKind::RunFinished { status } => info!(status = ?status, "Run finished"),
    }
}
