//! Shared fakes for integration tests.
//!
//! The backends answer the default chemical prompts by recognising which
//! instruction a prompt starts with, so full pipeline runs need no network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use emergency_reasoning::config::PipelineConfig;
use emergency_reasoning::error::{InferenceError, InferenceResult};
use emergency_reasoning::inference::{
    Completion, CompletionRequest, InferenceAdapter, InferenceBackend, RetryPolicy, Usage,
};
use emergency_reasoning::prompts::ChemicalPromptBuilder;
use emergency_reasoning::schema::chemical_schemas;
use emergency_reasoning::thought::StageKind;
use emergency_reasoning::Pipeline;

pub const REPAIR_MARKER: &str = "A previous answer was rejected";

pub fn situation_document() -> Value {
    json!({
        "basic_info": {
            "time": "2024-03-15 10:00",
            "location": "Jiangbei New Area, Nanjing",
            "enterprise": "chemical plant"
        },
        "accident_info": {
            "type": "leak",
            "chemical": "chlorine",
            "cause": "valve failure"
        },
        "weather_conditions": {
            "weather": "clear",
            "temperature": "20",
            "wind_direction": "south-east",
            "wind_speed": "force 3"
        }
    })
}

pub fn impact_document() -> Value {
    json!({
        "dispersion_prediction": {
            "affected_radius": "1500",
            "direction": "north-west"
        },
        "population_impact": {
            "residents_at_risk": "12000",
            "evacuation_radius": "2000"
        }
    })
}

pub fn response_document() -> Value {
    json!({
        "emergency_level": {"level": "II", "reason": "toxic gas near residents"},
        "evacuation_plan": {"radius": "2000", "routes": ["north-west corridor"]}
    })
}

/// Which stage a default chemical prompt is about.
pub fn prompt_stage(prompt: &str) -> Option<StageKind> {
    if prompt.starts_with("Analyse the following chemical accident report") {
        return Some(StageKind::SituationAnalysis);
    }
    if prompt.starts_with("Assess the impact") {
        return Some(StageKind::ImpactAssessment);
    }
    if prompt.starts_with("Draw up an emergency response plan") {
        return Some(StageKind::ResponsePlan);
    }
    let first_line = prompt.lines().next().unwrap_or_default();
    StageKind::ALL
        .into_iter()
        .find(|stage| first_line.contains(&stage.as_str().replace('_', " ")))
}

pub fn is_score_prompt(prompt: &str) -> bool {
    prompt.starts_with("You are reviewing a candidate")
}

/// Answers every default prompt with a valid document or score.
///
/// Optionally drops one key from merged or refined documents of one
/// stage, either until a repair prompt arrives or always, and fails
/// generate branches whose prompt contains one of `failing_drafts`.
#[derive(Default)]
pub struct ChemicalBackend {
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    broken: Option<(StageKind, &'static str)>,
    repairs_fix: bool,
    failing_drafts: Vec<String>,
}

impl ChemicalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Omit `key` from `stage`'s merged document until asked to repair.
    pub fn omitting_until_repair(stage: StageKind, key: &'static str) -> Self {
        Self {
            broken: Some((stage, key)),
            repairs_fix: true,
            ..Self::default()
        }
    }

    /// Omit `key` from `stage`'s merged document, repair or not.
    pub fn always_omitting(stage: StageKind, key: &'static str) -> Self {
        Self {
            broken: Some((stage, key)),
            repairs_fix: false,
            ..Self::default()
        }
    }

    /// Fail generate branches numbered `drafts` (1-based, as shown in the
    /// prompt; draft #1 carries no marker and cannot be failed).
    pub fn failing_drafts(drafts: &[usize]) -> Self {
        Self {
            failing_drafts: drafts
                .iter()
                .map(|d| format!("independent draft #{}.", d))
                .collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn document(&self, stage: StageKind, prompt: &str) -> Value {
        let mut document = match stage {
            StageKind::SituationAnalysis => situation_document(),
            StageKind::ImpactAssessment => impact_document(),
            StageKind::ResponsePlan => response_document(),
        };
        if let Some((broken_stage, key)) = self.broken {
            let repairing = prompt.contains(REPAIR_MARKER);
            if broken_stage == stage && !(repairing && self.repairs_fix) {
                document.as_object_mut().unwrap().remove(key);
            }
        }
        document
    }
}

#[async_trait]
impl InferenceBackend for ChemicalBackend {
    async fn complete(&self, request: &CompletionRequest) -> InferenceResult<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let prompt = request.prompt.as_str();

        if is_score_prompt(prompt) {
            return Ok(Completion {
                text: r#"{"score": 7.5, "rationale": "complete"}"#.to_string(),
                usage: Some(Usage {
                    prompt_tokens: 100,
                    completion_tokens: 10,
                    total_tokens: 110,
                }),
            });
        }
        if self.failing_drafts.iter().any(|d| prompt.contains(d.as_str())) {
            return Err(InferenceError::Api {
                status: 400,
                message: "content filtered".to_string(),
            });
        }

        let stage = prompt_stage(prompt).ok_or_else(|| InferenceError::Api {
            status: 400,
            message: "unrecognised prompt".to_string(),
        })?;
        let body = self.document(stage, prompt);
        Ok(Completion {
            text: format!("```json\n{}\n```", serde_json::to_string_pretty(&body).unwrap()),
            usage: Some(Usage {
                prompt_tokens: 400,
                completion_tokens: 200,
                total_tokens: 600,
            }),
        })
    }
}

/// Every call fails with a transient server error.
#[derive(Default)]
pub struct UnavailableBackend {
    calls: AtomicUsize,
}

impl UnavailableBackend {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for UnavailableBackend {
    async fn complete(&self, _request: &CompletionRequest) -> InferenceResult<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(InferenceError::Api {
            status: 503,
            message: "service unavailable".to_string(),
        })
    }
}

/// Small, fast pipeline configuration.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        max_concurrency: 4,
        branching_factor: 3,
        keep_best_k: 2,
        run_timeout_secs: 30,
        ..PipelineConfig::default()
    }
}

/// Adapter with two quick retries and no jitter.
pub fn adapter(backend: Arc<dyn InferenceBackend>, config: &PipelineConfig) -> Arc<InferenceAdapter> {
    Arc::new(InferenceAdapter::new(
        backend,
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5)),
        config.max_concurrency,
        Duration::from_secs(5),
    ))
}

pub fn pipeline(backend: Arc<dyn InferenceBackend>, config: PipelineConfig) -> Pipeline {
    let adapter = adapter(backend, &config);
    Pipeline::new(
        config,
        adapter,
        Arc::new(ChemicalPromptBuilder::new()),
        chemical_schemas().unwrap(),
    )
    .unwrap()
}
