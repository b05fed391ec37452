//! Prompt assembly.
//!
//! Operations never format prompts themselves; they describe what they need
//! in a [`PromptRequest`] and an injected [`PromptBuilder`] renders it. The
//! chemical-emergency wording lives in [`ChemicalPromptBuilder`].

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{IssueKind, SchemaViolation};
use crate::graph::OperationKind;
use crate::thought::{StageKind, ThoughtNode};

/// What an operation needs a prompt for.
#[derive(Debug, Clone, Copy)]
pub struct PromptRequest<'a> {
    pub stage: StageKind,
    pub kind: &'a OperationKind,
    /// Raw incident description.
    pub incident: &'a str,
    /// Validated documents of earlier stages.
    pub prior: &'a BTreeMap<StageKind, Value>,
    /// Nodes the prompt is about.
    pub inputs: &'a [ThoughtNode],
    /// Index of the sibling being generated, for fan-out.
    pub branch: Option<usize>,
    /// Stage-document section the operation fills, if restricted to one.
    pub section: Option<&'a str>,
    pub critique: Option<&'a str>,
    /// Problems to fix when the stage is being repaired.
    pub repair: Option<&'a SchemaViolation>,
}

/// Renders prompt text for an operation.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, request: &PromptRequest<'_>) -> String;
}

/// Stage 1 output layout.
pub const SITUATION_ANALYSIS_PROMPT: &str = r#"Analyse the following chemical accident report and extract the key facts.

Incident report:
{incident}

Respond with valid JSON in exactly this format:
{
  "basic_info": {
    "time": "time of the incident (YYYY-MM-DD HH:MM:SS)",
    "location": "incident location",
    "company": "company where the accident happened"
  },
  "accident_info": {
    "type": "accident type (leak, explosion, fire, ...)",
    "status": "current status (ongoing leak, contained, ...)",
    "development": "how the accident developed and is spreading"
  },
  "weather_conditions": {
    "weather": "weather (clear, rain, snow, ...)",
    "wind_direction": "wind direction",
    "wind_speed": "wind speed",
    "temperature": "temperature in degrees Celsius"
  },
  "geographical_info": {
    "area_type": "area type (industrial, urban, rural, ...)",
    "distance_to_residential": "distance to the nearest residential area in metres"
  },
  "sensitive_targets": {
    "residential_areas": ["nearby residential areas"],
    "schools": ["nearby schools"],
    "hospitals": ["nearby hospitals"]
  }
}

All keys must be in English. Mark anything the report does not state as "insufficient information"."#;

/// Stage 2 output layout.
pub const IMPACT_ASSESSMENT_PROMPT: &str = r#"Assess the impact of the chemical accident described by this situation analysis.

Situation analysis:
{situation_analysis}

Respond with valid JSON in exactly this format:
{
  "dispersion_prediction": {
    "affected_radius": "affected radius in metres",
    "main_direction": "main dispersion direction",
    "spread_speed": "estimated spread speed",
    "high_risk_area": "high risk area",
    "medium_risk_area": "medium risk area",
    "low_risk_area": "low risk area"
  },
  "population_impact": {
    "evacuation_radius": "recommended evacuation radius in metres",
    "affected_population": "estimated affected population",
    "priority_evacuation": "areas to evacuate first",
    "estimated_casualties": {"severe": "", "moderate": "", "mild": ""}
  },
  "environmental_impact": {
    "air_pollution": {"severity": "", "duration": "", "main_pollutants": ""},
    "water_pollution": {"severity": "", "affected_water_bodies": "", "duration": ""},
    "soil_contamination": {"severity": "", "affected_area": "", "duration": ""}
  },
  "secondary_disasters": {
    "explosion_risk": "",
    "fire_risk": "",
    "toxic_release_risk": "",
    "potential_chain_reactions": ""
  },
  "social_impact": {
    "economic_loss": "",
    "social_stability": "",
    "industry_impact": ""
  }
}

All keys must be in English. Mark anything that cannot be assessed as "insufficient information"."#;

/// Stage 3 output layout.
pub const RESPONSE_PLAN_PROMPT: &str = r#"Draw up an emergency response plan for the chemical accident below.

Situation analysis:
{situation_analysis}

Impact assessment:
{impact_assessment}

Respond with valid JSON in exactly this format:
{
  "emergency_level": {
    "level": "response level (I, II, III or IV)",
    "reason": "why this level applies"
  },
  "evacuation_plan": {
    "priority_zones": ["zones to evacuate first"],
    "evacuation_routes": ["recommended routes"],
    "assembly_points": ["assembly points"],
    "vulnerable_groups_arrangements": "arrangements for elderly, children and patients",
    "transportation_arrangements": "transport arrangements"
  },
  "onsite_response": {
    "isolation_zone": "",
    "leakage_control": {"method": "", "backup_plans": []},
    "hazard_neutralization": {"method": "", "equipment": []},
    "ppe_requirements": ""
  },
  "medical_response": {
    "triage_locations": [],
    "ambulance_standby": "",
    "medical_supplies": [],
    "specialist_team": ""
  },
  "environmental_monitoring": {
    "air_quality": {"parameters": [], "monitoring_points": []},
    "water_monitoring": {"parameters": [], "sampling_locations": []},
    "reporting_frequency": ""
  },
  "resource_allocation": {
    "emergency_personnel": {"onsite_command": "", "firefighters": "", "medical_staff": "", "security": ""},
    "equipment": {"vehicles": [], "specialized_equipment": []},
    "external_support": {"government_agencies": [], "nearby_enterprises": []}
  },
  "information_management": {
    "notification_chain": [],
    "public_communication": {"channels": [], "frequency": "", "content": ""},
    "rumor_control": ""
  },
  "recovery_plan": {
    "site_cleanup": {"methods": "", "timeline": ""},
    "environmental_restoration": {"soil_remediation": "", "vegetation_recovery": ""},
    "production_resumption": {"safety_inspection": "", "equipment_testing": "", "staff_training": ""},
    "long_term_monitoring": ""
  }
}

All keys must be in English. Mark anything that cannot be planned from the inputs as "insufficient information"."#;

/// Instruction for scoring one candidate.
pub const SCORE_PROMPT: &str = r#"You are reviewing a candidate {stage} for a chemical accident.

Incident report:
{incident}

Candidate:
{candidate}

Rate the candidate from 0 to 10 for completeness, internal consistency and faithfulness to the report.
Respond with valid JSON only: {"score": <number>, "rationale": "<one sentence>"}"#;

/// Instruction for merging candidates.
pub const AGGREGATE_PROMPT: &str = r#"Several candidate versions of a {stage} for the same chemical accident follow.
Merge them into one document that keeps the most specific, best supported details and resolves contradictions in favour of the incident report.

Incident report:
{incident}

Candidates:
{candidates}

Respond with a single JSON object using the same keys as the candidates."#;

/// Instruction for improving one document.
pub const REFINE_PROMPT: &str = r#"Improve the following {stage} for a chemical accident.

Incident report:
{incident}

Current version:
{candidate}

Instruction:
{critique}

Respond with the complete improved JSON object using the same keys."#;

/// Default prompt builder for the chemical-emergency pipeline.
#[derive(Debug, Clone, Default)]
pub struct ChemicalPromptBuilder;

impl ChemicalPromptBuilder {
    pub fn new() -> Self {
        Self
    }

    fn stage_prompt(&self, request: &PromptRequest<'_>) -> String {
        let prior = |stage: StageKind| {
            request
                .prior
                .get(&stage)
                .map(pretty)
                .unwrap_or_else(|| "{}".to_string())
        };
        match request.stage {
            StageKind::SituationAnalysis => {
                SITUATION_ANALYSIS_PROMPT.replace("{incident}", request.incident)
            }
            StageKind::ImpactAssessment => IMPACT_ASSESSMENT_PROMPT
                .replace("{situation_analysis}", &prior(StageKind::SituationAnalysis)),
            StageKind::ResponsePlan => RESPONSE_PLAN_PROMPT
                .replace("{situation_analysis}", &prior(StageKind::SituationAnalysis))
                .replace("{impact_assessment}", &prior(StageKind::ImpactAssessment)),
        }
    }

    fn generate_prompt(&self, request: &PromptRequest<'_>) -> String {
        let mut prompt = self.stage_prompt(request);
        if let Some(branch) = request.branch.filter(|b| *b > 0) {
            prompt.push_str(&format!(
                "\n\nThis is independent draft #{}. Reason it through on your own rather than repeating a standard answer.",
                branch + 1
            ));
        }
        prompt
    }

    fn candidate_prompt(&self, template: &str, request: &PromptRequest<'_>) -> String {
        let candidate = request
            .inputs
            .first()
            .map(ThoughtNode::prompt_text)
            .unwrap_or_default();
        template
            .replace("{stage}", &stage_title(request.stage))
            .replace("{incident}", request.incident)
            .replace("{candidate}", &candidate)
    }

    fn aggregate_prompt(&self, request: &PromptRequest<'_>) -> String {
        let candidates = request
            .inputs
            .iter()
            .enumerate()
            .map(|(i, node)| format!("--- Candidate {} ---\n{}", i + 1, node.prompt_text()))
            .collect::<Vec<_>>()
            .join("\n\n");
        AGGREGATE_PROMPT
            .replace("{stage}", &stage_title(request.stage))
            .replace("{incident}", request.incident)
            .replace("{candidates}", &candidates)
    }
}

impl PromptBuilder for ChemicalPromptBuilder {
    fn build(&self, request: &PromptRequest<'_>) -> String {
        let mut prompt = match request.kind {
            OperationKind::Generate => self.generate_prompt(request),
            OperationKind::Score => self.candidate_prompt(SCORE_PROMPT, request),
            OperationKind::Aggregate => self.aggregate_prompt(request),
            OperationKind::Refine => self
                .candidate_prompt(REFINE_PROMPT, request)
                .replace(
                    "{critique}",
                    request
                        .critique
                        .unwrap_or("Make every field specific and actionable."),
                ),
            OperationKind::KeepBestK | OperationKind::Custom(_) => self.stage_prompt(request),
        };

        if let Some(section) = request.section {
            prompt.push_str(&format!(
                "\n\nOnly the \"{}\" section is needed. Respond with a JSON object containing that key alone.",
                section
            ));
        }

        if let Some(violation) = request.repair {
            prompt.push_str(&repair_note(violation));
        }
        prompt
    }
}

/// Human-readable list of the problems a repair must fix.
pub fn repair_note(violation: &SchemaViolation) -> String {
    let mut note =
        String::from("\n\nA previous answer was rejected. Fix these problems and return the complete JSON object:");
    for issue in &violation.issues {
        let path = if issue.path.is_empty() { "/" } else { &issue.path };
        match issue.kind {
            IssueKind::Missing => note.push_str(&format!("\n- {} is missing", path)),
            IssueKind::Malformed => {
                note.push_str(&format!("\n- {} is malformed: {}", path, issue.message))
            }
        }
    }
    note
}

fn stage_title(stage: StageKind) -> String {
    stage.as_str().replace('_', " ")
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FieldIssue;
    use crate::thought::Payload;
    use serde_json::json;

    fn request<'a>(
        stage: StageKind,
        kind: &'a OperationKind,
        prior: &'a BTreeMap<StageKind, Value>,
        inputs: &'a [ThoughtNode],
    ) -> PromptRequest<'a> {
        PromptRequest {
            stage,
            kind,
            incident: "Chlorine leak at Acme Chemicals, 2024-05-01 14:00, NE wind 3 m/s",
            prior,
            inputs,
            branch: None,
            section: None,
            critique: None,
            repair: None,
        }
    }

    #[test]
    fn test_prompts_request_json() {
        for prompt in [
            SITUATION_ANALYSIS_PROMPT,
            IMPACT_ASSESSMENT_PROMPT,
            RESPONSE_PLAN_PROMPT,
            SCORE_PROMPT,
            AGGREGATE_PROMPT,
            REFINE_PROMPT,
        ] {
            assert!(prompt.contains("JSON"));
        }
    }

    #[test]
    fn test_situation_prompt_embeds_incident() {
        let prior = BTreeMap::new();
        let prompt = ChemicalPromptBuilder.build(&request(
            StageKind::SituationAnalysis,
            &OperationKind::Generate,
            &prior,
            &[],
        ));
        assert!(prompt.contains("Chlorine leak at Acme Chemicals"));
        assert!(prompt.contains("\"weather_conditions\""));
        assert!(!prompt.contains("{incident}"));
    }

    #[test]
    fn test_response_prompt_embeds_prior_documents() {
        let prior = BTreeMap::from([
            (
                StageKind::SituationAnalysis,
                json!({"basic_info": {"company": "Acme"}}),
            ),
            (
                StageKind::ImpactAssessment,
                json!({"dispersion_prediction": {"affected_radius": "800"}}),
            ),
        ]);
        let prompt = ChemicalPromptBuilder.build(&request(
            StageKind::ResponsePlan,
            &OperationKind::Generate,
            &prior,
            &[],
        ));
        assert!(prompt.contains("\"company\": \"Acme\""));
        assert!(prompt.contains("\"affected_radius\": \"800\""));
        assert!(prompt.contains("\"evacuation_plan\""));
    }

    #[test]
    fn test_branch_note_only_for_later_siblings() {
        let prior = BTreeMap::new();
        let mut req = request(
            StageKind::SituationAnalysis,
            &OperationKind::Generate,
            &prior,
            &[],
        );
        req.branch = Some(0);
        assert!(!ChemicalPromptBuilder.build(&req).contains("draft #"));
        req.branch = Some(2);
        assert!(ChemicalPromptBuilder.build(&req).contains("draft #3"));
    }

    #[test]
    fn test_score_and_aggregate_include_candidates() {
        let prior = BTreeMap::new();
        let inputs = vec![
            ThoughtNode::seed(
                StageKind::SituationAnalysis,
                Payload::Json(json!({"basic_info": {"company": "Acme"}})),
            ),
            ThoughtNode::seed(
                StageKind::SituationAnalysis,
                Payload::Json(json!({"basic_info": {"company": "Beta"}})),
            ),
        ];

        let score = ChemicalPromptBuilder.build(&request(
            StageKind::SituationAnalysis,
            &OperationKind::Score,
            &prior,
            &inputs[..1],
        ));
        assert!(score.contains("situation analysis"));
        assert!(score.contains("Acme"));
        assert!(score.contains("\"score\""));

        let aggregate = ChemicalPromptBuilder.build(&request(
            StageKind::SituationAnalysis,
            &OperationKind::Aggregate,
            &prior,
            &inputs,
        ));
        assert!(aggregate.contains("Candidate 1"));
        assert!(aggregate.contains("Beta"));
    }

    #[test]
    fn test_repair_note_lists_issues() {
        let prior = BTreeMap::new();
        let violation = SchemaViolation {
            stage: StageKind::SituationAnalysis,
            issues: vec![
                FieldIssue {
                    path: "/weather_conditions".to_string(),
                    kind: IssueKind::Missing,
                    message: "required".to_string(),
                },
                FieldIssue {
                    path: "/basic_info".to_string(),
                    kind: IssueKind::Malformed,
                    message: "must not be empty".to_string(),
                },
            ],
        };
        let mut req = request(
            StageKind::SituationAnalysis,
            &OperationKind::Aggregate,
            &prior,
            &[],
        );
        req.repair = Some(&violation);
        let prompt = ChemicalPromptBuilder.build(&req);
        assert!(prompt.contains("/weather_conditions is missing"));
        assert!(prompt.contains("/basic_info is malformed: must not be empty"));
    }

    #[test]
    fn test_refine_uses_critique() {
        let prior = BTreeMap::new();
        let inputs = vec![ThoughtNode::seed(
            StageKind::ResponsePlan,
            Payload::Json(json!({"emergency_level": {"level": "II"}})),
        )];
        let mut req = request(
            StageKind::ResponsePlan,
            &OperationKind::Refine,
            &prior,
            &inputs,
        );
        req.critique = Some("Name concrete assembly points.");
        let prompt = ChemicalPromptBuilder.build(&req);
        assert!(prompt.contains("Name concrete assembly points."));
        assert!(prompt.contains("\"level\": \"II\""));
    }
}
