use serde_json::{json, Value};

use super::{SchemaSet, StageSchema};
use crate::error::AppResult;
use crate::thought::StageKind;

fn section() -> Value {
    json!({"type": "object", "minProperties": 1})
}

fn stage_document(required: &[&str], optional: &[&str]) -> Value {
    let properties: serde_json::Map<String, Value> = required
        .iter()
        .chain(optional)
        .map(|key| (key.to_string(), section()))
        .collect();
    json!({
        "type": "object",
        "required": required,
        "properties": properties
    })
}

/// Expected shape of a chemical-emergency stage document.
///
/// Required sections must be non-empty objects; the remaining known
/// sections are optional but must be objects when present.
pub fn chemical_schema(stage: StageKind) -> Value {
    match stage {
        StageKind::SituationAnalysis => stage_document(
            &["basic_info", "accident_info", "weather_conditions"],
            &["geographical_info", "sensitive_targets"],
        ),
        StageKind::ImpactAssessment => stage_document(
            &["dispersion_prediction", "population_impact"],
            &[
                "environmental_impact",
                "secondary_disasters",
                "social_impact",
            ],
        ),
        StageKind::ResponsePlan => stage_document(
            &["emergency_level", "evacuation_plan"],
            &[
                "onsite_response",
                "medical_response",
                "environmental_monitoring",
                "resource_allocation",
                "information_management",
                "recovery_plan",
            ],
        ),
    }
}

/// Compiled schemas for all three stages.
pub fn chemical_schemas() -> AppResult<SchemaSet> {
    let mut set = SchemaSet::new();
    for stage in StageKind::ALL {
        set.insert(StageSchema::new(stage, chemical_schema(stage))?);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schemas_compile() {
        let set = chemical_schemas().unwrap();
        for stage in StageKind::ALL {
            assert!(set.get(stage).is_some());
        }
    }

    #[test]
    fn test_required_sections() {
        let schema = chemical_schema(StageKind::ResponsePlan);
        assert_eq!(
            schema["required"],
            json!(["emergency_level", "evacuation_plan"])
        );
        assert_eq!(schema["properties"]["recovery_plan"]["type"], "object");
    }

    #[test]
    fn test_optional_section_must_be_object() {
        let set = chemical_schemas().unwrap();
        let doc = json!({
            "dispersion_prediction": {"affected_radius": "800"},
            "population_impact": {"evacuation_radius": "1500"},
            "social_impact": "moderate"
        });
        let violation = set.validate(StageKind::ImpactAssessment, &doc).unwrap_err();
        assert_eq!(violation.sections(), vec!["social_impact".to_string()]);
    }
}
