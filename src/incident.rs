//! Incident input checks.
//!
//! The only hard requirement is a non-empty description. Missing details
//! are reported as warnings so the run can still proceed on partial
//! information.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::error::PipelineError;

/// Built-in sample used by `--sample`.
pub const SAMPLE_INCIDENT: &str = "At 10:00 on 15 March 2024 a chemical leak occurred at a \
chemical plant in Jiangbei New Area, Nanjing, Jiangsu Province. Chlorine escaped from a \
storage tank after a valve failure. The weather was clear, temperature 20℃, with a force 3 \
south-east wind. The leak point is in the north-east corner of the plant, about 2 km from the \
nearest residential area.";

/// Clock times such as `10:00`, `10：30`, `3 pm`, `7 o'clock` or `10时`.
const CLOCK_TIME_PATTERN: &str =
    r"(?i)\b\d{1,2}\s*[:：]\s*\d{2}\b|\b\d{1,2}\s*(?:a\.?m\.?|p\.?m\.?|o'clock)(?:\W|$)|\d\s*[时点]";

static CLOCK_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(CLOCK_TIME_PATTERN).expect("clock time pattern must compile"));

/// Facts a complete description mentions, each with the cue words that
/// indicate it (English and Chinese).
const EXPECTED_DETAILS: &[(&str, &[&str])] = &[
    ("time", &["年", "月", "日", "hour", "time"]),
    ("location", &["省", "市", "区", "厂", "province", "city", "district", "plant", "factory", "area"]),
    ("accident", &["事故", "泄漏", "泄露", "accident", "leak", "explosion", "fire", "spill"]),
    ("weather", &["天气", "晴", "阴", "雨", "weather", "sunny", "clear", "cloudy", "rain"]),
    ("temperature", &["温度", "℃", "temperature", "°c", "degrees"]),
    ("wind", &["风", "wind"]),
    ("distance", &["距离", "公里", "米", "distance", "km", "metre", "meter", " m "]),
    ("chemical", &["化学品", "氯气", "chemical", "chlorine", "ammonia", "benzene"]),
];

/// Validated incident description.
#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    text: String,
    missing: Vec<&'static str>,
}

impl Incident {
    /// Accept any non-blank description, noting which expected details it
    /// lacks.
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidInput {
                message: "incident description is empty".to_string(),
            });
        }

        let missing = missing_details(trimmed);
        if !missing.is_empty() {
            warn!(
                missing = %missing.join(", "),
                "Incident description lacks expected details"
            );
        }

        Ok(Self {
            text: trimmed.to_string(),
            missing,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Expected details not found in the description.
    pub fn missing_details(&self) -> &[&'static str] {
        &self.missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

fn missing_details(text: &str) -> Vec<&'static str> {
    let lowered = text.to_lowercase();
    EXPECTED_DETAILS
        .iter()
        .filter(|(name, cues)| {
            let cued = cues.iter().any(|cue| lowered.contains(cue));
            !(cued || (*name == "time" && CLOCK_TIME.is_match(text)))
        })
        .map(|(name, _)| *name)
        .collect()
}
