use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Identity of an operation within one stage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u32);

impl OperationId {
    /// Pseudo-operation that owns a stage's seed node.
    pub const SEED: OperationId = OperationId(u32::MAX);
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == OperationId::SEED {
            write!(f, "seed")
        } else {
            write!(f, "op{}", self.0)
        }
    }
}

/// Operation kind. Doubles as the key into the handler registry, so
/// additional kinds can be introduced with [`OperationKind::Custom`]
/// without touching the executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    Generate,
    Aggregate,
    Score,
    KeepBestK,
    Refine,
    Custom(String),
}

impl OperationKind {
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Generate => "generate",
            OperationKind::Aggregate => "aggregate",
            OperationKind::Score => "score",
            OperationKind::KeepBestK => "keep-best-k",
            OperationKind::Refine => "refine",
            OperationKind::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for OperationKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "generate" => OperationKind::Generate,
            "aggregate" => OperationKind::Aggregate,
            "score" => OperationKind::Score,
            "keep-best-k" | "keep_best_k" => OperationKind::KeepBestK,
            "refine" => OperationKind::Refine,
            _ => OperationKind::Custom(s),
        }
    }
}

impl From<OperationKind> for String {
    fn from(kind: OperationKind) -> Self {
        kind.as_str().to_string()
    }
}

/// How keep-best-k treats `k` larger than the number of nominal inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Require `min(k, nominal inputs)` survivors.
    #[default]
    Clamp,
    /// Reject graphs where `k` exceeds the nominal inputs.
    Strict,
}

impl std::str::FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clamp" => Ok(SelectionPolicy::Clamp),
            "strict" => Ok(SelectionPolicy::Strict),
            _ => Err(format!("Unknown selection policy: {}", s)),
        }
    }
}

fn default_branching_factor() -> usize {
    1
}

/// Per-operation settings. Fields a kind does not use are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Number of sibling nodes a `generate` produces.
    #[serde(default = "default_branching_factor")]
    pub branching_factor: usize,
    /// Selection size for `keep-best-k`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<usize>,
    /// Instruction for `refine`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critique: Option<String>,
    /// Overrides the executor-wide selection policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionPolicy>,
    /// Stage-document key a terminal operation fills. Without one, the
    /// operation's JSON output is merged into the document root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Free-form settings for custom kinds.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            branching_factor: default_branching_factor(),
            k: None,
            critique: None,
            selection: None,
            section: None,
            temperature: None,
            max_tokens: None,
            params: serde_json::Map::new(),
        }
    }
}

/// A graph vertex. Pure description; the executor interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub config: OperationConfig,
}

impl Operation {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            label: String::new(),
            config: OperationConfig::default(),
        }
    }

    /// Fan out `branching_factor` candidate nodes from the inputs.
    pub fn generate(branching_factor: usize) -> Self {
        let mut op = Self::new(OperationKind::Generate);
        op.config.branching_factor = branching_factor;
        op
    }

    /// Merge all inputs into one node.
    pub fn aggregate() -> Self {
        Self::new(OperationKind::Aggregate)
    }

    /// Score each input.
    pub fn score() -> Self {
        Self::new(OperationKind::Score)
    }

    /// Keep the `k` best-scored inputs.
    pub fn keep_best_k(k: usize) -> Self {
        let mut op = Self::new(OperationKind::KeepBestK);
        op.config.k = Some(k);
        op
    }

    /// Improve each input according to `critique`.
    pub fn refine(critique: impl Into<String>) -> Self {
        let mut op = Self::new(OperationKind::Refine);
        op.config.critique = Some(critique.into());
        op
    }

    pub fn custom(kind: impl Into<String>) -> Self {
        Self::new(OperationKind::from(kind.into()))
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.config.section = Some(section.into());
        self
    }

    pub fn with_selection(mut self, policy: SelectionPolicy) -> Self {
        self.config.selection = Some(policy);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.config.temperature = Some(temperature);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.params.insert(key.into(), value);
        self
    }

    /// Reject configurations that can never execute.
    pub fn validate(&self) -> Result<(), GraphError> {
        let fail = |message: &str| -> Result<(), GraphError> {
            Err(GraphError::Config {
                operation: self.display_name(),
                message: message.to_string(),
            })
        };
        match self.kind {
            OperationKind::Generate if self.config.branching_factor == 0 => {
                fail("branching factor must be at least 1")
            }
            OperationKind::KeepBestK => match self.config.k {
                None => fail("k is required"),
                Some(0) => fail("k must be at least 1"),
                Some(_) => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Label if set, otherwise the kind name.
    pub fn display_name(&self) -> String {
        if self.label.is_empty() {
            self.kind.to_string()
        } else {
            self.label.clone()
        }
    }
}
