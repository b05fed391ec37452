use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::graph::SelectionPolicy;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub inference: InferenceConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub pipeline: PipelineConfig,
}

/// Inference service configuration
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub api_key: String,
    /// OpenAI-compatible base URL, e.g. `https://api.deepseek.com/v1`.
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Cost per 1000 prompt tokens.
    pub prompt_token_cost: f64,
    /// Cost per 1000 completion tokens.
    pub response_token_cost: f64,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Per-call request and retry configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Upper bound of the random delay added to every backoff.
    pub retry_jitter_ms: u64,
    /// Reuse completions for repeated prompts with identical options.
    pub cache_responses: bool,
}

/// Orchestration configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum inference calls in flight at once.
    pub max_concurrency: usize,
    pub branching_factor: usize,
    pub keep_best_k: usize,
    pub selection_policy: SelectionPolicy,
    pub run_timeout_secs: u64,
    pub output_path: PathBuf,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let api_key = env::var("INFERENCE_API_KEY")
            .or_else(|_| env::var("DEEPSEEK_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AppError::Config {
                message: "INFERENCE_API_KEY is required".to_string(),
            })?;

        let inference = InferenceConfig {
            api_key,
            base_url: env::var("INFERENCE_BASE_URL")
                .unwrap_or_else(|_| "https://api.deepseek.com/v1".to_string()),
            model: env::var("INFERENCE_MODEL").unwrap_or_else(|_| "deepseek-chat".to_string()),
            temperature: env_or("INFERENCE_TEMPERATURE", 0.7),
            max_tokens: env_or("INFERENCE_MAX_TOKENS", 4096),
            prompt_token_cost: env_or("PROMPT_TOKEN_COST", 0.0),
            response_token_cost: env_or("RESPONSE_TOKEN_COST", 0.0),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let defaults = RequestConfig::default();
        let request = RequestConfig {
            timeout_ms: env_or("REQUEST_TIMEOUT_MS", defaults.timeout_ms),
            max_retries: env_or("MAX_RETRIES", defaults.max_retries),
            retry_delay_ms: env_or("RETRY_DELAY_MS", defaults.retry_delay_ms),
            retry_max_delay_ms: env_or("RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms),
            retry_jitter_ms: env_or("RETRY_JITTER_MS", defaults.retry_jitter_ms),
            cache_responses: env_or("INFERENCE_CACHE", defaults.cache_responses),
        };

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            max_concurrency: env_or("MAX_CONCURRENCY", defaults.max_concurrency).max(1),
            branching_factor: env_or("BRANCHING_FACTOR", defaults.branching_factor),
            keep_best_k: env_or("KEEP_BEST_K", defaults.keep_best_k),
            selection_policy: env_or("SELECTION_POLICY", defaults.selection_policy),
            run_timeout_secs: env_or("RUN_TIMEOUT_SECS", defaults.run_timeout_secs),
            output_path: env::var("OUTPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
        };

        Ok(Config {
            inference,
            logging,
            request,
            pipeline,
        })
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PipelineConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
            retry_max_delay_ms: 10000,
            retry_jitter_ms: 250,
            cache_responses: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            branching_factor: 3,
            keep_best_k: 2,
            selection_policy: SelectionPolicy::Clamp,
            run_timeout_secs: 600,
            output_path: PathBuf::from("emergency_response_plan.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_config_default() {
        let config = RequestConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.retry_delay_ms < config.retry_max_delay_ms);
    }

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.selection_policy, SelectionPolicy::Clamp);
        assert_eq!(config.run_timeout(), Duration::from_secs(600));
        assert_eq!(
            config.output_path,
            PathBuf::from("emergency_response_plan.json")
        );
    }
}
