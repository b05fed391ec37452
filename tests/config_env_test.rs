//! Config environment variable tests
//!
//! These tests verify that Config::from_env() correctly reads and applies
//! environment variable overrides. Config::from_env() also loads a .env
//! file via dotenvy, which never overrides variables already set.
//!
//! Tests use #[serial] to prevent race conditions with shared env vars.

use std::env;
use std::path::{Path, PathBuf};

use emergency_reasoning::config::{Config, LogFormat};
use emergency_reasoning::graph::SelectionPolicy;
use serial_test::serial;

fn with_api_key() {
    env::set_var("INFERENCE_API_KEY", "test-key");
}

#[test]
#[serial]
fn test_config_from_env_defaults() {
    with_api_key();

    let config = Config::from_env().unwrap();
    assert_eq!(config.inference.api_key, "test-key");
    assert_eq!(config.inference.base_url, "https://api.deepseek.com/v1");
    assert_eq!(config.inference.model, "deepseek-chat");
    assert_eq!(config.request.max_retries, 3);
    assert!(!config.request.cache_responses);
    assert_eq!(config.pipeline.branching_factor, 3);
    assert_eq!(config.pipeline.keep_best_k, 2);
    assert_eq!(config.pipeline.selection_policy, SelectionPolicy::Clamp);
    assert_eq!(
        config.pipeline.output_path,
        PathBuf::from("emergency_response_plan.json")
    );
}

#[test]
#[serial]
fn test_config_falls_back_to_deepseek_key() {
    env::remove_var("INFERENCE_API_KEY");
    env::set_var("DEEPSEEK_API_KEY", "deepseek-key");

    let config = Config::from_env().unwrap();
    assert_eq!(config.inference.api_key, "deepseek-key");

    env::remove_var("DEEPSEEK_API_KEY");
}

#[test]
#[serial]
fn test_config_missing_api_key_is_an_error() {
    // A local .env could supply the key.
    if Path::new(".env").exists() {
        return;
    }
    env::remove_var("INFERENCE_API_KEY");
    env::remove_var("DEEPSEEK_API_KEY");

    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("INFERENCE_API_KEY"));
}

#[test]
#[serial]
fn test_config_from_env_custom_inference() {
    with_api_key();
    env::set_var("INFERENCE_BASE_URL", "https://custom.api.com/v1");
    env::set_var("INFERENCE_MODEL", "custom-model");
    env::set_var("INFERENCE_TEMPERATURE", "0.2");
    env::set_var("PROMPT_TOKEN_COST", "0.5");

    let config = Config::from_env().unwrap();
    assert_eq!(config.inference.base_url, "https://custom.api.com/v1");
    assert_eq!(config.inference.model, "custom-model");
    assert_eq!(config.inference.temperature, 0.2);
    assert_eq!(config.inference.prompt_token_cost, 0.5);

    env::remove_var("INFERENCE_BASE_URL");
    env::remove_var("INFERENCE_MODEL");
    env::remove_var("INFERENCE_TEMPERATURE");
    env::remove_var("PROMPT_TOKEN_COST");
}

#[test]
#[serial]
fn test_config_from_env_custom_request() {
    with_api_key();
    env::set_var("REQUEST_TIMEOUT_MS", "60000");
    env::set_var("MAX_RETRIES", "5");
    env::set_var("RETRY_DELAY_MS", "2000");
    env::set_var("RETRY_JITTER_MS", "0");
    env::set_var("INFERENCE_CACHE", "true");

    let config = Config::from_env().unwrap();
    assert_eq!(config.request.timeout_ms, 60000);
    assert_eq!(config.request.max_retries, 5);
    assert_eq!(config.request.retry_delay_ms, 2000);
    assert_eq!(config.request.retry_jitter_ms, 0);
    assert!(config.request.cache_responses);

    env::remove_var("REQUEST_TIMEOUT_MS");
    env::remove_var("MAX_RETRIES");
    env::remove_var("RETRY_DELAY_MS");
    env::remove_var("RETRY_JITTER_MS");
    env::remove_var("INFERENCE_CACHE");
}

#[test]
#[serial]
fn test_config_from_env_custom_pipeline() {
    with_api_key();
    env::set_var("BRANCHING_FACTOR", "5");
    env::set_var("KEEP_BEST_K", "3");
    env::set_var("SELECTION_POLICY", "strict");
    env::set_var("MAX_CONCURRENCY", "0");
    env::set_var("OUTPUT_PATH", "/tmp/plan.json");

    let config = Config::from_env().unwrap();
    assert_eq!(config.pipeline.branching_factor, 5);
    assert_eq!(config.pipeline.keep_best_k, 3);
    assert_eq!(config.pipeline.selection_policy, SelectionPolicy::Strict);
    // At least one call must be allowed in flight.
    assert_eq!(config.pipeline.max_concurrency, 1);
    assert_eq!(config.pipeline.output_path, PathBuf::from("/tmp/plan.json"));

    env::remove_var("BRANCHING_FACTOR");
    env::remove_var("KEEP_BEST_K");
    env::remove_var("SELECTION_POLICY");
    env::remove_var("MAX_CONCURRENCY");
    env::remove_var("OUTPUT_PATH");
}

#[test]
#[serial]
fn test_config_from_env_json_log_format() {
    with_api_key();
    env::set_var("LOG_FORMAT", "json");

    let config = Config::from_env().unwrap();
    assert_eq!(config.logging.format, LogFormat::Json);

    env::remove_var("LOG_FORMAT");
}

#[test]
#[serial]
fn test_config_invalid_number_uses_default() {
    with_api_key();
    env::set_var("MAX_RETRIES", "not-a-number");
    env::set_var("SELECTION_POLICY", "sometimes");

    let config = Config::from_env().unwrap();
    assert_eq!(config.request.max_retries, 3);
    assert_eq!(config.pipeline.selection_policy, SelectionPolicy::Clamp);

    env::remove_var("MAX_RETRIES");
    env::remove_var("SELECTION_POLICY");
}
