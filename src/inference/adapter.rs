use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::retry::RetryPolicy;
use super::types::{CompletionOptions, CompletionRequest, Usage};
use super::InferenceBackend;
use crate::config::{InferenceConfig, PipelineConfig, RequestConfig};
use crate::error::{InferenceError, InferenceResult};

/// Token and cost totals across every call made through one adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    /// Successful completions.
    pub calls: u64,
    /// Calls that ended in an error after all retries.
    pub failed_calls: u64,
    pub retries: u64,
    /// Completions served from the response cache without a call.
    pub cache_hits: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

impl UsageSummary {
    /// Usage accrued since the `earlier` snapshot of the same adapter.
    pub fn since(&self, earlier: &UsageSummary) -> UsageSummary {
        UsageSummary {
            calls: self.calls.saturating_sub(earlier.calls),
            failed_calls: self.failed_calls.saturating_sub(earlier.failed_calls),
            retries: self.retries.saturating_sub(earlier.retries),
            cache_hits: self.cache_hits.saturating_sub(earlier.cache_hits),
            prompt_tokens: self.prompt_tokens.saturating_sub(earlier.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_sub(earlier.completion_tokens),
            cost: (self.cost - earlier.cost).max(0.0),
        }
    }
}

#[derive(Debug, Default)]
struct UsageTracker {
    calls: AtomicU64,
    failed_calls: AtomicU64,
    retries: AtomicU64,
    cache_hits: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl UsageTracker {
    fn record_success(&self, usage: Option<Usage>) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(usage) = usage {
            self.prompt_tokens
                .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
            self.completion_tokens
                .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        }
    }
}

/// Prompt plus the effective options; temperature is keyed by its bits.
type CacheKey = (String, Option<u64>, Option<u32>);

fn cache_key(request: &CompletionRequest) -> CacheKey {
    (
        request.prompt.clone(),
        request.options.temperature.map(f64::to_bits),
        request.options.max_tokens,
    )
}

/// Per-1000-token prices.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenPricing {
    pub prompt: f64,
    pub completion: f64,
}

/// Inference Adapter: the single entry point operations use to reach the
/// inference service.
///
/// Every call goes through a shared concurrency limit and a per-call
/// timeout. Transient failures are retried according to the
/// [`RetryPolicy`]; each retry issues a fresh request. When retries run out
/// the error becomes [`InferenceError::Permanent`]. Non-transient errors
/// such as [`InferenceError::ResponseFormat`] are returned immediately.
pub struct InferenceAdapter {
    backend: Arc<dyn InferenceBackend>,
    retry: RetryPolicy,
    limiter: Arc<Semaphore>,
    timeout: Duration,
    defaults: CompletionOptions,
    pricing: TokenPricing,
    usage: UsageTracker,
    cache: Option<Mutex<HashMap<CacheKey, String>>>,
}

impl InferenceAdapter {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        retry: RetryPolicy,
        max_concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            retry,
            limiter: Arc::new(Semaphore::new(max_concurrency.max(1))),
            timeout,
            defaults: CompletionOptions::default(),
            pricing: TokenPricing::default(),
            usage: UsageTracker::default(),
            cache: None,
        }
    }

    /// Build an adapter from application configuration.
    pub fn from_config(
        backend: Arc<dyn InferenceBackend>,
        inference: &InferenceConfig,
        request: &RequestConfig,
        pipeline: &PipelineConfig,
    ) -> Self {
        let mut adapter = Self::new(
            backend,
            RetryPolicy::from_config(request),
            pipeline.max_concurrency,
            request.timeout(),
        )
        .with_defaults(
            CompletionOptions::default()
                .with_temperature(inference.temperature)
                .with_max_tokens(inference.max_tokens),
        )
        .with_pricing(TokenPricing {
            prompt: inference.prompt_token_cost,
            completion: inference.response_token_cost,
        });
        if request.cache_responses {
            adapter = adapter.with_response_cache();
        }
        adapter
    }

    /// Options used where a call leaves a field unset.
    pub fn with_defaults(mut self, defaults: CompletionOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_pricing(mut self, pricing: TokenPricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// Serve repeated prompts with identical options from memory. Only
    /// successful completions are cached.
    pub fn with_response_cache(mut self) -> Self {
        self.cache = Some(Mutex::new(HashMap::new()));
        self
    }

    fn cached(&self, key: &CacheKey) -> Option<String> {
        let cache = self.cache.as_ref()?;
        let entries = cache.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    fn remember(&self, key: CacheKey, text: &str) {
        if let Some(cache) = &self.cache {
            let mut entries = cache.lock().unwrap_or_else(|e| e.into_inner());
            entries.insert(key, text.to_string());
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Complete `prompt`, retrying transient failures.
    pub async fn complete(
        &self,
        prompt: &str,
        options: CompletionOptions,
    ) -> InferenceResult<String> {
        let request = CompletionRequest::new(
            prompt,
            CompletionOptions {
                temperature: options.temperature.or(self.defaults.temperature),
                max_tokens: options.max_tokens.or(self.defaults.max_tokens),
            },
        );

        let key = self.cache.as_ref().map(|_| cache_key(&request));
        if let Some(text) = key.as_ref().and_then(|key| self.cached(key)) {
            self.usage.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(prompt_chars = request.prompt.len(), "Inference cache hit");
            return Ok(text);
        }

        let mut retry = 0;
        loop {
            let start = Instant::now();
            let result = self.attempt(&request).await;

            let err = match result {
                Ok(completion) => {
                    debug!(
                        retry,
                        latency_ms = start.elapsed().as_millis(),
                        "Inference call succeeded"
                    );
                    self.usage.record_success(completion.usage);
                    if let Some(key) = key {
                        self.remember(key, &completion.text);
                    }
                    return Ok(completion.text);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                self.usage.failed_calls.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }

            if !self.retry.should_retry(retry) {
                self.usage.failed_calls.fetch_add(1, Ordering::Relaxed);
                warn!(
                    attempts = retry + 1,
                    error = %err,
                    "Inference retries exhausted"
                );
                return Err(InferenceError::Permanent {
                    attempts: retry + 1,
                    message: err.to_string(),
                });
            }

            retry += 1;
            self.usage.retries.fetch_add(1, Ordering::Relaxed);
            let mut delay = self.retry.delay(retry);
            if let InferenceError::RateLimited {
                retry_after_ms: Some(ms),
                ..
            } = &err
            {
                delay = delay.max(Duration::from_millis(*ms));
            }
            warn!(
                retry,
                delay_ms = delay.as_millis(),
                error = %err,
                "Retrying inference request"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One bounded, time-limited backend call.
    async fn attempt(&self, request: &CompletionRequest) -> InferenceResult<super::Completion> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| InferenceError::Transport {
                message: "Concurrency limiter closed".to_string(),
            })?;

        match tokio::time::timeout(self.timeout, self.backend.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Totals so far, with cost computed from the configured pricing.
    pub fn usage(&self) -> UsageSummary {
        let prompt_tokens = self.usage.prompt_tokens.load(Ordering::Relaxed);
        let completion_tokens = self.usage.completion_tokens.load(Ordering::Relaxed);
        UsageSummary {
            calls: self.usage.calls.load(Ordering::Relaxed),
            failed_calls: self.usage.failed_calls.load(Ordering::Relaxed),
            retries: self.usage.retries.load(Ordering::Relaxed),
            cache_hits: self.usage.cache_hits.load(Ordering::Relaxed),
            prompt_tokens,
            completion_tokens,
            cost: prompt_tokens as f64 / 1000.0 * self.pricing.prompt
                + completion_tokens as f64 / 1000.0 * self.pricing.completion,
        }
    }
}

impl std::fmt::Debug for InferenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceAdapter")
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("available_permits", &self.limiter.available_permits())
            .finish()
    }
}
