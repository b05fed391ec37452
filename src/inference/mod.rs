//! Inference Adapter and the HTTP backend behind it.
//!
//! Operations call [`InferenceAdapter::complete`]; the adapter applies
//! retries, timeouts and the concurrency bound, then delegates a single
//! request to an [`InferenceBackend`]. The production backend is
//! [`ChatCompletionsClient`]; tests substitute fakes.

mod adapter;
mod client;
mod retry;
mod types;

pub use adapter::{InferenceAdapter, TokenPricing, UsageSummary};
pub use client::ChatCompletionsClient;
pub use retry::RetryPolicy;
pub use types::*;

use async_trait::async_trait;

use crate::error::InferenceResult;

/// One attempt at a completion. Implementations must not retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> InferenceResult<Completion>;
}
