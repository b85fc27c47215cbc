//! Provider adapters: per-provider request/response handling behind one
//! uniform contract.
//!
//! Two adapters (Anthropic, OpenAI) are held in a fixed enum-indexed table;
//! dispatch is a match on [`Provider`], not a registration map. Each adapter
//! owns its smoke-test state: the first successful call per process (and any
//! call after a token refresh) validates credentials with a minimal
//! completion, deduplicated across concurrent callers.

mod anthropic;
mod auth;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use auth::{AuthTokens, CodexAuth};
pub use openai::OpenAiAdapter;

use std::sync::Arc;

use crate::core::CoreConfig;
use crate::core::error::Result;
use crate::core::registry::Provider;

/// Prompt used for the one-time credential validation call.
pub(crate) const SMOKE_PROMPT: &str = "Reply with exactly AUTH_OK";
pub(crate) const SMOKE_TIMEOUT_MS: u64 = 15_000;

/// Normalized reply from any provider. Token counts are `None` when the
/// provider omitted usage; the router falls back to a character estimate.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub text: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

#[derive(Debug, Clone)]
pub(crate) enum SmokeState {
    NotRun,
    Passed,
    Failed(String),
}

pub(crate) fn smoke_test_disabled() -> bool {
    std::env::var("SKIP_SMOKE_TEST").map(|v| v == "1").unwrap_or(false)
}

/// First 500 characters of a response body, for error messages.
pub(crate) fn body_snippet(body: &str) -> String {
    match body.char_indices().nth(500) {
        Some((idx, _)) => body[..idx].to_string(),
        None => body.to_string(),
    }
}

/// Enum-indexed adapter table. One instance per [`crate::core::Core`].
pub struct Providers {
    anthropic: AnthropicAdapter,
    openai: OpenAiAdapter,
}

impl Providers {
    pub fn new(config: &CoreConfig) -> Self {
        let auth = Arc::new(CodexAuth::new(
            config.auth_path.clone(),
            config.oauth_token_url.clone(),
        ));
        Self {
            anthropic: AnthropicAdapter::new(config.anthropic_base_url.clone()),
            openai: OpenAiAdapter::new(config.openai_base_url.clone(), auth),
        }
    }

    /// Dispatch a single-turn completion to the matching adapter.
    pub async fn invoke(&self, provider: Provider, model: &str, prompt: &str) -> Result<ProviderReply> {
        match provider {
            Provider::Anthropic => self.anthropic.invoke(model, prompt).await,
            Provider::Openai => self.openai.invoke(model, prompt).await,
        }
    }
}
