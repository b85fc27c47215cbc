//! LLM router: model normalization, provider detection, dispatch with
//! timeout, and call logging.

pub mod strategy;

pub use strategy::{ModelStats, ResolveOptions, RouterConfig, RouterOverrides, Strategy};

use std::time::Instant;

use tracing::debug;

use crate::core::Core;
use crate::core::calllog::{CallLog, CallRecord};
use crate::core::error::{CoreError, Result};
use crate::core::registry::Provider;

/// Used when neither the caller nor the registry supplies a deadline.
const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_CLAUDE_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub model: Option<String>,
    pub timeout_ms: Option<u64>,
    pub caller: Option<String>,
    pub skip_log: bool,
}

/// Options for [`Core::routed_llm`]: strategy-driven model resolution on top
/// of the plain router.
#[derive(Debug, Clone, Default)]
pub struct RoutedOptions {
    pub strategy: Option<Strategy>,
    pub capability: Option<String>,
    pub model: Option<String>,
    pub timeout_ms: Option<u64>,
    pub caller: Option<String>,
    pub skip_log: bool,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub provider: Provider,
    pub model: String,
    /// Set by [`Core::routed_llm`] to the strategy-resolved model name.
    pub resolved_model: Option<String>,
    pub duration_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Strip a provider prefix and resolve shorthand aliases to canonical model
/// names.
pub(crate) fn normalize_model(raw: &str) -> String {
    let stripped = raw
        .strip_prefix("openai-codex/")
        .or_else(|| raw.strip_prefix("anthropic/"))
        .or_else(|| raw.strip_prefix("openai/"))
        .unwrap_or(raw);
    resolve_alias(stripped).to_string()
}

fn resolve_alias(name: &str) -> &str {
    match name {
        "opus-4" => "claude-opus-4-5",
        "sonnet-4" => "claude-sonnet-4-5",
        "haiku-4" => "claude-haiku-4-5",
        "opus-3" => "claude-opus-4",
        "sonnet-3" => "claude-sonnet-3-5",
        // Versioned family names that never shipped as standalone models.
        "claude-sonnet-4" => "claude-sonnet-4-5",
        "claude-haiku-4" => "claude-haiku-4-5",
        "gpt-4" => "gpt-4-turbo",
        "gpt-3.5" => "gpt-3.5-turbo",
        "codex" => "gpt-5.3-codex",
        other => other,
    }
}

/// Map a canonical model name to its provider.
pub(crate) fn detect_provider(model: &str) -> Result<Provider> {
    if model.contains("claude") || model.contains("anthropic") {
        Ok(Provider::Anthropic)
    } else if model.starts_with("gpt-") || model.starts_with("o1") || model.starts_with("o3") {
        Ok(Provider::Openai)
    } else {
        Err(CoreError::UnknownProvider(model.to_string()))
    }
}

impl Core {
    /// Send a prompt to the provider owning `opts.model`.
    ///
    /// The deadline is `opts.timeout_ms`, else the model's registry default.
    /// Duration is measured here, outside the adapter, and every outcome is
    /// logged unless `opts.skip_log` is set.
    pub async fn run_llm(&self, prompt: &str, opts: RunOptions) -> Result<LlmResponse> {
        let raw = opts.model.as_deref().unwrap_or(DEFAULT_CLAUDE_MODEL);
        let model = normalize_model(raw);
        let provider = detect_provider(&model)?;
        let timeout_ms = opts
            .timeout_ms
            .or_else(|| self.inner.registry.info(&model).map(|d| d.default_timeout_ms))
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        let caller = opts.caller.unwrap_or_else(|| "unknown".to_string());
        debug!("run_llm model={} provider={} timeout_ms={}", model, provider, timeout_ms);

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            self.inner.providers.invoke(provider, &model, prompt),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Err(_) => {
                let err = CoreError::Timeout(timeout_ms);
                if !opts.skip_log {
                    self.log_failure(provider, &model, &caller, prompt, duration_ms, &err);
                }
                Err(err)
            }
            Ok(Err(err)) => {
                if !opts.skip_log {
                    self.log_failure(provider, &model, &caller, prompt, duration_ms, &err);
                }
                Err(err)
            }
            Ok(Ok(reply)) => {
                let input_tokens = reply
                    .input_tokens
                    .unwrap_or_else(|| CallLog::estimate_tokens(prompt));
                let output_tokens = reply
                    .output_tokens
                    .unwrap_or_else(|| CallLog::estimate_tokens(&reply.text));
                let cost_estimate =
                    self.inner
                        .calllog
                        .estimate_cost(&model, input_tokens, output_tokens);
                if !opts.skip_log {
                    self.inner.calllog.log(CallRecord {
                        provider: provider.as_str().to_string(),
                        model: model.clone(),
                        caller,
                        prompt: prompt.to_string(),
                        response: reply.text.clone(),
                        input_tokens,
                        output_tokens,
                        cost_estimate,
                        duration_ms,
                        ok: true,
                        error: None,
                    });
                }
                Ok(LlmResponse {
                    text: reply.text,
                    provider,
                    model,
                    resolved_model: None,
                    duration_ms,
                    input_tokens,
                    output_tokens,
                })
            }
        }
    }

    /// [`Core::run_llm`] defaulting to an Anthropic model.
    pub async fn run_claude(&self, prompt: &str, mut opts: RunOptions) -> Result<LlmResponse> {
        opts.model = Some(opts.model.unwrap_or_else(|| DEFAULT_CLAUDE_MODEL.to_string()));
        self.run_llm(prompt, opts).await
    }

    /// [`Core::run_llm`] defaulting to an OpenAI model.
    pub async fn run_openai(&self, prompt: &str, mut opts: RunOptions) -> Result<LlmResponse> {
        opts.model = Some(opts.model.unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()));
        self.run_llm(prompt, opts).await
    }

    /// Resolve a model from the strategy, apply its default timeout, invoke,
    /// and attach the resolved name to the result.
    pub async fn routed_llm(&self, prompt: &str, opts: RoutedOptions) -> Result<LlmResponse> {
        let strategy = opts.strategy.unwrap_or(if opts.model.is_some() {
            Strategy::Specific
        } else {
            Strategy::Balanced
        });
        let resolved = self
            .resolve_model(
                strategy,
                &ResolveOptions {
                    capability: opts.capability.clone(),
                    model: opts.model.clone(),
                },
            )
            .await;
        let timeout_ms = opts.timeout_ms.or_else(|| {
            self.inner
                .registry
                .info(&resolved)
                .map(|d| d.default_timeout_ms)
        });

        let mut response = self
            .run_llm(
                prompt,
                RunOptions {
                    model: Some(resolved.clone()),
                    timeout_ms,
                    caller: opts.caller,
                    skip_log: opts.skip_log,
                },
            )
            .await?;
        response.resolved_model = Some(resolved);
        Ok(response)
    }

    fn log_failure(
        &self,
        provider: Provider,
        model: &str,
        caller: &str,
        prompt: &str,
        duration_ms: i64,
        err: &CoreError,
    ) {
        self.inner.calllog.log(CallRecord {
            provider: provider.as_str().to_string(),
            model: model.to_string(),
            caller: caller.to_string(),
            prompt: prompt.to_string(),
            response: String::new(),
            input_tokens: CallLog::estimate_tokens(prompt),
            output_tokens: 0,
            cost_estimate: 0.0,
            duration_ms,
            ok: false,
            error: Some(err.to_string()),
        });
    }
}
