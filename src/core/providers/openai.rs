//! OpenAI adapter: plain POST to the chat-completions endpoint, Bearer-authed
//! with the codex OAuth access token.

use std::sync::Arc;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::auth::CodexAuth;
use super::{ProviderReply, SMOKE_PROMPT, SMOKE_TIMEOUT_MS, SmokeState, body_snippet, smoke_test_disabled};
use crate::core::error::{CoreError, Result};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatRequestMessage<'a>>,
}

#[derive(Serialize)]
struct ChatRequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
}

pub struct OpenAiAdapter {
    client: Client,
    base_url: String,
    auth: Arc<CodexAuth>,
    smoke: Mutex<SmokeState>,
}

impl OpenAiAdapter {
    pub fn new(base_url: String, auth: Arc<CodexAuth>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            auth,
            smoke: Mutex::new(SmokeState::NotRun),
        }
    }

    pub async fn invoke(&self, model: &str, prompt: &str) -> Result<ProviderReply> {
        let (token, refreshed) = self.auth.access_token().await?;
        if refreshed {
            // New credentials must pass a fresh smoke test.
            *self.smoke.lock().await = SmokeState::NotRun;
        }
        self.ensure_smoke(model, &token).await?;
        self.complete(model, prompt, &token).await
    }

    /// One-time credential validation, shared across concurrent first calls.
    async fn ensure_smoke(&self, model: &str, token: &str) -> Result<()> {
        if smoke_test_disabled() {
            return Ok(());
        }
        let mut state = self.smoke.lock().await;
        match &*state {
            SmokeState::Passed => Ok(()),
            SmokeState::Failed(msg) => Err(CoreError::SmokeTestFailed(msg.clone())),
            SmokeState::NotRun => {
                debug!("running openai smoke test");
                let attempt = tokio::time::timeout(
                    std::time::Duration::from_millis(SMOKE_TIMEOUT_MS),
                    self.complete(model, SMOKE_PROMPT, token),
                )
                .await;
                let outcome = match attempt {
                    Err(_) => Err(format!("no reply within {} ms", SMOKE_TIMEOUT_MS)),
                    Ok(Err(e)) => Err(e.to_string()),
                    Ok(Ok(reply)) if reply.text.contains("AUTH_OK") => Ok(()),
                    Ok(Ok(reply)) => Err(format!(
                        "unexpected reply: {}",
                        body_snippet(&reply.text)
                    )),
                };
                match outcome {
                    Ok(()) => {
                        info!("openai smoke test passed");
                        *state = SmokeState::Passed;
                        Ok(())
                    }
                    Err(msg) => {
                        *state = SmokeState::Failed(msg.clone());
                        Err(CoreError::SmokeTestFailed(msg))
                    }
                }
            }
        }
    }

    async fn complete(&self, model: &str, prompt: &str, token: &str) -> Result<ProviderReply> {
        let req = ChatRequest {
            model,
            messages: vec![ChatRequestMessage {
                role: "user",
                content: prompt,
            }],
        };
        let res = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", token))
            .json(&req)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(CoreError::ProviderHttp {
                status: status.as_u16(),
                body: body_snippet(&body),
            });
        }

        let parsed: ChatResponse = res.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let (input_tokens, output_tokens) = match parsed.usage {
            Some(u) => (u.prompt_tokens, u.completion_tokens),
            None => (None, None),
        };
        Ok(ProviderReply {
            text,
            input_tokens,
            output_tokens,
        })
    }
}
