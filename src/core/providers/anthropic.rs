//! Anthropic adapter: streaming Messages API.
//!
//! The response is consumed as a server-sent event stream to its terminal
//! state; text accumulates from `text_delta` blocks, token counts come from
//! the `message_start` / `message_delta` usage fields when present.

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use super::{ProviderReply, SMOKE_PROMPT, SMOKE_TIMEOUT_MS, SmokeState, body_snippet, smoke_test_disabled};
use crate::core::error::{CoreError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;

/// Env var carrying an OAuth bearer token (preferred), or a plain API key.
const OAUTH_TOKEN_ENV: &str = "ANTHROPIC_OAUTH_TOKEN";
const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    stream: bool,
    messages: Vec<MessagesRequestMessage<'a>>,
}

#[derive(Serialize)]
struct MessagesRequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

enum Credentials {
    Bearer(String),
    ApiKey(String),
}

fn credentials() -> Result<Credentials> {
    if let Ok(token) = std::env::var(OAUTH_TOKEN_ENV) {
        if !token.is_empty() {
            return Ok(Credentials::Bearer(token));
        }
    }
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if !key.is_empty() {
            return Ok(Credentials::ApiKey(key));
        }
    }
    Err(CoreError::AuthMissing(format!(
        "set {} (or {}) to call Anthropic models",
        OAUTH_TOKEN_ENV, API_KEY_ENV
    )))
}

pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
    smoke: Mutex<SmokeState>,
}

impl AnthropicAdapter {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            smoke: Mutex::new(SmokeState::NotRun),
        }
    }

    pub async fn invoke(&self, model: &str, prompt: &str) -> Result<ProviderReply> {
        let creds = credentials()?;
        self.ensure_smoke(model, &creds).await?;
        self.stream_completion(model, prompt, &creds).await
    }

    async fn ensure_smoke(&self, model: &str, creds: &Credentials) -> Result<()> {
        if smoke_test_disabled() {
            return Ok(());
        }
        let mut state = self.smoke.lock().await;
        match &*state {
            SmokeState::Passed => Ok(()),
            SmokeState::Failed(msg) => Err(CoreError::SmokeTestFailed(msg.clone())),
            SmokeState::NotRun => {
                debug!("running anthropic smoke test");
                let attempt = tokio::time::timeout(
                    std::time::Duration::from_millis(SMOKE_TIMEOUT_MS),
                    self.stream_completion(model, SMOKE_PROMPT, creds),
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
                        info!("anthropic smoke test passed");
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

    async fn stream_completion(
        &self,
        model: &str,
        prompt: &str,
        creds: &Credentials,
    ) -> Result<ProviderReply> {
        let req = MessagesRequest {
            model,
            max_tokens: MAX_TOKENS,
            stream: true,
            messages: vec![MessagesRequestMessage {
                role: "user",
                content: prompt,
            }],
        };

        let mut request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req);
        request = match creds {
            Credentials::Bearer(token) => {
                request.header("Authorization", format!("Bearer {}", token))
            }
            Credentials::ApiKey(key) => request.header("x-api-key", key),
        };

        let res = request.send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(CoreError::ProviderHttp {
                status: status.as_u16(),
                body: body_snippet(&body),
            });
        }

        // Read the SSE stream line-by-line to its terminal event.
        let stream = res.bytes_stream();
        let mut reader = tokio_util::io::StreamReader::new(
            stream.map(|r| r.map_err(std::io::Error::other)),
        );
        let mut buf_reader = tokio::io::BufReader::new(&mut reader);
        let mut line = String::new();

        let mut event_type = String::new();
        let mut text = String::new();
        let mut input_tokens: Option<i64> = None;
        let mut output_tokens: Option<i64> = None;

        loop {
            line.clear();
            let read = buf_reader.read_line(&mut line).await?;
            if read == 0 {
                break;
            }
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("event:") {
                event_type = rest.trim().to_string();
                continue;
            }
            let Some(data) = trimmed.strip_prefix("data:") else {
                continue;
            };
            let Ok(json) = serde_json::from_str::<Value>(data.trim()) else {
                continue;
            };

            match event_type.as_str() {
                "message_start" => {
                    input_tokens = json["message"]["usage"]["input_tokens"].as_i64();
                }
                "content_block_delta" => {
                    if json["delta"]["type"].as_str() == Some("text_delta") {
                        if let Some(delta) = json["delta"]["text"].as_str() {
                            text.push_str(delta);
                        }
                    }
                }
                "message_delta" => {
                    if let Some(out) = json["usage"]["output_tokens"].as_i64() {
                        output_tokens = Some(out);
                    }
                }
                "message_stop" => break,
                "error" => {
                    let msg = json["error"]["message"]
                        .as_str()
                        .unwrap_or("unknown stream error");
                    return Err(CoreError::Provider(format!(
                        "anthropic stream error: {}",
                        msg
                    )));
                }
                _ => {}
            }
        }

        Ok(ProviderReply {
            text,
            input_tokens,
            output_tokens,
        })
    }
}
