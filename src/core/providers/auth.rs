//! OAuth credentials for the OpenAI/codex adapter.
//!
//! Tokens live in a JSON file owned by an external login command; this module
//! only reads the `openai-codex` entry and writes refreshed tokens back,
//! preserving any unrelated entries in the enclosing object. Expired tokens
//! are refreshed automatically; concurrent refreshes are deduplicated behind
//! a mutex with a re-read, so exactly one HTTP refresh is issued no matter
//! how many callers race.

use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::error::{CoreError, Result};

/// Key of our entry inside the auth file.
pub(crate) const AUTH_ENTRY: &str = "openai-codex";
/// Used when the access token's JWT payload carries no `client_id` claim.
const FALLBACK_CLIENT_ID: &str = "app_F2c9MNqLVDsbnTTLEjLMVGVY";
const EXPIRY_WARN_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access: String,
    pub refresh: String,
    /// Expiry as milliseconds since the Unix epoch.
    pub expires: i64,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    /// Lifetime of the new access token, in seconds.
    expires_in: i64,
}

pub struct CodexAuth {
    path: PathBuf,
    token_url: String,
    client: reqwest::Client,
    refresh_gate: Mutex<()>,
}

impl CodexAuth {
    pub fn new(path: PathBuf, token_url: String) -> Self {
        Self {
            path,
            token_url,
            client: reqwest::Client::new(),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Current access token, refreshing first when expired.
    ///
    /// Returns `(token, refreshed)`; `refreshed` tells the adapter to re-run
    /// its smoke test against the new credentials.
    pub async fn access_token(&self) -> Result<(String, bool)> {
        let tokens = self.read_tokens().await?;
        let now = Utc::now().timestamp_millis();
        if tokens.expires > now {
            self.warn_if_expiring(&tokens, now);
            return Ok((tokens.access, false));
        }

        let _gate = self.refresh_gate.lock().await;
        // Another caller may have finished the refresh while we waited.
        let tokens = self.read_tokens().await?;
        let now = Utc::now().timestamp_millis();
        if tokens.expires > now {
            return Ok((tokens.access, false));
        }

        info!("access token expired, refreshing");
        let refreshed = self.refresh(&tokens).await?;
        self.write_tokens(&refreshed).await?;
        Ok((refreshed.access, true))
    }

    fn warn_if_expiring(&self, tokens: &AuthTokens, now: i64) {
        let remaining = tokens.expires - now;
        if remaining < EXPIRY_WARN_WINDOW_MS {
            warn!(
                "access token expires in {} minutes; a refresh will run on expiry",
                remaining / 60_000
            );
        }
    }

    async fn read_tokens(&self) -> Result<AuthTokens> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|_| {
            CoreError::AuthMissing(format!(
                "auth file {} does not exist; run the codex login command first",
                self.path.display()
            ))
        })?;
        let doc: Value = serde_json::from_str(&raw)?;
        let entry = doc.get(AUTH_ENTRY).ok_or_else(|| {
            CoreError::AuthMissing(format!(
                "auth file {} has no '{}' entry; run the codex login command first",
                self.path.display(),
                AUTH_ENTRY
            ))
        })?;
        Ok(serde_json::from_value(entry.clone())?)
    }

    /// Write tokens back, preserving unrelated entries in the file.
    async fn write_tokens(&self, tokens: &AuthTokens) -> Result<()> {
        let mut doc: Value = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| json!({})),
            Err(_) => json!({}),
        };
        if !doc.is_object() {
            doc = json!({});
        }
        doc[AUTH_ENTRY] = serde_json::to_value(tokens)?;
        let rendered = serde_json::to_string_pretty(&doc)?;
        tokio::fs::write(&self.path, rendered).await?;
        Ok(())
    }

    async fn refresh(&self, old: &AuthTokens) -> Result<AuthTokens> {
        let client_id = client_id_from_jwt(&old.access)
            .unwrap_or_else(|| FALLBACK_CLIENT_ID.to_string());
        let body = json!({
            "grant_type": "refresh_token",
            "refresh_token": old.refresh,
            "client_id": client_id,
        });

        let res = self
            .client
            .post(&self.token_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::AuthRefreshFailed(e.to_string()))?;

        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(CoreError::AuthRefreshFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                super::body_snippet(&text)
            )));
        }

        let parsed: RefreshResponse = serde_json::from_str(&text)
            .map_err(|e| CoreError::AuthRefreshFailed(format!("malformed response: {}", e)))?;

        let now = Utc::now().timestamp_millis();
        Ok(AuthTokens {
            access: parsed.access_token,
            refresh: parsed.refresh_token.unwrap_or_else(|| old.refresh.clone()),
            expires: now + parsed.expires_in * 1000,
        })
    }
}

/// Extract the `client_id` claim from a JWT's payload segment.
pub(crate) fn client_id_from_jwt(jwt: &str) -> Option<String> {
    let payload = jwt.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("client_id")?.as_str().map(str::to_string)
}
