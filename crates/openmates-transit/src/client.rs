use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use openmates_core::config::TransitConfig;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, TransitError};

struct TokenState {
    token: String,
    validated_at: Instant,
}

struct CachedSecret {
    value: String,
    expires_at: Instant,
}

/// Client for the transit keystore: fetches provider API keys and performs
/// envelope encrypt/decrypt/HMAC. Grounded on `secrets_manager.py`'s token-file
/// fallback and 5-minute secret cache, and `qwen_oauth.rs`'s double-checked-lock
/// refresh pattern (fast read-lock path, slow write-lock path with re-check).
pub struct TransitClient {
    http: reqwest::Client,
    base_url: String,
    token_file_paths: Vec<String>,
    revalidate_interval: Duration,
    secret_ttl: Duration,
    token: RwLock<Option<TokenState>>,
    secrets: RwLock<HashMap<(String, String), CachedSecret>>,
}

impl TransitClient {
    pub fn new(config: &TransitConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.vault_url.clone(),
            token_file_paths: config.token_file_paths.clone(),
            revalidate_interval: Duration::from_secs(config.token_revalidate_secs),
            secret_ttl: Duration::from_secs(config.secret_cache_ttl_secs),
            token: RwLock::new(config.vault_token.clone().map(|token| TokenState {
                token,
                validated_at: Instant::now(),
            })),
            secrets: RwLock::new(HashMap::new()),
        }
    }

    fn read_token_file(&self) -> Option<String> {
        for path in &self.token_file_paths {
            if let Ok(contents) = std::fs::read_to_string(path) {
                let trimmed = contents.trim();
                if !trimmed.is_empty() {
                    debug!(path, "loaded vault token from file");
                    return Some(trimmed.to_string());
                }
            }
        }
        None
    }

    /// Fast path: return the cached token if it was validated recently. Slow
    /// path: take the write lock, re-check (another caller may have refreshed
    /// it while we waited), then reload from the token file.
    async fn ensure_token(&self) -> Result<String> {
        if let Some(token) = self.cached_token_if_fresh() {
            return Ok(token);
        }

        let mut guard = self.token.write().expect("transit token lock poisoned");
        if let Some(state) = guard.as_ref() {
            if state.validated_at.elapsed() < self.revalidate_interval {
                return Ok(state.token.clone());
            }
        }

        let token = self
            .read_token_file()
            .or_else(|| guard.as_ref().map(|s| s.token.clone()))
            .ok_or(TransitError::NoToken)?;

        *guard = Some(TokenState { token: token.clone(), validated_at: Instant::now() });
        Ok(token)
    }

    fn cached_token_if_fresh(&self) -> Option<String> {
        let guard = self.token.read().expect("transit token lock poisoned");
        let state = guard.as_ref()?;
        if state.validated_at.elapsed() < self.revalidate_interval {
            Some(state.token.clone())
        } else {
            None
        }
    }

    /// Force a re-read of the token file, bypassing the revalidation window.
    /// Called exactly once after an AUTH failure (§7: "retry after token refresh
    /// once; then fatal").
    fn force_reload_token(&self) -> Result<String> {
        let token = self.read_token_file().ok_or(TransitError::NoToken)?;
        let mut guard = self.token.write().expect("transit token lock poisoned");
        *guard = Some(TokenState { token: token.clone(), validated_at: Instant::now() });
        Ok(token)
    }

    async fn vault_request(&self, path: &str, body: Value) -> Result<Value> {
        let token = self.ensure_token().await?;
        let url = format!("{}/v1/{}", self.base_url.trim_end_matches('/'), path);

        let resp = self
            .http
            .post(&url)
            .header("X-Vault-Token", &token)
            .json(&body)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::FORBIDDEN || resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            warn!(path, "vault auth failure, reloading token once");
            let token = self.force_reload_token()?;
            let resp = self
                .http
                .post(&url)
                .header("X-Vault-Token", &token)
                .json(&body)
                .send()
                .await?;
            return Self::parse_response(resp).await;
        }

        Self::parse_response(resp).await
    }

    async fn parse_response(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(TransitError::Api { status: status.as_u16(), message });
        }
        let text = resp.text().await?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| TransitError::Api { status: status.as_u16(), message: e.to_string() })
    }

    /// Fetch a secret, e.g. a provider API key, from the `kv/data/{path}` mount.
    /// Cached per `(path, key)` for `secret_cache_ttl_secs`.
    pub async fn get_secret(&self, path: &str, key: &str) -> Result<String> {
        let cache_key = (path.to_string(), key.to_string());
        if let Some(value) = self.cached_secret(&cache_key) {
            return Ok(value);
        }

        let data = self.vault_request(&format!("kv/data/{path}"), Value::Null).await?;
        let value = data
            .get("data")
            .and_then(|d| d.get("data"))
            .and_then(|d| d.get(key))
            .and_then(|v| v.as_str())
            .ok_or_else(|| TransitError::SecretNotFound(key.to_string()))?
            .to_string();

        self.secrets.write().expect("secret cache lock poisoned").insert(
            cache_key,
            CachedSecret { value: value.clone(), expires_at: Instant::now() + self.secret_ttl },
        );
        Ok(value)
    }

    fn cached_secret(&self, key: &(String, String)) -> Option<String> {
        let guard = self.secrets.read().expect("secret cache lock poisoned");
        let entry = guard.get(key)?;
        if entry.expires_at > Instant::now() {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Encrypt plaintext via the transit engine. `context` is required for
    /// derived (per-user) keys.
    pub async fn encrypt(&self, key_name: &str, plaintext: &str, context: Option<&str>) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let encoded = BASE64.encode(plaintext.as_bytes());
        let mut body = json!({ "plaintext": encoded });
        if let Some(ctx) = context {
            body["context"] = json!(ctx);
        }
        let result = self.vault_request(&format!("transit/encrypt/{key_name}"), body).await?;
        result
            .get("data")
            .and_then(|d| d.get("ciphertext"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| TransitError::Api { status: 500, message: "missing ciphertext in response".into() })
    }

    /// Decrypt ciphertext via the transit engine. Rejects values without the
    /// `vault:` prefix as `WrongScheme` so callers can fall back to a
    /// client-side scheme instead of sending client-encrypted data to Vault.
    pub async fn decrypt(&self, key_name: &str, ciphertext: &str, context: Option<&str>) -> Result<String> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }
        if !ciphertext.starts_with("vault:") {
            return Err(TransitError::WrongScheme);
        }
        let mut body = json!({ "ciphertext": ciphertext });
        if let Some(ctx) = context {
            body["context"] = json!(ctx);
        }
        let result = self.vault_request(&format!("transit/decrypt/{key_name}"), body).await?;
        let encoded = result
            .get("data")
            .and_then(|d| d.get("plaintext"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| TransitError::Api { status: 500, message: "missing plaintext in response".into() })?;
        let decoded = BASE64
            .decode(encoded)
            .map_err(|e| TransitError::Api { status: 500, message: e.to_string() })?;
        String::from_utf8(decoded).map_err(|e| TransitError::Api { status: 500, message: e.to_string() })
    }

    pub async fn hmac(&self, key_name: &str, data: &str) -> Result<String> {
        let encoded = BASE64.encode(data.as_bytes());
        let result = self
            .vault_request(&format!("transit/hmac/{key_name}"), json!({ "input": encoded }))
            .await?;
        result
            .get("data")
            .and_then(|d| d.get("hmac"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| TransitError::Api { status: 500, message: "missing hmac in response".into() })
    }

    /// Create a new derived, non-exportable per-user key and return its id.
    pub async fn create_user_key(&self) -> Result<String> {
        let key_id = Uuid::new_v4().to_string();
        let key_name = format!("user-{key_id}");
        self.vault_request(
            &format!("transit/keys/{key_name}"),
            json!({ "derived": true, "exportable": false, "type": "aes256-gcm96" }),
        )
        .await?;
        Ok(key_id)
    }

    fn user_key_name(user_key_id: &str) -> String {
        format!("user-{user_key_id}")
    }

    fn user_context(user_key_id: &str) -> String {
        BASE64.encode(user_key_id.as_bytes())
    }

    pub async fn encrypt_with_user_key(&self, user_key_id: &str, plaintext: &str) -> Result<String> {
        self.encrypt(&Self::user_key_name(user_key_id), plaintext, Some(&Self::user_context(user_key_id)))
            .await
    }

    pub async fn decrypt_with_user_key(&self, user_key_id: &str, ciphertext: &str) -> Result<String> {
        self.decrypt(&Self::user_key_name(user_key_id), ciphertext, Some(&Self::user_context(user_key_id)))
            .await
    }
}
