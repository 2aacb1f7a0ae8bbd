use crate::domain::command::CommandOutcome;
use crate::domain::errors::{ExecutorError, TransportError};
use crate::domain::strategy::StrategyDefinition;
use crate::domain::trading::{AccountSnapshot, Position};
use hmac::{Hmac, Mac};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Executor identity issued once by `/executor/register`; stable across
/// restarts, never rotated in-process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorCredential {
    pub executor_id: String,
    pub api_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
}

/// Outbound HTTP client for the control plane.
///
/// Every request carries `Authorization: Bearer <apiKey>` plus an
/// HMAC-SHA256 signature over `timestamp || body` using the secret key.
/// Transient failures retry inside the middleware; anything surviving that
/// maps into the transport error taxonomy.
pub struct ControlClient {
    http: ClientWithMiddleware,
    base_url: String,
    credential: ExecutorCredential,
}

fn build_http_client() -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
    let client = Client::builder()
        .pool_max_idle_per_host(5)
        .timeout(HTTP_TIMEOUT)
        .connect_timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new());
    ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

impl ControlClient {
    pub fn new(base_url: String, credential: ExecutorCredential) -> Self {
        Self {
            http: build_http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
        }
    }

    pub fn executor_id(&self) -> &str {
        &self.credential.executor_id
    }

    pub fn secret_key(&self) -> &str {
        &self.credential.secret_key
    }

    /// One-shot registration; returns the credential exactly once.
    pub async fn register(
        base_url: &str,
        request: &RegisterRequest,
    ) -> Result<ExecutorCredential, ExecutorError> {
        let url = format!("{}/executor/register", base_url.trim_end_matches('/'));
        let response = build_http_client()
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|_| ExecutorError::Transport(TransportError::Disconnected))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ExecutorError::Auth(format!(
                "registration rejected with {status}"
            )));
        }
        if !status.is_success() {
            return Err(ExecutorError::Transport(TransportError::Malformed(
                format!("registration failed with {status}"),
            )));
        }
        let credential: ExecutorCredential = response
            .json()
            .await
            .map_err(|e| ExecutorError::Transport(TransportError::Malformed(e.to_string())))?;
        info!(
            "ControlClient: registered as executor {}",
            credential.executor_id
        );
        Ok(credential)
    }

    pub async fn heartbeat(&self, payload: &serde_json::Value) -> Result<(), ExecutorError> {
        self.post_signed("/executor/heartbeat", payload).await?;
        Ok(())
    }

    /// Report one command terminal state.
    pub async fn ack_command(&self, outcome: &CommandOutcome) -> Result<(), ExecutorError> {
        let path = format!("/executor/command/{}/ack", outcome.id);
        let body = serde_json::json!({
            "state": outcome.state,
            "result": outcome.result,
            "error": outcome.error,
        });
        self.post_signed(&path, &body).await?;
        debug!("ControlClient: acked {} as {}", outcome.id, outcome.state);
        Ok(())
    }

    pub async fn sync_positions(
        &self,
        positions: &[Position],
        account: Option<&AccountSnapshot>,
    ) -> Result<(), ExecutorError> {
        let body = serde_json::json!({
            "positions": positions,
            "account": account,
        });
        self.post_signed("/executor/positions", &body).await?;
        Ok(())
    }

    /// Current strategy set assigned to this executor.
    pub async fn download_strategies(&self) -> Result<Vec<StrategyDefinition>, ExecutorError> {
        let url = format!("{}/strategies/download", self.base_url);
        let timestamp = chrono::Utc::now().timestamp_millis();
        let signature = self.sign(&format!("{timestamp}"));

        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.credential.api_key))
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Signature", signature)
            .send()
            .await
            .map_err(|_| ExecutorError::Transport(TransportError::Disconnected))?;

        let response = Self::check_status(response)?;
        response
            .json()
            .await
            .map_err(|e| ExecutorError::Transport(TransportError::Malformed(e.to_string())))
    }

    async fn post_signed(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ExecutorError> {
        let url = format!("{}{}", self.base_url, path);
        let body_text = body.to_string();
        let timestamp = chrono::Utc::now().timestamp_millis();
        let signature = self.sign(&format!("{timestamp}{body_text}"));

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.credential.api_key))
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Signature", signature)
            .header("Content-Type", "application/json")
            .body(body_text)
            .send()
            .await
            .map_err(|_| ExecutorError::Transport(TransportError::Disconnected))?;

        Self::check_status(response)
    }

    fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ExecutorError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ExecutorError::Auth(format!(
                "control plane rejected credential with {status}"
            )));
        }
        if !status.is_success() {
            return Err(ExecutorError::Transport(TransportError::Malformed(
                format!("control plane returned {status}"),
            )));
        }
        Ok(response)
    }

    /// HMAC-SHA256 over `timestamp || body`, hex encoded.
    fn sign(&self, payload: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.credential.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}
