//! HTTP client for the AAS Part 2 repository API.
//!
//! Used both to poll repository snapshots (ingress) and to write property
//! values back on broker commands (egress). Write retries use bounded
//! exponential backoff; the command router turns exhaustion into a negative
//! acknowledgement.

use crate::encoding::{encode_id_short_path, encode_identifier};
use aas_uplink_core::aas::{Environment, Shell, Submodel};
use reqwest::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Repository client configuration.
#[derive(Debug, Clone)]
pub struct RepositoryClientConfig {
    /// Base URL of the repository (e.g. `http://localhost:8081`)
    pub base_url: String,
    /// Per-call timeout
    pub timeout: Duration,
    /// Optional bearer token
    pub bearer_token: Option<String>,
    /// Write retry attempts after the first failure
    pub write_retries: u32,
    /// Initial backoff between write retries (doubles per attempt)
    pub write_backoff: Duration,
}

impl Default for RepositoryClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            timeout: Duration::from_secs(30),
            bearer_token: None,
            write_retries: 3,
            write_backoff: Duration::from_millis(250),
        }
    }
}

/// AAS repository client.
pub struct RepositoryClient {
    client: Client,
    config: RepositoryClientConfig,
    last_snapshot_hash: Option<String>,
}

impl RepositoryClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: RepositoryClientConfig) -> Result<Self, RepositoryError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RepositoryError::Init(e.to_string()))?;
        Ok(Self {
            client,
            config,
            last_snapshot_hash: None,
        })
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value, RepositoryError> {
        tracing::debug!(url, "GET");
        let response = self
            .auth(self.client.get(url))
            .send()
            .await
            .map_err(|e| RepositoryError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RepositoryError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        response
            .json()
            .await
            .map_err(|e| RepositoryError::Parse(e.to_string()))
    }

    /// Unwrap the repository's paginated `{"result": [...]}` envelope.
    fn result_array(body: Value) -> Vec<Value> {
        match body {
            Value::Object(mut obj) => match obj.remove("result") {
                Some(Value::Array(items)) => items,
                Some(other) => vec![other],
                None => vec![Value::Object(obj)],
            },
            Value::Array(items) => items,
            other => vec![other],
        }
    }

    /// Fetch the full environment: all shells and all submodels.
    ///
    /// Returns the environment and whether the snapshot changed since the
    /// previous fetch (content-hash comparison).
    ///
    /// # Errors
    ///
    /// Returns error on transport, API or parse failure.
    pub async fn fetch_environment(&mut self) -> Result<(Environment, bool), RepositoryError> {
        let shells_raw = self
            .get_json(&format!("{}/shells", self.config.base_url))
            .await?;
        let submodels_raw = self
            .get_json(&format!("{}/submodels", self.config.base_url))
            .await?;

        let mut hasher = Sha256::new();
        hasher.update(shells_raw.to_string().as_bytes());
        hasher.update(submodels_raw.to_string().as_bytes());
        let snapshot_hash = format!("{:x}", hasher.finalize());
        let changed = self.last_snapshot_hash.as_deref() != Some(snapshot_hash.as_str());
        self.last_snapshot_hash = Some(snapshot_hash);

        let mut env = Environment::default();
        for raw in Self::result_array(shells_raw) {
            match serde_json::from_value::<Shell>(raw) {
                Ok(shell) => env.asset_administration_shells.push(shell),
                Err(e) => tracing::warn!(error = %e, "Skipping unparsable shell"),
            }
        }
        for raw in Self::result_array(submodels_raw) {
            match serde_json::from_value::<Submodel>(raw) {
                Ok(submodel) => env.submodels.push(submodel),
                Err(e) => tracing::warn!(error = %e, "Skipping unparsable submodel"),
            }
        }

        tracing::debug!(
            shells = env.asset_administration_shells.len(),
            submodels = env.submodels.len(),
            changed,
            "Fetched repository snapshot"
        );
        Ok((env, changed))
    }

    /// Patch one submodel element value, retrying with bounded exponential
    /// backoff.
    ///
    /// # Errors
    ///
    /// Returns the last failure once the retry budget is exhausted.
    pub async fn write_property(
        &self,
        submodel_id: &str,
        id_short_path: &str,
        value: &Value,
    ) -> Result<(), RepositoryError> {
        let url = format!(
            "{}/submodels/{}/submodel-elements/{}/$value",
            self.config.base_url,
            encode_identifier(submodel_id),
            encode_id_short_path(id_short_path),
        );

        let mut backoff = self.config.write_backoff;
        let mut last_error = None;
        for attempt in 0..=self.config.write_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }

            tracing::debug!(url, attempt, "PATCH element $value");
            let result = self
                .auth(
                    self.client
                        .patch(&url)
                        .header("Content-Type", "application/json")
                        .json(value),
                )
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let message = response.text().await.unwrap_or_default();
                    // Client errors will not heal on retry.
                    if (400..500).contains(&status) {
                        return Err(RepositoryError::Api { status, message });
                    }
                    last_error = Some(RepositoryError::Api { status, message });
                }
                Err(e) => last_error = Some(RepositoryError::Request(e.to_string())),
            }
        }

        Err(last_error.unwrap_or_else(|| RepositoryError::Request("no attempt made".into())))
    }
}

/// Errors of the repository client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    /// Client construction failed
    #[error("repository client init error: {0}")]
    Init(String),
    /// Transport failure
    #[error("repository request error: {0}")]
    Request(String),
    /// Non-success API status
    #[error("repository API error (status {status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Body text, if any
        message: String,
    },
    /// Body could not be parsed
    #[error("repository parse error: {0}")]
    Parse(String),
}
