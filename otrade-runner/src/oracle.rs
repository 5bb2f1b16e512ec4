//! HTTP scoring oracle.
//!
//! Posts an `OracleRequest` as JSON and expects
//! `{"direction": "long" | "short" | "flat", "confidence": 0.0..=1.0}`.
//! Anything else is an `OracleError`, which the loop treats as "no score".
//!
//! With an `exit_url`, open positions are posted there as an `ExitRequest`
//! and the reply `{"close": bool, "reason": "..."}` can close them early.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use otrade_core::decision::OracleScore;

use crate::collaborators::{ExitRequest, ExitVerdict, OracleRequest, ScoringOracle};
use crate::config::OracleConfig;
use crate::error::OracleError;

#[derive(Debug, Clone)]
pub struct HttpOracle {
    client: reqwest::Client,
    url: String,
    exit_url: Option<String>,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpOracle {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            exit_url: None,
            api_key,
            timeout,
        }
    }

    pub fn with_exit_url(mut self, exit_url: Option<String>) -> Self {
        self.exit_url = exit_url;
        self
    }

    /// Build from the `[oracle]` section; `None` when no HTTP oracle is configured.
    ///
    /// A missing API key variable is logged and the oracle runs without one.
    pub fn from_config(config: &OracleConfig, timeout: Duration) -> Option<Self> {
        match config {
            OracleConfig::None => None,
            OracleConfig::Http {
                url,
                api_key_env,
                exit_url,
            } => {
                let api_key = api_key_env.as_deref().and_then(|var| match std::env::var(var) {
                    Ok(key) => Some(key),
                    Err(_) => {
                        tracing::warn!(var, "oracle API key variable not set");
                        None
                    }
                });
                Some(Self::new(url.clone(), api_key, timeout).with_exit_url(exit_url.clone()))
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn exit_url(&self) -> Option<&str> {
        self.exit_url.as_deref()
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, OracleError> {
        let mut builder = self.client.post(url).timeout(self.timeout).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                OracleError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                OracleError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Unavailable(format!("HTTP {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))
    }
}

/// Reject scores the synthesizer cannot use.
pub fn validate_score(score: OracleScore) -> Result<OracleScore, OracleError> {
    if !(0.0..=1.0).contains(&score.confidence) {
        return Err(OracleError::InvalidResponse(format!(
            "confidence {} outside [0, 1]",
            score.confidence
        )));
    }
    Ok(score)
}

#[async_trait]
impl ScoringOracle for HttpOracle {
    async fn score(&self, request: &OracleRequest) -> Result<OracleScore, OracleError> {
        let score: OracleScore = self.post(&self.url, request).await?;
        validate_score(score)
    }

    async fn advise_exit(&self, request: &ExitRequest) -> Result<ExitVerdict, OracleError> {
        match &self.exit_url {
            Some(url) => self.post(url, request).await,
            None => Err(OracleError::Disabled),
        }
    }
}
