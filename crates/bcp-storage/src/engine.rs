//! Outbound triggers to the workflow automation engine.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, Instrument};

/// Header carrying the shared secret in both directions.
pub const SECRET_HEADER: &str = "x-ingest-secret";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub keywords_url: Option<String>,
    pub formatter_url: Option<String>,
    pub secret: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keywords_url: None,
            formatter_url: None,
            secret: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: "bcp/0.1".to_string(),
        }
    }
}

/// Upstream answer; `body` is the parsed JSON, or the raw text as a JSON string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineResponse {
    pub status: u16,
    pub body: JsonValue,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0} webhook url is not configured")]
    NotConfigured(&'static str),
    #[error("engine {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("engine request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait AutomationEngine: Send + Sync {
    /// Starts the keyword research workflow for one job.
    async fn trigger_keywords(&self, payload: &JsonValue) -> Result<EngineResponse, DispatchError>;

    /// Starts the outline formatter workflow.
    async fn trigger_formatter(&self, payload: &JsonValue) -> Result<EngineResponse, DispatchError>;
}

#[derive(Debug, Clone)]
pub struct HttpEngineClient {
    client: reqwest::Client,
    config: EngineConfig,
}

impl HttpEngineClient {
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building engine http client")?;
        Ok(Self { client, config })
    }

    async fn post(
        &self,
        workflow: &'static str,
        url: Option<&str>,
        payload: &JsonValue,
    ) -> Result<EngineResponse, DispatchError> {
        let url = url.ok_or(DispatchError::NotConfigured(workflow))?;
        let span = info_span!("engine_trigger", workflow, url);
        async move {
            let resp = self
                .client
                .post(url)
                .header(SECRET_HEADER, &self.config.secret)
                .json(payload)
                .send()
                .await?;
            let status = resp.status();
            let text = resp.text().await?;
            if !status.is_success() {
                tracing::warn!(status = status.as_u16(), "engine rejected trigger");
                return Err(DispatchError::Upstream {
                    status: status.as_u16(),
                    body: text,
                });
            }
            tracing::info!(status = status.as_u16(), "engine accepted trigger");
            let body = serde_json::from_str(&text).unwrap_or(JsonValue::String(text));
            Ok(EngineResponse {
                status: status.as_u16(),
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl AutomationEngine for HttpEngineClient {
    async fn trigger_keywords(&self, payload: &JsonValue) -> Result<EngineResponse, DispatchError> {
        self.post("keywords", self.config.keywords_url.as_deref(), payload)
            .await
    }

    async fn trigger_formatter(&self, payload: &JsonValue) -> Result<EngineResponse, DispatchError> {
        self.post("formatter", self.config.formatter_url.as_deref(), payload)
            .await
    }
}
