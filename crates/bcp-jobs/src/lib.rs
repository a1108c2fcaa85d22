//! Job lifecycle, callback ingestion and the read side polled by clients.
//!
//! [`JobService`] sits between the HTTP layer and the [`Store`]: it owns every
//! ownership check, the dispatch bookkeeping (QUEUED -> RUNNING / FAILED) and the
//! translation of storage and parser failures into [`JobError`].

mod preview;
mod service;

use std::time::Duration;

use bcp_adapters::AdapterError;
use bcp_core::{clamp_chars, limits, BLOGS_METRIC};
use bcp_storage::{EngineConfig, StoreError};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use preview::{build_preview, host_label, summaries_by_url, PreviewArticle, ResearchPreview, TopicGroups};
pub use service::{
    CallbackAck, JobService, JobStatusView, OutlineAck, SupportingPost, UsageTotal, UsageView,
};

pub const CRATE_NAME: &str = "bcp-jobs";

/// Path the engine posts results back to.
pub const CALLBACK_PATH: &str = "/api/n8n/keywords-callback";

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub engine: EngineConfig,
    pub public_base_url: String,
    pub recent_jobs_limit: i64,
}

impl JobsConfig {
    pub fn from_env() -> Self {
        let ingest_secret = std::env::var("BCP_INGEST_SECRET").unwrap_or_default();
        Self {
            engine: EngineConfig {
                keywords_url: non_empty_env("BCP_ENGINE_KEYWORDS_URL"),
                formatter_url: non_empty_env("BCP_ENGINE_FORMATTER_URL"),
                secret: non_empty_env("BCP_ENGINE_SECRET").unwrap_or(ingest_secret),
                timeout: Duration::from_secs(
                    std::env::var("BCP_HTTP_TIMEOUT_SECS")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(20),
                ),
                user_agent: std::env::var("BCP_USER_AGENT")
                    .unwrap_or_else(|_| "bcp-engine-client/0.1".to_string()),
            },
            public_base_url: std::env::var("BCP_PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            recent_jobs_limit: std::env::var("BCP_RECENT_JOBS_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    /// Callback URL handed to the engine. Proxy headers win over the configured base.
    pub fn callback_url(&self, forwarded_proto: Option<&str>, forwarded_host: Option<&str>) -> String {
        match (forwarded_proto, forwarded_host) {
            (Some(proto), Some(host)) if !proto.is_empty() && !host.is_empty() => {
                format!("{proto}://{host}{CALLBACK_PATH}")
            }
            _ => format!("{}{CALLBACK_PATH}", self.public_base_url.trim_end_matches('/')),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            public_base_url: "http://localhost:8000".to_string(),
            recent_jobs_limit: 20,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Validation(String),
    #[error("Unauthorized")]
    Unauthenticated,
    #[error("Forbidden")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(String),
    /// The engine refused or could not be reached; the job is already FAILED.
    #[error("{message}")]
    Dispatch {
        job_id: Option<String>,
        message: String,
        details: String,
    },
    #[error("storage failure")]
    Storage(#[source] StoreError),
}

impl JobError {
    /// HTTP status the web layer answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            JobError::Validation(_) => 400,
            JobError::Unauthenticated => 401,
            JobError::Forbidden => 403,
            JobError::NotFound(_) => 404,
            JobError::Dispatch { .. } => 502,
            JobError::Storage(_) => 500,
        }
    }

    pub(crate) fn dispatch(job_id: Option<&str>, message: &str, details: &str) -> Self {
        JobError::Dispatch {
            job_id: job_id.map(str::to_string),
            message: message.to_string(),
            details: clamp_chars(details, limits::DISPATCH_DETAILS_MAX),
        }
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => JobError::NotFound(what),
            StoreError::Conflict(_) => JobError::Forbidden,
            other => JobError::Storage(other),
        }
    }
}

impl From<AdapterError> for JobError {
    fn from(err: AdapterError) -> Self {
        JobError::Validation(err.to_string())
    }
}

/// Body of `POST /api/keywords`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub niche: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// `"US:CA"` or `{country, state}` / `{country, region}`.
    #[serde(default)]
    pub location: Option<JsonValue>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub seed_keywords: Option<Vec<String>>,
    #[serde(default)]
    pub max_results: Option<u32>,
}

/// Extra fields forwarded untouched to the keyword workflow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchExtras {
    pub seed_keywords: Option<Vec<String>>,
    pub max_results: Option<u32>,
}

impl CreateJobRequest {
    pub fn extras(&self) -> DispatchExtras {
        DispatchExtras {
            seed_keywords: self.seed_keywords.clone(),
            max_results: self.max_results,
        }
    }

    /// `(country, region)` with `GLOBAL` / `ALL` defaults, uppercased.
    pub fn resolve_location(&self) -> (String, String) {
        let (country, region) = match &self.location {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => {
                bcp_core::split_location(s.trim())
            }
            Some(JsonValue::Object(obj)) => {
                let field = |keys: &[&str]| {
                    keys.iter()
                        .find_map(|k| obj.get(*k).and_then(JsonValue::as_str))
                        .map(str::to_string)
                        .unwrap_or_default()
                };
                (field(&["country"]), field(&["state", "region"]))
            }
            _ => (
                self.country.clone().unwrap_or_default(),
                self.region.clone().unwrap_or_default(),
            ),
        };
        let country = clamp_chars(country.trim(), limits::LOCATION_MAX).to_ascii_uppercase();
        let region = clamp_chars(region.trim(), limits::LOCATION_MAX).to_ascii_uppercase();
        (
            if country.is_empty() { "GLOBAL".to_string() } else { country },
            if region.is_empty() { "ALL".to_string() } else { region },
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutlineRequest {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub topics: Option<JsonValue>,
    #[serde(default)]
    pub articles: Option<JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncrementUsageRequest {
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default = "default_amount")]
    pub amount: i64,
}

fn default_metric() -> String {
    BLOGS_METRIC.to_string()
}

fn default_amount() -> i64 {
    1
}
