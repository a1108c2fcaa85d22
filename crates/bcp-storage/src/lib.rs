//! Persistence + outbound engine plumbing for BlogCluster Pro.
//!
//! [`Store`] is the single shared mutable resource of the service. Two
//! implementations ship: [`PgStore`] (production, sqlx/Postgres) and
//! [`MemoryStore`] (tests and local runs without a database). Both honour the same
//! contract: every callback is applied atomically, so readers never observe a
//! half-replaced set of child rows.

mod engine;
mod memory;
mod pg;

use async_trait::async_trait;
use bcp_core::{
    ApplyReport, ChildCounts, ClusterRecord, DraftUpdate, FailureOrigin, JobRecord, NewJob,
    NormalizedCallback, OutlineUpsert, PostPublish, PostRecord, PostStatus, PublishOutcome,
    ResearchArticle, SubscriptionRecord, Suggestion, TopicSuggestion, UsageRecord,
};
use thiserror::Error;

pub use engine::{
    AutomationEngine, DispatchError, EngineConfig, EngineResponse, HttpEngineClient, SECRET_HEADER,
};
pub use memory::MemoryStore;
pub use pg::PgStore;

pub const CRATE_NAME: &str = "bcp-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0} not found")]
    NotFound(String),
    /// The row exists but belongs to someone else.
    #[error("{0} is owned by another user")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Decode(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;

    async fn ensure_user(&self, user_id: &str, email: Option<&str>) -> Result<(), StoreError>;

    /// Inserts a QUEUED job, or resets an existing one owned by the same user
    /// (or by the `unknown` sentinel) back to QUEUED. Adopting a sentinel row
    /// drops the children it collected. Another owner is a
    /// [`StoreError::Conflict`].
    async fn upsert_job(&self, job: &NewJob) -> Result<JobRecord, StoreError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    async fn list_jobs(&self, user_id: &str, limit: i64) -> Result<Vec<JobRecord>, StoreError>;

    /// QUEUED -> RUNNING; any other state is returned untouched.
    async fn mark_running(&self, job_id: &str) -> Result<JobRecord, StoreError>;

    /// Sets FAILED with `origin`. Only [`FailureOrigin::Cancelled`] overrides
    /// a terminal job; other origins leave it as is.
    async fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        origin: FailureOrigin,
    ) -> Result<JobRecord, StoreError>;

    async fn apply_callback(&self, callback: &NormalizedCallback) -> Result<ApplyReport, StoreError>;

    /// Suggestions in batch order.
    async fn suggestions(&self, job_id: &str) -> Result<Vec<Suggestion>, StoreError>;

    /// Articles in preview order, optionally limited.
    async fn articles(&self, job_id: &str, limit: Option<i64>) -> Result<Vec<ResearchArticle>, StoreError>;

    /// Topic suggestions sorted case-insensitively by label, ties in insertion order.
    async fn topic_suggestions(&self, job_id: &str) -> Result<Vec<TopicSuggestion>, StoreError>;

    async fn child_counts(&self, job_id: &str) -> Result<ChildCounts, StoreError>;

    async fn find_or_create_cluster(
        &self,
        user_id: &str,
        title: &str,
        niche: &str,
    ) -> Result<ClusterRecord, StoreError>;

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<ClusterRecord>, StoreError>;

    async fn get_post_by_slug(&self, slug: &str) -> Result<Option<PostRecord>, StoreError>;

    /// Upsert by slug. Returns the post and whether it was newly created.
    async fn upsert_outline(&self, upsert: &OutlineUpsert) -> Result<(PostRecord, bool), StoreError>;

    async fn apply_draft(&self, draft: &DraftUpdate) -> Result<PostRecord, StoreError>;

    /// Records a single-post publish in one transaction: event id, cluster,
    /// post upsert by slug and one `blogs` usage unit. A recorded event id
    /// replays without writing. A slug held by another user is a
    /// [`StoreError::Conflict`].
    async fn publish_post(
        &self,
        publish: &PostPublish,
        period_key: &str,
    ) -> Result<PublishOutcome, StoreError>;

    /// The user's posts under `parent_slug`, oldest first.
    async fn list_supporting_posts(
        &self,
        user_id: &str,
        parent_slug: &str,
        status: Option<PostStatus>,
    ) -> Result<Vec<PostRecord>, StoreError>;

    /// Atomic add; returns the new total for the bucket.
    async fn increment_usage(
        &self,
        user_id: &str,
        metric: &str,
        period_key: &str,
        amount: i64,
    ) -> Result<i64, StoreError>;

    async fn usage_for_period(&self, user_id: &str, period_key: &str)
        -> Result<Vec<UsageRecord>, StoreError>;

    async fn get_subscription(&self, user_id: &str) -> Result<Option<SubscriptionRecord>, StoreError>;

    async fn upsert_subscription(&self, subscription: &SubscriptionRecord) -> Result<(), StoreError>;
}

/// Shallow merge of JSON objects; keys from `incoming` win. Non-objects are replaced.
pub(crate) fn merge_meta(existing: &serde_json::Value, incoming: &serde_json::Value) -> serde_json::Value {
    match (existing, incoming) {
        (serde_json::Value::Object(base), serde_json::Value::Object(update)) => {
            let mut merged = base.clone();
            for (key, value) in update {
                merged.insert(key.clone(), value.clone());
            }
            serde_json::Value::Object(merged)
        }
        (_, incoming) => incoming.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn meta_merge_keeps_existing_keys() {
        let merged = merge_meta(&json!({"type": "pillar", "cta": "old"}), &json!({"cta": "new"}));
        assert_eq!(merged, json!({"type": "pillar", "cta": "new"}));
        assert_eq!(merge_meta(&json!(null), &json!({"a": 1})), json!({"a": 1}));
    }
}
