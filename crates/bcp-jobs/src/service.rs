use std::sync::Arc;

use bcp_adapters::{parse_draft, parse_outline, parse_publish, CallbackNormalizer, ClusterRef};
use bcp_core::{
    clamp_chars, clean_text, generate_job_id, is_valid_job_id, is_valid_metric, limits,
    location_string, period_key, strip_nul, ChildCounts, FailureOrigin, JobRecord, JobStatus,
    NewJob, Outline, OutlineUpsert, Plan, PlanLimits, PostRecord, PostStatus, PostType,
    PublishOutcome, Suggestion, UsageRecord, BLOGS_METRIC,
};
use bcp_storage::{AutomationEngine, DispatchError, EngineResponse, Store, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{info, info_span, warn, Instrument};

use crate::preview::{build_preview, ResearchPreview};
use crate::{
    CreateJobRequest, DispatchExtras, IncrementUsageRequest, JobError, JobsConfig,
    StartOutlineRequest,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackAck {
    pub job_id: String,
    pub saved: usize,
    pub status: JobStatus,
    pub ignored: bool,
    pub created_job: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub topic: String,
    pub location: String,
    pub counts: ChildCounts,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub suggestions: Vec<Suggestion>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineAck {
    pub post: PostRecord,
    pub created: bool,
}

/// Row of `GET /posts/supportings`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportingPost {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub status: PostStatus,
    pub outline: Option<Outline>,
}

impl From<PostRecord> for SupportingPost {
    fn from(post: PostRecord) -> Self {
        Self {
            id: post.id,
            slug: post.slug,
            title: post.title,
            status: post.status,
            outline: post.outline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotal {
    pub metric: String,
    pub period_key: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageView {
    pub period_key: String,
    pub plan: Plan,
    pub limits: PlanLimits,
    pub blogs_used: i64,
    pub blogs_remaining: i64,
    pub rows: Vec<UsageRecord>,
}

pub struct JobService {
    store: Arc<dyn Store>,
    engine: Arc<dyn AutomationEngine>,
    normalizer: CallbackNormalizer,
    config: JobsConfig,
}

impl JobService {
    pub fn new(store: Arc<dyn Store>, engine: Arc<dyn AutomationEngine>, config: JobsConfig) -> Self {
        Self {
            store,
            engine,
            normalizer: CallbackNormalizer::default(),
            config,
        }
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn health(&self) -> Result<(), JobError> {
        Ok(self.store.health_check().await?)
    }

    /// Inserts (or re-runs) a QUEUED job for `user_id`.
    pub async fn create_job(&self, user_id: &str, request: &CreateJobRequest) -> Result<JobRecord, JobError> {
        let topic = request
            .topic
            .as_deref()
            .or(request.niche.as_deref())
            .map(|t| strip_nul(t).trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| JobError::Validation("Missing topic".into()))?;
        if topic.chars().count() > limits::TOPIC_MAX {
            return Err(JobError::Validation(format!(
                "topic must be at most {} characters",
                limits::TOPIC_MAX
            )));
        }

        let id = match request.job_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) if is_valid_job_id(id) => id.to_string(),
            Some(_) => return Err(JobError::Validation("invalid jobId".into())),
            None => generate_job_id(),
        };
        let (country, region) = request.resolve_location();
        let new_job = NewJob {
            id,
            user_id: user_id.to_string(),
            topic,
            location: location_string(&country, &region),
            country,
            region,
            cluster_id: clean_text(request.cluster_id.as_deref(), limits::JOB_ID_MAX),
        };

        let email = request.email.as_deref().map(strip_nul);
        self.store.ensure_user(user_id, email.as_deref()).await?;
        let job = self.store.upsert_job(&new_job).await.map_err(|err| {
            if matches!(err, StoreError::Conflict(_)) {
                warn!(job_id = %new_job.id, user_id, "job id is owned by another user");
            }
            JobError::from(err)
        })?;
        info!(job_id = %job.id, user_id, location = %job.location, "job queued");
        Ok(job)
    }

    /// Triggers the keyword workflow. Failures mark the job FAILED (unless a
    /// callback already finished it) and surface as [`JobError::Dispatch`].
    /// The engine's own verdict may still land on such a job later.
    pub async fn dispatch(
        &self,
        job: &JobRecord,
        callback_url: &str,
        extras: &DispatchExtras,
    ) -> Result<JobRecord, JobError> {
        let payload = json!({
            "userId": job.user_id,
            "jobId": job.id,
            "topic": job.topic,
            "country": job.country,
            "region": job.region,
            "location": job.location,
            "clusterId": job.cluster_id,
            "seedKeywords": extras.seed_keywords,
            "maxResults": extras.max_results,
            "callbackUrl": callback_url,
        });
        let span = info_span!("dispatch", job_id = %job.id);
        async move {
            match self.engine.trigger_keywords(&payload).await {
                Ok(_) => Ok(self.store.mark_running(&job.id).await?),
                Err(err) => {
                    let (message, details) = match &err {
                        DispatchError::Upstream { status, body } => {
                            (format!("engine {status}: {body}"), body.clone())
                        }
                        other => (other.to_string(), other.to_string()),
                    };
                    warn!(error = %err, "engine dispatch failed");
                    let message = clamp_chars(&message, limits::DISPATCH_ERROR_MAX);
                    self.store
                        .mark_failed(&job.id, &message, FailureOrigin::Dispatch)
                        .await?;
                    Err(JobError::dispatch(Some(&job.id), "engine request failed", &details))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// `create_job` followed by `dispatch`.
    pub async fn submit(
        &self,
        user_id: &str,
        request: &CreateJobRequest,
        callback_url: &str,
    ) -> Result<JobRecord, JobError> {
        let job = self.create_job(user_id, request).await?;
        self.dispatch(&job, callback_url, &request.extras()).await
    }

    /// Cancelled jobs ignore every later callback.
    pub async fn cancel(&self, user_id: &str, job_id: &str) -> Result<JobRecord, JobError> {
        let job = self.owned_job(user_id, job_id).await?;
        let job = self
            .store
            .mark_failed(&job.id, "cancelled", FailureOrigin::Cancelled)
            .await?;
        info!(job_id = %job.id, "job cancelled");
        Ok(job)
    }

    pub async fn list_jobs(&self, user_id: &str, limit: Option<i64>) -> Result<Vec<JobRecord>, JobError> {
        let limit = limit.unwrap_or(self.config.recent_jobs_limit).clamp(1, 100);
        Ok(self.store.list_jobs(user_id, limit).await?)
    }

    /// Parses and applies one engine callback.
    pub async fn ingest_callback(&self, body: &[u8]) -> Result<CallbackAck, JobError> {
        let callback = self.normalizer.parse_slice(body)?;
        let span = info_span!("callback", job_id = %callback.job_id, outcome = ?callback.outcome);
        async move {
            let report = self.store.apply_callback(&callback).await?;
            if report.ignored {
                info!(status = %report.job.status, "late callback ignored on terminal job");
            } else {
                info!(
                    saved = report.saved,
                    status = %report.job.status,
                    created_job = report.created_job,
                    "callback applied"
                );
            }
            Ok(CallbackAck {
                job_id: report.job.id,
                saved: report.saved,
                status: report.job.status,
                ignored: report.ignored,
                created_job: report.created_job,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn status(&self, user_id: &str, job_id: &str) -> Result<JobStatusView, JobError> {
        let job = self.owned_job(user_id, job_id).await?;
        let counts = self.store.child_counts(&job.id).await?;
        let suggestions = self.store.suggestions(&job.id).await?;
        Ok(JobStatusView {
            job_id: job.id,
            status: job.status,
            error: job.error,
            topic: job.topic,
            location: job.location,
            counts,
            started_at: job.started_at,
            completed_at: job.completed_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
            suggestions,
        })
    }

    pub async fn preview(&self, user_id: &str, job_id: &str) -> Result<ResearchPreview, JobError> {
        let job = self.owned_job(user_id, job_id).await?;
        let articles = self
            .store
            .articles(&job.id, Some(limits::PREVIEW_ARTICLES as i64))
            .await?;
        let suggestions = self.store.suggestions(&job.id).await?;
        let topics = self.store.topic_suggestions(&job.id).await?;
        Ok(build_preview(&job.id, job.status, articles, &suggestions, &topics))
    }

    /// Forwards the chosen topics and articles to the outline formatter workflow.
    pub async fn start_outline(
        &self,
        user_id: &str,
        request: &StartOutlineRequest,
    ) -> Result<EngineResponse, JobError> {
        let job = self
            .owned_job(user_id, request.job_id.as_deref().unwrap_or_default())
            .await?;
        let as_array = |value: &Option<JsonValue>| match value {
            Some(JsonValue::Array(items)) => JsonValue::Array(items.clone()),
            _ => JsonValue::Array(Vec::new()),
        };
        let payload = json!({
            "jobId": job.id,
            "userId": job.user_id,
            "topics": as_array(&request.topics),
            "articles": as_array(&request.articles),
        });
        self.engine.trigger_formatter(&payload).await.map_err(|err| {
            warn!(job_id = %job.id, error = %err, "formatter trigger failed");
            let details = match &err {
                DispatchError::Upstream { body, .. } => body.clone(),
                other => other.to_string(),
            };
            JobError::dispatch(Some(&job.id), "formatter request failed", &details)
        })
    }

    /// Upserts a post outline by slug.
    pub async fn ingest_outline(&self, payload: &JsonValue) -> Result<OutlineAck, JobError> {
        let parsed = parse_outline(payload)?;
        let cluster = match &parsed.cluster {
            ClusterRef::Id(id) => self
                .store
                .get_cluster(id)
                .await?
                .ok_or_else(|| JobError::NotFound(format!("cluster {id}")))?,
            ClusterRef::Named { user_id, title, niche } => {
                self.store.ensure_user(user_id, None).await?;
                self.store.find_or_create_cluster(user_id, title, niche).await?
            }
        };

        let (parent_id, parent_slug) = match (parsed.post_type, parsed.parent_slug) {
            (PostType::Supporting, Some(slug)) => match self.store.get_post_by_slug(&slug).await? {
                Some(parent) if parent.post_type != PostType::Pillar => {
                    return Err(JobError::Validation(format!("parent {slug} is not a pillar post")));
                }
                Some(parent) => (Some(parent.id), Some(slug)),
                None => (None, Some(slug)),
            },
            _ => (None, None),
        };

        let upsert = OutlineUpsert {
            cluster_id: cluster.id.clone(),
            slug: parsed.slug,
            title: parsed.title,
            post_type: parsed.post_type,
            parent_id,
            parent_slug,
            outline: parsed.outline,
            meta: parsed.meta,
        };
        let (post, created) = self.store.upsert_outline(&upsert).await?;
        if created {
            self.store
                .increment_usage(&cluster.user_id, BLOGS_METRIC, &period_key(Utc::now()), 1)
                .await?;
        }
        info!(slug = %post.slug, cluster_id = %cluster.id, created, "outline stored");
        Ok(OutlineAck { post, created })
    }

    pub async fn ingest_draft(&self, payload: &JsonValue) -> Result<PostRecord, JobError> {
        let draft = parse_draft(payload)?;
        let post = self.store.apply_draft(&draft).await?;
        info!(slug = %post.slug, status = post.status.as_str(), "draft stored");
        Ok(post)
    }

    /// Single-post publish from an external publisher. Replays of a recorded
    /// `eventId` return the original cluster and write nothing.
    pub async fn publish(&self, payload: &JsonValue) -> Result<PublishOutcome, JobError> {
        let publish = parse_publish(payload)?;
        let span = info_span!("publish", slug = %publish.slug, event_id = ?publish.event_id);
        async move {
            self.store.ensure_user(&publish.user_id, None).await?;
            let outcome = self
                .store
                .publish_post(&publish, &period_key(Utc::now()))
                .await
                .map_err(|err| {
                    if matches!(err, StoreError::Conflict(_)) {
                        warn!(user_id = %publish.user_id, "slug is owned by another user");
                    }
                    JobError::from(err)
                })?;
            if outcome.replayed {
                info!(cluster_id = %outcome.cluster_id, "publish event replayed");
            } else {
                info!(cluster_id = %outcome.cluster_id, "post published");
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Posts of `user_id` whose parent is `parent_slug`, oldest first.
    pub async fn supporting_posts(
        &self,
        user_id: &str,
        parent_slug: Option<&str>,
        status: Option<&str>,
    ) -> Result<Vec<SupportingPost>, JobError> {
        let parent_slug = parent_slug
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| JobError::Validation("parent_slug is required".into()))?;
        let status = status
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<PostStatus>()
                    .map_err(|e| JobError::Validation(e.to_string()))
            })
            .transpose()?;
        let posts = self
            .store
            .list_supporting_posts(user_id, parent_slug, status)
            .await?;
        Ok(posts.into_iter().map(SupportingPost::from).collect())
    }

    pub async fn increment_usage(
        &self,
        user_id: &str,
        request: &IncrementUsageRequest,
    ) -> Result<UsageTotal, JobError> {
        if !is_valid_metric(&request.metric) {
            return Err(JobError::Validation("Invalid metric".into()));
        }
        if request.amount <= 0 {
            return Err(JobError::Validation("Invalid amount".into()));
        }
        let period = period_key(Utc::now());
        let amount = self
            .store
            .increment_usage(user_id, &request.metric, &period, request.amount)
            .await?;
        Ok(UsageTotal {
            metric: request.metric.clone(),
            period_key: period,
            amount,
        })
    }

    pub async fn usage(&self, user_id: &str) -> Result<UsageView, JobError> {
        let period = period_key(Utc::now());
        let rows = self.store.usage_for_period(user_id, &period).await?;
        let plan = self
            .store
            .get_subscription(user_id)
            .await?
            .map_or(Plan::Starter, |s| s.effective_plan());
        let limits = plan.limits();
        let blogs_used = rows
            .iter()
            .filter(|r| r.metric == BLOGS_METRIC)
            .map(|r| r.amount)
            .sum::<i64>();
        Ok(UsageView {
            period_key: period,
            plan,
            limits,
            blogs_used,
            blogs_remaining: (limits.blogs_per_month - blogs_used).max(0),
            rows,
        })
    }

    /// Loads a job and checks it belongs to `user_id`.
    pub async fn owned_job(&self, user_id: &str, job_id: &str) -> Result<JobRecord, JobError> {
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(JobError::Validation("Missing jobId".into()));
        }
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("job {job_id}")))?;
        if job.user_id != user_id {
            warn!(job_id, user_id, "job read by non-owner");
            return Err(JobError::Forbidden);
        }
        Ok(job)
    }
}
