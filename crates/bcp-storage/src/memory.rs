use std::collections::HashMap;

use async_trait::async_trait;
use bcp_core::{
    plan_status_change, preview_order, split_location, ApplyReport, ChildCounts, ClusterRecord,
    ClusterStatus, DraftUpdate, FailureOrigin, JobRecord, JobStatus, NewJob, NormalizedCallback,
    OutlineUpsert, PostPublish, PostRecord, PostStatus, PostType, PublishOutcome, ResearchArticle,
    StageStatus, SubscriptionRecord, Suggestion, TopicSuggestion, UsageRecord, BLOGS_METRIC,
    UNKNOWN,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{merge_meta, Store, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<String, Option<String>>,
    jobs: HashMap<String, JobRecord>,
    suggestions: HashMap<String, Vec<Suggestion>>,
    articles: HashMap<String, Vec<ResearchArticle>>,
    topics: HashMap<String, Vec<TopicSuggestion>>,
    clusters: HashMap<String, ClusterRecord>,
    posts: HashMap<String, PostRecord>,
    /// Slugs in creation order.
    post_order: Vec<String>,
    /// Publish event id -> cluster id.
    publish_events: HashMap<String, String>,
    usage: HashMap<(String, String, String), UsageRecord>,
    subscriptions: HashMap<String, SubscriptionRecord>,
}

impl MemoryState {
    fn cluster_for(&mut self, user_id: &str, title: &str, niche: &str) -> ClusterRecord {
        if let Some(existing) = self
            .clusters
            .values_mut()
            .find(|c| c.user_id == user_id && c.title == title)
        {
            if !niche.is_empty() {
                existing.niche = niche.to_string();
            }
            return existing.clone();
        }
        let cluster = ClusterRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            niche: niche.to_string(),
            status: ClusterStatus::Draft,
            created_at: Utc::now(),
        };
        self.clusters.insert(cluster.id.clone(), cluster.clone());
        cluster
    }

    fn insert_post(&mut self, post: PostRecord) {
        self.post_order.push(post.slug.clone());
        self.posts.insert(post.slug.clone(), post);
    }

    fn post_owner(&self, slug: &str) -> Option<&str> {
        let post = self.posts.get(slug)?;
        self.clusters.get(&post.cluster_id).map(|c| c.user_id.as_str())
    }

    fn add_usage(
        &mut self,
        user_id: &str,
        metric: &str,
        period_key: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> i64 {
        let key = (user_id.to_string(), metric.to_string(), period_key.to_string());
        let row = self.usage.entry(key).or_insert_with(|| UsageRecord {
            user_id: user_id.to_string(),
            metric: metric.to_string(),
            period_key: period_key.to_string(),
            amount: 0,
            updated_at: now,
        });
        row.amount += amount;
        row.updated_at = now;
        row.amount
    }
}

/// In-process store. One mutex guards everything, which makes each operation
/// trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(kind: &str, id: &str) -> StoreError {
    StoreError::NotFound(format!("{kind} {id}"))
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ensure_user(&self, user_id: &str, email: Option<&str>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state.users.entry(user_id.to_string()).or_default();
        if let Some(email) = email {
            *entry = Some(email.to_string());
        }
        Ok(())
    }

    async fn upsert_job(&self, job: &NewJob) -> Result<JobRecord, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let adopting = match state.jobs.get(&job.id) {
            Some(existing) if existing.user_id == job.user_id => false,
            Some(existing) if existing.user_id == UNKNOWN => true,
            Some(_) => return Err(StoreError::Conflict(format!("job {}", job.id))),
            None => false,
        };
        if adopting {
            state.suggestions.remove(&job.id);
            state.articles.remove(&job.id);
            state.topics.remove(&job.id);
        }
        if let Some(existing) = state.jobs.get_mut(&job.id) {
            existing.user_id = job.user_id.clone();
            existing.topic = job.topic.clone();
            existing.country = job.country.clone();
            existing.region = job.region.clone();
            existing.location = job.location.clone();
            existing.cluster_id = job.cluster_id.clone();
            existing.status = JobStatus::Queued;
            existing.error = None;
            existing.failure_origin = None;
            existing.started_at = None;
            existing.completed_at = None;
            existing.raw_payload = None;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let record = JobRecord {
            id: job.id.clone(),
            user_id: job.user_id.clone(),
            topic: job.topic.clone(),
            country: job.country.clone(),
            region: job.region.clone(),
            location: job.location.clone(),
            cluster_id: job.cluster_id.clone(),
            status: JobStatus::Queued,
            error: None,
            failure_origin: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            raw_payload: None,
        };
        state.jobs.insert(job.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.state.lock().await.jobs.get(job_id).cloned())
    }

    async fn list_jobs(&self, user_id: &str, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn mark_running(&self, job_id: &str) -> Result<JobRecord, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(job_id).ok_or_else(|| not_found("job", job_id))?;
        if job.status == JobStatus::Queued {
            let now = Utc::now();
            job.status = JobStatus::Running;
            job.started_at.get_or_insert(now);
            job.updated_at = now;
        }
        Ok(job.clone())
    }

    async fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        origin: FailureOrigin,
    ) -> Result<JobRecord, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(job_id).ok_or_else(|| not_found("job", job_id))?;
        if origin == FailureOrigin::Cancelled || !job.status.is_terminal() {
            let now = Utc::now();
            job.status = JobStatus::Failed;
            job.error = Some(error.to_string());
            job.failure_origin = Some(origin);
            job.completed_at = Some(now);
            job.updated_at = now;
        }
        Ok(job.clone())
    }

    async fn apply_callback(&self, callback: &NormalizedCallback) -> Result<ApplyReport, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let job_id = callback.job_id.as_str();

        let created_job = !state.jobs.contains_key(job_id);
        if created_job {
            let location = callback.location.clone().unwrap_or_else(|| "GLOBAL".to_string());
            let (country, region) = split_location(&location);
            state.jobs.insert(
                job_id.to_string(),
                JobRecord {
                    id: job_id.to_string(),
                    user_id: callback.user_id.clone().unwrap_or_else(|| UNKNOWN.to_string()),
                    topic: callback.topic.clone().unwrap_or_else(|| UNKNOWN.to_string()),
                    country,
                    region,
                    location,
                    cluster_id: None,
                    status: JobStatus::Queued,
                    error: None,
                    failure_origin: None,
                    started_at: None,
                    completed_at: None,
                    created_at: now,
                    updated_at: now,
                    raw_payload: None,
                },
            );
        }

        let job = state.jobs.get_mut(job_id).ok_or_else(|| not_found("job", job_id))?;
        let Some(change) = plan_status_change(
            job.status,
            job.failure_origin,
            callback.outcome,
            callback.error.as_deref(),
        ) else {
            return Ok(ApplyReport {
                job: job.clone(),
                saved: 0,
                ignored: true,
                created_job,
            });
        };

        job.status = change.status;
        job.error = change.error;
        job.failure_origin = change.failure_origin;
        if change.mark_started {
            job.started_at.get_or_insert(now);
        }
        if change.mark_completed {
            job.completed_at = Some(now);
        }
        if job.user_id == UNKNOWN {
            if let Some(user_id) = &callback.user_id {
                job.user_id = user_id.clone();
            }
        }
        if job.topic == UNKNOWN {
            if let Some(topic) = &callback.topic {
                job.topic = topic.clone();
            }
        }
        if let Some(raw) = &callback.raw_payload {
            job.raw_payload = Some(raw.clone());
        }
        job.updated_at = now;
        let job = job.clone();

        if let Some(drafts) = &callback.suggestions {
            let rows = drafts
                .iter()
                .cloned()
                .enumerate()
                .map(|(position, draft)| Suggestion::from_draft(job_id, position, draft, now))
                .collect();
            state.suggestions.insert(job_id.to_string(), rows);
        }
        if let Some(articles) = &callback.articles {
            state.articles.insert(job_id.to_string(), articles.clone());
        }
        if let Some(topics) = &callback.topics {
            state.topics.insert(job_id.to_string(), topics.clone());
        }

        Ok(ApplyReport {
            job,
            saved: callback.saved_count(),
            ignored: false,
            created_job,
        })
    }

    async fn suggestions(&self, job_id: &str) -> Result<Vec<Suggestion>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .suggestions
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn articles(&self, job_id: &str, limit: Option<i64>) -> Result<Vec<ResearchArticle>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state.articles.get(job_id).cloned().unwrap_or_default();
        rows.sort_by(preview_order);
        if let Some(limit) = limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }

    async fn topic_suggestions(&self, job_id: &str) -> Result<Vec<TopicSuggestion>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state.topics.get(job_id).cloned().unwrap_or_default();
        // Stable sort: equal labels keep insertion order.
        rows.sort_by_cached_key(|t| t.label.to_lowercase());
        Ok(rows)
    }

    async fn child_counts(&self, job_id: &str) -> Result<ChildCounts, StoreError> {
        let state = self.state.lock().await;
        let count = |len: Option<usize>| len.unwrap_or(0) as i64;
        Ok(ChildCounts {
            suggestions: count(state.suggestions.get(job_id).map(Vec::len)),
            articles: count(state.articles.get(job_id).map(Vec::len)),
            topics: count(state.topics.get(job_id).map(Vec::len)),
        })
    }

    async fn find_or_create_cluster(
        &self,
        user_id: &str,
        title: &str,
        niche: &str,
    ) -> Result<ClusterRecord, StoreError> {
        Ok(self.state.lock().await.cluster_for(user_id, title, niche))
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<ClusterRecord>, StoreError> {
        Ok(self.state.lock().await.clusters.get(cluster_id).cloned())
    }

    async fn get_post_by_slug(&self, slug: &str) -> Result<Option<PostRecord>, StoreError> {
        Ok(self.state.lock().await.posts.get(slug).cloned())
    }

    async fn upsert_outline(&self, upsert: &OutlineUpsert) -> Result<(PostRecord, bool), StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some(post) = state.posts.get_mut(&upsert.slug) {
            post.title = upsert.title.clone();
            post.post_type = upsert.post_type;
            post.parent_id = upsert.parent_id.clone();
            post.parent_slug = upsert.parent_slug.clone();
            post.outline = Some(upsert.outline.clone());
            post.outline_status = StageStatus::Ready;
            post.status = post.status.advance(PostStatus::Ready);
            post.meta = merge_meta(&post.meta, &upsert.meta);
            post.updated_at = now;
            return Ok((post.clone(), false));
        }

        let post = PostRecord {
            id: Uuid::new_v4().to_string(),
            cluster_id: upsert.cluster_id.clone(),
            slug: upsert.slug.clone(),
            title: upsert.title.clone(),
            post_type: upsert.post_type,
            parent_id: upsert.parent_id.clone(),
            parent_slug: upsert.parent_slug.clone(),
            outline: Some(upsert.outline.clone()),
            outline_status: StageStatus::Ready,
            content: String::new(),
            draft_status: StageStatus::None,
            status: PostStatus::Ready,
            meta: upsert.meta.clone(),
            citations: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        state.insert_post(post.clone());
        Ok((post, true))
    }

    async fn apply_draft(&self, draft: &DraftUpdate) -> Result<PostRecord, StoreError> {
        let mut state = self.state.lock().await;
        let post = state
            .posts
            .get_mut(&draft.slug)
            .ok_or_else(|| not_found("post", &draft.slug))?;
        if let Some(title) = &draft.title {
            post.title = title.clone();
        }
        post.content = draft.content.clone();
        post.draft_status = StageStatus::Ready;
        post.status = post.status.advance(draft.status);
        post.meta = merge_meta(&post.meta, &draft.meta);
        post.citations = draft.citations.clone();
        post.updated_at = Utc::now();
        Ok(post.clone())
    }

    async fn publish_post(
        &self,
        publish: &PostPublish,
        period_key: &str,
    ) -> Result<PublishOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(event_id) = &publish.event_id {
            if let Some(cluster_id) = state.publish_events.get(event_id) {
                return Ok(PublishOutcome {
                    cluster_id: cluster_id.clone(),
                    post: None,
                    replayed: true,
                });
            }
        }
        if state.posts.contains_key(&publish.slug)
            && state.post_owner(&publish.slug) != Some(publish.user_id.as_str())
        {
            return Err(StoreError::Conflict(format!("post {}", publish.slug)));
        }

        let now = Utc::now();
        let cluster = state.cluster_for(&publish.user_id, &publish.cluster_title, &publish.cluster_niche);
        let post = match state.posts.get_mut(&publish.slug) {
            Some(post) => {
                post.cluster_id = cluster.id.clone();
                post.title = publish.title.clone();
                if let Some(content) = &publish.content {
                    post.content = content.clone();
                    post.draft_status = StageStatus::Ready;
                }
                post.status = post.status.advance(publish.status);
                post.updated_at = now;
                post.clone()
            }
            None => {
                let post = PostRecord {
                    id: Uuid::new_v4().to_string(),
                    cluster_id: cluster.id.clone(),
                    slug: publish.slug.clone(),
                    title: publish.title.clone(),
                    post_type: PostType::Pillar,
                    parent_id: None,
                    parent_slug: None,
                    outline: None,
                    outline_status: StageStatus::None,
                    content: publish.content.clone().unwrap_or_default(),
                    draft_status: if publish.content.is_some() {
                        StageStatus::Ready
                    } else {
                        StageStatus::None
                    },
                    status: publish.status,
                    meta: serde_json::json!({}),
                    citations: Vec::new(),
                    created_at: now,
                    updated_at: now,
                };
                state.insert_post(post.clone());
                post
            }
        };
        if let Some(event_id) = &publish.event_id {
            state.publish_events.insert(event_id.clone(), cluster.id.clone());
        }
        state.add_usage(&publish.user_id, BLOGS_METRIC, period_key, 1, now);

        Ok(PublishOutcome {
            cluster_id: cluster.id,
            post: Some(post),
            replayed: false,
        })
    }

    async fn list_supporting_posts(
        &self,
        user_id: &str,
        parent_slug: &str,
        status: Option<PostStatus>,
    ) -> Result<Vec<PostRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .post_order
            .iter()
            .filter_map(|slug| state.posts.get(slug))
            .filter(|p| p.parent_slug.as_deref() == Some(parent_slug))
            .filter(|p| status.map_or(true, |s| p.status == s))
            .filter(|p| state.post_owner(&p.slug) == Some(user_id))
            .cloned()
            .collect())
    }

    async fn increment_usage(
        &self,
        user_id: &str,
        metric: &str,
        period_key: &str,
        amount: i64,
    ) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.add_usage(user_id, metric, period_key, amount, Utc::now()))
    }

    async fn usage_for_period(
        &self,
        user_id: &str,
        period_key: &str,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<UsageRecord> = state
            .usage
            .values()
            .filter(|u| u.user_id == user_id && u.period_key == period_key)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.metric.cmp(&b.metric));
        Ok(rows)
    }

    async fn get_subscription(&self, user_id: &str) -> Result<Option<SubscriptionRecord>, StoreError> {
        Ok(self.state.lock().await.subscriptions.get(user_id).cloned())
    }

    async fn upsert_subscription(&self, subscription: &SubscriptionRecord) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.user_id.clone(), subscription.clone());
        Ok(())
    }
}
