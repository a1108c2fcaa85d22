//! Postgres store. Runtime-checked queries (`query`/`query_as`) so the crate
//! builds without a live database.

use std::str::FromStr;

use async_trait::async_trait;
use bcp_core::{
    json_without_nul, plan_status_change, split_location, ApplyReport, ChildCounts, ClusterRecord,
    DraftUpdate, FailureOrigin, JobRecord, NewJob, NewsMeta, NormalizedCallback, Outline,
    OutlineUpsert, PostPublish, PostRecord, PostStatus, PostType, PublishOutcome, ResearchArticle,
    StageStatus, SubscriptionRecord, Suggestion, TopicSuggestion, UsageRecord, BLOGS_METRIC,
    UNKNOWN,
};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgConnection, Postgres, Transaction};
use uuid::Uuid;

use crate::{merge_meta, Store, StoreError};

const JOB_COLUMNS: &str = "id, user_id, topic, country, region, location, cluster_id, status, error, \
     failure_origin, started_at, completed_at, created_at, updated_at, raw_payload";

/// Per-job child tables, cleared together when a sentinel job is adopted.
const CHILD_TABLES: [&str; 3] = [
    "keyword_suggestions",
    "research_articles",
    "research_topic_suggestions",
];

const POST_COLUMNS: &str = "id, cluster_id, slug, title, post_type, parent_id, parent_slug, outline, \
     outline_status, content, draft_status, status, meta, citations, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        tracing::info!("database migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn lock_job(
        tx: &mut Transaction<'_, Postgres>,
        job_id: &str,
    ) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM keywords_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn fetch_job(&self, job_id: &str) -> Result<JobRecord, StoreError> {
        self.get_job(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    async fn cluster_for(
        conn: &mut PgConnection,
        user_id: &str,
        title: &str,
        niche: &str,
    ) -> Result<ClusterRecord, StoreError> {
        let row = sqlx::query_as::<_, ClusterRow>(
            "INSERT INTO clusters (id, user_id, title, niche, status)
             VALUES ($1, $2, $3, $4, 'DRAFT')
             ON CONFLICT (user_id, title) DO UPDATE SET
                niche = CASE WHEN EXCLUDED.niche <> '' THEN EXCLUDED.niche ELSE clusters.niche END
             RETURNING id, user_id, title, niche, status, created_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(title)
        .bind(niche)
        .fetch_one(&mut *conn)
        .await?;
        row.try_into()
    }

    async fn add_usage(
        conn: &mut PgConnection,
        user_id: &str,
        metric: &str,
        period_key: &str,
        amount: i64,
    ) -> Result<i64, StoreError> {
        let total: i64 = sqlx::query_scalar(
            "INSERT INTO usage (user_id, metric, period_key, amount, updated_at)
             VALUES ($1, $2, $3, $4, NOW())
             ON CONFLICT (user_id, metric, period_key)
             DO UPDATE SET amount = usage.amount + EXCLUDED.amount, updated_at = NOW()
             RETURNING amount",
        )
        .bind(user_id)
        .bind(metric)
        .bind(period_key)
        .bind(amount)
        .fetch_one(&mut *conn)
        .await?;
        Ok(total)
    }

    async fn replayed_publish(&self, event_id: &str) -> Result<Option<PublishOutcome>, StoreError> {
        let cluster_id: Option<String> =
            sqlx::query_scalar("SELECT cluster_id FROM publish_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cluster_id.map(|cluster_id| PublishOutcome {
            cluster_id,
            post: None,
            replayed: true,
        }))
    }
}

// ── Row types ───────────────────────────────────────────────────

fn parse_enum<T: FromStr>(value: &str, what: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Decode(format!("{what} {value:?}")))
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    user_id: String,
    topic: String,
    country: String,
    region: String,
    location: String,
    cluster_id: Option<String>,
    status: String,
    error: Option<String>,
    failure_origin: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    raw_payload: Option<JsonValue>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            status: parse_enum(&row.status, "job status")?,
            failure_origin: row
                .failure_origin
                .as_deref()
                .map(|origin| parse_enum(origin, "failure origin"))
                .transpose()?,
            id: row.id,
            user_id: row.user_id,
            topic: row.topic,
            country: row.country,
            region: row.region,
            location: row.location,
            cluster_id: row.cluster_id,
            error: row.error,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            raw_payload: row.raw_payload,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SuggestionRow {
    id: Uuid,
    job_id: String,
    position: i32,
    keyword: String,
    score: Option<f64>,
    source_url: Option<String>,
    news_urls: Json<Vec<String>>,
    news_meta: Json<Vec<Option<NewsMeta>>>,
    created_at: DateTime<Utc>,
}

impl From<SuggestionRow> for Suggestion {
    fn from(row: SuggestionRow) -> Self {
        Suggestion {
            id: row.id,
            job_id: row.job_id,
            position: row.position,
            keyword: row.keyword,
            score: row.score,
            source_url: row.source_url,
            news_urls: row.news_urls.0,
            news_meta: row.news_meta.0,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ArticleRow {
    id: String,
    job_id: String,
    url: String,
    title: Option<String>,
    source_name: Option<String>,
    published_time: Option<DateTime<Utc>>,
    raw_text: Option<String>,
    snippet: Option<String>,
    rank: Option<i32>,
    word_count: Option<i32>,
    relevance_score: Option<f64>,
}

impl From<ArticleRow> for ResearchArticle {
    fn from(row: ArticleRow) -> Self {
        ResearchArticle {
            id: row.id,
            job_id: row.job_id,
            url: row.url,
            title: row.title,
            source_name: row.source_name,
            published_time: row.published_time,
            raw_text: row.raw_text,
            snippet: row.snippet,
            rank: row.rank,
            word_count: row.word_count,
            relevance_score: row.relevance_score,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TopicRow {
    job_id: String,
    label: String,
    tier: String,
}

#[derive(sqlx::FromRow)]
struct ClusterRow {
    id: String,
    user_id: String,
    title: String,
    niche: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ClusterRow> for ClusterRecord {
    type Error = StoreError;

    fn try_from(row: ClusterRow) -> Result<Self, Self::Error> {
        Ok(ClusterRecord {
            status: parse_enum(&row.status, "cluster status")?,
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            niche: row.niche,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PostRow {
    id: String,
    cluster_id: String,
    slug: String,
    title: String,
    post_type: String,
    parent_id: Option<String>,
    parent_slug: Option<String>,
    outline: Option<Json<Outline>>,
    outline_status: String,
    content: String,
    draft_status: String,
    status: String,
    meta: JsonValue,
    citations: Json<Vec<String>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PostRow> for PostRecord {
    type Error = StoreError;

    fn try_from(row: PostRow) -> Result<Self, Self::Error> {
        Ok(PostRecord {
            post_type: parse_enum(&row.post_type, "post type")?,
            outline_status: parse_enum(&row.outline_status, "outline status")?,
            draft_status: parse_enum(&row.draft_status, "draft status")?,
            status: parse_enum(&row.status, "post status")?,
            id: row.id,
            cluster_id: row.cluster_id,
            slug: row.slug,
            title: row.title,
            parent_id: row.parent_id,
            parent_slug: row.parent_slug,
            outline: row.outline.map(|o| o.0),
            content: row.content,
            meta: row.meta,
            citations: row.citations.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UsageRow {
    user_id: String,
    metric: String,
    period_key: String,
    amount: i64,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    user_id: String,
    plan: String,
    status: String,
    current_period_end: Option<DateTime<Utc>>,
    price_id: Option<String>,
    updated_at: DateTime<Utc>,
}

// ── Store impl ──────────────────────────────────────────────────

#[async_trait]
impl Store for PgStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_user(&self, user_id: &str, email: Option<&str>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (id, email) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET email = COALESCE(EXCLUDED.email, users.email)",
        )
        .bind(user_id)
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_job(&self, job: &NewJob) -> Result<JobRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let owner: Option<String> =
            sqlx::query_scalar("SELECT user_id FROM keywords_jobs WHERE id = $1 FOR UPDATE")
                .bind(&job.id)
                .fetch_optional(&mut *tx)
                .await?;
        match owner.as_deref() {
            Some(owner) if owner == job.user_id => {}
            Some(UNKNOWN) => {
                for table in CHILD_TABLES {
                    sqlx::query(&format!("DELETE FROM {table} WHERE job_id = $1"))
                        .bind(&job.id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
            Some(_) => return Err(StoreError::Conflict(format!("job {}", job.id))),
            None => {}
        }

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "INSERT INTO keywords_jobs (id, user_id, topic, country, region, location, cluster_id, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'QUEUED')
             ON CONFLICT (id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                topic = EXCLUDED.topic,
                country = EXCLUDED.country,
                region = EXCLUDED.region,
                location = EXCLUDED.location,
                cluster_id = EXCLUDED.cluster_id,
                status = 'QUEUED',
                error = NULL,
                failure_origin = NULL,
                started_at = NULL,
                completed_at = NULL,
                raw_payload = NULL,
                updated_at = NOW()
             WHERE keywords_jobs.user_id IN (EXCLUDED.user_id, '{UNKNOWN}')
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(&job.id)
        .bind(&job.user_id)
        .bind(&job.topic)
        .bind(&job.country)
        .bind(&job.region)
        .bind(&job.location)
        .bind(&job.cluster_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::Conflict(format!("job {}", job.id)));
        };
        tx.commit().await?;
        row.try_into()
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM keywords_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn list_jobs(&self, user_id: &str, limit: i64) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM keywords_jobs
             WHERE user_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn mark_running(&self, job_id: &str) -> Result<JobRecord, StoreError> {
        sqlx::query(
            "UPDATE keywords_jobs
             SET status = 'RUNNING', started_at = COALESCE(started_at, NOW()), updated_at = NOW()
             WHERE id = $1 AND status = 'QUEUED'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        self.fetch_job(job_id).await
    }

    async fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        origin: FailureOrigin,
    ) -> Result<JobRecord, StoreError> {
        sqlx::query(
            "UPDATE keywords_jobs
             SET status = 'FAILED', error = $2, failure_origin = $3,
                 completed_at = NOW(), updated_at = NOW()
             WHERE id = $1 AND ($3 = 'CANCELLED' OR status IN ('QUEUED', 'RUNNING'))",
        )
        .bind(job_id)
        .bind(error)
        .bind(origin.as_str())
        .execute(&self.pool)
        .await?;
        self.fetch_job(job_id).await
    }

    async fn apply_callback(&self, callback: &NormalizedCallback) -> Result<ApplyReport, StoreError> {
        let job_id = callback.job_id.as_str();
        let mut tx = self.pool.begin().await?;

        let location = callback.location.clone().unwrap_or_else(|| "GLOBAL".to_string());
        let (country, region) = split_location(&location);
        let created_job = sqlx::query(
            "INSERT INTO keywords_jobs (id, user_id, topic, country, region, location, status)
             VALUES ($1, $2, $3, $4, $5, $6, 'QUEUED')
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(job_id)
        .bind(callback.user_id.as_deref().unwrap_or(UNKNOWN))
        .bind(callback.topic.as_deref().unwrap_or(UNKNOWN))
        .bind(&country)
        .bind(&region)
        .bind(&location)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let current = Self::lock_job(&mut tx, job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;

        let Some(change) = plan_status_change(
            current.status,
            current.failure_origin,
            callback.outcome,
            callback.error.as_deref(),
        ) else {
            tx.commit().await?;
            return Ok(ApplyReport {
                job: current,
                saved: 0,
                ignored: true,
                created_job,
            });
        };

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE keywords_jobs SET
                status = $2,
                error = $3,
                started_at = CASE WHEN $4 THEN COALESCE(started_at, NOW()) ELSE started_at END,
                completed_at = CASE WHEN $5 THEN NOW() ELSE completed_at END,
                user_id = CASE WHEN user_id = '{UNKNOWN}' THEN COALESCE($6, user_id) ELSE user_id END,
                topic = CASE WHEN topic = '{UNKNOWN}' THEN COALESCE($7, topic) ELSE topic END,
                raw_payload = COALESCE($8, raw_payload),
                failure_origin = $9,
                updated_at = NOW()
             WHERE id = $1
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(change.status.as_str())
        .bind(&change.error)
        .bind(change.mark_started)
        .bind(change.mark_completed)
        .bind(&callback.user_id)
        .bind(&callback.topic)
        .bind(callback.raw_payload.as_ref().map(|raw| json_without_nul(raw).into_owned()))
        .bind(change.failure_origin.map(FailureOrigin::as_str))
        .fetch_one(&mut *tx)
        .await?;
        let job = JobRecord::try_from(row)?;

        if let Some(drafts) = &callback.suggestions {
            sqlx::query("DELETE FROM keyword_suggestions WHERE job_id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            for (position, draft) in drafts.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO keyword_suggestions
                        (id, job_id, position, keyword, score, source_url, news_urls, news_meta)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(Uuid::new_v4())
                .bind(job_id)
                .bind(position as i32)
                .bind(&draft.keyword)
                .bind(draft.score)
                .bind(&draft.source_url)
                .bind(Json(&draft.news_urls))
                .bind(Json(&draft.news_meta))
                .execute(&mut *tx)
                .await?;
            }
        }

        if let Some(articles) = &callback.articles {
            sqlx::query("DELETE FROM research_articles WHERE job_id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            for article in articles {
                sqlx::query(
                    "INSERT INTO research_articles
                        (job_id, id, url, title, source_name, published_time, raw_text, snippet,
                         rank, word_count, relevance_score)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                )
                .bind(job_id)
                .bind(&article.id)
                .bind(&article.url)
                .bind(&article.title)
                .bind(&article.source_name)
                .bind(article.published_time)
                .bind(&article.raw_text)
                .bind(&article.snippet)
                .bind(article.rank)
                .bind(article.word_count)
                .bind(article.relevance_score)
                .execute(&mut *tx)
                .await?;
            }
        }

        if let Some(topics) = &callback.topics {
            sqlx::query("DELETE FROM research_topic_suggestions WHERE job_id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            for topic in topics {
                sqlx::query(
                    "INSERT INTO research_topic_suggestions (job_id, label, tier) VALUES ($1, $2, $3)",
                )
                .bind(job_id)
                .bind(&topic.label)
                .bind(topic.tier.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(ApplyReport {
            job,
            saved: callback.saved_count(),
            ignored: false,
            created_job,
        })
    }

    async fn suggestions(&self, job_id: &str) -> Result<Vec<Suggestion>, StoreError> {
        let rows = sqlx::query_as::<_, SuggestionRow>(
            "SELECT id, job_id, position, keyword, score, source_url, news_urls, news_meta, created_at
             FROM keyword_suggestions WHERE job_id = $1 ORDER BY position",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Suggestion::from).collect())
    }

    async fn articles(&self, job_id: &str, limit: Option<i64>) -> Result<Vec<ResearchArticle>, StoreError> {
        let rows = sqlx::query_as::<_, ArticleRow>(
            "SELECT id, job_id, url, title, source_name, published_time, raw_text, snippet,
                    rank, word_count, relevance_score
             FROM research_articles WHERE job_id = $1
             ORDER BY rank ASC NULLS LAST, published_time DESC NULLS LAST
             LIMIT $2",
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ResearchArticle::from).collect())
    }

    async fn topic_suggestions(&self, job_id: &str) -> Result<Vec<TopicSuggestion>, StoreError> {
        let rows = sqlx::query_as::<_, TopicRow>(
            "SELECT job_id, label, tier FROM research_topic_suggestions
             WHERE job_id = $1 ORDER BY LOWER(label) COLLATE \"C\", id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(TopicSuggestion {
                    tier: parse_enum(&row.tier, "topic tier")?,
                    job_id: row.job_id,
                    label: row.label,
                })
            })
            .collect()
    }

    async fn child_counts(&self, job_id: &str) -> Result<ChildCounts, StoreError> {
        let (suggestions, articles, topics): (i64, i64, i64) = sqlx::query_as(
            "SELECT
                (SELECT COUNT(*) FROM keyword_suggestions WHERE job_id = $1),
                (SELECT COUNT(*) FROM research_articles WHERE job_id = $1),
                (SELECT COUNT(*) FROM research_topic_suggestions WHERE job_id = $1)",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(ChildCounts {
            suggestions,
            articles,
            topics,
        })
    }

    async fn find_or_create_cluster(
        &self,
        user_id: &str,
        title: &str,
        niche: &str,
    ) -> Result<ClusterRecord, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::cluster_for(&mut conn, user_id, title, niche).await
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<ClusterRecord>, StoreError> {
        let row = sqlx::query_as::<_, ClusterRow>(
            "SELECT id, user_id, title, niche, status, created_at FROM clusters WHERE id = $1",
        )
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ClusterRecord::try_from).transpose()
    }

    async fn get_post_by_slug(&self, slug: &str) -> Result<Option<PostRecord>, StoreError> {
        let row = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE slug = $1"
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PostRecord::try_from).transpose()
    }

    async fn upsert_outline(&self, upsert: &OutlineUpsert) -> Result<(PostRecord, bool), StoreError> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE slug = $1 FOR UPDATE"
        ))
        .bind(&upsert.slug)
        .fetch_optional(&mut *tx)
        .await?
        .map(PostRecord::try_from)
        .transpose()?;

        let created = existing.is_none();
        let row = match existing {
            Some(post) => {
                sqlx::query_as::<_, PostRow>(&format!(
                    "UPDATE posts SET
                        title = $2, post_type = $3, parent_id = $4, parent_slug = $5,
                        outline = $6, outline_status = 'READY', status = $7, meta = $8,
                        updated_at = NOW()
                     WHERE id = $1
                     RETURNING {POST_COLUMNS}"
                ))
                .bind(&post.id)
                .bind(&upsert.title)
                .bind(upsert.post_type.as_str())
                .bind(&upsert.parent_id)
                .bind(&upsert.parent_slug)
                .bind(Json(&upsert.outline))
                .bind(post.status.advance(PostStatus::Ready).as_str())
                .bind(merge_meta(&post.meta, &upsert.meta))
                .fetch_one(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as::<_, PostRow>(&format!(
                    "INSERT INTO posts
                        (id, cluster_id, slug, title, post_type, parent_id, parent_slug, outline,
                         outline_status, content, draft_status, status, meta)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'READY', '', 'NONE', 'READY', $9)
                     RETURNING {POST_COLUMNS}"
                ))
                .bind(Uuid::new_v4().to_string())
                .bind(&upsert.cluster_id)
                .bind(&upsert.slug)
                .bind(&upsert.title)
                .bind(upsert.post_type.as_str())
                .bind(&upsert.parent_id)
                .bind(&upsert.parent_slug)
                .bind(Json(&upsert.outline))
                .bind(&upsert.meta)
                .fetch_one(&mut *tx)
                .await?
            }
        };
        tx.commit().await?;
        Ok((row.try_into()?, created))
    }

    async fn apply_draft(&self, draft: &DraftUpdate) -> Result<PostRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let post: PostRecord = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE slug = $1 FOR UPDATE"
        ))
        .bind(&draft.slug)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("post {}", draft.slug)))?
        .try_into()?;

        let row = sqlx::query_as::<_, PostRow>(&format!(
            "UPDATE posts SET
                title = COALESCE($2, title), content = $3, draft_status = $4, status = $5,
                meta = $6, citations = $7, updated_at = NOW()
             WHERE id = $1
             RETURNING {POST_COLUMNS}"
        ))
        .bind(&post.id)
        .bind(&draft.title)
        .bind(&draft.content)
        .bind(StageStatus::Ready.as_str())
        .bind(post.status.advance(draft.status).as_str())
        .bind(merge_meta(&post.meta, &draft.meta))
        .bind(Json(&draft.citations))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row.try_into()
    }

    async fn publish_post(
        &self,
        publish: &PostPublish,
        period_key: &str,
    ) -> Result<PublishOutcome, StoreError> {
        if let Some(event_id) = &publish.event_id {
            if let Some(replay) = self.replayed_publish(event_id).await? {
                return Ok(replay);
            }
        }

        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE slug = $1 FOR UPDATE"
        ))
        .bind(&publish.slug)
        .fetch_optional(&mut *tx)
        .await?
        .map(PostRecord::try_from)
        .transpose()?;

        if let Some(post) = &existing {
            let owner: Option<String> =
                sqlx::query_scalar("SELECT user_id FROM clusters WHERE id = $1")
                    .bind(&post.cluster_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if owner.as_deref() != Some(publish.user_id.as_str()) {
                return Err(StoreError::Conflict(format!("post {}", publish.slug)));
            }
        }

        let cluster = Self::cluster_for(
            &mut tx,
            &publish.user_id,
            &publish.cluster_title,
            &publish.cluster_niche,
        )
        .await?;
        let draft_status = match &publish.content {
            Some(_) => StageStatus::Ready,
            None => StageStatus::None,
        };

        let row = match existing {
            Some(post) => {
                sqlx::query_as::<_, PostRow>(&format!(
                    "UPDATE posts SET
                        cluster_id = $2, title = $3, content = COALESCE($4, content),
                        draft_status = CASE WHEN $4 IS NULL THEN draft_status ELSE 'READY' END,
                        status = $5, updated_at = NOW()
                     WHERE id = $1
                     RETURNING {POST_COLUMNS}"
                ))
                .bind(&post.id)
                .bind(&cluster.id)
                .bind(&publish.title)
                .bind(&publish.content)
                .bind(post.status.advance(publish.status).as_str())
                .fetch_one(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as::<_, PostRow>(&format!(
                    "INSERT INTO posts
                        (id, cluster_id, slug, title, post_type, outline_status, content,
                         draft_status, status)
                     VALUES ($1, $2, $3, $4, $5, 'NONE', $6, $7, $8)
                     RETURNING {POST_COLUMNS}"
                ))
                .bind(Uuid::new_v4().to_string())
                .bind(&cluster.id)
                .bind(&publish.slug)
                .bind(&publish.title)
                .bind(PostType::Pillar.as_str())
                .bind(publish.content.as_deref().unwrap_or_default())
                .bind(draft_status.as_str())
                .bind(publish.status.as_str())
                .fetch_one(&mut *tx)
                .await?
            }
        };

        if let Some(event_id) = &publish.event_id {
            let recorded = sqlx::query(
                "INSERT INTO publish_events (event_id, user_id, cluster_id, post_slug)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (event_id) DO NOTHING",
            )
            .bind(event_id)
            .bind(&publish.user_id)
            .bind(&cluster.id)
            .bind(&publish.slug)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if recorded == 0 {
                // A concurrent delivery of the same event committed first.
                tx.rollback().await?;
                return self
                    .replayed_publish(event_id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("publish event {event_id}")));
            }
        }

        Self::add_usage(&mut tx, &publish.user_id, BLOGS_METRIC, period_key, 1).await?;
        tx.commit().await?;
        Ok(PublishOutcome {
            cluster_id: cluster.id,
            post: Some(row.try_into()?),
            replayed: false,
        })
    }

    async fn list_supporting_posts(
        &self,
        user_id: &str,
        parent_slug: &str,
        status: Option<PostStatus>,
    ) -> Result<Vec<PostRecord>, StoreError> {
        let rows = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM posts
             WHERE parent_slug = $2
               AND cluster_id IN (SELECT id FROM clusters WHERE user_id = $1)
               AND ($3::TEXT IS NULL OR status = $3)
             ORDER BY created_at, id"
        ))
        .bind(user_id)
        .bind(parent_slug)
        .bind(status.map(PostStatus::as_str))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PostRecord::try_from).collect()
    }

    async fn increment_usage(
        &self,
        user_id: &str,
        metric: &str,
        period_key: &str,
        amount: i64,
    ) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::add_usage(&mut conn, user_id, metric, period_key, amount).await
    }

    async fn usage_for_period(
        &self,
        user_id: &str,
        period_key: &str,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let rows = sqlx::query_as::<_, UsageRow>(
            "SELECT user_id, metric, period_key, amount, updated_at FROM usage
             WHERE user_id = $1 AND period_key = $2 ORDER BY metric",
        )
        .bind(user_id)
        .bind(period_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| UsageRecord {
                user_id: r.user_id,
                metric: r.metric,
                period_key: r.period_key,
                amount: r.amount,
                updated_at: r.updated_at,
            })
            .collect())
    }

    async fn get_subscription(&self, user_id: &str) -> Result<Option<SubscriptionRecord>, StoreError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT user_id, plan, status, current_period_end, price_id, updated_at
             FROM subscriptions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| SubscriptionRecord {
            user_id: r.user_id,
            plan: r.plan,
            status: r.status,
            current_period_end: r.current_period_end,
            price_id: r.price_id,
            updated_at: r.updated_at,
        }))
    }

    async fn upsert_subscription(&self, subscription: &SubscriptionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO subscriptions (user_id, plan, status, current_period_end, price_id, updated_at)
             VALUES ($1, $2, $3, $4, $5, NOW())
             ON CONFLICT (user_id) DO UPDATE SET
                plan = EXCLUDED.plan,
                status = EXCLUDED.status,
                current_period_end = EXCLUDED.current_period_end,
                price_id = EXCLUDED.price_id,
                updated_at = NOW()",
        )
        .bind(&subscription.user_id)
        .bind(&subscription.plan)
        .bind(&subscription.status)
        .bind(subscription.current_period_end)
        .bind(&subscription.price_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
