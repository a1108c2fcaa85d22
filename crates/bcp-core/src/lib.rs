//! Core domain model and status rules for BlogCluster Pro.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

/// Sentinel used when a callback creates a job without owner or topic information.
pub const UNKNOWN: &str = "unknown";

/// Storage bounds applied by the ingestion normalizer.
pub mod limits {
    pub const KEYWORD_MAX: usize = 200;
    pub const URL_MAX: usize = 1024;
    pub const IMAGE_URL_MAX: usize = 512;
    pub const META_TITLE_MAX: usize = 160;
    pub const SUMMARY_MAX: usize = 600;
    pub const SOURCE_NAME_MAX: usize = 80;
    pub const PUBLISHED_TIME_MAX: usize = 64;
    pub const NEWS_URLS_PER_SUGGESTION: usize = 12;
    pub const SUGGESTIONS_PER_BATCH: usize = 100;
    pub const TOPIC_LABEL_MAX: usize = 160;
    pub const ARTICLE_ID_MAX: usize = 128;
    pub const ARTICLE_TITLE_MAX: usize = 300;
    pub const ARTICLE_SNIPPET_MAX: usize = 600;
    pub const ARTICLE_RAW_TEXT_MAX: usize = 20_000;
    pub const TOPIC_MAX: usize = 200;
    pub const LOCATION_MAX: usize = 64;
    pub const JOB_ID_MAX: usize = 64;
    pub const JOB_ERROR_MAX: usize = 500;
    pub const DISPATCH_ERROR_MAX: usize = 300;
    pub const DISPATCH_DETAILS_MAX: usize = 500;
    pub const PREVIEW_ARTICLES: usize = 5;
    pub const RAW_PAYLOAD_MAX_BYTES: usize = 256 * 1024;
    pub const METRIC_MAX: usize = 40;
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

// ── Text helpers ────────────────────────────────────────────────

/// Truncate to at most `max` characters, never splitting a code point.
pub fn clamp_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((byte_idx, _)) => input[..byte_idx].to_string(),
        None => input.to_string(),
    }
}

/// Postgres rejects U+0000 in TEXT and JSONB values.
pub fn strip_nul(input: &str) -> Cow<'_, str> {
    if input.contains('\0') {
        Cow::Owned(input.replace('\0', ""))
    } else {
        Cow::Borrowed(input)
    }
}

/// Copy of `value` with U+0000 removed from every key and string.
/// Borrows when nothing needs to change.
pub fn json_without_nul(value: &JsonValue) -> Cow<'_, JsonValue> {
    fn contains_nul(value: &JsonValue) -> bool {
        match value {
            JsonValue::String(s) => s.contains('\0'),
            JsonValue::Array(items) => items.iter().any(contains_nul),
            JsonValue::Object(map) => map
                .iter()
                .any(|(key, item)| key.contains('\0') || contains_nul(item)),
            _ => false,
        }
    }

    fn scrub(value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::String(s) => JsonValue::String(strip_nul(s).into_owned()),
            JsonValue::Array(items) => JsonValue::Array(items.iter().map(scrub).collect()),
            JsonValue::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(key, item)| (strip_nul(key).into_owned(), scrub(item)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    if contains_nul(value) {
        Cow::Owned(scrub(value))
    } else {
        Cow::Borrowed(value)
    }
}

/// Strip NUL, trim, drop empties, clamp.
pub fn clean_text(input: Option<&str>, max: usize) -> Option<String> {
    let stripped = strip_nul(input?);
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(clamp_chars(trimmed, max))
    }
}

/// Canonical keyword form: NUL stripped, trimmed, inner whitespace collapsed,
/// lowercased, clamped.
pub fn normalize_keyword(input: &str) -> String {
    let folded = strip_nul(input)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    clamp_chars(&folded, limits::KEYWORD_MAX)
}

// ── Jobs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Ready,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Ready => "READY",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "READY" => Ok(JobStatus::Ready),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(ParseEnumError {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

/// What a single engine callback says about its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallbackOutcome {
    InProgress,
    Succeeded,
    Failed,
}

/// Maps the loosely typed `status`/`finalize` pair of a callback to an outcome.
///
/// Total over all inputs: explicit `FAILED` wins, then `READY` or `finalize`,
/// and everything else (including `QUEUED`, `RUNNING` and garbage) is in progress.
pub fn resolve_outcome(status: Option<&str>, finalize: bool) -> CallbackOutcome {
    let status = status.map(|s| s.trim().to_ascii_uppercase()).unwrap_or_default();
    if status == "FAILED" {
        CallbackOutcome::Failed
    } else if status == "READY" || finalize {
        CallbackOutcome::Succeeded
    } else {
        CallbackOutcome::InProgress
    }
}

/// Who moved a job to FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureOrigin {
    /// The engine reported the failure in a callback.
    Engine,
    /// The engine could not be reached when the job was handed off.
    Dispatch,
    /// The owner cancelled the job.
    Cancelled,
}

impl FailureOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureOrigin::Engine => "ENGINE",
            FailureOrigin::Dispatch => "DISPATCH",
            FailureOrigin::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureOrigin {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENGINE" => Ok(FailureOrigin::Engine),
            "DISPATCH" => Ok(FailureOrigin::Dispatch),
            "CANCELLED" => Ok(FailureOrigin::Cancelled),
            other => Err(ParseEnumError {
                kind: "failure origin",
                value: other.to_string(),
            }),
        }
    }
}

/// Column changes produced by applying one callback outcome to a job.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: JobStatus,
    pub error: Option<String>,
    /// Set when `status` is FAILED, cleared otherwise.
    pub failure_origin: Option<FailureOrigin>,
    /// `started_at = COALESCE(started_at, now)`
    pub mark_started: bool,
    /// `completed_at = now`
    pub mark_completed: bool,
}

/// Returns `None` when the callback must be ignored.
///
/// Open jobs accept every outcome. A terminal job never goes back to RUNNING
/// and only accepts a re-delivery of the outcome it already holds. Two cases
/// refine that: a cancelled job accepts nothing, and a job that failed at
/// dispatch still accepts the engine's own verdict.
pub fn plan_status_change(
    current: JobStatus,
    failure: Option<FailureOrigin>,
    outcome: CallbackOutcome,
    error: Option<&str>,
) -> Option<StatusChange> {
    let accepted = match (current, outcome) {
        (JobStatus::Queued | JobStatus::Running, _) => true,
        (_, CallbackOutcome::InProgress) => false,
        (JobStatus::Ready, CallbackOutcome::Succeeded) => true,
        (JobStatus::Ready, CallbackOutcome::Failed) => false,
        (JobStatus::Failed, _) => match failure {
            Some(FailureOrigin::Cancelled) => false,
            Some(FailureOrigin::Dispatch) => true,
            Some(FailureOrigin::Engine) | None => outcome == CallbackOutcome::Failed,
        },
    };
    if !accepted {
        return None;
    }

    Some(match outcome {
        CallbackOutcome::InProgress => StatusChange {
            status: JobStatus::Running,
            error: None,
            failure_origin: None,
            mark_started: true,
            mark_completed: false,
        },
        CallbackOutcome::Succeeded => StatusChange {
            status: JobStatus::Ready,
            error: None,
            failure_origin: None,
            mark_started: true,
            mark_completed: true,
        },
        CallbackOutcome::Failed => StatusChange {
            status: JobStatus::Failed,
            error: Some(
                clean_text(error, limits::JOB_ERROR_MAX).unwrap_or_else(|| "failed".to_string()),
            ),
            failure_origin: Some(FailureOrigin::Engine),
            mark_started: false,
            mark_completed: true,
        },
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub user_id: String,
    pub topic: String,
    pub country: String,
    pub region: String,
    pub location: String,
    pub cluster_id: Option<String>,
    pub status: JobStatus,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_origin: Option<FailureOrigin>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<JsonValue>,
}

/// Insert (or explicit re-run) request for a job row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: String,
    pub user_id: String,
    pub topic: String,
    pub country: String,
    pub region: String,
    pub location: String,
    pub cluster_id: Option<String>,
}

pub fn generate_job_id() -> String {
    format!("kw_{}", Uuid::new_v4().simple())
}

/// Client supplied ids double as correlation keys in engine logs and URLs.
pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= limits::JOB_ID_MAX
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `GLOBAL`, `US` (whole country) or `US:CA` (country + region).
pub fn location_string(country: &str, region: &str) -> String {
    let country = country.trim().to_ascii_uppercase();
    if country.is_empty() || country == "GLOBAL" {
        return "GLOBAL".to_string();
    }
    let region = region.trim().to_ascii_uppercase();
    if region.is_empty() || region == "ALL" {
        country
    } else {
        format!("{country}:{region}")
    }
}

/// Inverse of [`location_string`]: `(country, region)`.
pub fn split_location(location: &str) -> (String, String) {
    match location.split_once(':') {
        Some((country, region)) => (country.to_string(), region.to_string()),
        None => (location.to_string(), "ALL".to_string()),
    }
}

// ── Ingested children ───────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsMeta {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub published_time: Option<String>,
    pub source_name: Option<String>,
    pub image_url: Option<String>,
}

impl NewsMeta {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.summary.is_none()
            && self.published_time.is_none()
            && self.source_name.is_none()
            && self.image_url.is_none()
    }
}

/// A normalized suggestion; `news_meta` is index-aligned with `news_urls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionDraft {
    pub keyword: String,
    pub score: Option<f64>,
    pub source_url: Option<String>,
    pub news_urls: Vec<String>,
    pub news_meta: Vec<Option<NewsMeta>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub id: Uuid,
    pub job_id: String,
    pub position: i32,
    pub keyword: String,
    pub score: Option<f64>,
    pub source_url: Option<String>,
    pub news_urls: Vec<String>,
    pub news_meta: Vec<Option<NewsMeta>>,
    pub created_at: DateTime<Utc>,
}

impl Suggestion {
    pub fn from_draft(job_id: &str, position: usize, draft: SuggestionDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.to_string(),
            position: position as i32,
            keyword: draft.keyword,
            score: draft.score,
            source_url: draft.source_url,
            news_urls: draft.news_urls,
            news_meta: draft.news_meta,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchArticle {
    pub id: String,
    pub job_id: String,
    pub url: String,
    pub title: Option<String>,
    pub source_name: Option<String>,
    pub published_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    pub snippet: Option<String>,
    pub rank: Option<i32>,
    pub word_count: Option<i32>,
    pub relevance_score: Option<f64>,
}

/// Deterministic id for articles delivered without one, stable across re-deliveries.
pub fn derived_article_id(job_id: &str, url: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{job_id}:{url}").as_bytes()).to_string()
}

/// Preview order: rank ascending with nulls last, then newest first with nulls last.
pub fn preview_order(a: &ResearchArticle, b: &ResearchArticle) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let by_rank = match (a.rank, b.rank) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_rank.then_with(|| match (a.published_time, b.published_time) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicTier {
    Top,
    Rising,
    All,
}

impl TopicTier {
    pub fn as_str(self) -> &'static str {
        match self {
            TopicTier::Top => "top",
            TopicTier::Rising => "rising",
            TopicTier::All => "all",
        }
    }

    /// Unknown non-empty tiers fall into `all`; empty tiers are rejected.
    pub fn parse_lenient(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "" => None,
            "top" => Some(TopicTier::Top),
            "rising" => Some(TopicTier::Rising),
            _ => Some(TopicTier::All),
        }
    }
}

impl FromStr for TopicTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "top" => Ok(TopicTier::Top),
            "rising" => Ok(TopicTier::Rising),
            "all" => Ok(TopicTier::All),
            other => Err(ParseEnumError {
                kind: "topic tier",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSuggestion {
    pub job_id: String,
    pub label: String,
    pub tier: TopicTier,
}

/// Canonical form of one engine callback, whatever shape it arrived in.
///
/// `None` child lists mean "not part of this callback" and leave stored rows alone;
/// `Some(vec![])` replaces them with nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCallback {
    pub job_id: String,
    pub user_id: Option<String>,
    pub topic: Option<String>,
    pub location: Option<String>,
    pub outcome: CallbackOutcome,
    pub error: Option<String>,
    pub suggestions: Option<Vec<SuggestionDraft>>,
    pub articles: Option<Vec<ResearchArticle>>,
    pub topics: Option<Vec<TopicSuggestion>>,
    pub raw_payload: Option<JsonValue>,
}

impl NormalizedCallback {
    pub fn saved_count(&self) -> usize {
        self.suggestions.as_ref().map_or(0, Vec::len)
            + self.articles.as_ref().map_or(0, Vec::len)
            + self.topics.as_ref().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReport {
    pub job: JobRecord,
    pub saved: usize,
    pub ignored: bool,
    pub created_job: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChildCounts {
    pub suggestions: i64,
    pub articles: i64,
    pub topics: i64,
}

// ── Clusters and posts ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Draft,
    Ready,
}

impl ClusterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::Draft => "DRAFT",
            ClusterStatus::Ready => "READY",
        }
    }
}

impl FromStr for ClusterStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(ClusterStatus::Draft),
            "READY" => Ok(ClusterStatus::Ready),
            other => Err(ParseEnumError {
                kind: "cluster status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub niche: String,
    pub status: ClusterStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostType {
    Pillar,
    Supporting,
}

impl PostType {
    pub fn as_str(self) -> &'static str {
        match self {
            PostType::Pillar => "PILLAR",
            PostType::Supporting => "SUPPORTING",
        }
    }
}

impl FromStr for PostType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PILLAR" => Ok(PostType::Pillar),
            "SUPPORTING" => Ok(PostType::Supporting),
            _ => Err(ParseEnumError {
                kind: "post type",
                value: s.to_string(),
            }),
        }
    }
}

/// Shared by outline and draft progress columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    None,
    Pending,
    Ready,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::None => "NONE",
            StageStatus::Pending => "PENDING",
            StageStatus::Ready => "READY",
        }
    }
}

impl FromStr for StageStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(StageStatus::None),
            "PENDING" => Ok(StageStatus::Pending),
            "READY" => Ok(StageStatus::Ready),
            other => Err(ParseEnumError {
                kind: "stage status",
                value: other.to_string(),
            }),
        }
    }
}

/// Post lifecycle, ordered: a post only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostStatus {
    Draft,
    Ready,
    Published,
}

impl PostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PostStatus::Draft => "DRAFT",
            PostStatus::Ready => "READY",
            PostStatus::Published => "PUBLISHED",
        }
    }

    pub fn advance(self, requested: PostStatus) -> PostStatus {
        self.max(requested)
    }
}

impl FromStr for PostStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(PostStatus::Draft),
            "READY" => Ok(PostStatus::Ready),
            "PUBLISHED" => Ok(PostStatus::Published),
            _ => Err(ParseEnumError {
                kind: "post status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalLink {
    pub slug: String,
    #[serde(default = "default_anchor_text")]
    pub anchor_text: String,
}

fn default_anchor_text() -> String {
    "Read more".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineSection {
    pub heading: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub suggested_internal_links: Vec<InternalLink>,
    #[serde(default)]
    pub citation_placeholders: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outline {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h1: Option<String>,
    pub sections: Vec<OutlineSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    pub id: String,
    pub cluster_id: String,
    pub slug: String,
    pub title: String,
    pub post_type: PostType,
    pub parent_id: Option<String>,
    pub parent_slug: Option<String>,
    pub outline: Option<Outline>,
    pub outline_status: StageStatus,
    pub content: String,
    pub draft_status: StageStatus,
    pub status: PostStatus,
    pub meta: JsonValue,
    pub citations: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outline delivery after validation and parent resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlineUpsert {
    pub cluster_id: String,
    pub slug: String,
    pub title: String,
    pub post_type: PostType,
    pub parent_id: Option<String>,
    pub parent_slug: Option<String>,
    pub outline: Outline,
    pub meta: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftUpdate {
    pub slug: String,
    pub title: Option<String>,
    pub content: String,
    pub status: PostStatus,
    pub meta: JsonValue,
    pub citations: Vec<String>,
}

/// Cluster that single posts land in when the publisher names none.
pub const UNCLUSTERED: &str = "Unclustered";

/// Single post pushed by an external publisher, outside the outline pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PostPublish {
    pub user_id: String,
    pub cluster_title: String,
    pub cluster_niche: String,
    pub slug: String,
    pub title: String,
    /// `None` keeps stored content; new posts start empty.
    pub content: Option<String>,
    pub status: PostStatus,
    /// Delivery id; a replay of a recorded id changes nothing.
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOutcome {
    pub cluster_id: String,
    /// Absent on replays.
    pub post: Option<PostRecord>,
    pub replayed: bool,
}

// ── Usage and billing cache ─────────────────────────────────────

/// Usage metric counted against the plan's monthly blog allowance.
pub const BLOGS_METRIC: &str = "blogs";

/// Monthly usage bucket, always computed in UTC.
pub fn period_key(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

pub fn is_valid_metric(metric: &str) -> bool {
    !metric.is_empty()
        && metric.len() <= limits::METRIC_MAX
        && metric
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub user_id: String,
    pub metric: String,
    pub period_key: String,
    pub amount: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Starter,
    Pro,
    Agency,
    Byok,
}

impl Plan {
    pub fn limits(self) -> PlanLimits {
        match self {
            Plan::Starter => PlanLimits { blogs_per_month: 8, clusters: 0, seats: 1 },
            Plan::Pro => PlanLimits { blogs_per_month: 30, clusters: 10, seats: 3 },
            Plan::Agency => PlanLimits { blogs_per_month: 120, clusters: 30, seats: 10 },
            Plan::Byok => PlanLimits { blogs_per_month: 9999, clusters: 9999, seats: 20 },
        }
    }
}

impl FromStr for Plan {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "starter" => Ok(Plan::Starter),
            "pro" => Ok(Plan::Pro),
            "agency" => Ok(Plan::Agency),
            "byok" => Ok(Plan::Byok),
            _ => Err(ParseEnumError {
                kind: "plan",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    pub blogs_per_month: i64,
    pub clusters: i64,
    pub seats: i64,
}

/// Read cache of the billing provider's subscription; the provider owns the truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub user_id: String,
    pub plan: String,
    pub status: String,
    pub current_period_end: Option<DateTime<Utc>>,
    pub price_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }

    /// Inactive or unknown plans fall back to the starter allowance.
    pub fn effective_plan(&self) -> Plan {
        if !self.is_active() {
            return Plan::Starter;
        }
        self.plan.parse().unwrap_or(Plan::Starter)
    }
}
