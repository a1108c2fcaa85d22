//! Engine payload shape adapters + the tolerant callback normalizer.
//!
//! The automation engine has shipped several payload shapes over time. Each
//! [`ShapeAdapter`] recognises one of them; [`CallbackNormalizer`] tries them in a
//! fixed priority order and turns the first match into a [`NormalizedCallback`].

use std::collections::HashSet;

use bcp_core::limits::{
    ARTICLE_ID_MAX, ARTICLE_RAW_TEXT_MAX, ARTICLE_SNIPPET_MAX, ARTICLE_TITLE_MAX, IMAGE_URL_MAX,
    JOB_ERROR_MAX, LOCATION_MAX, META_TITLE_MAX, NEWS_URLS_PER_SUGGESTION, PUBLISHED_TIME_MAX,
    RAW_PAYLOAD_MAX_BYTES, SOURCE_NAME_MAX, SUGGESTIONS_PER_BATCH, SUMMARY_MAX, TOPIC_LABEL_MAX,
    TOPIC_MAX, URL_MAX,
};
use bcp_core::{
    clean_text, derived_article_id, is_valid_job_id, json_without_nul, location_string,
    normalize_keyword, resolve_outcome, CallbackOutcome, DraftUpdate, NewsMeta, NormalizedCallback, Outline,
    PostPublish, PostStatus, PostType, ResearchArticle, SuggestionDraft, TopicSuggestion,
    TopicTier, UNCLUSTERED,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "bcp-adapters";

const JOB_ID_KEYS: [&str; 4] = ["jobId", "requestId", "job_id", "request_id"];
const USER_ID_KEYS: [&str; 3] = ["userId", "user_id", "clerkId"];
const META_KEYS: [&str; 6] = ["title", "summary", "description", "publishedTime", "sourceName", "imageUrl"];
const MAX_UNWRAP_DEPTH: usize = 2;
const USER_ID_MAX: usize = 128;
const SLUG_MAX: usize = 200;
const POST_TITLE_MAX: usize = 300;
const EVENT_ID_MAX: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("missing jobId")]
    MissingJobId,
    #[error("invalid jobId")]
    InvalidJobId,
    #[error("payload nested too deeply")]
    TooDeep,
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    Envelope,
    Wrapped,
    Flat,
}

pub enum ShapeMatch<'a> {
    /// The payload is a container; run the adapters again on the inner value.
    Unwrap(&'a JsonValue),
    Body(ShapeBody<'a>),
}

pub struct ShapeBody<'a> {
    pub fields: &'a Map<String, JsonValue>,
    pub forced_outcome: Option<CallbackOutcome>,
    /// What gets cached on the job when this callback completes it.
    pub cached_payload: Option<&'a JsonValue>,
}

pub trait ShapeAdapter: Send + Sync {
    fn shape(&self) -> PayloadShape;
    fn try_match<'a>(&self, payload: &'a JsonValue) -> Option<ShapeMatch<'a>>;
}

/// `{uiPayload, dbPayload}`: the engine's final delivery. It completes the job
/// unless `dbPayload.status` says FAILED.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeAdapter;

/// `{body: {...}}`, `{data: {...}}` or `[ {...} ]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WrappedAdapter;

#[derive(Debug, Clone, Copy, Default)]
pub struct FlatAdapter;

impl ShapeAdapter for EnvelopeAdapter {
    fn shape(&self) -> PayloadShape {
        PayloadShape::Envelope
    }

    fn try_match<'a>(&self, payload: &'a JsonValue) -> Option<ShapeMatch<'a>> {
        let obj = payload.as_object()?;
        let ui = obj.get("uiPayload").filter(|v| !v.is_null())?;
        let db = obj.get("dbPayload")?.as_object()?;
        let outcome = match resolve_outcome(db.get("status").and_then(JsonValue::as_str), false) {
            CallbackOutcome::Failed => CallbackOutcome::Failed,
            _ => CallbackOutcome::Succeeded,
        };
        Some(ShapeMatch::Body(ShapeBody {
            fields: db,
            forced_outcome: Some(outcome),
            cached_payload: Some(ui),
        }))
    }
}

impl ShapeAdapter for WrappedAdapter {
    fn shape(&self) -> PayloadShape {
        PayloadShape::Wrapped
    }

    fn try_match<'a>(&self, payload: &'a JsonValue) -> Option<ShapeMatch<'a>> {
        match payload {
            JsonValue::Array(items) => items
                .iter()
                .find(|item| item.is_object())
                .map(ShapeMatch::Unwrap),
            JsonValue::Object(obj) => {
                if first_field(obj, &JOB_ID_KEYS).is_some() {
                    return None;
                }
                ["body", "data"]
                    .iter()
                    .filter_map(|key| obj.get(*key))
                    .find(|inner| inner.is_object() || inner.is_array())
                    .map(ShapeMatch::Unwrap)
            }
            _ => None,
        }
    }
}

impl ShapeAdapter for FlatAdapter {
    fn shape(&self) -> PayloadShape {
        PayloadShape::Flat
    }

    fn try_match<'a>(&self, payload: &'a JsonValue) -> Option<ShapeMatch<'a>> {
        let fields = payload.as_object()?;
        Some(ShapeMatch::Body(ShapeBody {
            fields,
            forced_outcome: None,
            cached_payload: Some(payload),
        }))
    }
}

pub fn default_adapters() -> Vec<Box<dyn ShapeAdapter>> {
    vec![
        Box::new(EnvelopeAdapter),
        Box::new(WrappedAdapter),
        Box::new(FlatAdapter),
    ]
}

pub struct CallbackNormalizer {
    adapters: Vec<Box<dyn ShapeAdapter>>,
}

impl Default for CallbackNormalizer {
    fn default() -> Self {
        Self::new(default_adapters())
    }
}

impl CallbackNormalizer {
    pub fn new(adapters: Vec<Box<dyn ShapeAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn parse_slice(&self, bytes: &[u8]) -> Result<NormalizedCallback, AdapterError> {
        let payload: JsonValue =
            serde_json::from_slice(bytes).map_err(|e| AdapterError::InvalidJson(e.to_string()))?;
        self.normalize(&payload)
    }

    pub fn normalize(&self, payload: &JsonValue) -> Result<NormalizedCallback, AdapterError> {
        let payload = json_without_nul(payload);
        let mut current: &JsonValue = &payload;
        for _ in 0..=MAX_UNWRAP_DEPTH {
            let matched = self
                .adapters
                .iter()
                .find_map(|adapter| adapter.try_match(current).map(|m| (adapter.shape(), m)));
            match matched {
                Some((_, ShapeMatch::Unwrap(inner))) => current = inner,
                Some((shape, ShapeMatch::Body(body))) => {
                    tracing::debug!(?shape, "callback payload shape matched");
                    return build_callback(body);
                }
                None => return Err(AdapterError::NotAnObject),
            }
        }
        Err(AdapterError::TooDeep)
    }
}

fn build_callback(body: ShapeBody<'_>) -> Result<NormalizedCallback, AdapterError> {
    let fields = body.fields;
    let job_id = first_field(fields, &JOB_ID_KEYS)
        .and_then(string_of)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or(AdapterError::MissingJobId)?;
    if !is_valid_job_id(&job_id) {
        return Err(AdapterError::InvalidJobId);
    }

    let outcome = body.forced_outcome.unwrap_or_else(|| {
        let status = fields.get("status").and_then(JsonValue::as_str);
        resolve_outcome(status, truthy(fields.get("finalize")))
    });
    let error = match outcome {
        CallbackOutcome::Failed => fields.get("error").and_then(error_text),
        _ => None,
    };

    let raw_payload = match outcome {
        CallbackOutcome::Succeeded => body.cached_payload.and_then(bounded_payload),
        _ => None,
    };

    Ok(NormalizedCallback {
        user_id: first_field(fields, &USER_ID_KEYS)
            .and_then(string_of)
            .and_then(|u| clean_text(Some(&u), USER_ID_MAX)),
        topic: first_field(fields, &["topic", "niche"])
            .and_then(JsonValue::as_str)
            .and_then(|t| clean_text(Some(t), TOPIC_MAX)),
        location: payload_location(fields),
        outcome,
        error,
        suggestions: normalize_suggestions(fields),
        articles: first_field(fields, &["articles", "research_articles"])
            .map(|v| normalize_articles(&job_id, v)),
        topics: normalize_topics(&job_id, fields),
        raw_payload,
        job_id,
    })
}

// ── Field helpers ───────────────────────────────────────────────

/// First present, non-null value among `keys`.
fn first_field<'a>(fields: &'a Map<String, JsonValue>, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find(|v| !v.is_null())
}

fn string_of(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn str_field(fields: &Map<String, JsonValue>, keys: &[&str], max: usize) -> Option<String> {
    first_field(fields, keys)
        .and_then(JsonValue::as_str)
        .and_then(|s| clean_text(Some(s), max))
}

fn truthy(value: Option<&JsonValue>) -> bool {
    match value {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn error_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Object(obj) => obj
            .get("message")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        JsonValue::Null => return None,
        other => other.to_string(),
    };
    clean_text(Some(&text), JOB_ERROR_MAX)
}

fn coerce_f64(value: &JsonValue) -> Option<f64> {
    let n = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn coerce_i32(value: &JsonValue) -> Option<i32> {
    coerce_f64(value)
        .filter(|n| n.fract() == 0.0 && *n >= i32::MIN as f64 && *n <= i32::MAX as f64)
        .map(|n| n as i32)
}

fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    if let JsonValue::Number(n) = value {
        return n.as_i64().and_then(DateTime::from_timestamp_millis);
    }
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn bounded_payload(payload: &JsonValue) -> Option<JsonValue> {
    let size = serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(usize::MAX);
    if size > RAW_PAYLOAD_MAX_BYTES {
        tracing::warn!(size, limit = RAW_PAYLOAD_MAX_BYTES, "raw payload too large to cache");
        return None;
    }
    Some(payload.clone())
}

fn payload_location(fields: &Map<String, JsonValue>) -> Option<String> {
    match fields.get("location") {
        Some(JsonValue::String(s)) => clean_text(Some(s), LOCATION_MAX),
        Some(JsonValue::Object(loc)) => {
            let country = loc.get("country").and_then(JsonValue::as_str).unwrap_or("");
            let region = first_field(loc, &["state", "region"])
                .and_then(JsonValue::as_str)
                .unwrap_or("");
            Some(location_string(country, region))
        }
        _ => fields.get("country").and_then(JsonValue::as_str).map(|country| {
            let region = fields.get("region").and_then(JsonValue::as_str).unwrap_or("");
            location_string(country, region)
        }),
    }
}

// ── Suggestions ─────────────────────────────────────────────────

fn normalize_suggestions(fields: &Map<String, JsonValue>) -> Option<Vec<SuggestionDraft>> {
    let candidates: Vec<Option<SuggestionDraft>> =
        if let Some(list) = first_field(fields, &["suggestions", "keywords"]) {
            match list {
                JsonValue::Array(items) => items.iter().map(suggestion_from_value).collect(),
                other => vec![suggestion_from_value(other)],
            }
        } else if first_field(fields, &["keyword"]).is_some() {
            vec![suggestion_from_fields(fields)]
        } else {
            return None;
        };

    let mut seen = HashSet::new();
    Some(
        candidates
            .into_iter()
            .flatten()
            .filter(|draft| seen.insert(draft.keyword.clone()))
            .take(SUGGESTIONS_PER_BATCH)
            .collect(),
    )
}

fn suggestion_from_value(value: &JsonValue) -> Option<SuggestionDraft> {
    match value {
        JsonValue::String(keyword) => {
            let keyword = normalize_keyword(keyword);
            (!keyword.is_empty()).then(|| SuggestionDraft {
                keyword,
                score: None,
                source_url: None,
                news_urls: Vec::new(),
                news_meta: Vec::new(),
            })
        }
        JsonValue::Object(fields) => suggestion_from_fields(fields),
        _ => None,
    }
}

fn suggestion_from_fields(fields: &Map<String, JsonValue>) -> Option<SuggestionDraft> {
    let keyword = fields
        .get("keyword")
        .and_then(string_of)
        .map(|k| normalize_keyword(&k))
        .filter(|k| !k.is_empty())?;

    let indexed_urls = collect_news_urls(first_field(fields, &["newsUrls", "news_urls"]));
    let news_meta = align_news_meta(first_field(fields, &["newsMeta", "news_meta"]), &indexed_urls);
    let news_urls: Vec<String> = indexed_urls.into_iter().map(|(_, url)| url).collect();
    let source_url =
        str_field(fields, &["sourceUrl", "source_url"], URL_MAX).or_else(|| news_urls.first().cloned());

    Some(SuggestionDraft {
        keyword,
        score: fields.get("score").and_then(coerce_f64),
        source_url,
        news_urls,
        news_meta,
    })
}

/// Cleaned, deduplicated urls paired with their index in the raw list.
fn collect_news_urls(value: Option<&JsonValue>) -> Vec<(usize, String)> {
    let raw: Vec<Option<String>> = match value {
        Some(JsonValue::Array(items)) => items.iter().map(|v| v.as_str().map(str::to_string)).collect(),
        Some(JsonValue::String(joined)) => joined.split(',').map(|p| Some(p.to_string())).collect(),
        _ => Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (idx, url) in raw.into_iter().enumerate() {
        let Some(url) = clean_text(url.as_deref(), URL_MAX) else {
            continue;
        };
        if seen.insert(url.clone()) {
            out.push((idx, url));
            if out.len() >= NEWS_URLS_PER_SUGGESTION {
                break;
            }
        }
    }
    out
}

fn align_news_meta(meta: Option<&JsonValue>, urls: &[(usize, String)]) -> Vec<Option<NewsMeta>> {
    match meta {
        Some(JsonValue::Array(entries)) => urls
            .iter()
            .map(|(idx, _)| entries.get(*idx).and_then(news_meta_from))
            .collect(),
        // a bare meta object describes the first url
        Some(JsonValue::Object(obj)) if META_KEYS.iter().any(|k| obj.contains_key(*k)) => urls
            .iter()
            .enumerate()
            .map(|(pos, _)| if pos == 0 { news_meta_from_fields(obj) } else { None })
            .collect(),
        Some(JsonValue::Object(by_url)) => urls
            .iter()
            .map(|(_, url)| by_url.get(url).and_then(news_meta_from))
            .collect(),
        _ => vec![None; urls.len()],
    }
}

fn news_meta_from(value: &JsonValue) -> Option<NewsMeta> {
    value.as_object().and_then(news_meta_from_fields)
}

fn news_meta_from_fields(fields: &Map<String, JsonValue>) -> Option<NewsMeta> {
    let meta = NewsMeta {
        title: str_field(fields, &["title"], META_TITLE_MAX),
        summary: str_field(fields, &["summary", "description"], SUMMARY_MAX),
        published_time: str_field(fields, &["publishedTime", "published_time"], PUBLISHED_TIME_MAX),
        source_name: str_field(fields, &["sourceName", "source_name"], SOURCE_NAME_MAX),
        image_url: str_field(fields, &["imageUrl", "image_url"], IMAGE_URL_MAX),
    };
    (!meta.is_empty()).then_some(meta)
}

// ── Articles ────────────────────────────────────────────────────

fn normalize_articles(job_id: &str, value: &JsonValue) -> Vec<ResearchArticle> {
    let items: Vec<&JsonValue> = match value {
        JsonValue::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut seen_urls = HashSet::new();
    let mut seen_ids = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let Some(fields) = item.as_object() else {
            continue;
        };
        let Some(url) = str_field(fields, &["url"], URL_MAX) else {
            continue;
        };
        let id = fields
            .get("id")
            .and_then(string_of)
            .and_then(|id| clean_text(Some(&id), ARTICLE_ID_MAX))
            .unwrap_or_else(|| derived_article_id(job_id, &url));
        if seen_urls.contains(&url) || seen_ids.contains(&id) {
            continue;
        }
        seen_urls.insert(url.clone());
        seen_ids.insert(id.clone());

        out.push(ResearchArticle {
            id,
            job_id: job_id.to_string(),
            url,
            title: str_field(fields, &["title"], ARTICLE_TITLE_MAX),
            source_name: str_field(fields, &["source_name", "sourceName"], SOURCE_NAME_MAX),
            published_time: first_field(fields, &["published_time", "publishedTime"])
                .and_then(parse_timestamp),
            raw_text: str_field(fields, &["raw_text", "rawText"], ARTICLE_RAW_TEXT_MAX),
            snippet: str_field(fields, &["snippet"], ARTICLE_SNIPPET_MAX),
            rank: fields.get("rank").and_then(coerce_i32),
            word_count: first_field(fields, &["word_count", "wordCount"]).and_then(coerce_i32),
            relevance_score: first_field(fields, &["relevance_score", "relevanceScore"])
                .and_then(coerce_f64),
        });
    }
    out
}

// ── Topic suggestions ───────────────────────────────────────────

fn normalize_topics(job_id: &str, fields: &Map<String, JsonValue>) -> Option<Vec<TopicSuggestion>> {
    let listed = first_field(fields, &["topic_suggestions", "topicSuggestions"]);
    let grouped = first_field(fields, &["supportingTopics", "supporting_topics"]);
    if listed.is_none() && grouped.is_none() {
        return None;
    }

    let mut raw: Vec<(Option<String>, String)> = Vec::new();
    match listed {
        Some(JsonValue::Array(items)) => {
            for item in items.iter().filter_map(JsonValue::as_object) {
                let label = item.get("label").and_then(string_of);
                let tier = item.get("tier").and_then(JsonValue::as_str).unwrap_or("");
                raw.push((label, tier.to_string()));
            }
        }
        Some(JsonValue::Object(groups)) => collect_grouped_topics(groups, &mut raw),
        _ => {}
    }
    if let Some(JsonValue::Object(groups)) = grouped {
        collect_grouped_topics(groups, &mut raw);
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (label, tier) in raw {
        let Some(label) = clean_text(label.as_deref(), TOPIC_LABEL_MAX) else {
            continue;
        };
        let Some(tier) = TopicTier::parse_lenient(&tier) else {
            continue;
        };
        if seen.insert((label.to_lowercase(), tier)) {
            out.push(TopicSuggestion {
                job_id: job_id.to_string(),
                label,
                tier,
            });
        }
    }
    Some(out)
}

fn collect_grouped_topics(groups: &Map<String, JsonValue>, out: &mut Vec<(Option<String>, String)>) {
    for (tier, labels) in groups {
        let Some(labels) = labels.as_array() else {
            continue;
        };
        for label in labels {
            let label = match label {
                JsonValue::Object(obj) => obj.get("label").and_then(string_of),
                other => string_of(other),
            };
            out.push((label, tier.clone()));
        }
    }
}

// ── Outlines and drafts ─────────────────────────────────────────

/// Where an incoming outline should be attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterRef {
    Id(String),
    Named {
        user_id: String,
        title: String,
        niche: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutlinePayload {
    pub cluster: ClusterRef,
    pub slug: String,
    pub title: String,
    pub post_type: PostType,
    pub parent_slug: Option<String>,
    pub outline: Outline,
    pub meta: JsonValue,
}

#[derive(Debug, Deserialize)]
struct ClusterIn {
    title: String,
    #[serde(default)]
    niche: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutlinePostIn {
    slug: String,
    title: String,
    #[serde(rename = "type", default)]
    post_type: Option<String>,
    outline: Outline,
    #[serde(default)]
    metadata: Option<JsonValue>,
    #[serde(default, alias = "parentSlug")]
    parent_slug: Option<String>,
    #[serde(rename = "clusterId", default)]
    cluster_id: Option<String>,
    #[serde(rename = "userId", default)]
    user_id: Option<String>,
    #[serde(default)]
    cluster: Option<ClusterIn>,
}

/// Accepts `{clusterId?, userId?, cluster?, post: {...}}` or the flat post object.
pub fn parse_outline(payload: &JsonValue) -> Result<OutlinePayload, AdapterError> {
    let payload = json_without_nul(payload);
    let payload: &JsonValue = &payload;
    let obj = payload.as_object().ok_or(AdapterError::NotAnObject)?;
    let (post_value, outer) = match obj.get("post") {
        Some(post) if post.is_object() => (post, Some(obj)),
        _ => (payload, None),
    };
    let post = OutlinePostIn::deserialize(post_value)
        .map_err(|e| AdapterError::Message(format!("invalid outline payload: {e}")))?;

    let outer_str = |key: &str| {
        outer
            .and_then(|o| o.get(key))
            .and_then(JsonValue::as_str)
            .and_then(|s| clean_text(Some(s), SLUG_MAX))
    };

    let slug = clean_text(Some(&post.slug), SLUG_MAX)
        .ok_or_else(|| AdapterError::Message("slug is required".into()))?;
    let title = clean_text(Some(&post.title), POST_TITLE_MAX)
        .ok_or_else(|| AdapterError::Message("title is required".into()))?;
    if post.outline.sections.iter().any(|s| s.heading.trim().is_empty()) {
        return Err(AdapterError::Message("every outline section needs a heading".into()));
    }
    let post_type = match post.post_type.as_deref() {
        None => PostType::Supporting,
        Some(raw) => raw
            .parse::<PostType>()
            .map_err(|e| AdapterError::Message(e.to_string()))?,
    };

    let cluster_id = outer_str("clusterId").or_else(|| clean_text(post.cluster_id.as_deref(), SLUG_MAX));
    let cluster = match cluster_id {
        Some(id) => ClusterRef::Id(id),
        None => {
            let user_id = outer_str("userId").or_else(|| clean_text(post.user_id.as_deref(), USER_ID_MAX));
            let named = outer
                .and_then(|o| o.get("cluster"))
                .map(|c| ClusterIn::deserialize(c).map_err(|e| AdapterError::Message(e.to_string())))
                .transpose()?
                .or(post.cluster);
            match (user_id, named) {
                (Some(user_id), Some(c)) if !c.title.trim().is_empty() => ClusterRef::Named {
                    user_id,
                    title: c.title.trim().to_string(),
                    niche: c.niche.unwrap_or_default().trim().to_string(),
                },
                _ => {
                    return Err(AdapterError::Message(
                        "clusterId, or cluster.title with userId, is required".into(),
                    ))
                }
            }
        }
    };

    let mut meta = match post.metadata {
        Some(JsonValue::Object(map)) => map,
        _ => Map::new(),
    };
    meta.insert(
        "type".into(),
        JsonValue::String(post_type.as_str().to_ascii_lowercase()),
    );

    Ok(OutlinePayload {
        cluster,
        slug,
        title,
        post_type,
        parent_slug: clean_text(post.parent_slug.as_deref(), SLUG_MAX),
        outline: post.outline,
        meta: JsonValue::Object(meta),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftIn {
    slug: String,
    #[serde(default)]
    title: Option<String>,
    content: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    meta: Option<JsonValue>,
    #[serde(default)]
    citations: Vec<String>,
    #[serde(default)]
    seo_title: Option<String>,
    #[serde(default)]
    seo_desc: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

pub fn parse_draft(payload: &JsonValue) -> Result<DraftUpdate, AdapterError> {
    let payload = json_without_nul(payload);
    let draft = DraftIn::deserialize(payload.as_ref())
        .map_err(|e| AdapterError::Message(format!("invalid draft payload: {e}")))?;
    let slug = clean_text(Some(&draft.slug), SLUG_MAX)
        .ok_or_else(|| AdapterError::Message("slug is required".into()))?;
    let status = match draft.status.as_deref() {
        None => PostStatus::Ready,
        Some(raw) => raw
            .parse::<PostStatus>()
            .map_err(|e| AdapterError::Message(e.to_string()))?,
    };

    let mut meta = match draft.meta {
        Some(JsonValue::Object(map)) => map,
        _ => Map::new(),
    };
    for (key, explicit) in [
        ("seo_title", draft.seo_title),
        ("meta_description", draft.seo_desc),
        ("summary", draft.summary),
    ] {
        if let Some(value) = explicit.filter(|v| !v.trim().is_empty()) {
            meta.insert(key.to_string(), JsonValue::String(value));
        }
    }

    Ok(DraftUpdate {
        slug,
        title: clean_text(draft.title.as_deref(), POST_TITLE_MAX),
        content: draft.content,
        status,
        meta: JsonValue::Object(meta),
        citations: draft.citations,
    })
}

#[derive(Debug, Default, Deserialize)]
struct PublishPostIn {
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PublishClusterIn {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    niche: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishIn {
    #[serde(default, alias = "clerkUserId")]
    user_id: Option<String>,
    #[serde(default)]
    post: Option<PublishPostIn>,
    #[serde(default)]
    cluster: Option<PublishClusterIn>,
    #[serde(default)]
    event_id: Option<String>,
}

/// `{userId | clerkUserId, post: {slug, title, content?, status?}, cluster?, eventId?}`.
/// A missing cluster title lands the post in [`UNCLUSTERED`].
pub fn parse_publish(payload: &JsonValue) -> Result<PostPublish, AdapterError> {
    let payload = json_without_nul(payload);
    let publish = PublishIn::deserialize(payload.as_ref())
        .map_err(|e| AdapterError::Message(format!("invalid publish payload: {e}")))?;
    let post = publish.post.unwrap_or_default();
    let cluster = publish.cluster.unwrap_or_default();

    let user_id = clean_text(publish.user_id.as_deref(), USER_ID_MAX);
    let slug = clean_text(post.slug.as_deref(), SLUG_MAX);
    let title = clean_text(post.title.as_deref(), POST_TITLE_MAX);
    let (Some(user_id), Some(slug), Some(title)) = (user_id, slug, title) else {
        return Err(AdapterError::Message(
            "userId, post.slug and post.title are required".into(),
        ));
    };
    let status = match post.status.as_deref() {
        None => PostStatus::Draft,
        Some(raw) => raw
            .parse::<PostStatus>()
            .map_err(|e| AdapterError::Message(e.to_string()))?,
    };

    Ok(PostPublish {
        user_id,
        cluster_title: clean_text(cluster.title.as_deref(), POST_TITLE_MAX)
            .unwrap_or_else(|| UNCLUSTERED.to_string()),
        cluster_niche: clean_text(cluster.niche.as_deref(), TOPIC_MAX).unwrap_or_default(),
        slug,
        title,
        content: post.content,
        status,
        event_id: clean_text(publish.event_id.as_deref(), EVENT_ID_MAX),
    })
}
