use std::collections::{HashMap, HashSet};

use bcp_core::{JobStatus, ResearchArticle, Suggestion, TopicSuggestion, TopicTier};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewArticle {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
    pub source_name: Option<String>,
    pub published_time: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub rank: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopicGroups {
    pub top: Vec<String>,
    pub rising: Vec<String>,
    pub all: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchPreview {
    pub job_id: String,
    pub status: JobStatus,
    pub articles: Vec<PreviewArticle>,
    pub supporting_topics: TopicGroups,
}

/// Hostname without a leading `www.`; `None` for unparseable urls.
pub fn host_label(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let host = parsed.host_str()?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    (!host.is_empty()).then(|| host.to_string())
}

/// First non-empty news summary per url across the job's suggestions.
pub fn summaries_by_url(suggestions: &[Suggestion]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for suggestion in suggestions {
        for (url, meta) in suggestion.news_urls.iter().zip(&suggestion.news_meta) {
            let summary = meta
                .as_ref()
                .and_then(|m| m.summary.as_deref())
                .map(str::trim)
                .filter(|s| !s.is_empty());
            if let Some(summary) = summary {
                out.entry(url.clone()).or_insert_with(|| summary.to_string());
            }
        }
    }
    out
}

/// `articles` must already be in preview order; topics in label order.
pub fn build_preview(
    job_id: &str,
    status: JobStatus,
    articles: Vec<ResearchArticle>,
    suggestions: &[Suggestion],
    topics: &[TopicSuggestion],
) -> ResearchPreview {
    let summaries = summaries_by_url(suggestions);
    let articles = articles
        .into_iter()
        .map(|article| {
            let source_name = match article.source_name {
                Some(name) if !name.eq_ignore_ascii_case("unknown_source") => Some(name),
                _ => host_label(&article.url),
            };
            let snippet = article
                .snippet
                .filter(|s| !s.trim().is_empty())
                .or_else(|| summaries.get(&article.url).cloned());
            PreviewArticle {
                id: article.id,
                url: article.url,
                title: article.title,
                source_name,
                published_time: article.published_time,
                snippet,
                rank: article.rank,
            }
        })
        .collect();

    ResearchPreview {
        job_id: job_id.to_string(),
        status,
        articles,
        supporting_topics: group_topics(topics),
    }
}

/// A label shows up once, under the tier of its first occurrence.
fn group_topics(topics: &[TopicSuggestion]) -> TopicGroups {
    let mut groups = TopicGroups::default();
    let mut seen = HashSet::new();
    for topic in topics {
        let label = topic.label.trim();
        if label.is_empty() || !seen.insert(label.to_lowercase()) {
            continue;
        }
        let bucket = match topic.tier {
            TopicTier::Top => &mut groups.top,
            TopicTier::Rising => &mut groups.rising,
            TopicTier::All => &mut groups.all,
        };
        bucket.push(label.to_string());
    }
    groups
}
