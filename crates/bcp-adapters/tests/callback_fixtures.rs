use std::path::PathBuf;

use bcp_adapters::CallbackNormalizer;
use bcp_core::{CallbackOutcome, TopicTier};

fn fixture(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/callbacks")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[test]
fn progress_fixture_normalizes_suggestions() {
    let cb = CallbackNormalizer::default()
        .parse_slice(&fixture("n8n-progress.json"))
        .unwrap();
    assert_eq!(cb.job_id, "kw_fixture");
    assert_eq!(cb.user_id.as_deref(), Some("user_2abc"));
    assert_eq!(cb.outcome, CallbackOutcome::InProgress);

    let suggestions = cb.suggestions.unwrap();
    assert_eq!(suggestions.len(), 2);
    assert_eq!(suggestions[0].keyword, "chiropractor near me");
    assert_eq!(suggestions[0].score, Some(87.0));
    assert_eq!(suggestions[0].source_url.as_deref(), Some("https://news.example.com/a"));
    assert!(suggestions[0].news_meta[0].is_some());
    assert!(suggestions[0].news_meta[1].is_none());
    assert_eq!(suggestions[1].keyword, "neck pain relief");
    assert!(cb.raw_payload.is_none());
}

#[test]
fn final_envelope_fixture_completes_the_job() {
    let cb = CallbackNormalizer::default()
        .parse_slice(&fixture("n8n-final-envelope.json"))
        .unwrap();
    assert_eq!(cb.outcome, CallbackOutcome::Succeeded);
    assert_eq!(cb.raw_payload.as_ref().unwrap()["cards"], 3);

    let articles = cb.articles.unwrap();
    assert_eq!(articles.len(), 2);
    assert_eq!(articles[0].word_count, Some(812));
    assert!(articles[0].published_time.is_some());
    assert_eq!(articles[1].rank, Some(1));

    let topics = cb.topics.unwrap();
    assert_eq!(topics.len(), 2);
    assert_eq!(topics[1].tier, TopicTier::Rising);
}

#[test]
fn wrapped_failure_fixture_carries_the_error() {
    let cb = CallbackNormalizer::default()
        .parse_slice(&fixture("n8n-wrapped-failure.json"))
        .unwrap();
    assert_eq!(cb.outcome, CallbackOutcome::Failed);
    assert_eq!(cb.error.as_deref(), Some("SerpAPI quota exceeded"));
    assert!(cb.suggestions.is_none());
}
