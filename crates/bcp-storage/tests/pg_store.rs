//! Postgres store integration tests. Skipped unless `TEST_DATABASE_URL` is set.

use bcp_adapters::CallbackNormalizer;
use bcp_core::{
    CallbackOutcome, ChildCounts, FailureOrigin, JobStatus, NewJob, NormalizedCallback, Outline,
    OutlineUpsert, PostPublish, PostStatus, PostType, ResearchArticle, SuggestionDraft,
    TopicSuggestion, TopicTier, UNCLUSTERED,
};
use bcp_storage::{PgStore, Store, StoreError};
use tokio::sync::{Mutex, MutexGuard};

/// Tests share one database and truncate it on setup, so they run one at a time.
static DB_LOCK: Mutex<()> = Mutex::const_new(());

macro_rules! require_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("skipping: TEST_DATABASE_URL not set");
            return;
        }
    };
}

async fn setup() -> (PgStore, MutexGuard<'static, ()>) {
    let guard = DB_LOCK.lock().await;
    let url = std::env::var("TEST_DATABASE_URL").unwrap();
    let store = PgStore::connect(&url, 4).await.unwrap();
    store.migrate().await.unwrap();
    sqlx::raw_sql(
        "TRUNCATE TABLE keyword_suggestions, research_articles, research_topic_suggestions,
                        keywords_jobs, publish_events, posts, clusters, usage, subscriptions,
                        users CASCADE",
    )
    .execute(store.pool())
    .await
    .unwrap();
    (store, guard)
}

fn new_job(id: &str, user: &str) -> NewJob {
    NewJob {
        id: id.to_string(),
        user_id: user.to_string(),
        topic: "posture".to_string(),
        country: "US".to_string(),
        region: "CA".to_string(),
        location: "US:CA".to_string(),
        cluster_id: None,
    }
}

fn callback(job_id: &str, outcome: CallbackOutcome, keywords: &[&str]) -> NormalizedCallback {
    NormalizedCallback {
        job_id: job_id.to_string(),
        user_id: None,
        topic: None,
        location: None,
        outcome,
        error: None,
        suggestions: Some(
            keywords
                .iter()
                .map(|k| SuggestionDraft {
                    keyword: k.to_string(),
                    score: Some(1.0),
                    source_url: None,
                    news_urls: vec![format!("https://news.example/{k}")],
                    news_meta: vec![None],
                })
                .collect(),
        ),
        articles: None,
        topics: None,
        raw_payload: None,
    }
}

#[tokio::test]
async fn pg_apply_is_idempotent_and_ordered() {
    require_db!();
    let (store, _guard) = setup().await;
    store.upsert_job(&new_job("kw_pg_1", "user_a")).await.unwrap();

    let cb = callback("kw_pg_1", CallbackOutcome::Succeeded, &["b", "a", "c"]);
    store.apply_callback(&cb).await.unwrap();
    store.apply_callback(&cb).await.unwrap();

    let rows = store.suggestions("kw_pg_1").await.unwrap();
    let keywords: Vec<_> = rows.iter().map(|s| s.keyword.as_str()).collect();
    assert_eq!(keywords, vec!["b", "a", "c"]);
    assert_eq!(rows[0].news_urls, vec!["https://news.example/b"]);
    assert_eq!(store.get_job("kw_pg_1").await.unwrap().unwrap().status, JobStatus::Ready);
}

#[tokio::test]
async fn pg_terminal_job_ignores_late_progress() {
    require_db!();
    let (store, _guard) = setup().await;
    store.upsert_job(&new_job("kw_pg_2", "user_a")).await.unwrap();
    store
        .apply_callback(&callback("kw_pg_2", CallbackOutcome::Failed, &["x"]))
        .await
        .unwrap();
    let report = store
        .apply_callback(&callback("kw_pg_2", CallbackOutcome::InProgress, &["y", "z"]))
        .await
        .unwrap();

    assert!(report.ignored);
    assert_eq!(report.job.status, JobStatus::Failed);
    assert_eq!(store.child_counts("kw_pg_2").await.unwrap().suggestions, 1);
}

#[tokio::test]
async fn pg_children_are_replaced_per_entity() {
    require_db!();
    let (store, _guard) = setup().await;
    store.upsert_job(&new_job("kw_pg_3", "user_a")).await.unwrap();

    let mut first = callback("kw_pg_3", CallbackOutcome::InProgress, &["a"]);
    first.articles = Some(vec![ResearchArticle {
        id: "art_1".into(),
        job_id: "kw_pg_3".into(),
        url: "https://a.example/1".into(),
        title: Some("One".into()),
        source_name: None,
        published_time: None,
        raw_text: None,
        snippet: None,
        rank: Some(1),
        word_count: None,
        relevance_score: None,
    }]);
    first.topics = Some(vec![TopicSuggestion {
        job_id: "kw_pg_3".into(),
        label: "Desk setup".into(),
        tier: TopicTier::Rising,
    }]);
    store.apply_callback(&first).await.unwrap();

    let mut second = callback("kw_pg_3", CallbackOutcome::InProgress, &[]);
    second.suggestions = None;
    second.topics = Some(Vec::new());
    store.apply_callback(&second).await.unwrap();

    let counts = store.child_counts("kw_pg_3").await.unwrap();
    assert_eq!(counts.suggestions, 1);
    assert_eq!(counts.articles, 1);
    assert_eq!(counts.topics, 0);
}

#[tokio::test]
async fn pg_rerun_ownership() {
    require_db!();
    let (store, _guard) = setup().await;
    store.upsert_job(&new_job("kw_pg_4", "user_a")).await.unwrap();
    store.mark_running("kw_pg_4").await.unwrap();

    let rerun = store.upsert_job(&new_job("kw_pg_4", "user_a")).await.unwrap();
    assert_eq!(rerun.status, JobStatus::Queued);
    assert!(rerun.started_at.is_none());

    let err = store.upsert_job(&new_job("kw_pg_4", "user_b")).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn pg_usage_increment_is_atomic_upsert() {
    require_db!();
    let (store, _guard) = setup().await;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.increment_usage("user_a", "blogs", "2026-10", 1).await.unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    let rows = store.usage_for_period("user_a", "2026-10").await.unwrap();
    assert_eq!(rows[0].amount, 8);
}

#[tokio::test]
async fn pg_nul_bytes_are_stripped_before_insert() {
    require_db!();
    let (store, _guard) = setup().await;
    let normalizer = CallbackNormalizer::default();
    let callback = normalizer
        .parse_slice(br#"{"jobId":"kw_nul","status":"READY","keywords":["neck\u0000pain"]}"#)
        .unwrap();

    let report = store.apply_callback(&callback).await.unwrap();
    assert_eq!(report.job.status, JobStatus::Ready);
    let rows = store.suggestions("kw_nul").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].keyword, "neckpain");
    let raw = store.get_job("kw_nul").await.unwrap().unwrap().raw_payload.unwrap();
    assert!(!raw.to_string().contains("\\u0000"));
}

#[tokio::test]
async fn pg_cancelled_job_ignores_late_terminal_callbacks() {
    require_db!();
    let (store, _guard) = setup().await;
    store.upsert_job(&new_job("kw_pg_5", "user_a")).await.unwrap();
    store
        .mark_failed("kw_pg_5", "cancelled", FailureOrigin::Cancelled)
        .await
        .unwrap();

    let report = store
        .apply_callback(&callback("kw_pg_5", CallbackOutcome::Succeeded, &["late"]))
        .await
        .unwrap();
    assert!(report.ignored);
    let job = store.get_job("kw_pg_5").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_origin, Some(FailureOrigin::Cancelled));
    assert_eq!(store.child_counts("kw_pg_5").await.unwrap().suggestions, 0);
}

#[tokio::test]
async fn pg_late_success_after_dispatch_failure_lands() {
    require_db!();
    let (store, _guard) = setup().await;
    store.upsert_job(&new_job("kw_pg_6", "user_a")).await.unwrap();
    store
        .mark_failed("kw_pg_6", "engine unreachable", FailureOrigin::Dispatch)
        .await
        .unwrap();

    let report = store
        .apply_callback(&callback("kw_pg_6", CallbackOutcome::Succeeded, &["a"]))
        .await
        .unwrap();
    assert!(!report.ignored);
    assert_eq!(report.job.status, JobStatus::Ready);
    assert_eq!(report.job.failure_origin, None);
    assert_eq!(report.job.error, None);
}

#[tokio::test]
async fn pg_adopting_a_sentinel_job_drops_its_children() {
    require_db!();
    let (store, _guard) = setup().await;
    let mut orphan = callback("kw_pg_orphan", CallbackOutcome::Succeeded, &["stale"]);
    orphan.topics = Some(vec![TopicSuggestion {
        job_id: "kw_pg_orphan".into(),
        label: "Stale".into(),
        tier: TopicTier::Top,
    }]);
    store.apply_callback(&orphan).await.unwrap();

    let adopted = store.upsert_job(&new_job("kw_pg_orphan", "user_a")).await.unwrap();
    assert_eq!(adopted.user_id, "user_a");
    assert_eq!(adopted.status, JobStatus::Queued);
    assert_eq!(store.child_counts("kw_pg_orphan").await.unwrap(), ChildCounts::default());
}

#[tokio::test]
async fn pg_topics_with_equal_labels_keep_insertion_order() {
    require_db!();
    let (store, _guard) = setup().await;
    store.upsert_job(&new_job("kw_pg_7", "user_a")).await.unwrap();
    let topic = |label: &str, tier| TopicSuggestion {
        job_id: "kw_pg_7".into(),
        label: label.into(),
        tier,
    };
    let mut cb = callback("kw_pg_7", CallbackOutcome::InProgress, &[]);
    cb.suggestions = None;
    cb.topics = Some(vec![
        topic("posture", TopicTier::Rising),
        topic("Back", TopicTier::All),
        topic("Posture", TopicTier::Top),
    ]);
    store.apply_callback(&cb).await.unwrap();

    let order: Vec<_> = store
        .topic_suggestions("kw_pg_7")
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.label, t.tier))
        .collect();
    assert_eq!(
        order,
        vec![
            ("Back".to_string(), TopicTier::All),
            ("posture".to_string(), TopicTier::Rising),
            ("Posture".to_string(), TopicTier::Top),
        ]
    );
}

#[tokio::test]
async fn pg_publish_replays_event_ids() {
    require_db!();
    let (store, _guard) = setup().await;
    let publish = PostPublish {
        user_id: "user_a".into(),
        cluster_title: UNCLUSTERED.into(),
        cluster_niche: String::new(),
        slug: "desk-posture".into(),
        title: "Desk posture".into(),
        content: Some("body".into()),
        status: PostStatus::Published,
        event_id: Some("evt_pg_1".into()),
    };

    let first = store.publish_post(&publish, "2026-10").await.unwrap();
    let replay = store.publish_post(&publish, "2026-10").await.unwrap();
    assert!(!first.replayed);
    assert!(replay.replayed);
    assert_eq!(replay.cluster_id, first.cluster_id);
    let usage = store.usage_for_period("user_a", "2026-10").await.unwrap();
    assert_eq!(usage[0].amount, 1);

    let stolen = PostPublish {
        user_id: "user_b".into(),
        event_id: None,
        ..publish
    };
    let err = store.publish_post(&stolen, "2026-10").await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn pg_supporting_posts_filter_by_parent_and_status() {
    require_db!();
    let (store, _guard) = setup().await;
    let cluster = store.find_or_create_cluster("user_a", "Back pain", "").await.unwrap();
    for (slug, parent) in [("child-1", "pillar"), ("child-2", "pillar"), ("other", "elsewhere")] {
        store
            .upsert_outline(&OutlineUpsert {
                cluster_id: cluster.id.clone(),
                slug: slug.into(),
                title: slug.into(),
                post_type: PostType::Supporting,
                parent_id: None,
                parent_slug: Some(parent.into()),
                outline: Outline {
                    h1: None,
                    sections: Vec::new(),
                },
                meta: serde_json::json!({}),
            })
            .await
            .unwrap();
    }

    let all = store.list_supporting_posts("user_a", "pillar", None).await.unwrap();
    let slugs: Vec<_> = all.iter().map(|p| p.slug.as_str()).collect();
    assert_eq!(slugs, vec!["child-1", "child-2"]);
    assert!(store
        .list_supporting_posts("user_a", "pillar", Some(PostStatus::Published))
        .await
        .unwrap()
        .is_empty());
    assert!(store
        .list_supporting_posts("user_b", "pillar", None)
        .await
        .unwrap()
        .is_empty());
}
