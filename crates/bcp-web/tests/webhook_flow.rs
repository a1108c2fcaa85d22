//! Router-level flows against an in-memory store and a mocked automation engine.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bcp_jobs::{JobService, JobsConfig};
use bcp_storage::{EngineConfig, HttpEngineClient, MemoryStore};
use bcp_web::{app, AppState, AuthConfig};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value as JsonValue};
use tower::ServiceExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const JWT_SECRET: &str = "jwt-test-secret";
const INGEST_SECRET: &str = "ingest-test-secret";
const ENGINE_SECRET: &str = "engine-test-secret";

fn bearer(user: &str) -> String {
    let claims = json!({"sub": user, "exp": 4_102_444_800u64});
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {token}")
}

fn router(engine: &MockServer, ingest_secret: &str) -> Router {
    let config = JobsConfig {
        engine: EngineConfig {
            keywords_url: Some(format!("{}/webhook/keywords", engine.uri())),
            formatter_url: Some(format!("{}/webhook/formatter", engine.uri())),
            secret: ENGINE_SECRET.to_string(),
            timeout: Duration::from_secs(5),
            user_agent: "bcp-web-test".to_string(),
        },
        public_base_url: "https://app.example".to_string(),
        recent_jobs_limit: 20,
    };
    let client = HttpEngineClient::new(config.engine.clone()).unwrap();
    let jobs = JobService::new(Arc::new(MemoryStore::new()), Arc::new(client), config);
    app(AppState::new(
        jobs,
        AuthConfig {
            ingest_secret: ingest_secret.to_string(),
            jwt_secret: Some(JWT_SECRET.to_string()),
            trust_user_header: false,
        },
    ))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, JsonValue) {
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn user_get(uri: &str, user: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", bearer(user))
        .body(Body::empty())
        .unwrap()
}

fn user_post(uri: &str, user: &str, body: JsonValue) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", bearer(user))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn callback(secret: &str, body: JsonValue) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/n8n/keywords-callback")
        .header("x-ingest-secret", secret)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn accepting_engine() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook/keywords"))
        .and(header("x-ingest-secret", ENGINE_SECRET))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"started": true})))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn job_runs_from_creation_to_ready() {
    let engine = accepting_engine().await;
    let app = router(&engine, INGEST_SECRET);

    let (status, created) = send(
        &app,
        user_post("/api/keywords", "user_a", json!({"niche": "chiropractic", "location": {"country": "us", "state": "tx"}, "jobId": "kw_flow"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created, json!({"ok": true, "jobId": "kw_flow", "status": "RUNNING"}));

    let received = engine.received_requests().await.unwrap();
    let sent: JsonValue = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(sent["callbackUrl"], json!("https://app.example/api/n8n/keywords-callback"));
    assert_eq!(sent["location"], json!("US:TX"));

    let (status, ack) = send(
        &app,
        callback(
            INGEST_SECRET,
            json!({"jobId": "kw_flow", "status": "RUNNING", "keywords": ["Neck Pain", "neck pain", "posture tips"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["saved"], json!(2));
    assert_eq!(ack["status"], json!("RUNNING"));

    let (_, ack) = send(
        &app,
        callback(
            INGEST_SECRET,
            json!([{"jobId": "kw_flow", "finalize": true, "articles": [{"url": "https://www.spine.example/a", "rank": 1}]}]),
        ),
    )
    .await;
    assert_eq!(ack["status"], json!("READY"));

    let (status, polled) = send(&app, user_get("/api/research/status?jobId=kw_flow", "user_a")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(polled["ok"], json!(true));
    assert_eq!(polled["status"], json!("READY"));
    assert_eq!(polled["counts"], json!({"suggestions": 2, "articles": 1, "topics": 0}));
    assert_eq!(polled["suggestions"][0]["keyword"], json!("neck pain"));

    let (_, preview) = send(&app, user_get("/api/research/preview?jobId=kw_flow", "user_a")).await;
    assert_eq!(preview["articles"][0]["sourceName"], json!("spine.example"));
    assert_eq!(preview["supportingTopics"], json!({"top": [], "rising": [], "all": []}));

    let (_, ack) = send(
        &app,
        callback(INGEST_SECRET, json!({"jobId": "kw_flow", "status": "RUNNING", "keywords": ["late"]})),
    )
    .await;
    assert_eq!(ack["status"], json!("READY"));
    assert_eq!(ack["ignored"], json!(true));
}

#[tokio::test]
async fn wrong_secret_is_rejected_without_side_effects() {
    let engine = accepting_engine().await;
    let app = router(&engine, INGEST_SECRET);
    send(&app, user_post("/api/keywords", "user_a", json!({"topic": "yoga", "jobId": "kw_secret"}))).await;

    let (status, body) = send(
        &app,
        callback("not-the-secret", json!({"jobId": "kw_secret", "status": "READY", "keywords": ["x"]})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({"ok": false, "error": "Forbidden"}));

    let (_, polled) = send(&app, user_get("/api/research/status?jobId=kw_secret", "user_a")).await;
    assert_eq!(polled["status"], json!("RUNNING"));
    assert_eq!(polled["counts"]["suggestions"], json!(0));
}

#[tokio::test]
async fn empty_configured_secret_rejects_everything() {
    let engine = accepting_engine().await;
    let app = router(&engine, "");
    let (status, _) = send(&app, callback("", json!({"jobId": "kw_x", "status": "READY"}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn other_users_cannot_read_or_cancel_a_job() {
    let engine = accepting_engine().await;
    let app = router(&engine, INGEST_SECRET);
    send(&app, user_post("/api/keywords", "user_a", json!({"topic": "yoga", "jobId": "kw_mine"}))).await;

    for uri in ["/api/research/status?jobId=kw_mine", "/api/research/preview?jobId=kw_mine"] {
        let (status, body) = send(&app, user_get(uri, "user_b")).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{uri}");
        assert_eq!(body["ok"], json!(false));
    }
    let (status, _) = send(&app, user_post("/api/research/cancel", "user_b", json!({"jobId": "kw_mine"}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, user_post("/api/keywords", "user_b", json!({"topic": "steal", "jobId": "kw_mine"}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, listed) = send(&app, user_get("/api/keywords", "user_b")).await;
    assert_eq!(listed["jobs"], json!([]));

    let (status, _) = send(&app, user_get("/api/research/status?jobId=kw_missing", "user_a")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn engine_failure_returns_502_and_fails_the_job() {
    let engine = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("workflow inactive"))
        .mount(&engine)
        .await;
    let app = router(&engine, INGEST_SECRET);

    let (status, body) = send(&app, user_post("/api/keywords", "user_a", json!({"topic": "yoga", "jobId": "kw_down"}))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["ok"], json!(false));
    assert_eq!(body["jobId"], json!("kw_down"));
    assert_eq!(body["details"], json!("workflow inactive"));

    let (_, polled) = send(&app, user_get("/api/research/status?jobId=kw_down", "user_a")).await;
    assert_eq!(polled["status"], json!("FAILED"));
    assert_eq!(polled["error"], json!("engine 503: workflow inactive"));
}

#[tokio::test]
async fn outline_and_draft_ingestion_share_the_secret() {
    let engine = accepting_engine().await;
    let app = router(&engine, INGEST_SECRET);
    let ingest = |uri: &str, secret: &str, body: JsonValue| {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-ingest-secret", secret)
            .body(Body::from(body.to_string()))
            .unwrap()
    };
    let outline = json!({
        "userId": "user_a",
        "cluster": {"title": "Back care", "niche": "chiropractic"},
        "post": {"slug": "back-care", "title": "Back care", "type": "pillar",
                 "outline": {"h1": "Back care", "sections": [{"heading": "Basics", "key_points": ["sit up"]}]}}
    });

    let (status, _) = send(&app, ingest("/api/internal/outline", "nope", outline.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, ingest("/api/internal/outline", INGEST_SECRET, outline)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], json!(true));
    assert_eq!(body["post"]["outlineStatus"], json!("READY"));

    let (status, body) = send(
        &app,
        ingest("/api/drafts", INGEST_SECRET, json!({"slug": "back-care", "content": "# Back care"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["post"]["draftStatus"], json!("READY"));

    let (_, usage) = send(&app, user_get("/api/usage", "user_a")).await;
    assert_eq!(usage["blogsUsed"], json!(1));
    assert_eq!(usage["plan"], json!("starter"));
}

fn ingest(uri: &str, secret: &str, body: JsonValue) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-ingest-secret", secret)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn publish_replays_the_same_event_id() {
    let engine = accepting_engine().await;
    let app = router(&engine, INGEST_SECRET);
    let event = json!({
        "userId": "user_a",
        "eventId": "evt_1",
        "post": {"slug": "spring-posture", "title": "Spring posture", "content": "# Spring"}
    });

    let (status, _) = send(&app, ingest("/api/publish", "nope", event.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, first) = send(&app, ingest("/api/publish", INGEST_SECRET, event.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["ok"], json!(true));
    assert_eq!(first["idempotent"], json!(false));
    assert_eq!(first["post"]["slug"], json!("spring-posture"));
    assert_eq!(first["post"]["draftStatus"], json!("READY"));

    let (status, again) = send(&app, ingest("/api/publish", INGEST_SECRET, event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["idempotent"], json!(true));
    assert_eq!(again["clusterId"], first["clusterId"]);

    let (_, usage) = send(&app, user_get("/api/usage", "user_a")).await;
    assert_eq!(usage["blogsUsed"], json!(1));

    let (status, _) = send(
        &app,
        ingest("/api/publish", INGEST_SECRET, json!({"userId": "user_a", "post": {"slug": "x"}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn supportings_list_children_of_a_pillar() {
    let engine = accepting_engine().await;
    let app = router(&engine, INGEST_SECRET);
    let (_, pillar) = send(
        &app,
        ingest(
            "/api/internal/outline",
            INGEST_SECRET,
            json!({
                "userId": "user_a",
                "cluster": {"title": "Back care"},
                "post": {"slug": "guide", "title": "Guide", "type": "pillar",
                         "outline": {"sections": [{"heading": "Intro"}]}}
            }),
        ),
    )
    .await;
    let cluster_id = pillar["post"]["clusterId"].clone();
    for slug in ["neck", "wrists"] {
        let (status, _) = send(
            &app,
            ingest(
                "/api/internal/outline",
                INGEST_SECRET,
                json!({
                    "clusterId": cluster_id,
                    "post": {"slug": slug, "title": slug, "parentSlug": "guide",
                             "outline": {"sections": [{"heading": slug}]}}
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    send(
        &app,
        ingest("/api/drafts", INGEST_SECRET, json!({"slug": "wrists", "content": "done", "status": "PUBLISHED"})),
    )
    .await;

    let (status, body) = send(&app, user_get("/posts/supportings?parent_slug=guide", "user_a")).await;
    assert_eq!(status, StatusCode::OK);
    let slugs: Vec<_> = body["posts"].as_array().unwrap().iter().map(|p| p["slug"].clone()).collect();
    assert_eq!(slugs, vec![json!("neck"), json!("wrists")]);

    let (_, body) = send(
        &app,
        user_get("/posts/supportings?parent_slug=guide&status=PUBLISHED", "user_a"),
    )
    .await;
    assert_eq!(body["posts"].as_array().unwrap().len(), 1);
    assert_eq!(body["posts"][0]["status"], json!("PUBLISHED"));

    let (status, _) = send(&app, user_get("/posts/supportings", "user_a")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(&app, user_get("/posts/supportings?parent_slug=guide", "user_b")).await;
    assert_eq!(body["posts"], json!([]));
}
