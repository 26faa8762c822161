use std::net::{IpAddr, SocketAddr};
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, StatusCode, header};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use time::OffsetDateTime;
use tower::ServiceExt;
use url::Url;
use uuid::Uuid;

use papyrus::application::admission::{AdmissionController, AdmissionPolicy};
use papyrus::application::api_keys::{ApiKeyService, IssueApiKeyCommand};
use papyrus::application::idempotency::IdempotencyCache;
use papyrus::application::pipeline::{PipelineService, Stage};
use papyrus::application::render::{DocumentRenderer, RenderContext, RenderError};
use papyrus::application::storage::ObjectStore;
use papyrus::domain::api_keys::ApiKeyTier;
use papyrus::domain::documents::DocumentRequest;
use papyrus::infra::http::{ApiState, HttpState, RouterState, build_app};
use papyrus::infra::memory::{MemoryQueue, MemoryRepositories};
use papyrus::infra::render::TemplateCache;
use papyrus::infra::storage::FilesystemObjectStore;

struct StaticRenderer {
    healthy: bool,
}

#[async_trait]
impl DocumentRenderer for StaticRenderer {
    async fn render(
        &self,
        _context: &mut RenderContext,
        _request: &DocumentRequest,
    ) -> Result<Bytes, RenderError> {
        Ok(Bytes::from_static(b"%PDF-1.7"))
    }

    async fn check(&self) -> Result<String, RenderError> {
        if self.healthy {
            Ok("typst 0.13.1".to_string())
        } else {
            Err(RenderError::Launch("typst: not found".to_string()))
        }
    }
}

struct TestApp {
    _dir: TempDir,
    router: Router,
    queue: Arc<MemoryQueue>,
    files: Arc<FilesystemObjectStore>,
    secret: String,
}

async fn test_app(anonymous_limit: u32, typesetter_healthy: bool) -> TestApp {
    let dir = TempDir::new().expect("tempdir");
    let templates_dir = dir.path().join("templates");
    std::fs::create_dir_all(&templates_dir).expect("templates dir");
    std::fs::write(templates_dir.join("report.typ"), "= Report").expect("template");
    std::fs::write(templates_dir.join("budget.typ"), "= Budget").expect("template");

    let repos = Arc::new(MemoryRepositories::new());
    let queue = Arc::new(MemoryQueue::new());
    let files = Arc::new(
        FilesystemObjectStore::new(
            dir.path().join("artifacts"),
            Url::parse("http://localhost:3000/").expect("url"),
            4,
            "api-test-secret",
        )
        .expect("store"),
    );

    let api_keys = Arc::new(ApiKeyService::new(repos.clone()));
    let issued = api_keys
        .issue(IssueApiKeyCommand {
            name: "integration".to_string(),
            tier: ApiKeyTier::Basic,
            quota: None,
        })
        .await
        .expect("issue key");

    let state = RouterState {
        http: HttpState {
            health: repos.clone(),
            renderer: Arc::new(StaticRenderer {
                healthy: typesetter_healthy,
            }),
            templates: Arc::new(TemplateCache::new(
                templates_dir,
                NonZeroUsize::new(8).expect("capacity"),
            )),
            files: files.clone(),
        },
        api: ApiState {
            pipeline: Arc::new(PipelineService::new(
                repos.clone(),
                queue.clone(),
                IdempotencyCache::new(repos.clone(), Duration::from_secs(3600)),
            )),
            api_keys,
            admission: Arc::new(AdmissionController::new(
                repos.clone(),
                AdmissionPolicy {
                    window: Duration::from_secs(60),
                    anonymous_limit: NonZeroU32::new(anonymous_limit).expect("limit"),
                    exempt_routes: vec!["/health".to_string()],
                },
            )),
            trusted_proxies: Arc::from([IpAddr::from(PROXY)]),
        },
    };

    TestApp {
        _dir: dir,
        router: build_app(state),
        queue,
        files,
        secret: issued.secret,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Bytes) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router response");
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    (status, headers, body)
}

fn json_body(bytes: &Bytes) -> Value {
    serde_json::from_slice(bytes).expect("json body")
}

fn submit_request(secret: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/pdf")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(secret) = secret {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {secret}"));
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request")
}

const CLIENT: [u8; 4] = [203, 0, 113, 7];
const PROXY: [u8; 4] = [10, 0, 0, 1];

fn get(uri: &str) -> Request<Body> {
    get_from(uri, CLIENT, None)
}

/// A request arriving from `peer`, optionally carrying a forwarded client.
fn get_from(uri: &str, peer: [u8; 4], forwarded: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(forwarded) = forwarded {
        builder = builder.header("x-forwarded-for", forwarded);
    }
    let mut request = builder.body(Body::empty()).expect("request");
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((peer, 41000))));
    request
}

fn report_body() -> Value {
    json!({
        "type": "report",
        "title": "Monthly Report",
        "data": { "sections": [] },
        "config": { "format": "A4", "margin": { "top": "15mm" } }
    })
}

#[tokio::test]
async fn health_is_ok_and_tagged_with_request_id() {
    let app = test_app(5, true).await;
    let (status, headers, body) = send(&app.router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["status"], "ok");
    let request_id = headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .expect("request id header");
    assert!(Uuid::parse_str(request_id).is_ok());
}

#[tokio::test]
async fn detailed_health_reports_missing_typesetter() {
    let app = test_app(5, false).await;
    let (status, _, body) = send(&app.router, get("/health/detailed")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(&body);
    assert_eq!(body["status"], "degraded");
    let typesetter = body["checks"]
        .as_array()
        .expect("checks")
        .iter()
        .find(|check| check["name"] == "typesetter")
        .expect("typesetter check");
    assert_eq!(typesetter["healthy"], false);
}

#[tokio::test]
async fn templates_lists_present_files_only() {
    let app = test_app(5, true).await;
    let (status, _, body) = send(&app.router, get("/api/v1/pdf/templates")).await;

    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    let types: Vec<&str> = body["templates"]
        .as_array()
        .expect("templates")
        .iter()
        .filter_map(|template| template["type"].as_str())
        .collect();
    assert_eq!(types, ["budget", "report"]);
    assert!(
        body["formats"]
            .as_array()
            .expect("formats")
            .contains(&json!("A4"))
    );
}

#[tokio::test]
async fn submit_without_credentials_is_unauthorized() {
    let app = test_app(5, true).await;
    let (status, _, body) = send(&app.router, submit_request(None, report_body())).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(&body)["error"]["code"], "unauthorized");
    assert_eq!(app.queue.enqueued_count(Stage::Generate), 0);
}

#[tokio::test]
async fn unknown_api_key_is_unauthorized() {
    let app = test_app(5, true).await;
    let bogus = "f".repeat(64);
    let (status, _, _) = send(&app.router, submit_request(Some(&bogus), report_body())).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn accepted_job_is_queued_and_not_ready() {
    let app = test_app(5, true).await;
    let (status, headers, body) =
        send(&app.router, submit_request(Some(&app.secret), report_body())).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(
        headers
            .get("x-ratelimit-limit")
            .and_then(|value| value.to_str().ok()),
        Some("10")
    );
    let body = json_body(&body);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["replayed"], false);
    let job_id = body["job_id"].as_str().expect("job id").to_string();
    assert_eq!(app.queue.enqueued_count(Stage::Generate), 1);

    let (status, _, body) = send(&app.router, get(&format!("/api/v1/pdf/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["status"], "queued");

    let (status, _, body) = send(
        &app.router,
        get(&format!("/api/v1/pdf/jobs/{job_id}/result")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["error"]["code"], "not_ready");
}

#[tokio::test]
async fn invalid_document_lists_every_problem() {
    let app = test_app(5, true).await;
    let body = json!({
        "type": "budget",
        "language": "fr-FR",
        "data": { "budget": {} },
        "config": { "orientation": "diagonal" }
    });
    let (status, _, body) = send(&app.router, submit_request(Some(&app.secret), body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body = json_body(&body);
    assert_eq!(body["error"]["code"], "invalid_document");
    let details = body["error"]["details"].as_array().expect("details");
    assert_eq!(details.len(), 3, "unexpected problems: {details:?}");
    assert_eq!(app.queue.enqueued_count(Stage::Generate), 0);
}

#[tokio::test]
async fn idempotency_key_replays_first_job() {
    let app = test_app(5, true).await;
    let with_token = || {
        let mut request = submit_request(Some(&app.secret), report_body());
        request.headers_mut().insert(
            "idempotency-key",
            "invoice-2024-001".parse().expect("header value"),
        );
        request
    };

    let (first_status, _, first) = send(&app.router, with_token()).await;
    let (second_status, _, second) = send(&app.router, with_token()).await;

    assert_eq!(first_status, StatusCode::ACCEPTED);
    assert_eq!(second_status, StatusCode::ACCEPTED);
    let first = json_body(&first);
    let second = json_body(&second);
    assert_eq!(first["job_id"], second["job_id"]);
    assert_eq!(second["replayed"], true);
    assert_eq!(app.queue.enqueued_count(Stage::Generate), 1);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let app = test_app(5, true).await;
    let (status, _, body) = send(
        &app.router,
        get(&format!("/api/v1/pdf/jobs/{}", Uuid::new_v4())),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["error"]["code"], "not_found");
}

#[tokio::test]
async fn anonymous_callers_are_rate_limited_per_origin() {
    let app = test_app(2, true).await;
    let uri = format!("/api/v1/pdf/jobs/{}", Uuid::new_v4());

    for _ in 0..2 {
        let (status, _, _) = send(&app.router, get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    let (status, headers, body) = send(&app.router, get(&uri)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = headers
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .expect("retry-after header");
    assert!((1..=60).contains(&retry_after));
    assert_eq!(
        headers
            .get("x-ratelimit-remaining")
            .and_then(|value| value.to_str().ok()),
        Some("0")
    );
    let body = json_body(&body);
    assert_eq!(body["status_code"], 429);
    assert_eq!(body["rate_limit"]["limit"], 2);

    // A different peer has its own window.
    let (status, _, _) = send(&app.router, get_from(&uri, [198, 51, 100, 20], None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Health stays reachable.
    let (status, _, _) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn signed_links_serve_pdf_and_reject_tampering() {
    let app = test_app(5, true).await;
    let artifact = app
        .files
        .put("report-test.pdf", Bytes::from_static(b"%PDF-1.7 body"))
        .await
        .expect("put artifact");
    let url = app
        .files
        .signed_url(&artifact, Duration::from_secs(300), OffsetDateTime::now_utc())
        .await
        .expect("signed url");
    let url = Url::parse(&url).expect("url");
    let path_and_query = format!("{}?{}", url.path(), url.query().expect("query"));

    let (status, headers, body) = send(&app.router, get(&path_and_query)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("application/pdf")
    );
    assert_eq!(body.as_ref(), b"%PDF-1.7 body");

    let tampered = path_and_query.replace("signature=", "signature=0");
    let (status, _, _) = send(&app.router, get(&tampered)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = send(&app.router, get(url.path())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let past = OffsetDateTime::now_utc().unix_timestamp() - 10;
    let expired = format!(
        "{}?expires={past}&signature={}",
        url.path(),
        app.files.signature(artifact.key(), past)
    );
    let (status, _, _) = send(&app.router, get(&expired)).await;
    assert_eq!(status, StatusCode::GONE);

    let missing_key = format!("{}/missing.pdf", artifact.key().split('/').next().expect("prefix"));
    let expires = OffsetDateTime::now_utc().unix_timestamp() + 60;
    let missing = format!(
        "/files/{missing_key}?expires={expires}&signature={}",
        app.files.signature(&missing_key, expires)
    );
    let (status, _, _) = send(&app.router, get(&missing)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn forwarded_header_from_untrusted_peer_is_ignored() {
    let app = test_app(2, true).await;
    let uri = format!("/api/v1/pdf/jobs/{}", Uuid::new_v4());
    let attacker = [198, 51, 100, 66];

    // Rotating the header does not buy a fresh window.
    let mut statuses = Vec::new();
    for n in 1..=3 {
        let forwarded = format!("192.0.2.{n}");
        let (status, _, _) = send(&app.router, get_from(&uri, attacker, Some(&forwarded))).await;
        statuses.push(status);
    }
    assert_eq!(
        statuses,
        [StatusCode::NOT_FOUND, StatusCode::NOT_FOUND, StatusCode::TOO_MANY_REQUESTS]
    );

    // Naming the victim does not spend the victim's window.
    for _ in 0..3 {
        send(&app.router, get_from(&uri, attacker, Some("203.0.113.7"))).await;
    }
    let (status, _, _) = send(&app.router, get(&uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn trusted_proxy_keys_callers_by_forwarded_address() {
    let app = test_app(1, true).await;
    let uri = format!("/api/v1/pdf/jobs/{}", Uuid::new_v4());

    let (status, _, _) = send(&app.router, get_from(&uri, PROXY, Some("192.0.2.10"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = send(&app.router, get_from(&uri, PROXY, Some("192.0.2.11"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = send(&app.router, get_from(&uri, PROXY, Some("192.0.2.10"))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn template_detail_describes_installed_templates() {
    let app = test_app(5, true).await;
    let (status, _, body) = send(&app.router, get("/api/v1/pdf/templates/budget")).await;

    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["type"], "budget");
    assert_eq!(body["requires"], json!(["data.budget.items"]));
    assert_eq!(body["size_bytes"], 8);
    assert!(body["modified_at"].is_string());

    // Known type without a file, and a type that does not exist.
    for missing in ["invoice", "poster"] {
        let (status, _, _) = send(
            &app.router,
            get(&format!("/api/v1/pdf/templates/{missing}")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{missing}");
    }
}

#[tokio::test]
async fn submitting_a_type_without_template_is_rejected() {
    let app = test_app(5, true).await;
    let body = json!({ "type": "invoice", "title": "March", "data": {} });
    let (status, _, body) = send(&app.router, submit_request(Some(&app.secret), body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body = json_body(&body);
    assert_eq!(body["error"]["code"], "invalid_document");
    assert!(
        body["error"]["details"][0]
            .as_str()
            .is_some_and(|detail| detail.contains("invoice"))
    );
    assert_eq!(app.queue.enqueued_count(Stage::Generate), 0);
}

#[tokio::test]
async fn caller_stats_report_key_and_quota_window() {
    let app = test_app(5, true).await;
    for uri in ["/api/v1/keys/current", "/api/v1/pdf/stats"] {
        let request = Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", app.secret))
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = send(&app.router, request).await;

        assert_eq!(status, StatusCode::OK, "{uri}");
        let body = json_body(&body);
        assert_eq!(body["name"], "integration");
        assert_eq!(body["tier"], "basic");
        assert_eq!(body["active"], true);
        assert_eq!(body["limit"], 10);
        assert!(body["remaining"].as_u64().is_some_and(|remaining| remaining < 10));
        assert!(body["reset_at"].is_string());
    }

    let (status, _, body) = send(&app.router, get("/api/v1/keys/current")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(&body)["error"]["code"], "unauthorized");
}
