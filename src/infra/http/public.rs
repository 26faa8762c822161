use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{
        HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use futures::future::join;
use papyrus_api_types::{
    HealthCheck, HealthResponse, TemplateDetailResponse, TemplateSummary, TemplatesResponse,
};
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::error;

use crate::application::error::HttpError;
use crate::application::render::DocumentRenderer;
use crate::application::repos::HealthProbe;
use crate::application::storage::StorageError;
use crate::domain::documents::{DocumentType, Language, PageFormat};
use crate::infra::render::TemplateCache;
use crate::infra::storage::{FilesystemObjectStore, SignatureError};

use super::RouterState;
use super::middleware::{log_responses, set_request_context};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// State for unauthenticated routes: health, template listing and
/// signed downloads.
#[derive(Clone)]
pub struct HttpState {
    pub health: Arc<dyn HealthProbe>,
    pub renderer: Arc<dyn DocumentRenderer>,
    pub templates: Arc<TemplateCache>,
    pub files: Arc<FilesystemObjectStore>,
}

pub fn build_router(state: RouterState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/api/v1/pdf/templates", get(list_templates))
        .route("/api/v1/pdf/templates/{type}", get(template_detail))
        .route("/files/{*key}", get(serve_file))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: VERSION.to_string(),
        checks: Vec::new(),
    })
}

async fn health_detailed(State(state): State<HttpState>) -> Response {
    let (database, typesetter) = join(state.health.ping(), state.renderer.check()).await;

    let checks = vec![
        HealthCheck {
            name: "database".to_string(),
            healthy: database.is_ok(),
            detail: database.err().map(|err| err.to_string()),
        },
        match typesetter {
            Ok(version) => HealthCheck {
                name: "typesetter".to_string(),
                healthy: true,
                detail: Some(version),
            },
            Err(err) => HealthCheck {
                name: "typesetter".to_string(),
                healthy: false,
                detail: Some(err.to_string()),
            },
        },
    ];

    let healthy = checks.iter().all(|check| check.healthy);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: VERSION.to_string(),
        checks,
    };
    (status, Json(body)).into_response()
}

fn template_summary(document_type: DocumentType) -> TemplateSummary {
    TemplateSummary {
        document_type: document_type.as_str().to_string(),
        requires: document_type
            .required_fields()
            .iter()
            .map(|path| format!("data.{path}"))
            .collect(),
    }
}

fn languages() -> Vec<String> {
    Language::ALL
        .iter()
        .map(|language| language.as_str().to_string())
        .collect()
}

fn formats() -> Vec<String> {
    PageFormat::ALL
        .iter()
        .map(|format| format.as_str().to_string())
        .collect()
}

async fn list_templates(State(state): State<HttpState>) -> Json<TemplatesResponse> {
    let templates = state
        .templates
        .available()
        .await
        .into_iter()
        .map(template_summary)
        .collect();

    Json(TemplatesResponse {
        templates,
        languages: languages(),
        formats: formats(),
    })
}

async fn template_detail(
    State(state): State<HttpState>,
    Path(raw_type): Path<String>,
) -> Response {
    const SOURCE: &str = "infra::http::public::template_detail";

    let template = match DocumentType::try_from(raw_type.as_str()) {
        Ok(document_type) => state.templates.describe(document_type).await,
        Err(()) => None,
    };
    let Some(template) = template else {
        return HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "Template not found",
            format!("no template for document type `{raw_type}`"),
        )
        .into_response();
    };

    Json(TemplateDetailResponse {
        template: template_summary(template.document_type),
        size_bytes: template.size_bytes,
        modified_at: OffsetDateTime::from(template.modified),
        languages: languages(),
        formats: formats(),
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct SignedQuery {
    expires: Option<i64>,
    signature: Option<String>,
}

async fn serve_file(
    State(state): State<HttpState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
) -> Response {
    const SOURCE: &str = "infra::http::public::serve_file";

    let (Some(expires), Some(signature)) = (query.expires, query.signature) else {
        return HttpError::new(
            SOURCE,
            StatusCode::FORBIDDEN,
            "Signed link required",
            "missing expires or signature",
        )
        .into_response();
    };

    match state
        .files
        .verify(&key, expires, &signature, OffsetDateTime::now_utc())
    {
        Ok(()) => {}
        Err(SignatureError::Expired) => {
            return HttpError::new(SOURCE, StatusCode::GONE, "Link expired", "link expired")
                .into_response();
        }
        Err(SignatureError::Invalid) => {
            return HttpError::new(
                SOURCE,
                StatusCode::FORBIDDEN,
                "Invalid signature",
                "signature mismatch",
            )
            .into_response();
        }
    }

    match state.files.read(&key).await {
        Ok(bytes) => file_response(&key, bytes),
        Err(StorageError::NotFound(_) | StorageError::InvalidKey(_)) => HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "File not found",
            "The requested file is not available",
        )
        .into_response(),
        Err(err) => {
            error!(
                target = "papyrus::http::files",
                key = %key,
                error = %err,
                "failed to read stored artifact"
            );
            HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read file",
                &err,
            )
            .into_response()
        }
    }
}

fn file_response(key: &str, bytes: Bytes) -> Response {
    let length = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/pdf"));
    if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }
    let filename = key.rsplit('/').next().unwrap_or(key);
    if let Ok(value) = HeaderValue::from_str(&format!("inline; filename=\"{filename}\"")) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("private, no-store"));

    response
}
