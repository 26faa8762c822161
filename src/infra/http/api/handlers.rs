use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use papyrus_api_types::{
    CallerStatsResponse, JobAcceptedResponse, JobResultResponse, JobStatusResponse,
    SubmitPdfRequest,
};
use tracing::{error, info};
use uuid::Uuid;

use crate::application::admission::{Caller, QuotaSnapshot};
use crate::application::api_keys::ApiKeyError;
use crate::application::idempotency::{IdempotencyError, IdempotencyKey};
use crate::application::pipeline::{ResultError, SubmitError};
use crate::domain::documents::DocumentDraft;
use crate::domain::jobs::{JobRecord, JobStage};

use crate::infra::http::HttpState;

use super::error::{ApiError, codes};
use super::state::ApiState;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";
const TARGET: &str = "papyrus::http::api";

pub async fn submit_pdf(
    State(state): State<ApiState>,
    State(http): State<HttpState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Result<Json<SubmitPdfRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    if caller.identity().is_none() {
        return Err(ApiError::unauthorized("API key required to submit documents"));
    }

    let Json(body) = body.map_err(|rejection| {
        ApiError::bad_request("Malformed JSON body", Some(rejection.body_text()))
    })?;

    let token = match headers.get(IDEMPOTENCY_HEADER) {
        None => None,
        Some(value) => {
            let raw = value.to_str().map_err(|_| {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    codes::INVALID_IDEMPOTENCY_KEY,
                    "Invalid Idempotency-Key header",
                    Some("token must be printable ASCII".to_string()),
                )
            })?;
            Some(
                IdempotencyKey::parse(&caller.scope(), raw).map_err(|err| {
                    ApiError::new(
                        StatusCode::BAD_REQUEST,
                        codes::INVALID_IDEMPOTENCY_KEY,
                        "Invalid Idempotency-Key header",
                        Some(err.to_string()),
                    )
                })?,
            )
        }
    };

    let request = draft_from(body).validate().map_err(|invalid| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_DOCUMENT,
            "Document request is invalid",
            None,
        )
        .with_details(invalid.problems)
    })?;

    if !http.templates.has_template(request.document_type).await {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_DOCUMENT,
            "Document request is invalid",
            None,
        )
        .with_details(vec![format!(
            "no template installed for document type `{}`",
            request.document_type
        )]));
    }

    let submission = state
        .pipeline
        .submit(request, token)
        .await
        .map_err(submit_error)?;

    if !submission.replayed {
        info!(
            target = TARGET,
            job_id = %submission.job_id,
            caller = %caller.scope(),
            "document accepted"
        );
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAcceptedResponse {
            job_id: submission.job_id,
            status: JobStage::Queued.as_str().to_string(),
            replayed: submission.replayed,
        }),
    ))
}

pub async fn job_status(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.pipeline.status(id).await.map_err(result_error)?;
    Ok(Json(status_response(record)))
}

pub async fn job_result(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.pipeline.result(id).await.map_err(result_error)?;
    Ok(Json(JobResultResponse {
        job_id: result.job_id,
        url: result.url,
    }))
}

/// The calling key, its tier and the quota window after this request.
pub async fn caller_stats(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    snapshot: Option<Extension<QuotaSnapshot>>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(identity) = caller.identity() else {
        return Err(ApiError::unauthorized("API key required for caller statistics"));
    };
    let record = state
        .api_keys
        .find(identity.key_id)
        .await
        .map_err(|err| match err {
            ApiKeyError::NotFound => ApiError::not_found("API key not found"),
            other => ApiError::unavailable("Credential store unavailable", other),
        })?;
    let snapshot = snapshot.map(|Extension(snapshot)| snapshot);

    Ok(Json(CallerStatsResponse {
        id: record.id,
        name: record.name,
        tier: record.tier.as_str().to_string(),
        active: record.active,
        limit: record.quota.limit(),
        remaining: snapshot.as_ref().and_then(|snapshot| snapshot.remaining),
        reset_at: snapshot.and_then(|snapshot| snapshot.reset_at),
        created_at: record.created_at,
        last_used_at: record.last_used_at,
    }))
}

fn draft_from(body: SubmitPdfRequest) -> DocumentDraft {
    let config = body.config.unwrap_or_default();
    let margin = config.margin.unwrap_or_default();
    DocumentDraft {
        document_type: body.document_type,
        title: body.title,
        language: body.language,
        data: body.data,
        format: config.format,
        orientation: config.orientation,
        margin_top: margin.top,
        margin_right: margin.right,
        margin_bottom: margin.bottom,
        margin_left: margin.left,
    }
}

fn status_response(record: JobRecord) -> JobStatusResponse {
    JobStatusResponse {
        job_id: record.id,
        status: record.stage.as_str().to_string(),
        artifact_key: record.artifact_key,
        result_url: record.result_url,
        error: record.error,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

fn submit_error(err: SubmitError) -> ApiError {
    match err {
        SubmitError::Idempotency(IdempotencyError::InvalidToken(reason)) => ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_IDEMPOTENCY_KEY,
            "Invalid Idempotency-Key header",
            Some(reason.to_string()),
        ),
        SubmitError::Idempotency(IdempotencyError::Unavailable(err)) => {
            ApiError::unavailable("Idempotency store unavailable", err)
        }
        SubmitError::Contended => ApiError::new(
            StatusCode::CONFLICT,
            codes::IDEMPOTENCY_CONFLICT,
            "Idempotency-Key is held by a request still in progress",
            Some("retry the request shortly".to_string()),
        ),
        SubmitError::Jobs(err) => ApiError::unavailable("Job store unavailable", err),
        SubmitError::Enqueue(err) => ApiError::unavailable("Job could not be queued", err),
        SubmitError::Encode(detail) => {
            error!(target = TARGET, detail = %detail, "job payload encoding failed");
            ApiError::internal("Job payload could not be encoded", detail)
        }
    }
}

fn result_error(err: ResultError) -> ApiError {
    match err {
        ResultError::NotFound => ApiError::not_found("Job not found"),
        ResultError::NotReady(stage) => ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::NOT_READY,
            "Job has not completed",
            Some(format!("current status is `{stage}`")),
        ),
        ResultError::Failed(reason) => ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::JOB_FAILED,
            "Job failed",
            Some(reason),
        ),
        ResultError::Repo(err) => ApiError::unavailable("Job store unavailable", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use papyrus_api_types::{Margin, PdfConfig};

    #[test]
    fn draft_carries_nested_config() {
        let draft = draft_from(SubmitPdfRequest {
            document_type: Some("invoice".into()),
            config: Some(PdfConfig {
                format: Some("Letter".into()),
                orientation: None,
                margin: Some(Margin {
                    left: Some("1in".into()),
                    ..Margin::default()
                }),
            }),
            ..SubmitPdfRequest::default()
        });
        assert_eq!(draft.document_type.as_deref(), Some("invoice"));
        assert_eq!(draft.format.as_deref(), Some("Letter"));
        assert_eq!(draft.margin_left.as_deref(), Some("1in"));
        assert!(draft.margin_top.is_none());
    }

    #[test]
    fn unfinished_jobs_answer_bad_request() {
        let err = result_error(ResultError::NotReady(JobStage::Signing));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            result_error(ResultError::NotFound).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn contended_idempotency_key_answers_conflict() {
        assert_eq!(
            submit_error(SubmitError::Contended).status(),
            StatusCode::CONFLICT
        );
    }
}
