//! Request and response bodies of the papyrus HTTP API.
//!
//! The server deserializes requests leniently (every submission field is
//! optional) and reports validation problems itself, so clients get one
//! `400` listing every problem instead of the first serde failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Body of `POST /api/v1/pdf`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitPdfRequest {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<PdfConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PdfConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin: Option<Margin>,
}

/// Page margins as typesetter lengths, e.g. `"20mm"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Margin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<String>,
}

/// `202 Accepted` body. `replayed` is true when the job id came from the
/// idempotency cache instead of a fresh submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAcceptedResponse {
    pub job_id: Uuid,
    pub status: String,
    #[serde(default)]
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultResponse {
    pub job_id: Uuid,
    pub url: String,
}

/// `429 Too Many Requests` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitedBody {
    pub status_code: u16,
    pub error: String,
    pub message: String,
    pub rate_limit: RateLimitInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<ApiKeyQuota>,
    pub suggestion: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_time: OffsetDateTime,
    pub retry_after_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyQuota {
    pub name: String,
    pub tier: String,
    /// `None` for unlimited keys.
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSummary {
    #[serde(rename = "type")]
    pub document_type: String,
    pub requires: Vec<String>,
}

/// Body of `GET /api/v1/pdf/templates/{type}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDetailResponse {
    #[serde(flatten)]
    pub template: TemplateSummary,
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
    pub languages: Vec<String>,
    pub formats: Vec<String>,
}

/// Body of `GET /api/v1/keys/current`: the calling key and its quota
/// window after this request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerStatsResponse {
    pub id: Uuid,
    pub name: String,
    pub tier: String,
    pub active: bool,
    /// `None` for unlimited keys.
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub remaining: Option<u32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub reset_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatesResponse {
    pub templates: Vec<TemplateSummary>,
    pub languages: Vec<String>,
    pub formats: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<HealthCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_reads_type_field() {
        let request: SubmitPdfRequest = serde_json::from_value(serde_json::json!({
            "type": "invoice",
            "data": {"total": 10},
            "config": {"format": "A4", "margin": {"top": "20mm"}}
        }))
        .expect("valid body");

        assert_eq!(request.document_type.as_deref(), Some("invoice"));
        assert!(request.title.is_none());
        let config = request.config.expect("config present");
        assert_eq!(config.format.as_deref(), Some("A4"));
        assert_eq!(
            config.margin.and_then(|margin| margin.top).as_deref(),
            Some("20mm")
        );
    }

    #[test]
    fn error_body_omits_empty_details() {
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: "not_found".to_string(),
                message: "Job not found".to_string(),
                hint: None,
                details: Vec::new(),
            },
        };
        let value = serde_json::to_value(&body).expect("serializes");
        assert_eq!(
            value,
            serde_json::json!({"error": {"code": "not_found", "message": "Job not found"}})
        );
    }
}
