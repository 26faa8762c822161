use std::net::{IpAddr, SocketAddr};

use axum::Json;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use papyrus_api_types::{ApiKeyQuota, RateLimitInfo, RateLimitedBody};
use time::OffsetDateTime;
use tracing::warn;

use crate::application::admission::{
    Admission, AdmissionError, AdmissionRequest, Caller, Denial, QuotaSnapshot,
};
use crate::application::api_keys::ApiAuthError;
use crate::application::error::ErrorReport;
use crate::infra::http::middleware::CallerLabel;

use super::error::ApiError;
use super::state::ApiState;

const API_KEY_HEADER: &str = "x-api-key";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Resolve the caller. A missing credential yields an anonymous caller; a
/// presented but unknown credential is rejected.
pub async fn api_auth(
    State(state): State<ApiState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let caller = match extract_token(request.headers()) {
        Some(token) => match state.api_keys.authenticate(&token).await {
            Ok(identity) => Caller::Authenticated(identity),
            Err(ApiAuthError::Invalid) => {
                return ApiError::unauthorized("Invalid or inactive API key").into_response();
            }
            Err(ApiAuthError::Unavailable(err)) => {
                return ApiError::unavailable("Credential store unavailable", err)
                    .into_response();
            }
        },
        None => anonymous_caller(&request, &state.trusted_proxies),
    };

    let label = CallerLabel::from(&caller);
    request.extensions_mut().insert(caller);

    let mut response = next.run(request).await;
    response.extensions_mut().insert(label);
    response
}

pub async fn api_admission(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(caller) = request.extensions().get::<Caller>().cloned() else {
        warn!(
            target = "papyrus::http::admission",
            "missing caller in admission middleware"
        );
        return ApiError::unauthorized("Caller could not be identified").into_response();
    };

    let path = request.uri().path().to_string();
    let decision = state
        .admission
        .admit(
            AdmissionRequest {
                caller: &caller,
                route: &path,
                preflight: request.method() == Method::OPTIONS,
            },
            OffsetDateTime::now_utc(),
        )
        .await;

    match decision {
        Ok(Admission::Exempt) => next.run(request).await,
        Ok(Admission::Allowed(snapshot)) => {
            let mut request = request;
            request.extensions_mut().insert(snapshot.clone());
            let mut response = next.run(request).await;
            insert_quota_headers(response.headers_mut(), &snapshot);
            response
        }
        Ok(Admission::Denied(denial)) => rate_limited(&caller, &denial),
        Err(AdmissionError::StoreUnavailable(err)) => {
            ApiError::unavailable("Admission control unavailable", err).into_response()
        }
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    let api_key = || {
        headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|token| !token.is_empty())
    };
    bearer.or_else(api_key).map(str::to_string)
}

/// Anonymous callers are keyed by the connecting peer. A forwarded client
/// address is honoured only when that peer is a trusted proxy.
fn anonymous_caller(request: &Request<Body>, trusted_proxies: &[IpAddr]) -> Caller {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let forwarded = || {
        request
            .headers()
            .get(FORWARDED_FOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| raw.split(',').next())
            .map(str::trim)
            .and_then(|origin| origin.parse::<IpAddr>().ok())
    };
    let origin = match peer {
        Some(peer) if trusted_proxies.contains(&peer) => forwarded().unwrap_or(peer).to_string(),
        Some(peer) => peer.to_string(),
        None => "unknown".to_string(),
    };
    Caller::Anonymous {
        origin,
        user_agent: user_agent(request),
    }
}

fn user_agent(request: &Request<Body>) -> Option<String> {
    request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn insert_quota_headers(headers: &mut HeaderMap, snapshot: &QuotaSnapshot) {
    let (Some(limit), Some(remaining), Some(reset_at)) =
        (snapshot.limit, snapshot.remaining, snapshot.reset_at)
    else {
        return;
    };
    insert_numeric(headers, LIMIT_HEADER, u64::from(limit));
    insert_numeric(headers, REMAINING_HEADER, u64::from(remaining));
    insert_numeric(
        headers,
        RESET_HEADER,
        u64::try_from(reset_at.unix_timestamp()).unwrap_or_default(),
    );
}

fn insert_numeric(headers: &mut HeaderMap, name: &'static str, value: u64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, value);
    }
}

fn rate_limited(caller: &Caller, denial: &Denial) -> Response {
    let retry_after = denial.retry_after.as_secs();
    let body = RateLimitedBody {
        status_code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
        error: "Too Many Requests".to_string(),
        message: format!(
            "Rate limit of {} requests per window exceeded",
            denial.limit
        ),
        rate_limit: RateLimitInfo {
            limit: denial.limit,
            remaining: 0,
            reset_time: denial.reset_at,
            retry_after_seconds: retry_after,
        },
        api_key: caller.identity().map(|identity| ApiKeyQuota {
            name: identity.name.clone(),
            tier: identity.tier.as_str().to_string(),
            limit: identity.quota.limit(),
        }),
        suggestion: denial.hint.message().to_string(),
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    insert_numeric(headers, LIMIT_HEADER, u64::from(denial.limit));
    insert_numeric(headers, REMAINING_HEADER, 0);
    insert_numeric(
        headers,
        RESET_HEADER,
        u64::try_from(denial.reset_at.unix_timestamp()).unwrap_or_default(),
    );
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        headers.insert(header::RETRY_AFTER, value);
    }
    ErrorReport::from_message(
        "infra::http::api::admission",
        StatusCode::TOO_MANY_REQUESTS,
        format!(
            "rate_limited: hint={} retry_after={retry_after}",
            denial.hint.as_str()
        ),
    )
    .attach(&mut response);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_wins_over_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(extract_token(&headers).as_deref(), Some("from-header"));

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-bearer"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("from-bearer"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_token(&headers).as_deref(), Some("from-header"));
    }

    fn from_peer(peer: [u8; 4], forwarded: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().header(header::USER_AGENT, "curl/8.0");
        if let Some(forwarded) = forwarded {
            builder = builder.header(FORWARDED_FOR_HEADER, forwarded);
        }
        let mut request = builder.body(Body::empty()).expect("request");
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 4000))));
        request
    }

    fn origin(caller: Caller) -> String {
        match caller {
            Caller::Anonymous { origin, .. } => origin,
            other => panic!("expected anonymous caller, got {other:?}"),
        }
    }

    #[test]
    fn untrusted_peer_is_keyed_by_its_own_address() {
        let request = from_peer([192, 0, 2, 1], Some("203.0.113.7, 10.0.0.1"));
        assert_eq!(
            anonymous_caller(&request, &[]),
            Caller::Anonymous {
                origin: "192.0.2.1".to_string(),
                user_agent: Some("curl/8.0".to_string()),
            }
        );
    }

    #[test]
    fn trusted_proxy_forwards_the_client_address() {
        let proxy = IpAddr::from([10, 0, 0, 1]);
        let request = from_peer([10, 0, 0, 1], Some("203.0.113.7, 10.0.0.1"));
        assert_eq!(origin(anonymous_caller(&request, &[proxy])), "203.0.113.7");

        // A garbled header falls back to the proxy itself.
        let request = from_peer([10, 0, 0, 1], Some("not-an-address"));
        assert_eq!(origin(anonymous_caller(&request, &[proxy])), "10.0.0.1");
    }

    #[test]
    fn missing_peer_is_unknown() {
        let request = Request::builder()
            .header(FORWARDED_FOR_HEADER, "203.0.113.7")
            .body(Body::empty())
            .expect("request");
        assert_eq!(origin(anonymous_caller(&request, &[])), "unknown");
    }
}
