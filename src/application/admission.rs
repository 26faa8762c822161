//! Per-caller admission control over fixed quota windows.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error};

use crate::application::repos::{QuotaRepo, RepoError};
use crate::domain::api_keys::{Identity, Quota};

const FINGERPRINT_LEN: usize = 8;

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Authenticated(Identity),
    Anonymous {
        origin: String,
        user_agent: Option<String>,
    },
}

impl Caller {
    /// Key under which hits are counted. Authenticated callers are keyed by
    /// credential hash; anonymous callers by origin plus a truncated
    /// client-signature so two clients behind one address keep apart buckets.
    pub fn quota_key(&self) -> String {
        match self {
            Self::Authenticated(identity) => format!("api_key:{}", identity.key_hash),
            Self::Anonymous { origin, user_agent } => {
                let encoded = STANDARD.encode(user_agent.as_deref().unwrap_or("unknown"));
                let fingerprint: String = encoded.chars().take(FINGERPRINT_LEN).collect();
                format!("ip:{origin}:{fingerprint}")
            }
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Authenticated(identity) => Some(identity),
            Self::Anonymous { .. } => None,
        }
    }

    /// Label used to scope per-caller state such as idempotency tokens.
    pub fn scope(&self) -> String {
        match self {
            Self::Authenticated(identity) => identity.key_id.to_string(),
            Self::Anonymous { .. } => self.quota_key(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    pub window: Duration,
    pub anonymous_limit: NonZeroU32,
    pub exempt_routes: Vec<String>,
}

impl AdmissionPolicy {
    fn is_exempt(&self, route: &str) -> bool {
        self.exempt_routes.iter().any(|exempt| {
            let exempt = exempt.trim_end_matches('/');
            route == exempt
                || route
                    .strip_prefix(exempt)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    fn quota_for(&self, caller: &Caller) -> Quota {
        match caller {
            Caller::Authenticated(identity) => identity.quota,
            Caller::Anonymous { .. } => Quota::Limited(self.anonymous_limit),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub caller: &'a Caller,
    pub route: &'a str,
    pub preflight: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Route is on the allow-list; no accounting happened.
    Exempt,
    Allowed(QuotaSnapshot),
    Denied(Denial),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaSnapshot {
    /// `None` for unlimited callers.
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub limit: u32,
    pub retry_after: Duration,
    pub reset_at: OffsetDateTime,
    pub hint: DenialHint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialHint {
    MissingCredential,
    UpgradeTier,
    SpaceOutRequests,
}

impl DenialHint {
    fn for_caller(caller: &Caller) -> Self {
        match caller.identity().map(|identity| identity.tier) {
            None => Self::MissingCredential,
            Some(tier) if tier.suggests_upgrade() => Self::UpgradeTier,
            Some(_) => Self::SpaceOutRequests,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::UpgradeTier => "upgrade_tier",
            Self::SpaceOutRequests => "space_out_requests",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::MissingCredential => {
                "Send a valid API key in the x-api-key header to receive a higher limit."
            }
            Self::UpgradeTier => "Upgrade to a premium API key for a higher request limit.",
            Self::SpaceOutRequests => {
                "Spread requests over time or contact support for a higher limit."
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("quota store unavailable")]
    StoreUnavailable(#[source] RepoError),
}

#[derive(Clone)]
pub struct AdmissionController {
    quotas: Arc<dyn QuotaRepo>,
    policy: AdmissionPolicy,
}

impl AdmissionController {
    pub fn new(quotas: Arc<dyn QuotaRepo>, policy: AdmissionPolicy) -> Self {
        Self { quotas, policy }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Decide whether `request` may proceed. Fails closed: a quota store
    /// error is returned to the caller rather than treated as an allow.
    pub async fn admit(
        &self,
        request: AdmissionRequest<'_>,
        now: OffsetDateTime,
    ) -> Result<Admission, AdmissionError> {
        if request.preflight || self.policy.is_exempt(request.route) {
            return Ok(Admission::Exempt);
        }

        let limit = match self.policy.quota_for(request.caller) {
            Quota::Unlimited => {
                return Ok(Admission::Allowed(QuotaSnapshot {
                    limit: None,
                    remaining: None,
                    reset_at: None,
                }));
            }
            Quota::Limited(limit) => limit.get(),
        };

        let (window_start, reset_at) = self.window_bounds(now);
        let key = request.caller.quota_key();
        let count = self
            .quotas
            .increment_window(&key, window_start, reset_at)
            .await
            .map_err(|err| {
                counter!("papyrus_admission_store_failure_total").increment(1);
                error!(
                    target = "papyrus::admission",
                    key = %key,
                    error = %err,
                    "quota store unavailable; denying request"
                );
                AdmissionError::StoreUnavailable(err)
            })?;

        if count > limit {
            let hint = DenialHint::for_caller(request.caller);
            counter!("papyrus_admission_denied_total", "hint" => hint.as_str()).increment(1);
            debug!(
                target = "papyrus::admission",
                key = %key,
                route = request.route,
                limit,
                count,
                "request denied"
            );
            return Ok(Admission::Denied(Denial {
                limit,
                retry_after: retry_after(now, reset_at),
                reset_at,
                hint,
            }));
        }

        Ok(Admission::Allowed(QuotaSnapshot {
            limit: Some(limit),
            remaining: Some(limit - count),
            reset_at: Some(reset_at),
        }))
    }

    fn window_bounds(&self, now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
        let window_secs = i64::try_from(self.policy.window.as_secs())
            .unwrap_or(i64::MAX)
            .max(1);
        let now_secs = now.unix_timestamp();
        let start_secs = now_secs - now_secs.rem_euclid(window_secs);
        let start = OffsetDateTime::from_unix_timestamp(start_secs).unwrap_or(now);
        (start, start + time::Duration::seconds(window_secs))
    }
}

/// Whole seconds until `reset_at`, rounded up and never zero.
fn retry_after(now: OffsetDateTime, reset_at: OffsetDateTime) -> Duration {
    let remaining = reset_at - now;
    let mut seconds = remaining.whole_seconds().max(0);
    if remaining.subsec_nanoseconds() > 0 {
        seconds += 1;
    }
    Duration::from_secs(u64::try_from(seconds.max(1)).unwrap_or(1))
}
