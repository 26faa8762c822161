//! Domain types for API keys, tiers and request quotas.

use std::fmt::{Display, Formatter};
use std::num::NonZeroU32;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Requests allowed per admission window.
///
/// Persisted as an integer where `0` means unlimited; that sentinel is
/// converted at the storage boundary and never used in arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quota {
    Unlimited,
    Limited(NonZeroU32),
}

impl Quota {
    pub fn from_stored(value: i32) -> Self {
        u32::try_from(value)
            .ok()
            .and_then(NonZeroU32::new)
            .map_or(Self::Unlimited, Self::Limited)
    }

    pub fn to_stored(self) -> i32 {
        match self {
            Self::Unlimited => 0,
            Self::Limited(limit) => i32::try_from(limit.get()).unwrap_or(i32::MAX),
        }
    }

    pub fn limit(self) -> Option<u32> {
        match self {
            Self::Unlimited => None,
            Self::Limited(limit) => Some(limit.get()),
        }
    }
}

impl Display for Quota {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unlimited => f.write_str("unlimited"),
            Self::Limited(limit) => write!(f, "{limit}/window"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyTier {
    Basic,
    Premium,
    Unlimited,
}

impl ApiKeyTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Unlimited => "unlimited",
        }
    }

    pub fn default_quota(self) -> Quota {
        match self {
            Self::Basic => Quota::Limited(NonZeroU32::MIN.saturating_add(9)),
            Self::Premium => Quota::Limited(NonZeroU32::MIN.saturating_add(99)),
            Self::Unlimited => Quota::Unlimited,
        }
    }

    /// Whether a denied caller on this tier should be told to upgrade.
    pub fn suggests_upgrade(self) -> bool {
        matches!(self, Self::Basic)
    }
}

impl Display for ApiKeyTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiKeyTier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Self::Basic),
            "premium" => Ok(Self::Premium),
            "unlimited" => Ok(Self::Unlimited),
            _ => Err(()),
        }
    }
}

/// Stored API key. The raw secret is never kept; only its SHA-256 hex hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub tier: ApiKeyTier,
    pub quota: Quota,
    pub active: bool,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
}

/// An authenticated caller as seen by admission control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key_id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub tier: ApiKeyTier,
    pub quota: Quota,
}

impl From<ApiKeyRecord> for Identity {
    fn from(record: ApiKeyRecord) -> Self {
        Self {
            key_id: record.id,
            name: record.name,
            key_hash: record.key_hash,
            tier: record.tier,
            quota: record.quota,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_unlimited_only_at_the_boundary() {
        assert_eq!(Quota::from_stored(0), Quota::Unlimited);
        assert_eq!(Quota::from_stored(-4), Quota::Unlimited);
        assert_eq!(Quota::from_stored(7).limit(), Some(7));
        assert_eq!(Quota::Unlimited.to_stored(), 0);
    }

    #[test]
    fn tier_defaults() {
        assert_eq!(ApiKeyTier::Basic.default_quota().limit(), Some(10));
        assert_eq!(ApiKeyTier::Premium.default_quota().limit(), Some(100));
        assert_eq!(ApiKeyTier::Unlimited.default_quota(), Quota::Unlimited);
    }
}
