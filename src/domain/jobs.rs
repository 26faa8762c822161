//! Job lifecycle: stage enumeration, the legal stage graph, and the record
//! the status store keeps per job.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Lifecycle stage of a job.
///
/// The happy path is strictly linear; any non-terminal stage may move to
/// [`JobStage::Failed`]. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    Generating,
    Generated,
    Signing,
    Signed,
    Delivering,
    Completed,
    Failed,
}

const PIPELINE_ORDER: [JobStage; 7] = [
    JobStage::Queued,
    JobStage::Generating,
    JobStage::Generated,
    JobStage::Signing,
    JobStage::Signed,
    JobStage::Delivering,
    JobStage::Completed,
];

impl JobStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Generating => "generating",
            Self::Generated => "generated",
            Self::Signing => "signing",
            Self::Signed => "signed",
            Self::Delivering => "delivering",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// `generating`, `signing` and `delivering`: a worker owns the job.
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Generating | Self::Signing | Self::Delivering)
    }

    /// Position on the happy path; `None` for `failed`.
    pub fn ordinal(self) -> Option<usize> {
        PIPELINE_ORDER.iter().position(|stage| *stage == self)
    }

    /// Next stage on the happy path.
    pub fn successor(self) -> Option<Self> {
        let index = self.ordinal()?;
        PIPELINE_ORDER.get(index + 1).copied()
    }

    /// Whether moving from `self` to `next` is a legal forward step.
    ///
    /// Re-entering the same in-progress stage is legal: a redelivered
    /// message rewrites `generating` over `generating` after a worker crash.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        if self == next {
            return self.is_in_progress();
        }
        self.successor() == Some(next)
    }

    /// Every stage from which `next` may legally be entered.
    pub fn allowed_sources(next: Self) -> Vec<Self> {
        PIPELINE_ORDER
            .iter()
            .copied()
            .filter(|stage| stage.can_transition_to(next))
            .collect()
    }

    /// Whether `self` is `other` or lies after it on the happy path.
    pub fn has_reached(self, other: Self) -> bool {
        match (self.ordinal(), other.ordinal()) {
            (Some(current), Some(target)) => current >= target,
            _ => self == other,
        }
    }
}

impl Display for JobStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for JobStage {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "queued" => Ok(Self::Queued),
            "generating" => Ok(Self::Generating),
            "generated" => Ok(Self::Generated),
            "signing" => Ok(Self::Signing),
            "signed" => Ok(Self::Signed),
            "delivering" => Ok(Self::Delivering),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job stage `{other}`")),
        }
    }
}

/// Stage outputs merged into the stored record on a transition. Absent
/// fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageMetadata {
    pub artifact_key: Option<String>,
    pub result_url: Option<String>,
    pub error: Option<String>,
}

impl StageMetadata {
    pub fn artifact(key: impl Into<String>) -> Self {
        Self {
            artifact_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn delivered(url: impl Into<String>) -> Self {
        Self {
            result_url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: Uuid,
    pub stage: JobStage,
    pub artifact_key: Option<String>,
    pub result_url: Option<String>,
    pub error: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl JobRecord {
    pub fn queued(id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            id,
            stage: JobStage::Queued,
            artifact_key: None,
            result_url: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a transition in memory. Callers validate legality first.
    pub fn apply(&mut self, stage: JobStage, metadata: StageMetadata, now: OffsetDateTime) {
        self.stage = stage;
        if let Some(key) = metadata.artifact_key {
            self.artifact_key = Some(key);
        }
        if let Some(url) = metadata.result_url {
            self.result_url = Some(url);
        }
        if let Some(error) = metadata.error {
            self.error = Some(error);
        }
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_linear() {
        let mut stage = JobStage::Queued;
        let mut seen = vec![stage];
        while let Some(next) = stage.successor() {
            assert!(stage.can_transition_to(next));
            stage = next;
            seen.push(stage);
        }
        assert_eq!(seen, PIPELINE_ORDER.to_vec());
    }

    #[test]
    fn skipping_and_reverting_are_rejected() {
        assert!(!JobStage::Queued.can_transition_to(JobStage::Generated));
        assert!(!JobStage::Signed.can_transition_to(JobStage::Signing));
        assert!(!JobStage::Generated.can_transition_to(JobStage::Generated));
    }

    #[test]
    fn terminal_stages_accept_nothing() {
        for next in PIPELINE_ORDER.iter().copied().chain([JobStage::Failed]) {
            assert!(!JobStage::Completed.can_transition_to(next));
            assert!(!JobStage::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn in_progress_stage_can_be_reentered() {
        assert!(JobStage::Generating.can_transition_to(JobStage::Generating));
        assert_eq!(
            JobStage::allowed_sources(JobStage::Generating),
            vec![JobStage::Queued, JobStage::Generating]
        );
    }

    #[test]
    fn failed_is_reachable_from_every_live_stage() {
        let sources = JobStage::allowed_sources(JobStage::Failed);
        assert_eq!(sources.len(), 6);
        assert!(!sources.contains(&JobStage::Completed));
    }

    #[test]
    fn merge_keeps_unrelated_fields() {
        let now = OffsetDateTime::now_utc();
        let mut record = JobRecord::queued(Uuid::new_v4(), now);
        record.apply(JobStage::Generated, StageMetadata::artifact("3/a.pdf"), now);
        record.apply(JobStage::Signed, StageMetadata::artifact("3/signed-a.pdf"), now);
        record.apply(JobStage::Completed, StageMetadata::delivered("https://x"), now);

        assert_eq!(record.artifact_key.as_deref(), Some("3/signed-a.pdf"));
        assert_eq!(record.result_url.as_deref(), Some("https://x"));
        assert!(record.error.is_none());
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in PIPELINE_ORDER.iter().copied().chain([JobStage::Failed]) {
            assert_eq!(JobStage::try_from(stage.as_str()), Ok(stage));
        }
        assert!(JobStage::try_from("paused").is_err());
    }
}
