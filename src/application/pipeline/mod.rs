//! Three-stage job pipeline: generate, sign, deliver.
//!
//! Each stage has its own queue. A stage's message is produced only
//! after the previous stage wrote its "done" status, so a job's stages run
//! strictly in order while different jobs proceed in parallel.

mod consumer;
mod queue;
mod retry;
mod service;
mod stages;
mod worker;

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::documents::DocumentRequest;
use crate::domain::jobs::JobStage;

pub use consumer::{
    ConsumerSettings, Disposition, RetryingConsumer, StageError, StageHandler, StageOutcome,
    StageRunner,
};
pub use queue::{Delivery, PipelineQueue, Reservation, ReservingQueue};
pub use retry::{Backoff, RetryPolicy};
pub use service::{JobResult, PipelineService, ResultError, SubmitError, Submission};
pub use stages::{DeliverStage, GenerateStage, SignStage, artifact_filename};
pub use worker::{StageJob, StageWorkerContext, process_stage_job};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generate,
    Sign,
    Deliver,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Self::Generate, Self::Sign, Self::Deliver];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Sign => "sign",
            Self::Deliver => "deliver",
        }
    }

    /// Durable queue backing this stage.
    pub fn queue_name(self) -> &'static str {
        match self {
            Self::Generate => "pdf-generation",
            Self::Sign => "pdf-sign",
            Self::Deliver => "pdf-deliver",
        }
    }

    /// Job stage at the moment this stage's message is produced.
    pub fn entry(self) -> JobStage {
        match self {
            Self::Generate => JobStage::Queued,
            Self::Sign => JobStage::Generated,
            Self::Deliver => JobStage::Signed,
        }
    }

    pub fn in_progress(self) -> JobStage {
        match self {
            Self::Generate => JobStage::Generating,
            Self::Sign => JobStage::Signing,
            Self::Deliver => JobStage::Delivering,
        }
    }

    pub fn done(self) -> JobStage {
        match self {
            Self::Generate => JobStage::Generated,
            Self::Sign => JobStage::Signed,
            Self::Deliver => JobStage::Completed,
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Generate => Some(Self::Sign),
            Self::Sign => Some(Self::Deliver),
            Self::Deliver => None,
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Stage {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == value || stage.queue_name() == value)
            .ok_or_else(|| format!("unknown pipeline stage `{value}`"))
    }
}

/// Queue envelope. `payload` stays opaque until the owning stage decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMessage {
    pub job_id: Uuid,
    pub stage: Stage,
    pub payload: Value,
}

/// Payload of the sign and deliver stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub artifact_key: String,
}

impl StageMessage {
    pub fn generate(job_id: Uuid, request: &DocumentRequest) -> Result<Self, serde_json::Error> {
        Ok(Self {
            job_id,
            stage: Stage::Generate,
            payload: serde_json::to_value(request)?,
        })
    }

    pub fn artifact(job_id: Uuid, stage: Stage, artifact_key: impl Into<String>) -> Self {
        Self {
            job_id,
            stage,
            payload: serde_json::json!({ "artifact_key": artifact_key.into() }),
        }
    }
}
