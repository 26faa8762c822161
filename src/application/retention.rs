//! Periodic cleanup of finished jobs, expired idempotency tokens, elapsed
//! quota windows and finished queue rows.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use apalis::prelude::*;
use apalis_cron::Schedule;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::application::pipeline::PipelineQueue;
use crate::application::repos::{IdempotencyRepo, JobStatusRepo, QuotaRepo, RepoError};

const TARGET: &str = "papyrus::retention";

/// Marker for the cron-triggered sweep.
/// Must implement `From<chrono::DateTime<chrono::Utc>>` for apalis-cron compatibility.
#[derive(Default, Debug, Clone)]
pub struct RetentionJob;

impl From<chrono::DateTime<chrono::Utc>> for RetentionJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub jobs: u64,
    pub idempotency_records: u64,
    pub quota_windows: u64,
    pub queue_messages: u64,
}

#[derive(Clone)]
pub struct RetentionSweeper {
    jobs: Arc<dyn JobStatusRepo>,
    idempotency: Arc<dyn IdempotencyRepo>,
    quotas: Arc<dyn QuotaRepo>,
    queue: Arc<dyn PipelineQueue>,
    job_retention: Duration,
}

impl RetentionSweeper {
    pub fn new(
        jobs: Arc<dyn JobStatusRepo>,
        idempotency: Arc<dyn IdempotencyRepo>,
        quotas: Arc<dyn QuotaRepo>,
        queue: Arc<dyn PipelineQueue>,
        job_retention: Duration,
    ) -> Self {
        Self {
            jobs,
            idempotency,
            quotas,
            queue,
            job_retention,
        }
    }

    /// Purge everything that expired before `now`. Terminal jobs are kept
    /// for the retention window after their last update.
    pub async fn sweep(&self, now: OffsetDateTime) -> Result<SweepReport, RepoError> {
        let cutoff = now - self.job_retention;
        Ok(SweepReport {
            jobs: self.jobs.purge_terminal_jobs(cutoff).await?,
            idempotency_records: self.idempotency.purge_expired(now).await?,
            quota_windows: self.quotas.purge_windows(now).await?,
            queue_messages: self.queue.purge_finished(cutoff).await?,
        })
    }
}

/// Worker function registered with the cron backend.
pub async fn process_retention_job(
    _job: RetentionJob,
    sweeper: Data<RetentionSweeper>,
) -> Result<(), apalis::prelude::Error> {
    match sweeper.sweep(OffsetDateTime::now_utc()).await {
        Ok(report) if report != SweepReport::default() => {
            info!(
                target = TARGET,
                jobs = report.jobs,
                idempotency_records = report.idempotency_records,
                quota_windows = report.quota_windows,
                queue_messages = report.queue_messages,
                "retention sweep purged records"
            );
        }
        Ok(_) => {}
        Err(err) => {
            warn!(target = TARGET, error = %err, "retention sweep failed");
        }
    }
    Ok(())
}

pub fn retention_schedule(expression: &str) -> Result<Schedule, String> {
    Schedule::from_str(expression).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::repos::{IdempotencyRecord, TransitionParams};
    use crate::domain::jobs::JobStage;
    use crate::infra::memory::{MemoryQueue, MemoryRepositories};
    use uuid::Uuid;

    #[test]
    fn schedule_parses_correctly() {
        let schedule = retention_schedule("0 */15 * * * *").expect("schedule");
        let upcoming: Vec<_> = schedule.upcoming(chrono::Utc).take(3).collect();
        assert_eq!(upcoming.len(), 3);
        assert!(retention_schedule("every minute").is_err());
    }

    #[tokio::test]
    async fn sweep_keeps_active_and_recent_jobs() {
        let repos = Arc::new(MemoryRepositories::default());
        let now = OffsetDateTime::now_utc();
        let old = now - Duration::from_secs(10 * 3600);

        let finished = Uuid::new_v4();
        let active = Uuid::new_v4();
        let recent = Uuid::new_v4();
        repos.create_job(finished, old).await.expect("create");
        repos.create_job(active, old).await.expect("create");
        repos.create_job(recent, now).await.expect("create");
        repos
            .transition_job(TransitionParams::new(finished, JobStage::Failed, old))
            .await
            .expect("fail job");
        repos
            .transition_job(TransitionParams::new(recent, JobStage::Failed, now))
            .await
            .expect("fail job");
        repos
            .insert_if_absent(IdempotencyRecord {
                key: "scope:token".into(),
                job_id: finished,
                created_at: old,
                expires_at: old + Duration::from_secs(60),
            })
            .await
            .expect("insert token");

        let sweeper = RetentionSweeper::new(
            repos.clone(),
            repos.clone(),
            repos.clone(),
            Arc::new(MemoryQueue::new()),
            Duration::from_secs(3600),
        );
        let report = sweeper.sweep(now).await.expect("sweep");

        assert_eq!(report.jobs, 1);
        assert_eq!(report.idempotency_records, 1);
        assert!(repos.find_job(finished).await.expect("find").is_none());
        assert!(repos.find_job(active).await.expect("find").is_some());
        assert!(repos.find_job(recent).await.expect("find").is_some());
    }
}
