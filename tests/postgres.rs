use std::num::NonZeroU32;
use std::time::Duration;

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use papyrus::application::api_keys::{ApiKeyService, IssueApiKeyCommand};
use papyrus::application::pipeline::{PipelineQueue, Stage, StageMessage};
use papyrus::application::repos::{
    IdempotencyRecord, IdempotencyRepo, InsertOutcome, JobStatusRepo, QuotaRepo, RepoError,
    TransitionParams,
};
use papyrus::domain::api_keys::{ApiKeyTier, Quota};
use papyrus::domain::jobs::{JobStage, StageMetadata};
use papyrus::infra::db::{ApalisStageQueue, PostgresRepositories};

#[sqlx::test(migrations = "./migrations")]
async fn job_transitions_follow_the_state_machine(pool: PgPool) {
    let repos = PostgresRepositories::new(pool);
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();

    let created = repos.create_job(id, now).await.expect("create job");
    assert_eq!(created.stage, JobStage::Queued);
    assert!(matches!(
        repos.create_job(id, now).await,
        Err(RepoError::Duplicate { .. })
    ));

    repos
        .transition_job(TransitionParams::new(id, JobStage::Generating, now).expecting(JobStage::Queued))
        .await
        .expect("queued -> generating");
    let stale = repos
        .transition_job(TransitionParams::new(id, JobStage::Generating, now).expecting(JobStage::Queued))
        .await;
    assert!(matches!(stale, Err(RepoError::Conflict { .. })));

    let skipped = repos
        .transition_job(TransitionParams::new(id, JobStage::Completed, now))
        .await;
    assert!(matches!(skipped, Err(RepoError::Conflict { .. })));

    let generated = repos
        .transition_job(
            TransitionParams::new(id, JobStage::Generated, now)
                .expecting(JobStage::Generating)
                .with_metadata(StageMetadata::artifact("1/report.pdf")),
        )
        .await
        .expect("generating -> generated");
    assert_eq!(generated.artifact_key.as_deref(), Some("1/report.pdf"));

    let failed = repos
        .transition_job(
            TransitionParams::new(id, JobStage::Failed, now)
                .with_metadata(StageMetadata::failure("signing key missing")),
        )
        .await
        .expect("generated -> failed");
    assert_eq!(failed.error.as_deref(), Some("signing key missing"));
    assert_eq!(failed.artifact_key.as_deref(), Some("1/report.pdf"));

    let after_terminal = repos
        .transition_job(TransitionParams::new(id, JobStage::Signing, now))
        .await;
    assert!(matches!(after_terminal, Err(RepoError::Conflict { .. })));

    assert_eq!(
        repos
            .purge_terminal_jobs(now + time::Duration::seconds(1))
            .await
            .expect("purge"),
        1
    );
    assert!(repos.find_job(id).await.expect("find").is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn stage_queue_counts_and_purges_apalis_rows(pool: PgPool) {
    ApalisStageQueue::setup(&pool).await.expect("apalis schema");
    let queue = ApalisStageQueue::new(pool.clone(), NonZeroU32::new(3).expect("attempts"));
    let job_id = Uuid::new_v4();
    let message = StageMessage::artifact(job_id, Stage::Sign, "0/doc.pdf");

    queue.enqueue(message.clone()).await.expect("enqueue");
    queue
        .enqueue_retry(message, 2, Duration::from_secs(60))
        .await
        .expect("scheduled retry");
    assert_eq!(queue.depth(Stage::Sign).await.expect("depth"), 2);
    assert_eq!(queue.depth(Stage::Generate).await.expect("depth"), 0);

    let attempts: Vec<String> = sqlx::query_scalar(
        "SELECT job->>'attempt' FROM apalis.jobs WHERE job_type = $1 ORDER BY run_at",
    )
    .bind(Stage::Sign.queue_name())
    .fetch_all(&pool)
    .await
    .expect("payloads");
    assert_eq!(attempts, ["1", "2"]);

    sqlx::query(
        "UPDATE apalis.jobs SET status = 'Done', done_at = NOW() - INTERVAL '2 hours' \
         WHERE job_type = $1 AND run_at <= NOW()",
    )
    .bind(Stage::Sign.queue_name())
    .execute(&pool)
    .await
    .expect("finish first row");
    assert_eq!(queue.depth(Stage::Sign).await.expect("depth"), 1);

    let purged = queue
        .purge_finished(OffsetDateTime::now_utc() - Duration::from_secs(3600))
        .await
        .expect("purge");
    assert_eq!(purged, 1);
    assert_eq!(queue.depth(Stage::Sign).await.expect("depth"), 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn quota_windows_count_per_key(pool: PgPool) {
    let repos = PostgresRepositories::new(pool);
    let start = OffsetDateTime::now_utc().replace_nanosecond(0).expect("truncate");
    let expires = start + time::Duration::minutes(1);

    for expected in 1..=3 {
        let count = repos
            .increment_window("anon:198.51.100.1", start, expires)
            .await
            .expect("increment");
        assert_eq!(count, expected);
    }
    assert_eq!(
        repos
            .increment_window("anon:198.51.100.2", start, expires)
            .await
            .expect("other key"),
        1
    );
    assert_eq!(
        repos
            .purge_windows(expires + time::Duration::seconds(1))
            .await
            .expect("purge"),
        2
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn idempotency_insert_is_set_if_absent(pool: PgPool) {
    let repos = PostgresRepositories::new(pool);
    let now = OffsetDateTime::now_utc();
    let record = IdempotencyRecord {
        key: "key-1:order-7".to_string(),
        job_id: Uuid::new_v4(),
        created_at: now,
        expires_at: now + time::Duration::hours(1),
    };

    assert_eq!(
        repos
            .insert_if_absent(record.clone())
            .await
            .expect("insert"),
        InsertOutcome::Inserted
    );
    let competing = IdempotencyRecord {
        job_id: Uuid::new_v4(),
        ..record.clone()
    };
    match repos.insert_if_absent(competing).await.expect("second insert") {
        InsertOutcome::Existing(existing) => assert_eq!(existing.job_id, record.job_id),
        InsertOutcome::Inserted => panic!("second insert must not win"),
    }

    // Releasing with a different job id leaves the binding alone.
    repos
        .release(&record.key, Uuid::new_v4())
        .await
        .expect("foreign release");
    assert!(
        repos
            .find_live(&record.key, now)
            .await
            .expect("find")
            .is_some()
    );

    assert!(
        repos
            .find_live(&record.key, record.expires_at + time::Duration::seconds(1))
            .await
            .expect("find expired")
            .is_none()
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn api_keys_authenticate_until_deactivated(pool: PgPool) {
    let repos = std::sync::Arc::new(PostgresRepositories::new(pool));
    let service = ApiKeyService::new(repos);

    let issued = service
        .issue(IssueApiKeyCommand {
            name: "billing".to_string(),
            tier: ApiKeyTier::Premium,
            quota: None,
        })
        .await
        .expect("issue");
    assert_eq!(issued.record.quota, ApiKeyTier::Premium.default_quota());
    assert_ne!(issued.record.key_hash, issued.secret);

    let identity = service
        .authenticate(&issued.secret)
        .await
        .expect("authenticate");
    assert_eq!(identity.key_id, issued.record.id);
    assert!(matches!(identity.quota, Quota::Limited(_)));

    let listed = service.list().await.expect("list");
    assert_eq!(listed.len(), 1);

    service
        .deactivate(issued.record.id)
        .await
        .expect("deactivate");
    assert!(service.authenticate(&issued.secret).await.is_err());
}
