use std::{net::SocketAddr, num::NonZeroU32, process, sync::Arc};

use apalis::{
    layers::WorkerBuilderExt,
    prelude::{Monitor, WorkerBuilder, WorkerFactoryFn},
};
use apalis_cron::{CronStream, Schedule};
use futures::future::join_all;
use papyrus::{
    application::{
        admission::{AdmissionController, AdmissionPolicy},
        api_keys::{ApiKeyError, ApiKeyService, IssueApiKeyCommand},
        error::AppError,
        idempotency::IdempotencyCache,
        pipeline::{
            Backoff, ConsumerSettings, DeliverStage, GenerateStage, PipelineQueue, PipelineService,
            RetryPolicy, RetryingConsumer, SignStage, Stage, StageHandler, StageRunner,
            StageWorkerContext, process_stage_job,
        },
        pool::ResourcePool,
        render::DocumentRenderer,
        repos::{ApiKeysRepo, HealthProbe, IdempotencyRepo, JobStatusRepo, QuotaRepo},
        retention::{RetentionSweeper, process_retention_job, retention_schedule},
    },
    config,
    domain::api_keys::Quota,
    infra::{
        db::{ApalisStageQueue, PostgresRepositories},
        error::InfraError,
        http::{self, ApiState, HttpState, RouterState},
        memory::{MemoryQueue, MemoryRepositories},
        render::{TemplateCache, TypstRenderer, WorkspaceManager},
        storage::FilesystemObjectStore,
        telemetry,
    },
};
use time::format_description::well_known::Rfc3339;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use uuid::Uuid;

const TARGET: &str = "papyrus::main";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_service(settings, Role::All).await,
        config::Command::Api(_) => run_service(settings, Role::Api).await,
        config::Command::Worker(args) => {
            run_service(settings, Role::Worker(stage_for(args.stage))).await
        }
        config::Command::Keys(args) => run_keys(settings, args).await,
    }
}

/// Which parts of the service this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    All,
    Api,
    Worker(Stage),
}

impl Role {
    fn runs_api(self) -> bool {
        matches!(self, Self::All | Self::Api)
    }

    fn stages(self) -> Vec<Stage> {
        match self {
            Self::All => Stage::ALL.to_vec(),
            Self::Api => Vec::new(),
            Self::Worker(stage) => vec![stage],
        }
    }

    /// The retention sweep runs next to the API, which owns admission and
    /// idempotency state.
    fn runs_sweeper(self) -> bool {
        self.runs_api()
    }
}

fn stage_for(stage: config::WorkerStage) -> Stage {
    match stage {
        config::WorkerStage::Generate => Stage::Generate,
        config::WorkerStage::Sign => Stage::Sign,
        config::WorkerStage::Deliver => Stage::Deliver,
    }
}

/// How stage messages reach their handlers.
enum StageTransport {
    /// Polled in-process by [`RetryingConsumer`]s.
    Memory(Arc<MemoryQueue>),
    /// Apalis workers over the Postgres job table.
    Apalis(ApalisStageQueue),
}

struct Backends {
    jobs: Arc<dyn JobStatusRepo>,
    queue: Arc<dyn PipelineQueue>,
    transport: StageTransport,
    quotas: Arc<dyn QuotaRepo>,
    idempotency: Arc<dyn IdempotencyRepo>,
    api_keys: Arc<dyn ApiKeysRepo>,
    health: Arc<dyn HealthProbe>,
}

impl Backends {
    fn postgres(repositories: Arc<PostgresRepositories>, max_attempts: NonZeroU32) -> Self {
        let stage_queue = ApalisStageQueue::new(repositories.pool().clone(), max_attempts);
        Self {
            jobs: repositories.clone(),
            queue: Arc::new(stage_queue.clone()),
            transport: StageTransport::Apalis(stage_queue),
            quotas: repositories.clone(),
            idempotency: repositories.clone(),
            api_keys: repositories.clone(),
            health: repositories,
        }
    }

    fn memory() -> Self {
        let repositories = Arc::new(MemoryRepositories::new());
        let queue = Arc::new(MemoryQueue::new());
        Self {
            jobs: repositories.clone(),
            queue: queue.clone(),
            transport: StageTransport::Memory(queue),
            quotas: repositories.clone(),
            idempotency: repositories.clone(),
            api_keys: repositories.clone(),
            health: repositories,
        }
    }
}

struct Components {
    pipeline: Arc<PipelineService>,
    api_keys: Arc<ApiKeyService>,
    admission: Arc<AdmissionController>,
    templates: Arc<TemplateCache>,
    renderer: Arc<TypstRenderer>,
    files: Arc<FilesystemObjectStore>,
    pool: ResourcePool<WorkspaceManager>,
}

async fn connect_postgres(
    settings: &config::Settings,
) -> Result<Option<Arc<PostgresRepositories>>, AppError> {
    let Some(database_url) = settings.database.url.as_ref() else {
        return Ok(None);
    };

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(Some(Arc::new(PostgresRepositories::new(pool))))
}

async fn init_backends(settings: &config::Settings, role: Role) -> Result<Backends, AppError> {
    match connect_postgres(settings).await? {
        Some(repositories) => Ok(Backends::postgres(
            repositories,
            settings.pipeline.max_attempts,
        )),
        None => {
            if role != Role::All {
                return Err(AppError::from(InfraError::configuration(
                    "split api/worker roles need database.url so processes share state",
                )));
            }
            warn!(
                target = TARGET,
                "no database configured; using in-memory backends, state is lost on exit"
            );
            Ok(Backends::memory())
        }
    }
}

fn build_components(
    settings: &config::Settings,
    backends: &Backends,
) -> Result<Components, AppError> {
    let templates = Arc::new(TemplateCache::new(
        settings.render.templates_dir.clone(),
        settings.render.template_cache_capacity,
    ));
    let renderer = Arc::new(TypstRenderer::new(
        settings.render.binary.clone(),
        templates.clone(),
        settings.render.timeout,
    ));

    let secret = match settings.storage.signing_secret.clone() {
        Some(secret) => secret,
        None => {
            warn!(
                target = TARGET,
                "storage.signing_secret is not set; generated a process-local secret, \
                 download links will not survive a restart"
            );
            format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
        }
    };
    let files = Arc::new(
        FilesystemObjectStore::new(
            settings.storage.root.clone(),
            settings.storage.public_base_url.clone(),
            settings.storage.prefixes.get(),
            secret,
        )
        .map_err(|err| AppError::from(InfraError::from(err)))?,
    );

    let workspace_dir = settings
        .pool
        .workspace_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let pool = ResourcePool::new(
        WorkspaceManager::new(workspace_dir),
        settings.pool.max_resources,
    );

    let idempotency = IdempotencyCache::new(backends.idempotency.clone(), settings.idempotency.ttl);
    let pipeline = Arc::new(PipelineService::new(
        backends.jobs.clone(),
        backends.queue.clone(),
        idempotency,
    ));
    let admission = Arc::new(AdmissionController::new(
        backends.quotas.clone(),
        AdmissionPolicy {
            window: settings.admission.window,
            anonymous_limit: settings.admission.anonymous_limit,
            exempt_routes: settings.admission.exempt_routes.clone(),
        },
    ));
    let api_keys = Arc::new(ApiKeyService::new(backends.api_keys.clone()));

    Ok(Components {
        pipeline,
        api_keys,
        admission,
        templates,
        renderer,
        files,
        pool,
    })
}

fn consumer_settings(pipeline: &config::PipelineSettings, stage: Stage) -> ConsumerSettings {
    let concurrency = match stage {
        Stage::Generate => pipeline.generate_concurrency,
        Stage::Sign => pipeline.sign_concurrency,
        Stage::Deliver => pipeline.deliver_concurrency,
    };
    ConsumerSettings {
        concurrency,
        visibility: pipeline.visibility,
        poll_interval: pipeline.poll_interval,
        retry: RetryPolicy {
            max_attempts: pipeline.max_attempts,
            backoff: Backoff {
                initial: pipeline.backoff_initial,
                multiplier: pipeline.backoff_multiplier,
                max: pipeline.backoff_max,
            },
        },
    }
}

fn build_handler(
    stage: Stage,
    settings: &config::Settings,
    backends: &Backends,
    components: &Components,
) -> Arc<dyn StageHandler> {
    match stage {
        Stage::Generate => Arc::new(GenerateStage::new(
            backends.jobs.clone(),
            backends.queue.clone(),
            components.pool.clone(),
            components.renderer.clone(),
            components.files.clone(),
            settings.pool.acquire_timeout,
        )),
        Stage::Sign => Arc::new(SignStage::new(
            backends.jobs.clone(),
            backends.queue.clone(),
            components.files.clone(),
        )),
        Stage::Deliver => Arc::new(DeliverStage::new(
            backends.jobs.clone(),
            backends.queue.clone(),
            components.files.clone(),
            settings.storage.url_ttl,
        )),
    }
}

async fn run_service(settings: config::Settings, role: Role) -> Result<(), AppError> {
    let backends = init_backends(&settings, role).await?;
    let components = build_components(&settings, &backends)?;

    if !role.stages().is_empty() || role.runs_api() {
        match components.renderer.check().await {
            Ok(version) => info!(target = TARGET, version = %version, "typesetter available"),
            Err(err) => warn!(target = TARGET, error = %err, "typesetter check failed"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumers: Vec<JoinHandle<()>> = Vec::new();
    let mut monitor = Monitor::new().shutdown_timeout(settings.server.graceful_shutdown);
    let mut monitored = false;

    for stage in role.stages() {
        let handler = build_handler(stage, &settings, &backends, &components);
        let consumer_settings = consumer_settings(&settings.pipeline, stage);
        match &backends.transport {
            StageTransport::Memory(queue) => {
                let consumer = RetryingConsumer::new(
                    handler,
                    queue.clone(),
                    backends.jobs.clone(),
                    consumer_settings,
                );
                let shutdown = shutdown_rx.clone();
                consumers.push(tokio::spawn(async move { consumer.run(shutdown).await }));
            }
            StageTransport::Apalis(stage_queue) => {
                let context = StageWorkerContext {
                    runner: Arc::new(StageRunner::new(
                        handler,
                        backends.jobs.clone(),
                        consumer_settings.retry,
                    )),
                    queue: backends.queue.clone(),
                };
                let worker = WorkerBuilder::new(format!("pdf-{stage}-worker"))
                    .concurrency(consumer_settings.concurrency.get())
                    .data(context)
                    .backend(stage_queue.storage(
                        stage,
                        consumer_settings.visibility,
                        consumer_settings.poll_interval,
                    ))
                    .build_fn(process_stage_job);
                monitor = monitor.register(worker);
                monitored = true;
            }
        }
    }

    if role.runs_sweeper() {
        let (sweeper, schedule) = retention_sweeper(&settings, &backends)?;
        let retention_worker = WorkerBuilder::new("retention-sweeper")
            .data(sweeper)
            .backend(CronStream::new(schedule))
            .build_fn(process_retention_job);
        monitor = monitor.register(retention_worker);
        monitored = true;
    }

    let monitor_handle = monitored.then(|| {
        let mut stop = shutdown_rx.clone();
        tokio::spawn(async move {
            let signal = async move {
                let _ = stop.wait_for(|stopped| *stopped).await;
                Ok::<(), std::io::Error>(())
            };
            if let Err(err) = monitor.run_with_signal(signal).await {
                error!(target = TARGET, error = %err, "job monitor stopped");
            }
        })
    });

    info!(target = TARGET, role = ?role, "papyrus started");

    let result = if role.runs_api() {
        serve_http(&settings, &backends, &components).await
    } else {
        shutdown_signal().await;
        Ok(())
    };

    info!(target = TARGET, "shutting down");
    let _ = shutdown_tx.send(true);
    let grace = settings.server.graceful_shutdown;
    if let Some(handle) = monitor_handle {
        consumers.push(handle);
    }
    if tokio::time::timeout(grace, join_all(consumers)).await.is_err() {
        warn!(
            target = TARGET,
            grace_secs = grace.as_secs(),
            "stage workers did not stop in time; unfinished messages will be redelivered"
        );
    }
    let abandoned = components.pool.destroy_all(grace).await;
    if abandoned > 0 {
        warn!(target = TARGET, abandoned, "render contexts still leased at exit");
    }

    result
}

fn retention_sweeper(
    settings: &config::Settings,
    backends: &Backends,
) -> Result<(RetentionSweeper, Schedule), AppError> {
    let schedule = retention_schedule(&settings.retention.schedule)
        .map_err(|err| AppError::from(InfraError::configuration(err)))?;
    let sweeper = RetentionSweeper::new(
        backends.jobs.clone(),
        backends.idempotency.clone(),
        backends.quotas.clone(),
        backends.queue.clone(),
        settings.retention.job_retention,
    );
    Ok((sweeper, schedule))
}

async fn serve_http(
    settings: &config::Settings,
    backends: &Backends,
    components: &Components,
) -> Result<(), AppError> {
    let router_state = RouterState {
        http: HttpState {
            health: backends.health.clone(),
            renderer: components.renderer.clone(),
            templates: components.templates.clone(),
            files: components.files.clone(),
        },
        api: ApiState {
            pipeline: components.pipeline.clone(),
            api_keys: components.api_keys.clone(),
            admission: components.admission.clone(),
            trusted_proxies: Arc::from(settings.admission.trusted_proxies.as_slice()),
        },
    };
    let app = http::build_app(router_state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(target = TARGET, addr = %settings.server.addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = TARGET, error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = TARGET, error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_keys(settings: config::Settings, args: config::KeysArgs) -> Result<(), AppError> {
    let repositories = connect_postgres(&settings).await?.ok_or_else(|| {
        AppError::from(InfraError::configuration(
            "keys commands need database.url; in-memory keys would be lost on exit",
        ))
    })?;
    let service = ApiKeyService::new(repositories);

    match args.command {
        config::KeysCommand::Issue(issue) => {
            let quota = issue
                .quota
                .map(|value| NonZeroU32::new(value).map_or(Quota::Unlimited, Quota::Limited));
            let issued = service
                .issue(IssueApiKeyCommand {
                    name: issue.name,
                    tier: issue.tier,
                    quota,
                })
                .await
                .map_err(api_key_error)?;
            info!(
                target = "papyrus::keys",
                key_id = %issued.record.id,
                tier = %issued.record.tier,
                "api key issued"
            );
            println!("id:     {}", issued.record.id);
            println!("name:   {}", issued.record.name);
            println!("tier:   {}", issued.record.tier);
            println!("quota:  {}", issued.record.quota);
            println!("secret: {}", issued.secret);
            println!("Store the secret now; it cannot be shown again.");
        }
        config::KeysCommand::List => {
            let keys = service.list().await.map_err(api_key_error)?;
            for key in keys {
                let created = key
                    .created_at
                    .format(&Rfc3339)
                    .unwrap_or_else(|_| key.created_at.to_string());
                let last_used = key
                    .last_used_at
                    .and_then(|at| at.format(&Rfc3339).ok())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{created}\t{last_used}",
                    key.id,
                    key.name,
                    key.tier,
                    key.quota,
                    if key.active { "active" } else { "inactive" },
                );
            }
        }
        config::KeysCommand::Deactivate { id } => {
            service.deactivate(id).await.map_err(api_key_error)?;
            info!(target = "papyrus::keys", key_id = %id, "api key deactivated");
            println!("deactivated {id}");
        }
    }
    Ok(())
}

fn api_key_error(err: ApiKeyError) -> AppError {
    match err {
        ApiKeyError::Repo(err) => AppError::from(err),
        ApiKeyError::InvalidName => AppError::validation(err.to_string()),
        ApiKeyError::NotFound => AppError::NotFound,
    }
}
