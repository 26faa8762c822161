//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::{IpAddr, SocketAddr},
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;
use uuid::Uuid;

use crate::application::retention::retention_schedule;
use crate::domain::api_keys::ApiKeyTier;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "papyrus";
const ENV_PREFIX: &str = "PAPYRUS";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ADMISSION_WINDOW_SECS: u64 = 60;
const DEFAULT_ANONYMOUS_LIMIT: u64 = 5;
const DEFAULT_EXEMPT_ROUTE: &str = "/health";
const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 86_400;
const DEFAULT_POOL_MAX_RESOURCES: u64 = 5;
const DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RENDER_BINARY: &str = "typst";
const DEFAULT_TEMPLATES_DIR: &str = "templates";
const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TEMPLATE_CACHE_CAPACITY: u64 = 64;
const DEFAULT_STORAGE_ROOT: &str = "storage";
const DEFAULT_PUBLIC_BASE_URL: &str = "http://127.0.0.1:3000/";
const DEFAULT_STORAGE_PREFIXES: u64 = 10;
const DEFAULT_URL_TTL_SECS: u64 = 3600;
const DEFAULT_STAGE_CONCURRENCY: u64 = 2;
const DEFAULT_MAX_ATTEMPTS: u64 = 3;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 2_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;
const DEFAULT_VISIBILITY_SECS: u64 = 300;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RETENTION_HOURS: u64 = 168;
const DEFAULT_RETENTION_SCHEDULE: &str = "0 */15 * * * *";

/// Command-line arguments for the papyrus binary.
#[derive(Debug, Parser)]
#[command(name = "papyrus", version, about = "Asynchronous PDF generation service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "PAPYRUS_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP API, every stage worker and the retention sweep.
    Serve(Box<ServeArgs>),
    /// Run only the HTTP API.
    Api(Box<ServeArgs>),
    /// Run the consumers of a single pipeline stage.
    Worker(Box<WorkerArgs>),
    /// Manage API keys.
    Keys(KeysArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkerStage {
    Generate,
    Sign,
    Deliver,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct WorkerArgs {
    /// Stage whose queue this process consumes.
    #[arg(long, value_enum)]
    pub stage: WorkerStage,

    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct KeysArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(subcommand)]
    pub command: KeysCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum KeysCommand {
    /// Issue a new key and print its secret once.
    Issue(IssueKeyArgs),
    /// List stored keys.
    List,
    /// Deactivate a key by id.
    Deactivate {
        #[arg(value_name = "ID")]
        id: Uuid,
    },
}

#[derive(Debug, Args, Clone)]
pub struct IssueKeyArgs {
    /// Human-readable label for the key.
    #[arg(long)]
    pub name: String,

    /// Quota tier (basic|premium|unlimited).
    #[arg(long, default_value = "basic", value_parser = parse_tier)]
    pub tier: ApiKeyTier,

    /// Requests per admission window; `0` means unlimited. Defaults to the tier's quota.
    #[arg(long, value_name = "COUNT")]
    pub quota: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the admission window size.
    #[arg(long = "admission-window-seconds", value_name = "SECONDS")]
    pub admission_window_seconds: Option<u64>,

    /// Override the per-window limit for callers without a key.
    #[arg(long = "admission-anonymous-limit", value_name = "COUNT")]
    pub admission_anonymous_limit: Option<u64>,

    /// Override the number of render contexts.
    #[arg(long = "pool-max-resources", value_name = "COUNT")]
    pub pool_max_resources: Option<u64>,

    /// Override the typesetter executable.
    #[arg(long = "render-binary", value_name = "PATH", value_hint = ValueHint::ExecutablePath)]
    pub render_binary: Option<PathBuf>,

    /// Override the template directory.
    #[arg(long = "render-templates-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub render_templates_dir: Option<PathBuf>,

    /// Override the artifact storage directory.
    #[arg(long = "storage-root", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub storage_root: Option<PathBuf>,

    /// Override the base URL used in signed download links.
    #[arg(long = "storage-public-base-url", value_name = "URL")]
    pub storage_public_base_url: Option<String>,

    /// Override the generate worker concurrency.
    #[arg(long = "pipeline-generate-concurrency", value_name = "COUNT")]
    pub pipeline_generate_concurrency: Option<u64>,

    /// Override the sign worker concurrency.
    #[arg(long = "pipeline-sign-concurrency", value_name = "COUNT")]
    pub pipeline_sign_concurrency: Option<u64>,

    /// Override the deliver worker concurrency.
    #[arg(long = "pipeline-deliver-concurrency", value_name = "COUNT")]
    pub pipeline_deliver_concurrency: Option<u64>,

    /// Override how many deliveries a message gets.
    #[arg(long = "pipeline-max-attempts", value_name = "COUNT")]
    pub pipeline_max_attempts: Option<u64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub admission: AdmissionSettings,
    pub idempotency: IdempotencySettings,
    pub pool: PoolSettings,
    pub render: RenderSettings,
    pub storage: StorageSettings,
    pub pipeline: PipelineSettings,
    pub retention: RetentionSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Absent means in-memory backends.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    pub window: Duration,
    pub anonymous_limit: NonZeroU32,
    pub exempt_routes: Vec<String>,
    /// Peers whose `x-forwarded-for` header names the anonymous caller.
    pub trusted_proxies: Vec<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct IdempotencySettings {
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_resources: NonZeroUsize,
    pub acquire_timeout: Duration,
    /// Parent directory for render workspaces; the system temp dir when unset.
    pub workspace_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub binary: PathBuf,
    pub templates_dir: PathBuf,
    pub timeout: Duration,
    pub template_cache_capacity: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub root: PathBuf,
    pub public_base_url: Url,
    pub prefixes: NonZeroU32,
    pub signing_secret: Option<String>,
    pub url_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub generate_concurrency: NonZeroUsize,
    pub sign_concurrency: NonZeroUsize,
    pub deliver_concurrency: NonZeroUsize,
    pub max_attempts: NonZeroU32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: u32,
    pub visibility: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub job_retention: Duration,
    pub schedule: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("admission.exempt_routes")
            .with_list_parse_key("admission.trusted_proxies")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) | Some(Command::Api(args)) => {
            raw.apply_serve_overrides(&args.overrides)
        }
        Some(Command::Worker(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Keys(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    admission: RawAdmissionSettings,
    idempotency: RawIdempotencySettings,
    pool: RawPoolSettings,
    render: RawRenderSettings,
    storage: RawStorageSettings,
    pipeline: RawPipelineSettings,
    retention: RawRetentionSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(window) = overrides.admission_window_seconds {
            self.admission.window_seconds = Some(window);
        }
        if let Some(limit) = overrides.admission_anonymous_limit {
            self.admission.anonymous_limit = Some(limit);
        }
        if let Some(max) = overrides.pool_max_resources {
            self.pool.max_resources = Some(max);
        }
        if let Some(binary) = overrides.render_binary.as_ref() {
            self.render.binary = Some(binary.clone());
        }
        if let Some(dir) = overrides.render_templates_dir.as_ref() {
            self.render.templates_dir = Some(dir.clone());
        }
        if let Some(root) = overrides.storage_root.as_ref() {
            self.storage.root = Some(root.clone());
        }
        if let Some(url) = overrides.storage_public_base_url.as_ref() {
            self.storage.public_base_url = Some(url.clone());
        }
        if let Some(value) = overrides.pipeline_generate_concurrency {
            self.pipeline.generate_concurrency = Some(value);
        }
        if let Some(value) = overrides.pipeline_sign_concurrency {
            self.pipeline.sign_concurrency = Some(value);
        }
        if let Some(value) = overrides.pipeline_deliver_concurrency {
            self.pipeline.deliver_concurrency = Some(value);
        }
        if let Some(value) = overrides.pipeline_max_attempts {
            self.pipeline.max_attempts = Some(value);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            admission,
            idempotency,
            pool,
            render,
            storage,
            pipeline,
            retention,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            admission: build_admission_settings(admission)?,
            idempotency: build_idempotency_settings(idempotency)?,
            pool: build_pool_settings(pool)?,
            render: build_render_settings(render)?,
            storage: build_storage_settings(storage)?,
            pipeline: build_pipeline_settings(pipeline)?,
            retention: build_retention_settings(retention)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_shutdown = positive_duration(
        server
            .graceful_shutdown_seconds
            .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS),
        "server.graceful_shutdown_seconds",
        Duration::from_secs,
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_admission_settings(
    admission: RawAdmissionSettings,
) -> Result<AdmissionSettings, LoadError> {
    let window = positive_duration(
        admission
            .window_seconds
            .unwrap_or(DEFAULT_ADMISSION_WINDOW_SECS),
        "admission.window_seconds",
        Duration::from_secs,
    )?;
    let anonymous_limit = non_zero_u32(
        admission
            .anonymous_limit
            .unwrap_or(DEFAULT_ANONYMOUS_LIMIT),
        "admission.anonymous_limit",
    )?;

    let exempt_routes = admission
        .exempt_routes
        .unwrap_or_else(|| vec![DEFAULT_EXEMPT_ROUTE.to_string()]);
    if let Some(route) = exempt_routes.iter().find(|route| !route.starts_with('/')) {
        return Err(LoadError::invalid(
            "admission.exempt_routes",
            format!("route `{route}` must start with `/`"),
        ));
    }

    let trusted_proxies = admission
        .trusted_proxies
        .unwrap_or_default()
        .iter()
        .map(|raw| {
            raw.trim().parse::<IpAddr>().map_err(|_| {
                LoadError::invalid(
                    "admission.trusted_proxies",
                    format!("`{raw}` is not an IP address"),
                )
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AdmissionSettings {
        window,
        anonymous_limit,
        exempt_routes,
        trusted_proxies,
    })
}

fn build_idempotency_settings(
    idempotency: RawIdempotencySettings,
) -> Result<IdempotencySettings, LoadError> {
    let ttl = positive_duration(
        idempotency
            .ttl_seconds
            .unwrap_or(DEFAULT_IDEMPOTENCY_TTL_SECS),
        "idempotency.ttl_seconds",
        Duration::from_secs,
    )?;
    Ok(IdempotencySettings { ttl })
}

fn build_pool_settings(pool: RawPoolSettings) -> Result<PoolSettings, LoadError> {
    let max_resources = non_zero_usize(
        pool.max_resources.unwrap_or(DEFAULT_POOL_MAX_RESOURCES),
        "pool.max_resources",
    )?;
    let acquire_timeout = positive_duration(
        pool.acquire_timeout_seconds
            .unwrap_or(DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS),
        "pool.acquire_timeout_seconds",
        Duration::from_secs,
    )?;
    Ok(PoolSettings {
        max_resources,
        acquire_timeout,
        workspace_dir: pool.workspace_dir,
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let binary = render
        .binary
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDER_BINARY));
    if binary.as_os_str().is_empty() {
        return Err(LoadError::invalid("render.binary", "must not be empty"));
    }
    let timeout = positive_duration(
        render.timeout_seconds.unwrap_or(DEFAULT_RENDER_TIMEOUT_SECS),
        "render.timeout_seconds",
        Duration::from_secs,
    )?;
    let template_cache_capacity = non_zero_usize(
        render
            .template_cache_capacity
            .unwrap_or(DEFAULT_TEMPLATE_CACHE_CAPACITY),
        "render.template_cache_capacity",
    )?;

    Ok(RenderSettings {
        binary,
        templates_dir: render
            .templates_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATES_DIR)),
        timeout,
        template_cache_capacity,
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let raw_url = storage
        .public_base_url
        .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string());
    let public_base_url = Url::parse(raw_url.trim()).map_err(|err| {
        LoadError::invalid("storage.public_base_url", format!("invalid url: {err}"))
    })?;
    if !matches!(public_base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "storage.public_base_url",
            "scheme must be http or https",
        ));
    }

    let prefixes = non_zero_u32(
        storage.prefixes.unwrap_or(DEFAULT_STORAGE_PREFIXES),
        "storage.prefixes",
    )?;
    let url_ttl = positive_duration(
        storage.url_ttl_seconds.unwrap_or(DEFAULT_URL_TTL_SECS),
        "storage.url_ttl_seconds",
        Duration::from_secs,
    )?;
    let signing_secret = storage.signing_secret.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    Ok(StorageSettings {
        root: storage
            .root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT)),
        public_base_url,
        prefixes,
        signing_secret,
        url_ttl,
    })
}

fn build_pipeline_settings(pipeline: RawPipelineSettings) -> Result<PipelineSettings, LoadError> {
    let generate_concurrency = non_zero_usize(
        pipeline
            .generate_concurrency
            .unwrap_or(DEFAULT_STAGE_CONCURRENCY),
        "pipeline.generate_concurrency",
    )?;
    let sign_concurrency = non_zero_usize(
        pipeline
            .sign_concurrency
            .unwrap_or(DEFAULT_STAGE_CONCURRENCY),
        "pipeline.sign_concurrency",
    )?;
    let deliver_concurrency = non_zero_usize(
        pipeline
            .deliver_concurrency
            .unwrap_or(DEFAULT_STAGE_CONCURRENCY),
        "pipeline.deliver_concurrency",
    )?;
    let max_attempts = non_zero_u32(
        pipeline.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        "pipeline.max_attempts",
    )?;

    let backoff_initial = positive_duration(
        pipeline
            .backoff_initial_ms
            .unwrap_or(DEFAULT_BACKOFF_INITIAL_MS),
        "pipeline.backoff_initial_ms",
        Duration::from_millis,
    )?;
    let backoff_max = positive_duration(
        pipeline.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS),
        "pipeline.backoff_max_ms",
        Duration::from_millis,
    )?;
    if backoff_max < backoff_initial {
        return Err(LoadError::invalid(
            "pipeline.backoff_max_ms",
            "must not be smaller than pipeline.backoff_initial_ms",
        ));
    }
    let backoff_multiplier = pipeline
        .backoff_multiplier
        .unwrap_or(DEFAULT_BACKOFF_MULTIPLIER);
    if backoff_multiplier == 0 {
        return Err(LoadError::invalid(
            "pipeline.backoff_multiplier",
            "must be greater than zero",
        ));
    }

    let visibility = positive_duration(
        pipeline
            .visibility_timeout_seconds
            .unwrap_or(DEFAULT_VISIBILITY_SECS),
        "pipeline.visibility_timeout_seconds",
        Duration::from_secs,
    )?;
    let poll_interval = positive_duration(
        pipeline
            .poll_interval_ms
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        "pipeline.poll_interval_ms",
        Duration::from_millis,
    )?;

    Ok(PipelineSettings {
        generate_concurrency,
        sign_concurrency,
        deliver_concurrency,
        max_attempts,
        backoff_initial,
        backoff_max,
        backoff_multiplier,
        visibility,
        poll_interval,
    })
}

fn build_retention_settings(
    retention: RawRetentionSettings,
) -> Result<RetentionSettings, LoadError> {
    let hours = retention.job_retention_hours.unwrap_or(DEFAULT_RETENTION_HOURS);
    let job_retention = positive_duration(hours, "retention.job_retention_hours", |hours| {
        Duration::from_secs(hours.saturating_mul(3600))
    })?;

    let schedule = retention
        .schedule
        .unwrap_or_else(|| DEFAULT_RETENTION_SCHEDULE.to_string());
    retention_schedule(&schedule)
        .map_err(|reason| LoadError::invalid("retention.schedule", reason))?;

    Ok(RetentionSettings {
        job_retention,
        schedule,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAdmissionSettings {
    window_seconds: Option<u64>,
    anonymous_limit: Option<u64>,
    exempt_routes: Option<Vec<String>>,
    trusted_proxies: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawIdempotencySettings {
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPoolSettings {
    max_resources: Option<u64>,
    acquire_timeout_seconds: Option<u64>,
    workspace_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    binary: Option<PathBuf>,
    templates_dir: Option<PathBuf>,
    timeout_seconds: Option<u64>,
    template_cache_capacity: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    root: Option<PathBuf>,
    public_base_url: Option<String>,
    prefixes: Option<u64>,
    signing_secret: Option<String>,
    url_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPipelineSettings {
    generate_concurrency: Option<u64>,
    sign_concurrency: Option<u64>,
    deliver_concurrency: Option<u64>,
    max_attempts: Option<u64>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    backoff_multiplier: Option<u32>,
    visibility_timeout_seconds: Option<u64>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRetentionSettings {
    job_retention_hours: Option<u64>,
    schedule: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_tier(value: &str) -> Result<ApiKeyTier, String> {
    ApiKeyTier::from_str(value)
        .map_err(|()| format!("unknown tier `{value}`; expected basic, premium or unlimited"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_duration(
    value: u64,
    key: &'static str,
    unit: impl FnOnce(u64) -> Duration,
) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(unit(value))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
