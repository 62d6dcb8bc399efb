//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::HashMap, net::SocketAddr, num::NonZeroU32, path::PathBuf, str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::tracker::{BuildEpoch, CacheOptions, CoordinatorConfig, HasherKind, StaticTableNames};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tracker";
const ENV_PREFIX: &str = "TRACKER";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_POOL_CAPACITY: usize = 64;

/// Command-line arguments for the tracker binary.
#[derive(Debug, Parser)]
#[command(name = "tracker", version, about = "ETag conditional-cache service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TRACKER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service.
    Serve(Box<ServeArgs>),
    /// Manage change tracking for a table.
    Tracking(TrackingArgs),
    /// Apply pending database migrations.
    Migrate(MigrateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
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

    /// Override the ETag hashing strategy (fnv1a|murmur3|sha256).
    #[arg(long = "tracker-hasher", value_name = "NAME")]
    pub tracker_hasher: Option<String>,

    /// Override the build epoch embedded in issued ETags.
    #[arg(long = "tracker-build-epoch", value_name = "DIGITS")]
    pub tracker_build_epoch: Option<String>,

    /// Override the provider used when an endpoint names none.
    #[arg(long = "tracker-source", value_name = "ID")]
    pub tracker_source: Option<String>,

    /// Issue ETag headers on requests without If-None-Match.
    #[arg(
        long = "tracker-emit-headers",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub tracker_emit_headers: Option<bool>,

    /// Override the freshness fetch deadline.
    #[arg(long = "tracker-fetch-timeout-ms", value_name = "MILLIS")]
    pub tracker_fetch_timeout_ms: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct TrackingArgs {
    #[command(subcommand)]
    pub command: TrackingCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum TrackingCommand {
    /// Install change tracking on a table.
    Enable(TableArgs),
    /// Remove change tracking from a table.
    Disable(TableArgs),
    /// Report whether a table is tracked and its last version.
    Status(TableArgs),
}

impl TrackingCommand {
    pub fn table_args(&self) -> &TableArgs {
        match self {
            TrackingCommand::Enable(args)
            | TrackingCommand::Disable(args)
            | TrackingCommand::Status(args) => args,
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct TableArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Table name, optionally schema-qualified.
    #[arg(value_name = "TABLE")]
    pub table: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub tracker: TrackerSettings,
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
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub build_epoch: BuildEpoch,
    pub hasher: HasherKind,
    pub emit_headers_without_condition: bool,
    /// `None` disables the deadline.
    pub fetch_timeout: Option<Duration>,
    pub pool_capacity: usize,
    pub source: Option<String>,
    pub cache_control: Option<String>,
    pub invalid_response_directives: Vec<String>,
    pub invalid_request_directives: Vec<String>,
    /// Logical entity → physical table.
    pub entities: HashMap<String, String>,
}

impl TrackerSettings {
    /// Deployment-wide defaults handed to every tracked endpoint.
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            source: self.source.clone(),
            cache_control: self.cache_control.clone(),
            invalid_response_directives: self.invalid_response_directives.clone(),
            invalid_request_directives: self.invalid_request_directives.clone(),
            ..CacheOptions::default()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            epoch: self.build_epoch.clone(),
            hasher: self.hasher,
            pool_capacity: self.pool_capacity,
            emit_headers_without_condition: self.emit_headers_without_condition,
        }
    }

    pub fn table_names(&self) -> StaticTableNames {
        StaticTableNames::new(self.entities.clone())
    }
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
            .with_list_parse_key("tracker.invalid_response_directives")
            .with_list_parse_key("tracker.invalid_request_directives")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Tracking(args)) => {
            raw.apply_database_override(&args.command.table_args().database)
        }
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
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
    tracker: RawTrackerSettings,
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
        if let Some(hasher) = overrides.tracker_hasher.as_ref() {
            self.tracker.hasher = Some(hasher.clone());
        }
        if let Some(epoch) = overrides.tracker_build_epoch.as_ref() {
            self.tracker.build_epoch = Some(epoch.clone());
        }
        if let Some(source) = overrides.tracker_source.as_ref() {
            self.tracker.source = Some(source.clone());
        }
        if let Some(emit) = overrides.tracker_emit_headers {
            self.tracker.emit_headers_without_condition = Some(emit);
        }
        if let Some(timeout) = overrides.tracker_fetch_timeout_ms {
            self.tracker.fetch_timeout_ms = Some(timeout);
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
            tracker,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let tracker = build_tracker_settings(tracker)?;

        Ok(Self {
            server,
            logging,
            database,
            tracker,
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

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
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

fn build_tracker_settings(tracker: RawTrackerSettings) -> Result<TrackerSettings, LoadError> {
    let build_epoch = match tracker.build_epoch {
        Some(epoch) => BuildEpoch::new(&epoch)
            .map_err(|err| LoadError::invalid("tracker.build_epoch", err.to_string()))?,
        None => BuildEpoch::current(),
    };

    let hasher = match tracker.hasher {
        Some(name) => HasherKind::from_str(&name)
            .map_err(|reason| LoadError::invalid("tracker.hasher", reason))?,
        None => HasherKind::default(),
    };

    let fetch_timeout = match tracker.fetch_timeout_ms.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS) {
        0 => None,
        millis => Some(Duration::from_millis(millis)),
    };

    let pool_capacity = tracker.pool_capacity.unwrap_or(DEFAULT_POOL_CAPACITY);
    if pool_capacity == 0 {
        return Err(LoadError::invalid(
            "tracker.pool_capacity",
            "must be greater than zero",
        ));
    }

    let source = non_blank(tracker.source);
    let cache_control = non_blank(tracker.cache_control);

    let invalid_response_directives = normalize_directives(
        tracker
            .invalid_response_directives
            .unwrap_or_else(|| vec!["immutable".to_string(), "no-store".to_string()]),
    );
    let invalid_request_directives =
        normalize_directives(tracker.invalid_request_directives.unwrap_or_default());

    let mut entities = HashMap::with_capacity(tracker.entities.len());
    for (entity, table) in tracker.entities {
        let table = table.trim();
        if table.is_empty() {
            return Err(LoadError::invalid(
                "tracker.entities",
                format!("entity `{entity}` maps to an empty table name"),
            ));
        }
        entities.insert(entity, table.to_string());
    }

    Ok(TrackerSettings {
        build_epoch,
        hasher,
        emit_headers_without_condition: tracker.emit_headers_without_condition.unwrap_or(true),
        fetch_timeout,
        pool_capacity,
        source,
        cache_control,
        invalid_response_directives,
        invalid_request_directives,
        entities,
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
struct RawTrackerSettings {
    build_epoch: Option<String>,
    hasher: Option<String>,
    emit_headers_without_condition: Option<bool>,
    fetch_timeout_ms: Option<u64>,
    pool_capacity: Option<usize>,
    source: Option<String>,
    cache_control: Option<String>,
    invalid_response_directives: Option<Vec<String>>,
    invalid_request_directives: Option<Vec<String>>,
    entities: HashMap<String, String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
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

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn normalize_directives(directives: Vec<String>) -> Vec<String> {
    directives
        .into_iter()
        .map(|directive| directive.trim().to_ascii_lowercase())
        .filter(|directive| !directive.is_empty())
        .collect()
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
