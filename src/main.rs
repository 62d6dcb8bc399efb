use std::{process, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use tracker::{
    application::{error::AppError, tracking::TrackingService},
    config::{self, Settings, TrackingCommand},
    infra::{
        db::{POSTGRES_SOURCE_ID, PostgresVersionSource},
        error::InfraError,
        http::{self, AppState, COMMENTS_TABLE, POSTS_TABLE},
        memory::MemoryVersionSource,
        telemetry,
    },
    tracker::{
        Coordinator, OptionsBuilder, OptionsCache, ProviderRegistry, ProviderResolver,
        VersionSource,
    },
};

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
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Tracking(args) => run_tracking(settings, args.command).await,
        config::Command::Migrate(_) => run_migrations(settings).await,
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let mut sources: Vec<Arc<dyn VersionSource>> = Vec::new();
    if settings.database.url.is_some() {
        let pool = connect(&settings).await?;
        sources.push(Arc::new(PostgresVersionSource::new(POSTGRES_SOURCE_ID, pool)));
    }
    sources.push(Arc::new(
        MemoryVersionSource::default().with_tables([POSTS_TABLE, COMMENTS_TABLE]),
    ));

    let registry = Arc::new(ProviderRegistry::new(sources)?);
    let tracking = TrackingService::new(registry.default_source().clone());
    let builder = OptionsBuilder::new(
        ProviderResolver::new(registry.clone()),
        Arc::new(settings.tracker.table_names()),
    );
    let coordinator = Arc::new(Coordinator::new(
        settings.tracker.cache_options(),
        builder,
        Arc::new(OptionsCache::new()),
        settings.tracker.coordinator_config(),
    ));

    info!(
        sources = ?registry.ids().collect::<Vec<_>>(),
        epoch = %coordinator.epoch(),
        hasher = %settings.tracker.hasher,
        "version sources registered"
    );

    let router = http::build_router(AppState {
        coordinator,
        registry,
        tracking,
        fetch_timeout: settings.tracker.fetch_timeout,
    })?;

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(addr = %settings.server.addr, "listening");

    let shutdown = CancellationToken::new();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        _ = drain_after_signal(shutdown, settings.server.graceful_shutdown) => {
            warn!("graceful shutdown timed out; dropping open connections");
        }
    }

    Ok(())
}

/// Wait for a shutdown signal, stop accepting, then give in-flight requests
/// `grace` to finish.
async fn drain_after_signal(shutdown: CancellationToken, grace: Duration) {
    shutdown_signal().await;
    info!(grace_secs = grace.as_secs(), "shutdown requested");
    shutdown.cancel();
    tokio::time::sleep(grace).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
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
                error!(error = %err, "failed to listen for SIGTERM");
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

async fn run_tracking(settings: Settings, command: TrackingCommand) -> Result<(), AppError> {
    let pool = connect(&settings).await?;
    let service = TrackingService::new(Arc::new(PostgresVersionSource::new(
        POSTGRES_SOURCE_ID,
        pool,
    )));
    let table = command.table_args().table.trim();
    let token = CancellationToken::new();

    match command {
        TrackingCommand::Enable(_) => {
            let changed = service.enable(table, &token).await?;
            println!("{table}: tracking enabled (changed: {changed})");
        }
        TrackingCommand::Disable(_) => {
            let changed = service.disable(table, &token).await?;
            println!("{table}: tracking disabled (changed: {changed})");
        }
        TrackingCommand::Status(_) => {
            let status = service.status(table, &token).await?;
            let rendered = serde_json::to_string_pretty(&status)
                .map_err(|err| AppError::unexpected(format!("failed to render status: {err}")))?;
            println!("{rendered}");
        }
    }

    Ok(())
}

async fn run_migrations(settings: Settings) -> Result<(), AppError> {
    let pool = connect(&settings).await?;
    PostgresVersionSource::run_migrations(&pool)
        .await
        .map_err(InfraError::from)?;
    info!("migrations applied");
    Ok(())
}

async fn connect(settings: &Settings) -> Result<sqlx::PgPool, AppError> {
    let url = settings.database.url.as_deref().ok_or_else(|| {
        AppError::validation(
            "database url is required (provide --database-url or set TRACKER__DATABASE__URL)",
        )
    })?;

    let pool = PostgresVersionSource::connect(url, settings.database.max_connections.get())
        .await
        .map_err(InfraError::from)?;
    Ok(pool)
}
