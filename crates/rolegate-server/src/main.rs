use std::sync::Arc;

use clap::Parser;
use rolegate_client::{AuthzEngineClient, InMemoryEngine};
use rolegate_core::sync::{EnforcementEngine, PolicySynchronizer};
use rolegate_server::bootstrap;
use rolegate_server::cli::{Cli, Command};
use rolegate_server::config::{AppConfig, LogFormat, StorageBackend};
use rolegate_server::metrics::Metrics;
use rolegate_server::rest;
use rolegate_server::service::UserService;
use rolegate_server::telemetry::{self, TelemetryGuard};
use rolegate_storage::postgres::migrations::run_migrations;
use rolegate_storage::{
    DirectoryStore, IdentityProvider, InMemoryIdentityProvider, InMemoryStore, MappingStore,
    PostgresIdentityProvider, PostgresStore,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type BoxError = Box<dyn std::error::Error>;

fn init_logging(config: &AppConfig) -> TelemetryGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    // OTel layer is typed to bare Registry, so it must be added first.
    // Layer order (bottom to top): Registry → OTel → EnvFilter → fmt
    let registry = tracing_subscriber::registry();
    let provider = telemetry::init_telemetry(&config.tracing);

    #[cfg(feature = "telemetry")]
    let registry = registry.with(provider.as_ref().map(telemetry::make_otel_layer));

    let registry = registry.with(filter);

    match config.log.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer().json();
            registry.with(fmt_layer).init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer().pretty();
            registry.with(fmt_layer).init();
        }
    }

    let guard = telemetry::guard(provider);
    if guard.is_exporting() {
        tracing::info!(endpoint = %config.tracing.otlp_endpoint, "OpenTelemetry tracing enabled");
    }
    guard
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    let _telemetry = init_logging(&config);

    match cli.command {
        Some(Command::Migrate) => run_migrate(&config).await,
        Some(Command::ProvisionOrganization { partner, name }) => {
            run_provision_organization(&config, &partner, &name).await
        }
        Some(Command::SeedRoles) => run_seed_roles(&config).await,
        Some(Command::Serve) | None => run_serve(config).await,
    }
}

async fn connect_pool(config: &AppConfig) -> Result<sqlx::PgPool, BoxError> {
    if config.storage.backend != StorageBackend::Postgres {
        return Err("this command needs storage.backend = \"postgres\"".into());
    }
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrate(config: &AppConfig) -> Result<(), BoxError> {
    tracing::info!("running database migrations");
    connect_pool(config).await?;
    tracing::info!("migrations completed successfully");
    Ok(())
}

async fn run_provision_organization(
    config: &AppConfig,
    partner: &str,
    name: &str,
) -> Result<(), BoxError> {
    let store = PostgresStore::new(connect_pool(config).await?);
    let org = bootstrap::provision_organization(&store, partner, name).await?;

    println!("Organization provisioned successfully");
    println!("  Partner:         {partner}");
    println!("  Organization:    {}", org.name);
    println!("  Organization ID: {}", org.id);
    Ok(())
}

async fn run_seed_roles(config: &AppConfig) -> Result<(), BoxError> {
    let store = PostgresStore::new(connect_pool(config).await?);
    let Some(endpoint) = config.authz_endpoint() else {
        return Err("seed-roles needs authz.endpoint to reach the enforcement engine".into());
    };
    let engine = AuthzEngineClient::connect(endpoint, config.client_options()).await?;
    let sync = PolicySynchronizer::new(Arc::new(engine));

    let roles = bootstrap::seed_roles(&store, &sync).await?;
    println!("Seeded {} built-in roles", roles.len());
    Ok(())
}

async fn run_serve(config: AppConfig) -> Result<(), BoxError> {
    match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage; state is lost on restart");
            let store = Arc::new(InMemoryStore::new());
            let identities = Arc::new(InMemoryIdentityProvider::new());
            serve_with_engine(config, store, identities).await
        }
        StorageBackend::Postgres => {
            let pool = connect_pool(&config).await?;
            let store = Arc::new(PostgresStore::new(pool.clone()));
            let identities = Arc::new(PostgresIdentityProvider::new(pool));
            serve_with_engine(config, store, identities).await
        }
    }
}

async fn serve_with_engine<S, I>(
    config: AppConfig,
    store: Arc<S>,
    identities: Arc<I>,
) -> Result<(), BoxError>
where
    S: DirectoryStore + MappingStore + 'static,
    I: IdentityProvider + 'static,
{
    match config.authz_endpoint().map(str::to_string) {
        Some(endpoint) => {
            tracing::info!(%endpoint, "using remote enforcement engine");
            let engine = AuthzEngineClient::connect_lazy(&endpoint, config.client_options())?;
            serve(config, store, identities, Arc::new(engine)).await
        }
        None => {
            tracing::warn!("authz.endpoint is empty; using the in-process enforcement engine");
            serve(config, store, identities, Arc::new(InMemoryEngine::new())).await
        }
    }
}

async fn serve<S, I, E>(
    config: AppConfig,
    store: Arc<S>,
    identities: Arc<I>,
    engine: Arc<E>,
) -> Result<(), BoxError>
where
    S: DirectoryStore + MappingStore + 'static,
    I: IdentityProvider + 'static,
    E: EnforcementEngine + 'static,
{
    let http_addr: std::net::SocketAddr = config.http_addr().parse()?;
    tracing::info!(
        %http_addr,
        backend = ?config.storage.backend,
        "starting rolegate server"
    );

    let metrics = Arc::new(Metrics::new());
    let service = Arc::new(
        UserService::new(store, identities, engine).with_metrics(Arc::clone(&metrics)),
    );

    let store = service.store().as_ref();
    if let Some(org) = bootstrap::provision_from_config(store, &config.bootstrap).await? {
        tracing::info!(organization = %org.name, "bootstrap tenant ready");
    }
    if config.bootstrap.seed_roles {
        bootstrap::seed_roles(store, service.synchronizer()).await?;
    }

    let router = rest::create_router(rest::AppState { service, metrics });

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    tracing::info!(%http_addr, "REST server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => { tracing::info!("received SIGINT"); }
                _ = sigterm.recv() => { tracing::info!("received SIGTERM"); }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler, using SIGINT only");
            let _ = ctrl_c.await;
            tracing::info!("received SIGINT");
        }
    }
}
