// ABOUTME: Unified binary running the NIP-46 signer and the HTTP control plane
// ABOUTME: Wires config, database, vault, relay pool, backends, and janitors together

use dotenv::dotenv;
use signet_api::http::routes::api_routes;
use signet_api::{ApiState, ControlSettings};
use signet_core::acl::AclEvaluator;
use signet_core::bus::EventBus;
use signet_core::config::Config;
use signet_core::database::Database;
use signet_core::pending::PendingQueue;
use signet_core::types::activity::Activity;
use signet_core::types::connection_token::ConnectionToken;
use signet_core::types::request::Request;
use signet_core::vault::KeyVault;
use signet_core::bus::Topic;
use signet_signer::backend::BackendContext;
use signet_signer::relay_pool::{PublishReport, StatusListener};
use signet_signer::{BackendSupervisor, RelayPool, SubscriptionManager};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let worker_threads = env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(num_cpus::get);

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?
        .block_on(async_main())
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let is_production = env::var("SIGNET_ENV").unwrap_or_default() == "production";

    if is_production {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    // Config document; first run writes defaults plus a fresh KDF salt.
    let config_path = Config::default_path();
    let mut config = Config::load_or_default(&config_path)?;
    if config.ensure_salt() {
        config.save(&config_path)?;
    }
    tracing::info!("Config loaded from {}", config_path.display());

    if config.relays.is_empty() {
        tracing::warn!("No relays configured; the signer cannot receive requests");
    }

    // Storage.
    let db_path = Config::database_path(&config_path);
    let database = Database::connect(&db_path).await?;

    let stale = Request::expire_stale_on_boot(&database.pool).await?;
    if stale > 0 {
        tracing::info!("{} request(s) from a previous run read as expired", stale);
    }

    // Authorization pipeline.
    let bus = EventBus::new();
    let acl = Arc::new(AclEvaluator::new(database.pool.clone()));
    let pending = Arc::new(PendingQueue::new(
        database.pool.clone(),
        bus.clone(),
        acl.clone(),
    ));

    // Relay plumbing.
    let cancel = CancellationToken::new();
    let relay_pool = RelayPool::new(&config.relays).await?;
    relay_pool.spawn(cancel.clone());

    // Per-relay publish failures land in the audit log.
    let report_pool = database.pool.clone();
    let report: PublishReport = Arc::new(move |relay_url, ok, event_id| {
        if !ok {
            let pool = report_pool.clone();
            let detail = format!("{} {}", relay_url, event_id);
            tokio::spawn(async move {
                Activity::record(&pool, "relay_publish_failed", None, Some(&detail), None, None)
                    .await
                    .ok();
            });
        }
    });
    relay_pool.set_publish_report(report).await;

    // Relay state transitions surface on the SSE stream.
    let status_bus = bus.clone();
    let listener: StatusListener = Arc::new(move || {
        status_bus.publish(Topic::RelaysUpdated, serde_json::Value::Null);
    });
    relay_pool.set_status_listener(listener).await;

    let manager = Arc::new(SubscriptionManager::new(relay_pool.clone()));
    tokio::spawn(manager.clone().run(cancel.clone()));

    // Key vault plus the backend supervisor it activates.
    let vault = Arc::new(KeyVault::new(
        database.pool.clone(),
        bus.clone(),
        config_path.clone(),
        config.clone(),
    ));

    let ctx = BackendContext {
        pool: database.pool.clone(),
        acl: acl.clone(),
        pending: pending.clone(),
        bus: bus.clone(),
        admin_secret: config.admin_secret.clone(),
    };
    let supervisor = BackendSupervisor::new(manager.clone(), ctx, relay_pool.clone());
    vault.set_activation(supervisor.clone()).await;
    vault.start_configured().await?;
    let online = supervisor.running().await.len();
    bus.publish(
        Topic::Connected,
        serde_json::json!({ "keys_online": online }),
    );
    tracing::info!("Signer ready: {} key(s) online", online);

    // Janitors: expired pending rows and stale connection tokens.
    {
        let pending = pending.clone();
        let pool = database.pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match pending.cleanup().await {
                    Ok(n) if n > 0 => tracing::debug!("Janitor removed {} expired request(s)", n),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Request cleanup failed: {}", e),
                }
                match ConnectionToken::cleanup_expired(&pool).await {
                    Ok(n) if n > 0 => tracing::debug!("Janitor removed {} expired token(s)", n),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Token cleanup failed: {}", e),
                }
            }
        });
    }

    // Control plane.
    let state = Arc::new(ApiState {
        pool: database.pool.clone(),
        vault: vault.clone(),
        acl: acl.clone(),
        pending: pending.clone(),
        bus: bus.clone(),
        relays: relay_pool.clone(),
        settings: ControlSettings::from_config(&config),
    });
    let app = api_routes(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Control plane listening on http://{}", addr);

    let api_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { api_cancel.cancelled().await })
            .await
    });

    wait_for_shutdown_signal().await;
    cancel.cancel();

    // Backends drain in-flight handlers before the pool closes.
    supervisor.stop_all().await;

    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!("API server error on shutdown: {}", e),
        Ok(Err(e)) => tracing::warn!("API server task error: {}", e),
        Err(_) => tracing::warn!("API server shutdown timed out after {:?}", SHUTDOWN_GRACE),
    }

    database.pool.close().await;
    tracing::info!("Shutdown complete");

    Ok(())
}
