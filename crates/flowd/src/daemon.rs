//! Daemon wiring: builds every subsystem from the configuration, runs the
//! background loops and serves the API until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use flowgrid_api::{ApiState, RoleLocks};
use flowgrid_autoscale::AutoScaler;
use flowgrid_core::FlowConfig;
use flowgrid_intent::{HttpLcm, IntentDispatcher, Session};
use flowgrid_role::{HttpVmDriver, MemoryDriver, RoleOperator, VmDriver};
use flowgrid_state::{ServiceState, StateStore};
use flowgrid_watchdog::{EventBus, MemoryBus, Watchdog, ZmqBus};

/// Endpoint scheme selecting the in-process driver or bus (dry runs).
const MEMORY_SCHEME: &str = "memory://";

pub fn build_driver(
    endpoint: &str,
    timeout: std::time::Duration,
) -> anyhow::Result<Arc<dyn VmDriver>> {
    if endpoint.starts_with(MEMORY_SCHEME) {
        warn!("using the in-memory vm driver, no hypervisor is contacted");
        return Ok(Arc::new(MemoryDriver::new()));
    }
    Ok(Arc::new(HttpVmDriver::new(endpoint, timeout)?))
}

pub fn build_bus(endpoint: &str) -> anyhow::Result<Arc<dyn EventBus>> {
    if endpoint.starts_with(MEMORY_SCHEME) {
        warn!("using the in-process event bus, no vm events will arrive");
        return Ok(Arc::new(MemoryBus::default()));
    }
    Ok(Arc::new(ZmqBus::new(endpoint)?))
}

/// Start watching every service that has VMs which may still change state.
pub async fn rewatch_services(store: &StateStore, watchdog: &Watchdog) -> anyhow::Result<usize> {
    let mut watched = 0;
    for service in store.list_services()? {
        if matches!(service.state, ServiceState::Done | ServiceState::Pending) {
            continue;
        }
        match watchdog.start_watching(&service).await {
            Ok(nodes) if nodes > 0 => watched += 1,
            Ok(_) => {}
            Err(e) => warn!(service_id = service.id, error = %e, "could not watch service"),
        }
    }
    Ok(watched)
}

pub async fn run(config: FlowConfig) -> anyhow::Result<()> {
    info!("flowgrid daemon starting");
    config.validate()?;

    let poll_interval = config.poll_interval()?;
    let default_cooldown = config.default_cooldown()?;
    let watchdog_timeout = config.watchdog_timeout()?;
    let driver_timeout = config.driver_timeout()?;

    // ── Initialize subsystems ──────────────────────────────────

    if let Some(parent) = config.state.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = StateStore::open(&config.state.path)?;
    info!(path = ?config.state.path, "state store opened");

    let session = Session::resolve(None, &config.auth)?;
    info!(user = %session.user, "lcm session resolved");

    let driver = build_driver(&config.driver.endpoint, driver_timeout)?;
    let operator = Arc::new(RoleOperator::new(
        Arc::clone(&driver),
        config.role_defaults()?,
        driver_timeout,
    ));
    info!(endpoint = %config.driver.endpoint, "vm driver initialized");

    let lcm = Arc::new(HttpLcm::new(&config.lcm.endpoint, driver_timeout)?);
    let (dispatcher, intents) = IntentDispatcher::new(lcm, config.lcm.queue_depth);
    info!(endpoint = %config.lcm.endpoint, queue_depth = config.lcm.queue_depth, "intent dispatcher initialized");

    let bus = build_bus(&config.watchdog.subscriber_endpoint)?;
    let watchdog = Arc::new(
        Watchdog::new(bus, driver, intents.clone(), session.clone())
            .with_recv_timeout(watchdog_timeout),
    );
    info!(endpoint = %config.watchdog.subscriber_endpoint, "watchdog initialized");

    let autoscaler = AutoScaler::new(store.clone(), intents, session, default_cooldown);
    info!(interval = ?poll_interval, "auto-scaler initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher_shutdown = shutdown_rx.clone();
    let autoscale_shutdown = shutdown_rx.clone();

    // ── Start background tasks ─────────────────────────────────

    let dispatcher_handle = tokio::spawn(dispatcher.run(dispatcher_shutdown));
    let autoscale_handle = tokio::spawn(async move {
        autoscaler.run(poll_interval, autoscale_shutdown).await;
    });

    let watched = rewatch_services(&store, &watchdog).await?;
    info!(services = watched, "watchdog resumed");

    // ── Start API server ───────────────────────────────────────

    let router = flowgrid_api::build_router(ApiState {
        store,
        watchdog: Arc::clone(&watchdog),
        operator,
        locks: RoleLocks::default(),
    });
    let addr: SocketAddr = config.api.listen.parse()?;
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    server.await?;

    // ── Drain ──────────────────────────────────────────────────

    watchdog.stop_all().await;
    let _ = dispatcher_handle.await;
    let _ = autoscale_handle.await;

    info!("flowgrid daemon stopped");
    Ok(())
}
