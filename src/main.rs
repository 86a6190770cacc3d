use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use slotwise::config::{Seed, ServerConfig};
use slotwise::dispatch::{self, LogNotifier, Outbox, RetryPolicy};
use slotwise::engine::{Collaborators, Engine};
use slotwise::gate::KeyedCounterGate;
use slotwise::notify::NotifyHub;
use slotwise::provider::StaticBusyProvider;
use slotwise::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();
    slotwise::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let provider = Arc::new(StaticBusyProvider::new());
    let notify = Arc::new(NotifyHub::new());
    let (outbox, outbox_rx) = Outbox::channel(1024);

    let mut collaborators = Collaborators::new(provider.clone(), outbox)
        .with_provider_timeout(config.provider_timeout);
    let gate = config
        .rate_limit
        .map(|limit| Arc::new(KeyedCounterGate::new(limit, config.rate_window)));
    if let Some(gate) = &gate {
        collaborators = collaborators.with_gate(gate.clone());
    }

    let engine = Arc::new(Engine::new(config.wal_path(), notify.clone(), collaborators)?);
    info!(
        "recovered {} businesses, {} items",
        engine.business_count(),
        engine.item_count()
    );

    if let Some(path) = &config.seed {
        Seed::load(path)?.apply(&engine, &provider).await?;
        info!("applied seed {}", path.display());
    }

    tokio::spawn(dispatch::run_dispatcher(
        outbox_rx,
        Arc::new(LogNotifier),
        RetryPolicy::default(),
    ));
    tokio::spawn(dispatch::run_compactor(
        engine.clone(),
        config.compact_threshold,
        Duration::from_secs(30),
    ));
    tokio::spawn(dispatch::run_janitor(gate, notify, Duration::from_secs(60)));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotwise listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  auth: {}", if config.token.is_some() { "token" } else { "open" });
    info!(
        "  rate_limit: {}",
        config
            .rate_limit
            .map_or("disabled".to_string(), |n| format!("{n} commits / {:?}", config.rate_window))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(slotwise::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(slotwise::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(slotwise::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let token = config.token.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, token).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(slotwise::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("slotwise stopped");
    Ok(())
}
