//! Relay server: listeners, accept loop, HTTP serving, and lifecycle.
//!
//! [`RelayServer::bind`] opens both listeners up front so bind failures are
//! reported before anything runs, and so tests can bind port `0` and read
//! back the real addresses.  [`RelayServer::run`] then drives:
//!
//! 1. the bus accept loop (one read task and one write task per client),
//! 2. the axum HTTP bridge, with graceful shutdown,
//! 3. a periodic "clients connected" log line,
//!
//! until the shared `running` flag is cleared.  On exit every remaining
//! connection is disconnected.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::application::notifier::Notifier;
use crate::application::registry::ConnectionRegistry;
use crate::application::router::BroadcastRouter;
use crate::domain::RelayConfig;
use crate::infrastructure::http::{api_router, ApiState};
use crate::infrastructure::network::accept;
use crate::infrastructure::webhook::WebhookDispatcher;

/// How often the accept loop and the HTTP shutdown watcher re-check `running`.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// A bound, not-yet-running relay.
pub struct RelayServer {
    config: RelayConfig,
    bus_listener: TcpListener,
    api_listener: TcpListener,
    bus_addr: SocketAddr,
    api_addr: SocketAddr,
    router: Arc<BroadcastRouter>,
    running: Arc<AtomicBool>,
}

impl RelayServer {
    /// Binds both listeners and wires the production webhook dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if either port cannot be bound or the webhook HTTP
    /// client cannot be built.
    pub async fn bind(config: RelayConfig) -> anyhow::Result<Self> {
        let webhook = WebhookDispatcher::new(config.webhook.clone())
            .context("failed to build webhook HTTP client")?;
        Self::bind_with_notifier(config, Arc::new(webhook)).await
    }

    /// Like [`RelayServer::bind`], with a caller-supplied notifier.
    ///
    /// # Errors
    ///
    /// Returns an error if either port cannot be bound.
    pub async fn bind_with_notifier(
        config: RelayConfig,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        let bus_listener = TcpListener::bind(config.bus_addr())
            .await
            .with_context(|| format!("failed to bind bus listener on {}", config.bus_addr()))?;
        let api_listener = TcpListener::bind(config.api_addr())
            .await
            .with_context(|| format!("failed to bind HTTP API on {}", config.api_addr()))?;
        let bus_addr = bus_listener
            .local_addr()
            .context("bus listener has no local address")?;
        let api_addr = api_listener
            .local_addr()
            .context("HTTP listener has no local address")?;

        let registry = Arc::new(ConnectionRegistry::new(config.max_pending_bytes));
        let router = Arc::new(BroadcastRouter::new(
            registry,
            notifier,
            config.max_frame_len,
        ));

        Ok(Self {
            config,
            bus_listener,
            api_listener,
            bus_addr,
            api_addr,
            router,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn bus_addr(&self) -> SocketAddr {
        self.bus_addr
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn router(&self) -> Arc<BroadcastRouter> {
        Arc::clone(&self.router)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(self.router.registry())
    }

    /// Clearing this flag stops [`RelayServer::run`] within about 200 ms.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Serves bus clients and HTTP requests until the running flag is cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP server fails.  Per-connection and
    /// per-request failures are logged and never end the run.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            config,
            bus_listener,
            api_listener,
            bus_addr,
            api_addr,
            router,
            running,
        } = self;

        let state = ApiState::new(
            Arc::clone(&router),
            Arc::clone(&running),
            config.bind_host.to_string(),
            bus_addr.port(),
        );
        let app = api_router(state);
        let http_running = Arc::clone(&running);
        let http = tokio::spawn(async move {
            axum::serve(api_listener, app)
                .with_graceful_shutdown(wait_for_shutdown(http_running))
                .await
        });

        let log_task = tokio::spawn(log_connections(
            Arc::clone(router.registry()),
            Arc::clone(&running),
            config.connection_log_interval,
        ));

        info!("bus relay listening on {bus_addr}, HTTP API on {api_addr}");

        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            match timeout(SHUTDOWN_POLL, bus_listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "could not set TCP_NODELAY");
                    }
                    let id = accept(stream, peer, Arc::clone(&router));
                    info!("new bus connection {id} from {peer}");
                }
                Ok(Err(e)) => {
                    // Transient (e.g. out of file descriptors); keep serving.
                    error!("accept error: {e}");
                }
                Err(_) => {}
            }
        }

        let closed = router.disconnect_all();
        info!("disconnected {closed} client(s)");
        log_task.abort();

        match http.await {
            Ok(result) => result.context("HTTP server failed")?,
            Err(e) => return Err(anyhow::anyhow!("HTTP server task failed: {e}")),
        }
        info!("bus relay stopped");
        Ok(())
    }
}

async fn wait_for_shutdown(running: Arc<AtomicBool>) {
    let mut tick = interval(SHUTDOWN_POLL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    while running.load(Ordering::Relaxed) {
        tick.tick().await;
    }
}

async fn log_connections(registry: Arc<ConnectionRegistry>, running: Arc<AtomicBool>, every: Duration) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    tick.tick().await;
    while running.load(Ordering::Relaxed) {
        tick.tick().await;
        let total = registry.len();
        if total > 0 {
            info!("{}/{} clients connected", registry.identified_count(), total);
        }
    }
}
