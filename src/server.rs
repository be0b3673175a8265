//! MCP server lifecycle.
//!
//! [`McpManager`] owns the server configuration, the tool registry, the
//! metrics, and the running listener. It moves through
//! `Stopped → Starting → Running → Stopped`:
//!
//! - [`McpManager::start`] binds the configured address, wraps the listener
//!   with the connection limiter, serves the router, and starts the status
//!   loop. Calling it while not stopped is a no-op. A bind or protocol failure
//!   returns the manager to `Stopped`.
//! - [`McpManager::stop`] cancels the status loop, asks the server to shut
//!   down gracefully (bounded by [`SHUTDOWN_TIMEOUT`]), and zeroes the live
//!   connection count. Stopping a stopped manager is a no-op.
//!
//! Shared state sits behind short-lived `std::sync::Mutex` locks that are
//! never held across an await. Lifecycle transitions are serialized by a
//! separate async lock.
//!
//! # Configuration
//!
//! The server configuration is persisted in the settings store under
//! [`SERVER_CONFIG_KEY`]; the `[server]` table of the TOML file seeds it
//! until the first update.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 7332
//! max_connections = 64
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{McpServerConfig, DEFAULT_PROTOCOL};
use crate::error::{Error, Result};
use crate::http::{self, InstanceCache};
use crate::listener::TrackedListener;
use crate::project::ProjectService;
use crate::registry::{ToolInfo, ToolRegistry};
use crate::settings::{self, SettingsStore, SERVER_CONFIG_KEY};
use crate::status::{LogObserver, McpStatus, Metrics, StatusObserver};

pub const STATUS_INTERVAL: Duration = Duration::from_secs(2);
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

enum Lifecycle {
    Stopped,
    Starting,
    Running(Running),
}

struct Running {
    cancel: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
    status_task: JoinHandle<()>,
    started_at: Instant,
    cache: Arc<InstanceCache>,
    local_addr: SocketAddr,
}

pub struct McpManager {
    config: Mutex<McpServerConfig>,
    state: Mutex<Lifecycle>,
    transitions: tokio::sync::Mutex<()>,
    registry: Arc<ToolRegistry>,
    metrics: Arc<Metrics>,
    service: Arc<dyn ProjectService>,
    settings: Arc<dyn SettingsStore>,
    observer: Arc<dyn StatusObserver>,
}

impl McpManager {
    /// A stopped manager with the built-in tools, all enabled.
    pub fn new(
        config: McpServerConfig,
        service: Arc<dyn ProjectService>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(ToolRegistry::with_builtins(metrics.clone(), settings.clone()));
        Self {
            config: Mutex::new(config.normalized()),
            state: Mutex::new(Lifecycle::Stopped),
            transitions: tokio::sync::Mutex::new(()),
            registry,
            metrics,
            service,
            settings,
            observer: Arc::new(LogObserver),
        }
    }

    /// Like [`McpManager::new`], but the persisted configuration (if any)
    /// replaces `seed` and the persisted disabled-tool set is applied.
    pub async fn load(
        seed: McpServerConfig,
        service: Arc<dyn ProjectService>,
        settings: Arc<dyn SettingsStore>,
    ) -> Result<Self> {
        let persisted = settings.get(SERVER_CONFIG_KEY).await?;
        let config = match persisted.map(|raw| serde_json::from_str::<McpServerConfig>(&raw)) {
            Some(Ok(cfg)) if cfg.validate().is_ok() => cfg,
            Some(Ok(cfg)) => {
                warn!(host = %cfg.host, port = cfg.port, "ignoring invalid persisted server config");
                seed
            }
            Some(Err(e)) => {
                warn!(error = %e, "ignoring undecodable persisted server config");
                seed
            }
            None => seed,
        };
        let manager = Self::new(config, service, settings);
        manager.registry.load_disabled().await?;
        Ok(manager)
    }

    pub fn with_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> McpServerConfig {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), Lifecycle::Running(_))
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lock_state() {
            Lifecycle::Running(running) => Some(running.local_addr),
            _ => None,
        }
    }

    /// Instances built by the running listener; empty when stopped.
    pub fn live_instances(&self) -> Vec<Arc<crate::mcp::ServerInstance>> {
        match &*self.lock_state() {
            Lifecycle::Running(running) => running.cache.live_instances(),
            _ => Vec::new(),
        }
    }

    pub fn status(&self) -> McpStatus {
        let uptime = match &*self.lock_state() {
            Lifecycle::Running(running) => Some(running.started_at.elapsed()),
            _ => None,
        };
        self.metrics
            .snapshot(uptime.is_some(), uptime.unwrap_or_default())
    }

    pub fn tools(&self) -> Vec<ToolInfo> {
        self.registry.infos()
    }

    // ============ Lifecycle ============

    pub async fn start(&self) -> Result<()> {
        let _transition = self.transitions.lock().await;
        {
            let mut state = self.lock_state();
            if !matches!(*state, Lifecycle::Stopped) {
                return Ok(());
            }
            *state = Lifecycle::Starting;
        }

        let config = self.config();
        match self.launch(&config).await {
            Ok(running) => {
                info!(addr = %running.local_addr, "MCP server listening on http://{}/mcp", running.local_addr);
                *self.lock_state() = Lifecycle::Running(running);
                self.observer.tools_changed(&self.registry.infos());
                Ok(())
            }
            Err(e) => {
                self.metrics.record_error(e.to_string());
                *self.lock_state() = Lifecycle::Stopped;
                Err(e)
            }
        }
    }

    async fn launch(&self, config: &McpServerConfig) -> Result<Running> {
        if config.protocol != DEFAULT_PROTOCOL {
            return Err(Error::Transport(format!(
                "unsupported protocol: {}",
                config.protocol
            )));
        }

        let bind_addr = config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| Error::Transport(format!("failed to bind {}: {}", bind_addr, e)))?;
        let local_addr = listener.local_addr()?;
        let listener =
            TrackedListener::new(listener, config.connection_limit(), self.metrics.clone());

        let cancel = CancellationToken::new();
        let cache = Arc::new(InstanceCache::new(
            self.service.clone(),
            self.registry.clone(),
            cancel.child_token(),
        ));
        // Build the unbound instance now so construction problems surface at start.
        cache.instance(None);
        let router = http::router(cache.clone(), self.registry.clone());

        let shutdown = cancel.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });

        let started_at = Instant::now();
        let status_task = tokio::spawn(status_loop(
            cancel.clone(),
            self.metrics.clone(),
            self.observer.clone(),
            started_at,
        ));

        Ok(Running {
            cancel,
            server,
            status_task,
            started_at,
            cache,
            local_addr,
        })
    }

    pub async fn stop(&self) -> Result<()> {
        let _transition = self.transitions.lock().await;
        let running = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                other => {
                    *state = other;
                    return Ok(());
                }
            }
        };

        running.cancel.cancel();
        let _ = running.status_task.await;

        let mut server = running.server;
        let result = match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(Error::Io(e)),
            Ok(Err(join)) => Err(Error::Transport(format!("server task failed: {}", join))),
            Err(_) => {
                warn!(
                    "graceful shutdown exceeded {:?}; closing remaining connections",
                    SHUTDOWN_TIMEOUT
                );
                server.abort();
                self.metrics.record_error("graceful shutdown timed out");
                Ok(())
            }
        };

        self.metrics.reset_connections();
        self.observer.status(&self.status());
        info!("MCP server stopped");
        result
    }

    // ============ Configuration & tools ============

    /// Validate, persist, and apply a new configuration; a running server is
    /// restarted on the new address. Invalid input changes nothing.
    pub async fn update_config(&self, config: McpServerConfig) -> Result<()> {
        config.validate()?;
        let config = config.normalized();
        settings::set_json(self.settings.as_ref(), SERVER_CONFIG_KEY, &config).await?;
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config;

        if self.is_running() {
            self.stop().await?;
            self.start().await?;
        }
        Ok(())
    }

    /// Flip a tool on or off, on every live instance. Returns the new state.
    pub async fn toggle_tool(&self, name: &str) -> Result<bool> {
        let enabled = self
            .registry
            .toggle_with(name, || self.live_instances())
            .await?;
        self.observer.tools_changed(&self.registry.infos());
        Ok(enabled)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for McpManager {
    fn drop(&mut self) {
        if let Lifecycle::Running(running) = &*self.lock_state() {
            running.cancel.cancel();
        }
    }
}

async fn status_loop(
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
    observer: Arc<dyn StatusObserver>,
    started_at: Instant,
) {
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => observer.status(&metrics.snapshot(true, started_at.elapsed())),
        }
    }
}
