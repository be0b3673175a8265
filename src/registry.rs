//! Tool registry: the catalog of MCP tools, their enabled state, and call counts.
//!
//! The registry is independent of the transport. Each entry carries a
//! registration closure that binds the tool into a [`ServerInstance`]; the
//! HTTP layer calls [`ToolRegistry::bind_enabled`] when it builds an
//! instance, and [`ToolRegistry::toggle`] re-binds a tool on live instances
//! without restarting the listener.
//!
//! Only the set of disabled tool names is persisted (settings key
//! [`DISABLED_TOOLS_KEY`]). Any tool not listed there starts enabled.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};
use crate::mcp::ServerInstance;
use crate::settings::{self, SettingsStore, DISABLED_TOOLS_KEY};
use crate::status::Metrics;
use crate::tools::{self, Tool};

/// Binds a tool into one server instance.
pub type RegisterFn = Arc<dyn Fn(&ServerInstance) + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════
// Tool State
// ═══════════════════════════════════════════════════════════════════════

struct ToolState {
    name: String,
    description: String,
    enabled: bool,
    register: RegisterFn,
    call_count: u64,
}

/// Externally visible view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub call_count: u64,
}

// ═══════════════════════════════════════════════════════════════════════
// ToolRegistry
// ═══════════════════════════════════════════════════════════════════════

pub struct ToolRegistry {
    tools: Mutex<Vec<ToolState>>,
    metrics: Arc<Metrics>,
    settings: Arc<dyn SettingsStore>,
    /// Serializes toggles so the persisted disabled set is written in order.
    toggle_lock: tokio::sync::Mutex<()>,
}

impl ToolRegistry {
    pub fn new(metrics: Arc<Metrics>, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            tools: Mutex::new(Vec::new()),
            metrics,
            settings,
            toggle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Registry holding `search`, `outline`, and `nodeSource`, all enabled.
    pub fn with_builtins(metrics: Arc<Metrics>, settings: Arc<dyn SettingsStore>) -> Self {
        let registry = Self::new(metrics, settings);
        for tool in tools::builtin_tools() {
            registry.register(tool);
        }
        registry
    }

    /// Add a tool whose registration adds it to the instance's tool set.
    /// A tool with the same name replaces the earlier entry.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let description = tool.description().to_string();
        let register: RegisterFn = Arc::new(move |instance: &ServerInstance| {
            instance.add_tool(tool.clone());
        });
        self.register_with(name, description, register);
    }

    /// Add an entry with a custom registration closure.
    pub fn register_with(&self, name: String, description: String, register: RegisterFn) {
        let mut tools = self.lock();
        let state = ToolState {
            name,
            description,
            enabled: true,
            register,
            call_count: 0,
        };
        match tools.iter_mut().find(|t| t.name == state.name) {
            Some(existing) => *existing = state,
            None => tools.push(state),
        }
    }

    /// Read the persisted disabled set and apply it.
    pub async fn load_disabled(&self) -> Result<()> {
        let disabled: Vec<String> = settings::get_json(self.settings.as_ref(), DISABLED_TOOLS_KEY)
            .await?
            .unwrap_or_default();
        self.apply_disabled(&disabled);
        Ok(())
    }

    /// Mark exactly the tools in `disabled` as disabled. Unknown names are ignored.
    pub fn apply_disabled(&self, disabled: &[String]) {
        let mut tools = self.lock();
        for tool in tools.iter_mut() {
            tool.enabled = !disabled.iter().any(|d| d == &tool.name);
        }
    }

    /// Register every enabled tool on `instance`.
    pub fn bind_enabled(&self, instance: &ServerInstance) {
        let registrations: Vec<RegisterFn> = self
            .lock()
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.register.clone())
            .collect();
        for register in registrations {
            register(instance);
        }
    }

    /// Flip a tool's enabled state, persist the disabled set, and rebind the
    /// tool on `live` instances. Returns the new enabled state.
    pub async fn toggle(&self, name: &str, live: &[Arc<ServerInstance>]) -> Result<bool> {
        self.toggle_with(name, || live.to_vec()).await
    }

    /// Like [`ToolRegistry::toggle`], but the live instances are listed only
    /// after the flip, so an instance built concurrently is never missed.
    ///
    /// If persisting fails the flip is reverted and the reverted state is
    /// rebound.
    pub async fn toggle_with<F>(&self, name: &str, live: F) -> Result<bool>
    where
        F: FnOnce() -> Vec<Arc<ServerInstance>>,
    {
        let _serial = self.toggle_lock.lock().await;

        let (enabled, register, disabled) = {
            let mut tools = self.lock();
            let tool = tools
                .iter_mut()
                .find(|t| t.name == name)
                .ok_or_else(|| Error::not_found("tool", name))?;
            tool.enabled = !tool.enabled;
            let enabled = tool.enabled;
            let register = tool.register.clone();
            (enabled, register, disabled_names(&tools))
        };

        let persisted =
            settings::set_json(self.settings.as_ref(), DISABLED_TOOLS_KEY, &disabled).await;
        if persisted.is_err() {
            let mut tools = self.lock();
            if let Some(tool) = tools.iter_mut().find(|t| t.name == name) {
                tool.enabled = !enabled;
            }
        }
        let bound = if persisted.is_ok() { enabled } else { !enabled };

        for instance in live() {
            instance.remove_tool(name);
            if bound {
                register(instance.as_ref());
            }
        }
        persisted?;
        info!(tool = name, enabled, "toggled tool");
        Ok(enabled)
    }

    /// Count one invocation of `name` that took `elapsed`.
    pub fn record_call(&self, name: &str, elapsed: Duration) {
        self.metrics.record_request(elapsed);
        let mut tools = self.lock();
        if let Some(tool) = tools.iter_mut().find(|t| t.name == name) {
            tool.call_count += 1;
        }
    }

    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.lock().iter().find(|t| t.name == name).map(|t| t.enabled)
    }

    pub fn call_count(&self, name: &str) -> Option<u64> {
        self.lock()
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.call_count)
    }

    pub fn infos(&self) -> Vec<ToolInfo> {
        self.lock()
            .iter()
            .map(|t| ToolInfo {
                name: t.name.clone(),
                description: t.description.clone(),
                enabled: t.enabled,
                call_count: t.call_count,
            })
            .collect()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ToolState>> {
        self.tools.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn disabled_names(tools: &[ToolState]) -> Vec<String> {
    tools
        .iter()
        .filter(|t| !t.enabled)
        .map(|t| t.name.clone())
        .collect()
}
