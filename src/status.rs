//! Server metrics and the externally observable status snapshot.
//!
//! [`Metrics`] is shared by the listener (connection accounting), the tool
//! registry (request count and latency), and the MCP bridge (last error).
//! All counters are atomics; only the last error sits behind a lock.
//!
//! Connection accounting carries a generation number. Stopping the server
//! zeroes the live count and bumps the generation, so a connection opened
//! before the reset that closes afterwards does not decrement the new count.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::registry::ToolInfo;

#[derive(Debug, Default)]
pub struct Metrics {
    total_requests: AtomicU64,
    total_latency_us: AtomicU64,
    active_connections: AtomicI64,
    generation: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, elapsed: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn average_response_time_ms(&self) -> f64 {
        let requests = self.total_requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 0.0;
        }
        let total_us = self.total_latency_us.load(Ordering::Relaxed);
        total_us as f64 / requests as f64 / 1000.0
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let mut last = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(message.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Count a new connection. Returns the generation to hand back on close.
    pub fn connection_opened(&self) -> u64 {
        let generation = self.generation.load(Ordering::Acquire);
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        generation
    }

    /// Uncount a connection opened in `generation`; stale generations are ignored.
    pub fn connection_closed(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            });
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Zero the live connection count regardless of in-flight connections.
    pub fn reset_connections(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.active_connections.store(0, Ordering::Release);
    }

    pub fn snapshot(&self, is_running: bool, uptime: Duration) -> McpStatus {
        McpStatus {
            is_running,
            uptime_seconds: if is_running { uptime.as_secs() } else { 0 },
            active_connections: self.active_connections(),
            total_requests: self.total_requests(),
            average_response_time_ms: self.average_response_time_ms(),
            last_error: self.last_error(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpStatus {
    pub is_running: bool,
    pub uptime_seconds: u64,
    pub active_connections: i64,
    pub total_requests: u64,
    pub average_response_time_ms: f64,
    pub last_error: Option<String>,
}

/// Receives periodic status snapshots and tool-list changes.
pub trait StatusObserver: Send + Sync {
    fn status(&self, status: &McpStatus);

    fn tools_changed(&self, tools: &[ToolInfo]);
}

/// Default observer: writes events to the tracing log.
pub struct LogObserver;

impl StatusObserver for LogObserver {
    fn status(&self, status: &McpStatus) {
        debug!(
            running = status.is_running,
            uptime_s = status.uptime_seconds,
            connections = status.active_connections,
            requests = status.total_requests,
            avg_ms = status.average_response_time_ms,
            "mcp status"
        );
    }

    fn tools_changed(&self, tools: &[ToolInfo]) {
        let enabled: Vec<&str> = tools
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.name.as_str())
            .collect();
        info!(enabled = ?enabled, "mcp tools changed");
    }
}
