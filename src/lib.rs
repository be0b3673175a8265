//! # codectx
//!
//! A local-first source code index served to AI agents over MCP.
//!
//! Each project gets its own SQLite store of files, semantic chunks, symbols,
//! and hierarchical outlines. One HTTP listener serves every project: a
//! client connected to `/mcp/<projectId>` sees the read-only `search`,
//! `outline`, and `nodeSource` tools bound to that project.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌───────────────┐
//! │ SourceParser│──▶│   Outline   │──▶│ ProjectStore  │
//! │  Embedder   │   │  assembler  │   │ (per project) │
//! └─────────────┘   └─────────────┘   └──────┬────────┘
//!                                            │ ProjectService
//!                        ┌───────────────────┤
//!                        ▼                   ▼
//!                   ┌──────────┐     ┌──────────────────┐
//!                   │   CLI    │     │ McpManager (HTTP)│
//!                   │ (codectx)│     │ /mcp/{projectId} │
//!                   └──────────┘     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Versioned schema migrations |
//! | [`models`] | Core data types |
//! | [`store`] | Per-project store CRUD |
//! | [`outline`] | Outline assembly from parser output |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`ingest`] | Index one file into a store |
//! | [`project`] | Project service used by the tools |
//! | [`settings`] | Cross-project key/value settings |
//! | [`tools`] | Built-in MCP tools |
//! | [`registry`] | Tool catalog with enable/disable |
//! | [`mcp`] | Server instances and the rmcp bridge |
//! | [`http`] | Router and per-project instance cache |
//! | [`listener`] | Connection-counting listener |
//! | [`status`] | Metrics and status snapshots |
//! | [`server`] | MCP server lifecycle |

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod http;
pub mod ingest;
pub mod listener;
pub mod logging;
pub mod mcp;
pub mod migrate;
pub mod models;
pub mod outline;
pub mod project;
pub mod registry;
pub mod server;
pub mod settings;
pub mod status;
pub mod store;
pub mod tools;

pub use error::{Error, Result};
