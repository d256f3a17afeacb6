//! # sandboxed-exec
//!
//! Runs agent-written Python in an isolated interpreter while letting that
//! code call tools owned by the host process.
//!
//! ## Architecture
//!
//! ```text
//!   ExecutionRequest
//!         │
//!         ▼
//!   ┌───────────────┐   venv / container    ┌──────────────────┐
//!   │   Executor    │ ────────────────────▶ │  generated script │
//!   │ (provision,   │   INITIALIZED SERVER  │  (stubs + RPC     │
//!   │  render, run) │ ◀──────────────────── │   server + code)  │
//!   └───────┬───────┘                       └────────┬─────────┘
//!           │ on ready                               │ tool calls
//!           ▼                                        ▼
//!   ┌───────────────┐       WebSocket RPC      ┌──────────┐
//!   │    Bridge     │ ◀──────────────────────▶ │  stubs   │
//!   └───────┬───────┘                          └──────────┘
//!           │ rich results by call id
//!           ▼
//!   ┌───────────────┐
//!   │   Splicer     │ ──▶ Vec<ComplexContent>
//!   └───────────────┘
//! ```
//!
//! ## Modules
//! - `executor`: environment provisioning, script rendering, process supervision
//! - `bridge`: host side of the RPC channel (tool calls, file transfer)
//! - `splice`: marker substitution in the recorded output
//! - `runner`: ties the three together for one execution
//! - `tools`: tool trait, catalog, built-in workspace tools
//! - `api`: HTTP surface

pub mod api;
pub mod bridge;
pub mod config;
pub mod content;
pub mod executor;
pub mod runner;
pub mod splice;
pub mod tools;
pub mod util;

pub use config::Config;
pub use content::ComplexContent;
pub use executor::{CodeExecutor, ExecutionRequest, Executor, WorkspaceMode};
pub use runner::{execute_code, ExecutionResult};
pub use tools::{Tool, ToolCatalog};
