//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::content::ComplexContent;
use crate::executor::provision::PackageFailure;

/// Which workspace mode a request runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceChoice {
    /// Throw-away directory
    Ephemeral,
    /// Run inside the configured workspace
    Shared,
    /// Work on a copy, transfer files explicitly
    Synced,
}

/// Request to run a piece of code.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    /// Python source
    pub code: String,

    /// Packages to install before running (on top of the configured extras)
    #[serde(default)]
    pub packages: Vec<String>,

    /// Workspace mode override (defaults from configuration)
    pub workspace: Option<WorkspaceChoice>,
}

/// Result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    /// Console output with rich tool results spliced in
    pub content: Vec<ComplexContent>,

    /// Interpreter exit code
    pub exit_code: i32,

    /// Whether the run was killed by the timeout
    pub timed_out: bool,

    /// Requested packages that failed to install, with pip's output
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub package_failures: Vec<PackageFailure>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Isolation variant in use
    pub isolation: String,

    /// Packages installed for every run
    pub packages: Vec<String>,

    /// Tools exposed to sandboxed code
    pub tools: Vec<String>,
}
