//! Host-side tools callable from sandboxed code.
//!
//! A tool lives in the host process. The generated script exposes each tool as
//! a plain Python function whose body performs a remote call over the RPC
//! bridge, so sandboxed code never touches host memory or the host filesystem
//! directly.
//!
//! ## Structured vs. rich results
//!
//! - Tools with an [`Tool::output_schema`] return JSON text; the bridge parses it
//!   and hands the value straight to the sandbox.
//! - Tools without one return arbitrary [`ComplexContent`] (text, images). The
//!   sandbox only sees an opaque marker; the content is spliced back in after
//!   the run.

mod directory;
mod file_ops;

pub use directory::ListDirectory;
pub use file_ops::ReadFile;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::content::ComplexContent;
use crate::executor::script::RESERVED_GLOBALS;

// ============================================================================
// Path Resolution Utilities
// ============================================================================

/// Result of resolving a path relative to the workspace.
#[derive(Debug, Clone)]
pub struct PathResolution {
    /// The original path string provided by the caller.
    pub original: String,
    /// The fully resolved absolute path.
    pub resolved: PathBuf,
    /// Whether the resolved path is outside the workspace.
    pub is_outside_workspace: bool,
}

/// Resolve a path relative to the workspace.
///
/// Relative paths are joined with `workspace`; absolute paths are kept as-is
/// and flagged when they land outside it.
pub fn resolve_path(path_str: &str, workspace: &Path) -> PathResolution {
    let path = Path::new(path_str);
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    };

    // Canonicalize for accurate comparison (handles .., symlinks, etc.)
    let canonical_resolved = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());
    let canonical_workspace = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());

    PathResolution {
        original: path_str.to_string(),
        is_outside_workspace: !canonical_resolved.starts_with(&canonical_workspace),
        resolved,
    }
}

// ============================================================================
// Identifier Sanitization
// ============================================================================

/// Python hard keywords; none of them can name a function.
const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise",
    "return", "try", "while", "with", "yield",
];

/// Turn a tool name into a valid Python identifier.
///
/// Characters outside `[A-Za-z0-9_]` become `_`, a leading digit gets a `_`
/// prefix, and an empty name maps to `_`. Keywords and names the generated
/// script already uses get a trailing `_`.
pub fn sanitize_identifier(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if ident.is_empty() {
        return "_".to_string();
    }
    if ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    if PYTHON_KEYWORDS.contains(&ident.as_str()) || RESERVED_GLOBALS.contains(&ident.as_str()) {
        ident.push('_');
    }
    ident
}

// ============================================================================
// Tool Trait and Catalog
// ============================================================================

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// JSON schema of the tool's result, when the result is plain JSON.
    ///
    /// `None` means the result is rich content and travels through the
    /// response registry instead of the wire.
    fn output_schema(&self) -> Option<Value> {
        None
    }

    /// Execute the tool with the given arguments.
    ///
    /// The `working_dir` is the host-side workspace used for relative paths.
    async fn execute(&self, args: Value, working_dir: &Path)
        -> anyhow::Result<Vec<ComplexContent>>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Duplicate tool name: {0}")]
    DuplicateName(String),

    #[error("Tools '{first}' and '{second}' both sanitize to identifier '{identifier}'")]
    AmbiguousIdentifier {
        first: String,
        second: String,
        identifier: String,
    },
}

/// One catalog entry: the tool and the identifier it is exposed under.
#[derive(Clone)]
pub struct CatalogEntry {
    pub identifier: String,
    pub tool: Arc<dyn Tool>,
}

/// Ordered, immutable set of tools offered to one execution.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    entries: Vec<CatalogEntry>,
    by_identifier: HashMap<String, usize>,
    working_dir: PathBuf,
}

impl ToolCatalog {
    /// Build a catalog, rejecting duplicate names and sanitized-name collisions.
    pub fn new(
        tools: Vec<Arc<dyn Tool>>,
        working_dir: impl Into<PathBuf>,
    ) -> Result<Self, CatalogError> {
        let mut entries: Vec<CatalogEntry> = Vec::with_capacity(tools.len());
        let mut by_identifier = HashMap::new();

        for tool in tools {
            if entries.iter().any(|e| e.tool.name() == tool.name()) {
                return Err(CatalogError::DuplicateName(tool.name().to_string()));
            }
            let identifier = sanitize_identifier(tool.name());
            if let Some(&index) = by_identifier.get(&identifier) {
                let existing: &CatalogEntry = &entries[index];
                return Err(CatalogError::AmbiguousIdentifier {
                    first: existing.tool.name().to_string(),
                    second: tool.name().to_string(),
                    identifier,
                });
            }
            by_identifier.insert(identifier.clone(), entries.len());
            entries.push(CatalogEntry { identifier, tool });
        }

        Ok(Self {
            entries,
            by_identifier,
            working_dir: working_dir.into(),
        })
    }

    /// Catalog with no tools.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in workspace tools rooted at `working_dir`.
    pub fn builtin(working_dir: impl Into<PathBuf>) -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(ListDirectory), Arc::new(ReadFile)];
        // Built-in names are fixed and distinct.
        Self::new(tools, working_dir).unwrap_or_default()
    }

    /// Look up a tool by the identifier the sandbox calls it with, falling back
    /// to the raw tool name.
    pub fn get(&self, method: &str) -> Option<&CatalogEntry> {
        self.by_identifier
            .get(method)
            .map(|&i| &self.entries[i])
            .or_else(|| self.entries.iter().find(|e| e.tool.name() == method))
    }

    /// Sandbox identifiers, in catalog order.
    pub fn identifiers(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.identifier.clone()).collect()
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
