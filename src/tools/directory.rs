//! Directory listing tool.
//!
//! Returns structured JSON, so the sandbox receives a real `dict` instead of a
//! marker token.

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{resolve_path, Tool};
use crate::content::ComplexContent;

#[derive(Debug, Serialize)]
struct DirEntry {
    path: String,
    is_dir: bool,
    size: u64,
}

/// List contents of a workspace directory.
pub struct ListDirectory;

#[async_trait]
impl Tool for ListDirectory {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List files and directories under a workspace path. Returns {\"entries\": [{\"path\", \"is_dir\", \"size\"}]}."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path relative to the workspace. Use '.' for the workspace root."
                },
                "max_depth": {
                    "type": "integer",
                    "description": "Maximum depth to traverse (default: 3)"
                }
            },
            "required": ["path"]
        })
    }

    fn output_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "entries": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "path": {"type": "string"},
                            "is_dir": {"type": "boolean"},
                            "size": {"type": "integer"}
                        }
                    }
                }
            }
        }))
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<Vec<ComplexContent>> {
        let path = args["path"].as_str().unwrap_or(".");
        let max_depth = args["max_depth"].as_u64().unwrap_or(3) as usize;

        let resolution = resolve_path(path, working_dir);
        if resolution.is_outside_workspace {
            return Err(anyhow::anyhow!("Path is outside the workspace: {}", path));
        }
        if !resolution.resolved.is_dir() {
            return Err(anyhow::anyhow!(
                "Directory not found: {} (resolved to: {})",
                path,
                resolution.resolved.display()
            ));
        }

        let root = resolution.resolved;
        let entries: Vec<DirEntry> = WalkDir::new(&root)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.depth() > 0)
            .map(|entry| {
                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                DirEntry {
                    path: relative.to_string_lossy().replace('\\', "/"),
                    is_dir: entry.file_type().is_dir(),
                    size: entry.metadata().map(|m| m.len()).unwrap_or(0),
                }
            })
            .collect();

        let body = serde_json::to_string(&json!({ "entries": entries }))?;
        Ok(vec![ComplexContent::text(body)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::extract_all_text;

    #[tokio::test]
    async fn lists_nested_entries_as_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/a.csv"), "x,y\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();

        let out = ListDirectory
            .execute(json!({"path": "."}), dir.path())
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&extract_all_text(&out)).unwrap();
        let paths: Vec<&str> = value["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["data", "data/a.csv", "notes.txt"]);
        assert_eq!(value["entries"][1]["size"], 4);
    }

    #[tokio::test]
    async fn rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = ListDirectory
            .execute(json!({"path": "nope"}), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Directory not found"));
    }
}
