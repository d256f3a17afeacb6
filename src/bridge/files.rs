//! Workspace file transfer for the sync workspace mode.
//!
//! The sandbox works in a private copy and asks the host to move files in
//! (`load_file`) and out (`save_file`). Content travels base64-encoded.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{builtin_method, CallHandler, RpcRequest, RpcResult};

#[derive(Debug, Deserialize)]
struct LoadArgs {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SaveArgs {
    name: String,
    content: String,
}

/// Serves `load_file`/`save_file` against a host workspace directory.
pub struct FileCallHandler {
    workspace: PathBuf,
}

impl FileCallHandler {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    /// Map a sandbox-relative name into the workspace.
    fn resolve(&self, name: &str) -> Result<PathBuf, String> {
        let rel = Path::new(name);
        if name.trim().is_empty() {
            return Err("File name is empty".to_string());
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(format!("File name {name} must be relative to the workspace")),
            }
        }
        Ok(self.workspace.join(rel))
    }

    async fn load(&self, args: Value) -> Result<Value, String> {
        let args: LoadArgs = serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {e}"))?;
        let path = self.resolve(&args.name)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| format!("Failed to read {}: {}", args.name, e))?;
        tracing::debug!(file = %args.name, bytes = bytes.len(), "Sending workspace file to sandbox");
        Ok(json!({
            "name": args.name,
            "content": base64::engine::general_purpose::STANDARD.encode(bytes),
        }))
    }

    async fn save(&self, args: Value) -> Result<Value, String> {
        let args: SaveArgs = serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {e}"))?;
        let path = self.resolve(&args.name)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(args.content.as_bytes())
            .map_err(|e| format!("Invalid base64 content for {}: {}", args.name, e))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create directory for {}: {}", args.name, e))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| format!("Failed to write {}: {}", args.name, e))?;
        tracing::debug!(file = %args.name, bytes = bytes.len(), "Saved workspace file from sandbox");
        Ok(json!({ "name": args.name, "bytes": bytes.len() }))
    }
}

#[async_trait]
impl CallHandler for FileCallHandler {
    async fn handle(&self, request: RpcRequest) -> RpcResult {
        if let Some(result) = builtin_method(&request) {
            return result;
        }
        let outcome = match request.method.as_str() {
            "load_file" => self.load(request.arguments).await,
            "save_file" => self.save(request.arguments).await,
            other => Err(format!("Unknown file method {other}")),
        };
        match outcome {
            Ok(value) => RpcResult::ok(value),
            Err(message) => {
                tracing::warn!(method = %request.method, "File transfer failed: {}", message);
                RpcResult::err(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(method: &str, arguments: Value) -> RpcRequest {
        RpcRequest {
            method: method.to_string(),
            arguments,
            call_id: Some("f1".to_string()),
        }
    }

    #[tokio::test]
    async fn load_returns_base64_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.csv"), "a,b\n1,2\n").unwrap();
        let handler = FileCallHandler::new(dir.path());

        let result = handler.handle(call("load_file", json!({"name": "data.csv"}))).await;
        assert!(!result.error);
        assert_eq!(result.value["name"], "data.csv");
        assert_eq!(result.value["content"], "YSxiCjEsMgo=");
    }

    #[tokio::test]
    async fn save_writes_into_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileCallHandler::new(dir.path());

        let result = handler
            .handle(call("save_file", json!({"name": "out/report.txt", "content": "aGVsbG8="})))
            .await;
        assert_eq!(result, RpcResult::ok(json!({"name": "out/report.txt", "bytes": 5})));
        assert_eq!(std::fs::read_to_string(dir.path().join("out/report.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn escaping_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileCallHandler::new(dir.path());

        for name in ["../secret", "/etc/passwd", "a/../../b", ""] {
            let result = handler.handle(call("load_file", json!({ "name": name }))).await;
            assert!(result.error, "{name}");
        }
        let result = handler
            .handle(call("save_file", json!({"name": "../x", "content": "aGVsbG8="})))
            .await;
        assert!(result.error);
        assert!(!dir.path().parent().unwrap().join("x").exists());
    }

    #[tokio::test]
    async fn missing_file_and_bad_base64_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileCallHandler::new(dir.path());

        let missing = handler.handle(call("load_file", json!({"name": "nope.txt"}))).await;
        assert!(missing.error);
        let bad = handler
            .handle(call("save_file", json!({"name": "x.bin", "content": "%%%"})))
            .await;
        assert!(bad.error);
        let unknown = handler.handle(call("delete_file", json!({}))).await;
        assert!(unknown.error);
    }
}
