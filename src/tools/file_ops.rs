//! File reading tool.
//!
//! Returns rich content: text files come back as a text block, common image
//! formats as a base64 image block. Neither is JSON, so the sandbox sees a
//! marker that is replaced after the run.

use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};

use super::{resolve_path, Tool};
use crate::content::ComplexContent;

fn image_media_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Read a workspace file.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a workspace file. Text files are shown as text, images are shown as images."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace (e.g., 'output/data.json')."
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<Vec<ComplexContent>> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))?;

        let resolution = resolve_path(path, working_dir);
        if resolution.is_outside_workspace {
            return Err(anyhow::anyhow!("Path is outside the workspace: {}", path));
        }
        if !resolution.resolved.is_file() {
            return Err(anyhow::anyhow!(
                "File not found: {} (resolved to: {})",
                path,
                resolution.resolved.display()
            ));
        }

        let bytes = tokio::fs::read(&resolution.resolved).await?;

        if let Some(media_type) = image_media_type(&resolution.resolved) {
            return Ok(vec![ComplexContent::Image {
                data: base64::engine::general_purpose::STANDARD.encode(&bytes),
                media_type: media_type.to_string(),
            }]);
        }

        match String::from_utf8(bytes) {
            Ok(text) => Ok(vec![ComplexContent::text(text)]),
            Err(e) => Ok(vec![ComplexContent::text(format!(
                "Binary file detected: {} ({} bytes)",
                resolution.original,
                e.as_bytes().len()
            ))]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_text_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let out = ReadFile
            .execute(json!({"path": "a.txt"}), dir.path())
            .await
            .unwrap();
        assert_eq!(out, vec![ComplexContent::text("hello")]);
    }

    #[tokio::test]
    async fn reads_image_as_image_block() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plot.png"), [0x89u8, b'P', b'N', b'G']).unwrap();
        let out = ReadFile
            .execute(json!({"path": "plot.png"}), dir.path())
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![ComplexContent::Image {
                data: "iVBORw==".to_string(),
                media_type: "image/png".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn refuses_paths_outside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("ws");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "x").unwrap();
        let err = ReadFile
            .execute(json!({"path": "../secret.txt"}), &inner)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the workspace"));
    }
}
