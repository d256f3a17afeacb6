//! End-to-end runs against a real interpreter.
//!
//! These need `python3` with the `venv` module and network access to PyPI, so
//! they are ignored by default: `cargo test -- --ignored`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sandboxed_exec::config::ExecutorConfig;
use sandboxed_exec::{execute_code, ComplexContent, ExecutionRequest, Executor, Tool, ToolCatalog, WorkspaceMode};
use serde_json::{json, Value};

struct GetTime;

#[async_trait]
impl Tool for GetTime {
    fn name(&self) -> &str {
        "get_time"
    }

    fn description(&self) -> &str {
        "Returns the current time"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, _working_dir: &Path) -> anyhow::Result<Vec<ComplexContent>> {
        Ok(vec![ComplexContent::text("12:00")])
    }
}

fn config() -> ExecutorConfig {
    ExecutorConfig {
        stream_output: false,
        ..Default::default()
    }
}

#[tokio::test]
#[ignore = "needs python3 and PyPI"]
async fn hello_world_output_has_no_wrapper_markers() {
    let mut executor = Executor::local(config());
    let result = execute_code(
        &mut executor,
        Arc::new(ToolCatalog::empty()),
        &ExecutionRequest::new("print(\"hello\")"),
    )
    .await
    .unwrap();

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.content, vec![ComplexContent::text("hello\n")]);
}

#[tokio::test]
#[ignore = "needs python3 and PyPI"]
async fn rich_tool_result_is_spliced() {
    let catalog = ToolCatalog::new(vec![Arc::new(GetTime) as Arc<dyn Tool>], std::env::temp_dir()).unwrap();
    let mut executor = Executor::local(config());
    let result = execute_code(
        &mut executor,
        Arc::new(catalog),
        &ExecutionRequest::new("print(\"The time is\", get_time({}))"),
    )
    .await
    .unwrap();

    assert_eq!(
        result.content,
        vec![
            ComplexContent::text("The time is "),
            ComplexContent::text("12:00"),
            ComplexContent::text("\n"),
        ]
    );
}

#[tokio::test]
#[ignore = "needs python3 and PyPI"]
async fn structured_tool_and_shared_workspace() {
    let ws = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("notes.txt"), "hi").unwrap();
    let catalog = ToolCatalog::builtin(ws.path());
    let mut executor = Executor::local(config());
    let request = ExecutionRequest::new(
        "listing = list_directory({\"path\": \".\"})\nprint([e[\"path\"] for e in listing[\"entries\"]])\nopen(\"out.txt\", \"w\").write(\"done\")",
    )
    .with_workspace(WorkspaceMode::Shared(ws.path().to_path_buf()));

    let result = execute_code(&mut executor, Arc::new(catalog), &request).await.unwrap();

    assert_eq!(result.content, vec![ComplexContent::text("['notes.txt']\n")]);
    assert_eq!(std::fs::read_to_string(ws.path().join("out.txt")).unwrap(), "done");
}

#[tokio::test]
#[ignore = "needs python3 and PyPI"]
async fn synced_workspace_moves_files_explicitly() {
    let ws = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("in.txt"), "abc").unwrap();
    let mut executor = Executor::local(config());
    let request = ExecutionRequest::new(
        "load_file(\"in.txt\")\ndata = open(\"in.txt\").read()\nopen(\"out.txt\", \"w\").write(data.upper())\nsave_file(\"out.txt\")\nprint(WORKSPACE_FILES)",
    )
    .with_workspace(WorkspaceMode::Synced(ws.path().to_path_buf()));

    let result = execute_code(&mut executor, Arc::new(ToolCatalog::empty()), &request)
        .await
        .unwrap();

    assert_eq!(result.content, vec![ComplexContent::text("['in.txt']\n")]);
    assert_eq!(std::fs::read_to_string(ws.path().join("out.txt")).unwrap(), "ABC");
}
