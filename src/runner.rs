//! One complete code execution: run, bridge tool calls, splice results.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::bridge::{self, CallHandler, FileCallHandler, ToolCallHandler, ToolResponseRegistry};
use crate::content::ComplexContent;
use crate::executor::provision::PackageFailure;
use crate::executor::{CodeExecutor, ExecutionRequest, ExecutorError, SandboxEndpoints};
use crate::splice::splice;
use crate::tools::ToolCatalog;

/// How long bridge tasks may linger after the script has exited.
const BRIDGE_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub content: Vec<ComplexContent>,
    pub exit_code: i32,
    pub timed_out: bool,
    pub package_failures: Vec<PackageFailure>,
}

/// Run `request` on `executor` with `catalog` exposed to the code.
pub async fn execute_code(
    executor: &mut dyn CodeExecutor,
    catalog: Arc<ToolCatalog>,
    request: &ExecutionRequest,
) -> Result<ExecutionResult, ExecutorError> {
    let registry = ToolResponseRegistry::new();
    let identifiers = catalog.identifiers();
    let mut bridges: Vec<JoinHandle<()>> = Vec::new();

    let tools_handler: Arc<dyn CallHandler> = Arc::new(ToolCallHandler::new(catalog, registry.clone()));
    let mut on_ready = |endpoints: &SandboxEndpoints| {
        bridges.push(bridge::attach(
            endpoints.tools_url.clone(),
            tools_handler.clone(),
            endpoints.abort.clone(),
        ));
        if let Some(files) = &endpoints.files {
            let handler: Arc<dyn CallHandler> = Arc::new(FileCallHandler::new(files.workspace.clone()));
            bridges.push(bridge::attach(files.url.clone(), handler, endpoints.abort.clone()));
        }
    };

    let output = executor.execute(request, &identifiers, &mut on_ready).await?;

    for handle in bridges {
        let abort = handle.abort_handle();
        if tokio::time::timeout(BRIDGE_SHUTDOWN_GRACE, handle).await.is_err() {
            tracing::debug!("Bridge still running after script exit, aborting it");
            abort.abort();
        }
    }

    let responses = registry.drain().await;
    Ok(ExecutionResult {
        content: splice(&output.output, &responses),
        exit_code: output.exit_code,
        timed_out: output.timed_out,
        package_failures: output.package_failures,
    })
}
