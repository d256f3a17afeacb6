//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, IsolationKind};
use crate::executor::{self, CodeExecutor, ExecutionRequest, ExecutorError, WorkspaceMode};
use crate::runner::execute_code;
use crate::tools::ToolCatalog;

use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Executions run one at a time per executor
    pub executor: Mutex<Box<dyn CodeExecutor>>,
    pub catalog: Arc<ToolCatalog>,
    /// Read once so health checks never wait on a running execution
    packages: Vec<String>,
}

impl AppState {
    pub fn new(config: Config, executor: Box<dyn CodeExecutor>, catalog: ToolCatalog) -> Self {
        let packages = executor.available_packages();
        Self {
            config,
            executor: Mutex::new(executor),
            catalog: Arc::new(catalog),
            packages,
        }
    }

    fn workspace_for(&self, choice: Option<WorkspaceChoice>) -> WorkspaceMode {
        let choice = choice.unwrap_or(if self.config.workspace_sync {
            WorkspaceChoice::Synced
        } else {
            WorkspaceChoice::Shared
        });
        match choice {
            WorkspaceChoice::Ephemeral => WorkspaceMode::Ephemeral,
            WorkspaceChoice::Shared => WorkspaceMode::Shared(self.config.workspace_path.clone()),
            WorkspaceChoice::Synced => WorkspaceMode::Synced(self.config.workspace_path.clone()),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/execute", post(execute))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let executor = executor::from_config(&config);
    let catalog = ToolCatalog::builtin(config.workspace_path.clone());
    tracing::info!(
        tools = ?catalog.identifiers(),
        workspace = %config.workspace_path.display(),
        "Tool catalog ready"
    );

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config, executor, catalog));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        isolation: match state.config.isolation {
            IsolationKind::Local => "local".to_string(),
            IsolationKind::Docker => "docker".to_string(),
        },
        packages: state.packages.clone(),
        tools: state.catalog.identifiers(),
    })
}

/// Run code in the sandbox.
async fn execute(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, (StatusCode, String)> {
    let request = ExecutionRequest::new(req.code)
        .with_packages(req.packages)
        .with_workspace(state.workspace_for(req.workspace));

    let mut executor = state.executor.lock().await;
    let result = execute_code(&mut **executor, Arc::clone(&state.catalog), &request)
        .await
        .map_err(|e| {
            tracing::error!("Execution failed: {}", e);
            let status = match &e {
                ExecutorError::Workspace(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, e.to_string())
        })?;

    Ok(Json(ExecuteResponse {
        content: result.content,
        exit_code: result.exit_code,
        timed_out: result.timed_out,
        package_failures: result.package_failures,
    }))
}
