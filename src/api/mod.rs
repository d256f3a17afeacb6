//! HTTP API for the sandboxed executor.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check, isolation variant, packages and tools
//! - `POST /api/execute` - Run code and return the spliced output

mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
