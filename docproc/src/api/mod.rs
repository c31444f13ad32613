//! HTTP and WebSocket surface.

pub mod error;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult, ErrorCode};
pub use server::{ApiServer, ApiServerConfig, AppState};
