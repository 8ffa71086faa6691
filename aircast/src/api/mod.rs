//! HTTP adaptor: a thin axum surface over the core components.

pub mod error;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{AppState, build_router, serve};
