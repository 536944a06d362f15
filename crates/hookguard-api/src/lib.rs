//! Hookguard HTTP API.
//!
//! Two audiences share one router: the bot posts signed deliveries to
//! `/webhooks/bot`, and operators use the bearer-authenticated `/api` routes
//! to inspect, replay and ignore events or undo delayed jobs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ErrorDetail, ErrorResponse};
pub use middleware::auth::{Operator, OperatorKeys};
pub use server::{create_router, create_router_with_timeout, shutdown_signal, start_server};
pub use state::AppState;
