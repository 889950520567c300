//! Read-only status API for twinhub.
//!
//! Serves the sync stream status board over HTTP so operators can see each
//! stream's checkpoint, lag and failures. Lag is an operational signal:
//! it shows up here and in the logs, never as a command error.

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;

pub use router::build_router;
pub use server::{ServerConfig, ServerError, start_server};
pub use state::AppState;
