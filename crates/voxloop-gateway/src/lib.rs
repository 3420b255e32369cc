//! HTTP gateway for the voice turn pipeline.
//!
//! Serves the session API under `/sessions`, the fixed four-call device
//! protocol (`/upload`, `/get_response`, `/get_response2`, `/get_wav`) on a
//! default session, and `/health`.

pub mod error;
pub mod legacy;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod routes;
pub mod server;
pub mod state;

#[cfg(test)]
mod testing;

pub use error::ApiError;
pub use server::{router, serve, start_gateway};
pub use state::GatewayState;
