//! HTTP gateway: index trigger, status, structure and streamed chat.

mod error;
mod handlers;
mod router;
mod server;

pub use error::{ApiError, GatewayError};
pub use server::{AppState, GatewayServer};
