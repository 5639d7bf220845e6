//! The outermost shell: WebSocket gateway, HTTP router, and startup
//! configuration for the Taleweave adventure server.

pub mod config;
pub mod gateway;

pub use config::{ClientConfig, ServerConfig};
pub use gateway::{AppState, router};
