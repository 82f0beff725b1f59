//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, trace + request ID + body limit layers)
//!     → admission middleware (exempt paths skip it)
//!     → handlers.rs (health, diagnostics, deferred results)
//!       or the downstream fallback (forward to upstream)
//!     → response.rs (JSON envelopes for locally generated bodies)
//!     → Send to client
//! ```

pub mod handlers;
pub mod response;
pub mod server;

pub use server::{AppState, HttpServer, ServerError};
