//! Admission gate library.
//!
//! Bounds how many requests a downstream API processes at once. Overflow
//! requests are queued FIFO and acknowledged immediately with a 202; each
//! completion drains one queued request into the freed slot.

pub mod admin;
pub mod admission;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;

pub use admission::{AdmissionController, GateStatus};
pub use config::GateConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
