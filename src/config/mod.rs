//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GateConfig (validated, immutable)
//!     → shared with the server and the admission controller
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; capacity never changes at runtime
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdmissionConfig, GateConfig, ListenerConfig, LogFormat, ObservabilityConfig,
    TimeoutConfig, UpstreamConfig,
};
pub use validation::{validate_config, ValidationError};
