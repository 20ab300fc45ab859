//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → TransportConfig (validated, immutable)
//!     → ConnectionOptions for listeners and dialed connections
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → forwarded only if it differs from the last one
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Reload only affects tunables safe to change live (keepalive interval,
//!   options for future connections); the bind address is fixed at start

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ConnectionConfig, ListenerConfig, ObservabilityConfig, TransportConfig, TransportKind,
};
pub use watcher::ConfigWatcher;
