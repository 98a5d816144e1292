//! Server module for pgsched
//!
//! # Module Structure
//!
//! - `config`: Configuration structures
//! - `loader`: Configuration loading from files and environment
//! - `logging`: Tracing subscriber setup
//! - `validation`: Startup configuration checks
//! - `components`: Store, connector and executor construction
//! - `init`: Service startup and shutdown

mod components;
pub mod config;
mod init;
mod loader;
mod logging;
mod validation;

// Re-export public API
pub use components::{build_executor, connect_store, source_connector};
pub use init::run;
pub use loader::load_config;
pub use logging::init_logging;
