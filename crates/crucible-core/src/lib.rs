pub mod config;
pub mod event_bus;
pub mod run_registry;
pub mod store;

pub use config::*;
pub use event_bus::*;
pub use run_registry::*;
pub use store::*;
