//! Backends for the keyed execution state store.
//!
//! Engines and orchestrators only see `Arc<dyn StateStore>`; the backend is
//! picked from `[store] backend` in the config.

pub mod memory;

pub use memory::MemoryStateStore;

use std::sync::Arc;

use tracing::debug;

use weft_core::config::StoreConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::StateStore;

/// Create the store backend named in the config.
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn StateStore>> {
    match config.backend.as_str() {
        "memory" => {
            debug!(backend = "memory", "Creating state store");
            Ok(Arc::new(MemoryStateStore::new()))
        }
        other => Err(WeftError::Config(format!(
            "unknown state store backend: {}",
            other
        ))),
    }
}
