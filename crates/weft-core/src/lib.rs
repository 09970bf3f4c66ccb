pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{ErrorKind, ExecFailure, NodeError, NodeResult, Result, WeftError};
pub use event::EventBus;
pub use traits::{Node, StateStore};
pub use types::*;
