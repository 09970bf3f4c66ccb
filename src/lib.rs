//! Weft: a single-process workflow engine.
//!
//! A [`Flow`] is a graph of [`Node`]s. Each node prepares, executes (with
//! retries) and finalizes over a [`SharedState`], and its finalize picks the
//! action that selects the next node.
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft::{Flow, FlowEngine, MemoryStateStore, SharedState};
//! # async fn demo(flow: Flow) -> weft::Result<()> {
//! let engine = FlowEngine::new(Arc::new(MemoryStateStore::new()));
//! let run = engine.run(&flow, SharedState::new()).await?;
//! println!("{:?}", run.state);
//! # Ok(())
//! # }
//! ```

pub mod telemetry;

pub use weft_core::config::{
    BatchConfig, EngineConfig, EventsConfig, FlowConfig, MonitoringConfig, RecoveryConfig, RecoveryRule,
    RuleAction, StoreConfig,
};
pub use weft_core::error::{ErrorKind, ExecFailure, NodeError, NodeResult, Result, WeftError};
pub use weft_core::event::EventBus;
pub use weft_core::traits::{Node, StateStore};
pub use weft_core::types::{
    Dispatch, ExecutionId, FlowEvent, NodeId, Params, Phase, SharedState, Transition, DEFAULT_ACTION,
};
pub use weft_engine::{
    classify, BatchRun, ErrorCategory, Flow, FlowBuilder, FlowEngine, FlowRun, MonitoringRecord,
    MonitoringRecorder, ParallelBatch, Recovered, Recovery, RunStatus, SequentialBatch, StepStatus, Strategy,
};
pub use weft_store::{create_store, MemoryStateStore};
