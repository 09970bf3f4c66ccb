//! Flow execution for Weft.
//!
//! [`FlowEngine`] walks a [`Flow`] node by node. [`SequentialBatch`] and
//! [`ParallelBatch`] drive it once per batch item. [`Recovery`] and
//! [`MonitoringRecorder`] plug into the engine.

pub mod batch;
pub mod engine;
pub mod flow;
pub mod lifecycle;
pub mod monitor;
pub mod parallel;
pub mod recovery;
pub mod resolver;
pub mod retry;

pub use batch::{BatchRun, SequentialBatch};
pub use engine::{FlowEngine, FlowRun, FlowState};
pub use flow::{Edges, Flow, FlowBuilder};
pub use lifecycle::{run_node, run_with_prep, NodeRun};
pub use monitor::{MonitoringRecord, MonitoringRecorder, RunStatus, StepStatus};
pub use parallel::{ParallelBatch, CONTINUATION_KEY};
pub use recovery::{classify, Backoff, ErrorCategory, Recovered, Recovery, Strategy};
pub use resolver::{resolve, Resolution};
pub use retry::{execute_node, retry, Attempted, Executed};
