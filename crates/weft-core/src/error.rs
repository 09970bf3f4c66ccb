use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Phase;

/// Kind hint a node attaches to a failure so recovery can classify it
/// without guessing from the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Argument,
    Arithmetic,
    KeyNotFound,
    PatternMismatch,
    Timeout,
    Network,
    /// Caller-supplied category label.
    Custom(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Argument => write!(f, "argument"),
            ErrorKind::Arithmetic => write!(f, "arithmetic"),
            ErrorKind::KeyNotFound => write!(f, "key_not_found"),
            ErrorKind::PatternMismatch => write!(f, "pattern_mismatch"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Custom(label) => write!(f, "{}", label),
        }
    }
}

/// Failure produced by a node stage (prepare, execute, finalize, fallback).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct NodeError {
    pub kind: Option<ErrorKind>,
    pub message: String,
}

impl NodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }

    pub fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Network, message)
    }

    pub fn key_not_found(key: &str) -> Self {
        Self::with_kind(ErrorKind::KeyNotFound, format!("key not found: {}", key))
    }

    pub fn custom(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Custom(label.into()), message)
    }
}

impl From<String> for NodeError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for NodeError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// Why the execute stage of a node gave up.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecFailure {
    #[error("max retries exceeded after {attempts} attempt(s): {last}")]
    MaxRetriesExceeded { attempts: u32, last: NodeError },

    #[error("fallback failed: {fallback} (after: {original})")]
    FallbackFailed {
        original: NodeError,
        fallback: NodeError,
    },
}

impl ExecFailure {
    /// The failure that ended the retry loop.
    pub fn last_error(&self) -> &NodeError {
        match self {
            ExecFailure::MaxRetriesExceeded { last, .. } => last,
            ExecFailure::FallbackFailed { original, .. } => original,
        }
    }
}

#[derive(Debug, Error)]
pub enum WeftError {
    // Node lifecycle errors
    #[error("prepare failed in node {node}: {source}")]
    Prepare { node: String, source: NodeError },

    #[error("execution failed in node {node}: {failure}")]
    Execution { node: String, failure: ExecFailure },

    #[error("finalize failed in node {node}: {source}")]
    Finalize { node: String, source: NodeError },

    // Flow errors
    #[error("Node not found in flow: {0}")]
    NodeNotFound(String),

    #[error("Flow exceeded max steps ({0})")]
    MaxStepsExceeded(usize),

    // Recovery errors
    #[error("flow aborted in node {node} ({phase}): {cause}")]
    FlowAborted {
        node: String,
        phase: Phase,
        cause: String,
    },

    #[error("no recovery strategy for {category} during {phase}")]
    NoRecoveryStrategy { category: String, phase: Phase },

    #[error("recovery fallback failed: {0}")]
    RecoveryFallbackFailed(NodeError),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("State store error: {0}")]
    Store(String),

    // Task errors
    #[error("Task join error: {0}")]
    Join(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Node the failure originated in, if it is a lifecycle failure.
    pub fn node(&self) -> Option<&str> {
        match self {
            WeftError::Prepare { node, .. }
            | WeftError::Execution { node, .. }
            | WeftError::Finalize { node, .. }
            | WeftError::FlowAborted { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Lifecycle phase the failure belongs to.
    pub fn phase(&self) -> Phase {
        match self {
            WeftError::Prepare { .. } => Phase::Prepare,
            WeftError::Execution { .. } => Phase::Execute,
            WeftError::Finalize { .. } => Phase::Finalize,
            WeftError::FlowAborted { phase, .. } => *phase,
            _ => Phase::Generic,
        }
    }

    /// Underlying node failure, if any.
    pub fn node_error(&self) -> Option<&NodeError> {
        match self {
            WeftError::Prepare { source, .. } | WeftError::Finalize { source, .. } => Some(source),
            WeftError::Execution { failure, .. } => Some(failure.last_error()),
            WeftError::RecoveryFallbackFailed(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;
