//! Error classification and recovery strategies.
//!
//! A failure is classified into an [`ErrorCategory`]; the `(category, phase)`
//! pair selects a [`Strategy`] from the table. Retry re-runs the failed
//! operation with exponential backoff, fallback swaps in a caller-supplied
//! state, skip keeps the state unchanged, abort ends the flow.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use weft_core::config::{RecoveryConfig, RuleAction};
use weft_core::error::{ErrorKind, NodeError, NodeResult, Result, WeftError};
use weft_core::types::{Phase, SharedState};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Argument,
    Arithmetic,
    KeyNotFound,
    PatternMismatch,
    Timeout,
    Network,
    Unknown,
    Custom(String),
}

impl ErrorCategory {
    /// Parse a config label; unrecognised labels become `Custom`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "argument" => ErrorCategory::Argument,
            "arithmetic" => ErrorCategory::Arithmetic,
            "key_not_found" => ErrorCategory::KeyNotFound,
            "pattern_mismatch" => ErrorCategory::PatternMismatch,
            "timeout" => ErrorCategory::Timeout,
            "network" => ErrorCategory::Network,
            "unknown" => ErrorCategory::Unknown,
            _ => ErrorCategory::Custom(label.trim().to_string()),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Argument => write!(f, "argument"),
            ErrorCategory::Arithmetic => write!(f, "arithmetic"),
            ErrorCategory::KeyNotFound => write!(f, "key_not_found"),
            ErrorCategory::PatternMismatch => write!(f, "pattern_mismatch"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Unknown => write!(f, "unknown"),
            ErrorCategory::Custom(label) => write!(f, "{}", label),
        }
    }
}

impl From<&ErrorKind> for ErrorCategory {
    fn from(kind: &ErrorKind) -> Self {
        match kind {
            ErrorKind::Argument => ErrorCategory::Argument,
            ErrorKind::Arithmetic => ErrorCategory::Arithmetic,
            ErrorKind::KeyNotFound => ErrorCategory::KeyNotFound,
            ErrorKind::PatternMismatch => ErrorCategory::PatternMismatch,
            ErrorKind::Timeout => ErrorCategory::Timeout,
            ErrorKind::Network => ErrorCategory::Network,
            ErrorKind::Custom(label) => ErrorCategory::Custom(label.clone()),
        }
    }
}

/// Classify an engine error.
pub fn classify(error: &WeftError) -> ErrorCategory {
    match error.node_error() {
        Some(e) => classify_node_error(e),
        None => classify_message(&error.to_string()),
    }
}

/// Classify a node failure. An explicit kind wins over the message.
pub fn classify_node_error(error: &NodeError) -> ErrorCategory {
    match &error.kind {
        Some(kind) => kind.into(),
        None => classify_message(&error.message),
    }
}

fn classify_message(message: &str) -> ErrorCategory {
    let m = message.to_lowercase();
    if m.contains("timed out") || m.contains("timeout") || m.contains("deadline") {
        ErrorCategory::Timeout
    } else if m.contains("connection") || m.contains("network") || m.contains("unreachable") {
        ErrorCategory::Network
    } else if m.contains("key not found") || m.contains("missing key") || m.contains("no such key") {
        ErrorCategory::KeyNotFound
    } else if m.contains("division by zero") || m.contains("divide by zero") || m.contains("overflow") {
        ErrorCategory::Arithmetic
    } else if m.contains("invalid argument") || m.contains("bad argument") {
        ErrorCategory::Argument
    } else if m.contains("no match") || m.contains("pattern") {
        ErrorCategory::PatternMismatch
    } else {
        ErrorCategory::Unknown
    }
}

/// Pure state transform used by the fallback strategy.
pub type FallbackFn = Arc<dyn Fn(&SharedState) -> NodeResult<SharedState> + Send + Sync>;

#[derive(Clone)]
pub enum Strategy {
    /// Re-run the failed operation up to `n` more times.
    Retry(u32),
    Fallback(FallbackFn),
    Skip,
    Abort,
}

impl Strategy {
    pub fn label(&self) -> &'static str {
        match self {
            Strategy::Retry(_) => "retry",
            Strategy::Fallback(_) => "fallback",
            Strategy::Skip => "skip",
            Strategy::Abort => "abort",
        }
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Retry(n) => write!(f, "Retry({})", n),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Exponential backoff: `initial * 2^attempt`, optional 0.8x–1.2x jitter,
/// never above `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Backoff {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            jitter: config.jitter,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let max = self.max.as_millis() as u64;
        let ms = (self.initial.as_millis() as u64)
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(max);
        let ms = if self.jitter {
            let jitter = 0.8 + rand::random::<f64>() * 0.4;
            (ms as f64 * jitter) as u64
        } else {
            ms
        };
        Duration::from_millis(ms.min(max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

/// What a successful recovery produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovered<T> {
    /// A retry of the failed operation succeeded.
    Retried(T),
    Fallback(SharedState),
    Skipped(SharedState),
}

impl<T> Recovered<T> {
    pub fn label(&self) -> &'static str {
        match self {
            Recovered::Retried(_) => "retry",
            Recovered::Fallback(_) => "fallback",
            Recovered::Skipped(_) => "skip",
        }
    }
}

/// Strategy table keyed by `(category, phase)`.
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    table: HashMap<(ErrorCategory, Phase), Strategy>,
    backoff: Backoff,
}

impl Recovery {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            table: HashMap::new(),
            backoff,
        }
    }

    /// Build the table from `[[recovery.rules]]`. Fallbacks can only be
    /// registered in code with [`Recovery::with_fallback`].
    pub fn from_config(config: &RecoveryConfig) -> Self {
        config
            .rules
            .iter()
            .fold(Self::new(Backoff::from_config(config)), |recovery, rule| {
                let strategy = match rule.action {
                    RuleAction::Retry => Strategy::Retry(rule.attempts),
                    RuleAction::Skip => Strategy::Skip,
                    RuleAction::Abort => Strategy::Abort,
                };
                recovery.with_strategy(ErrorCategory::from_label(&rule.category), rule.phase, strategy)
            })
    }

    pub fn with_strategy(mut self, category: ErrorCategory, phase: Phase, strategy: Strategy) -> Self {
        self.table.insert((category, phase), strategy);
        self
    }

    pub fn with_fallback<F>(self, category: ErrorCategory, phase: Phase, f: F) -> Self
    where
        F: Fn(&SharedState) -> NodeResult<SharedState> + Send + Sync + 'static,
    {
        self.with_strategy(category, phase, Strategy::Fallback(Arc::new(f)))
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Strategy for a failure; a `Generic` entry covers every phase of its
    /// category that has no entry of its own.
    pub fn strategy(&self, category: &ErrorCategory, phase: Phase) -> Option<&Strategy> {
        self.table
            .get(&(category.clone(), phase))
            .or_else(|| self.table.get(&(category.clone(), Phase::Generic)))
    }

    /// Apply the strategy selected for `error`.
    ///
    /// `retry` re-runs the failed operation; it is only called for the retry
    /// strategy. Exhausted retries and the abort strategy both end in
    /// [`WeftError::FlowAborted`].
    pub async fn attempt_recovery<T, F, Fut>(
        &self,
        error: &WeftError,
        state: &SharedState,
        mut retry: F,
    ) -> Result<Recovered<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let category = classify(error);
        let phase = error.phase();
        let node = error.node().unwrap_or("flow").to_string();

        let Some(strategy) = self.strategy(&category, phase) else {
            return Err(WeftError::NoRecoveryStrategy {
                category: category.to_string(),
                phase,
            });
        };

        match strategy {
            Strategy::Retry(attempts) => {
                let mut last = error.to_string();
                for attempt in 0..*attempts {
                    let delay = self.backoff.delay(attempt);
                    info!(
                        node = %node,
                        category = %category,
                        attempt = attempt + 1,
                        attempts = *attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after recoverable failure"
                    );
                    tokio::time::sleep(delay).await;
                    match retry().await {
                        Ok(value) => return Ok(Recovered::Retried(value)),
                        Err(e) => {
                            warn!(node = %node, attempt = attempt + 1, error = %e, "Recovery retry failed");
                            last = e.to_string();
                        }
                    }
                }
                Err(WeftError::FlowAborted {
                    node,
                    phase,
                    cause: format!("recovery retries exhausted after {} attempt(s): {}", attempts, last),
                })
            }
            Strategy::Fallback(f) => f(state)
                .map(Recovered::Fallback)
                .map_err(WeftError::RecoveryFallbackFailed),
            Strategy::Skip => Ok(Recovered::Skipped(state.clone())),
            Strategy::Abort => Err(WeftError::FlowAborted {
                node,
                phase,
                cause: error.to_string(),
            }),
        }
    }
}
