//! Execution limits for the dispatch core.
//!
//! The engine runs translated code that may loop forever or recurse without
//! bound, so the dispatch loop counts every dispatched instruction against a
//! hard ceiling and every re-entrant evaluation against a call-depth limit.
//! A caller-supplied cancellation token is additionally checked at
//! backward-branch points, where loops must pass through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Call-site configurable limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Dispatched-instruction ceiling; exceeding it is a fatal engine error.
    pub instruction_limit: u64,
    /// Maximum depth of re-entrant evaluation.
    pub call_depth_limit: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            instruction_limit: 1_000_000_000,
            call_depth_limit: 256,
        }
    }
}

/// Counters surfaced after a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SandboxMetrics {
    pub instruction_count: u64,
    pub max_call_depth: usize,
}

/// Cooperative cancellation flag shared with the embedding host.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Stateful limit tracker owned by the evaluator for the duration of one
/// outermost evaluation.
#[derive(Debug)]
pub struct Sandbox {
    limits: SandboxLimits,
    metrics: SandboxMetrics,
    cancel: Option<CancelToken>,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits, cancel: Option<CancelToken>) -> Self {
        Self {
            limits,
            metrics: SandboxMetrics::default(),
            cancel,
        }
    }

    pub fn metrics(&self) -> SandboxMetrics {
        self.metrics
    }

    /// Call once per dispatched instruction.
    #[inline]
    pub fn observe_instruction(&mut self) -> Result<(), SandboxError> {
        self.metrics.instruction_count += 1;
        if self.metrics.instruction_count > self.limits.instruction_limit {
            return Err(SandboxError::InstructionLimit {
                limit: self.limits.instruction_limit,
            });
        }
        Ok(())
    }

    /// Update call-depth accounting and enforce the recursion limit.
    pub fn record_call_depth(&mut self, depth: usize) -> Result<(), SandboxError> {
        if depth > self.metrics.max_call_depth {
            self.metrics.max_call_depth = depth;
        }
        if depth > self.limits.call_depth_limit {
            return Err(SandboxError::CallDepthLimit {
                limit: self.limits.call_depth_limit,
            });
        }
        Ok(())
    }

    /// Call at backward-branch points.
    #[inline]
    pub fn check_cancelled(&self) -> Result<(), SandboxError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(SandboxError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Limit violations raised to the caller as fatal engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("execution entered infinite loop")]
    InstructionLimit { limit: u64 },
    #[error("maximum evaluation depth exceeded (limit {limit})")]
    CallDepthLimit { limit: usize },
    #[error("execution cancelled by host")]
    Cancelled,
}
