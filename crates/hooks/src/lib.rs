//! Hooks: ordered, asynchronous interception points in the prompt pipeline.
//!
//! A plugin registers a *strategy*: an id, an `order`, and a callback per
//! [`HookPoint`] it cares about. When the pipeline reaches a point, the
//! [`HookDispatcher`] runs every callback registered for it, highest
//! `order` first (ties in registration order). Each callback sees the
//! payload left by the previous one and may return a replacement.
//!
//! ```text
//! payload ──▶ strategy(order 100) ──▶ strategy(order 10) ──▶ strategy(order 10) ──▶ result
//!                 Some(new)               None (unchanged)      Err (logged, skipped)
//! ```
//!
//! Failures never abort the pipeline: errors, panics and timeouts are
//! logged and treated as "no change".

mod context;
mod dispatcher;
pub mod http;
mod point;

pub use context::{HookContext, HookContextInfo, HookOutcome, HookTraceEntry, PostprocessInstruction};
pub use dispatcher::{
    HookCallback, HookDispatcher, HookRegistration, StrategyInfo, hook_fn,
};
pub use http::{HttpHookCallback, HttpHookRegistration};
pub use point::HookPoint;

/// Errors from the hook subsystem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    #[error("strategy '{0}' is already registered")]
    Duplicate(String),

    #[error("unknown hook point: {0}")]
    UnknownPoint(String),

    #[error("hook callback failed: {0}")]
    Callback(String),

    #[error("hook plugin request failed: {0}")]
    Http(String),
}
