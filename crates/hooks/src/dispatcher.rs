//! Strategy registry and sequential dispatch.

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::context::{HookContext, HookOutcome, HookTraceEntry};
use crate::{HookError, HookPoint};

/// A single interception callback.
///
/// `Ok(Some(v))` replaces the payload, `Ok(None)` leaves it unchanged.
#[async_trait]
pub trait HookCallback: Send + Sync {
    async fn call(&self, data: Value, ctx: HookContext) -> Result<Option<Value>, HookError>;
}

struct FnHook<F>(F);

#[async_trait]
impl<F, Fut> HookCallback for FnHook<F>
where
    F: Fn(Value, HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, HookError>> + Send + 'static,
{
    async fn call(&self, data: Value, ctx: HookContext) -> Result<Option<Value>, HookError> {
        (self.0)(data, ctx).await
    }
}

/// Wrap an async closure as a callback.
pub fn hook_fn<F, Fut>(f: F) -> Arc<dyn HookCallback>
where
    F: Fn(Value, HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, HookError>> + Send + 'static,
{
    Arc::new(FnHook(f))
}

/// What a plugin hands to [`HookDispatcher::register`].
#[derive(Clone)]
pub struct HookRegistration {
    pub strategy_id: String,
    /// Higher runs first
    pub order: i32,
    pub hooks: HashMap<HookPoint, Arc<dyn HookCallback>>,
}

impl HookRegistration {
    pub fn new(strategy_id: impl Into<String>, order: i32) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            order,
            hooks: HashMap::new(),
        }
    }

    pub fn on(mut self, point: HookPoint, callback: Arc<dyn HookCallback>) -> Self {
        self.hooks.insert(point, callback);
        self
    }
}

/// Listing entry for a registered strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyInfo {
    pub strategy_id: String,
    pub order: i32,
    pub points: Vec<HookPoint>,
}

struct Registered {
    id: String,
    order: i32,
    seq: u64,
    hooks: HashMap<HookPoint, Arc<dyn HookCallback>>,
}

#[derive(Default)]
struct Registry {
    strategies: Vec<Registered>,
    next_seq: u64,
}

impl Registry {
    fn sort(&mut self) {
        self.strategies
            .sort_by(|a, b| b.order.cmp(&a.order).then(a.seq.cmp(&b.seq)));
    }
}

/// Runs registered strategies at each [`HookPoint`].
///
/// One instance is shared by every API surface so that plugins behave the
/// same no matter how a build was requested.
pub struct HookDispatcher {
    registry: RwLock<Registry>,
    timeout: Duration,
}

impl HookDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            timeout,
        }
    }

    /// Add a strategy. A strategy id may only be registered once.
    pub async fn register(&self, registration: HookRegistration) -> Result<(), HookError> {
        let mut registry = self.registry.write().await;
        if registry
            .strategies
            .iter()
            .any(|s| s.id == registration.strategy_id)
        {
            return Err(HookError::Duplicate(registration.strategy_id));
        }
        let seq = registry.next_seq;
        registry.next_seq += 1;
        info!(
            strategy = %registration.strategy_id,
            order = registration.order,
            points = registration.hooks.len(),
            "Hook strategy registered"
        );
        registry.strategies.push(Registered {
            id: registration.strategy_id,
            order: registration.order,
            seq,
            hooks: registration.hooks,
        });
        registry.sort();
        Ok(())
    }

    /// Add a strategy, replacing any existing one with the same id. The
    /// replacement keeps the original's tie-break position. Returns `true`
    /// when something was replaced.
    pub async fn register_or_replace(&self, registration: HookRegistration) -> bool {
        let mut registry = self.registry.write().await;
        let existing = registry
            .strategies
            .iter()
            .position(|s| s.id == registration.strategy_id);
        let replaced = existing.is_some();
        let seq = match existing {
            Some(index) => registry.strategies.remove(index).seq,
            None => {
                let seq = registry.next_seq;
                registry.next_seq += 1;
                seq
            }
        };
        info!(strategy = %registration.strategy_id, replaced, "Hook strategy registered");
        registry.strategies.push(Registered {
            id: registration.strategy_id,
            order: registration.order,
            seq,
            hooks: registration.hooks,
        });
        registry.sort();
        replaced
    }

    pub async fn unregister(&self, strategy_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        let before = registry.strategies.len();
        registry.strategies.retain(|s| s.id != strategy_id);
        let removed = registry.strategies.len() < before;
        if removed {
            info!(strategy = strategy_id, "Hook strategy unregistered");
        }
        removed
    }

    /// Registered strategies in execution order.
    pub async fn list(&self) -> Vec<StrategyInfo> {
        self.registry
            .read()
            .await
            .strategies
            .iter()
            .map(|s| {
                let mut points: Vec<HookPoint> = s.hooks.keys().copied().collect();
                points.sort();
                StrategyInfo {
                    strategy_id: s.id.clone(),
                    order: s.order,
                    points,
                }
            })
            .collect()
    }

    pub async fn has_hooks(&self, point: HookPoint) -> bool {
        self.registry
            .read()
            .await
            .strategies
            .iter()
            .any(|s| s.hooks.contains_key(&point))
    }

    /// Run every callback registered for `point` over `data`.
    ///
    /// Callbacks run one after another in descending `order`. A failing,
    /// panicking or slow callback is logged, recorded in the context trace,
    /// and skipped.
    pub async fn dispatch(&self, point: HookPoint, data: Value, ctx: &HookContext) -> Value {
        let callbacks: Vec<(String, Arc<dyn HookCallback>)> = {
            let registry = self.registry.read().await;
            registry
                .strategies
                .iter()
                .filter_map(|s| s.hooks.get(&point).map(|cb| (s.id.clone(), cb.clone())))
                .collect()
        };
        if callbacks.is_empty() {
            return data;
        }

        let mut current = data;
        for (strategy_id, callback) in callbacks {
            let scoped = ctx.for_callback(point, &strategy_id);
            let run = AssertUnwindSafe(callback.call(current.clone(), scoped)).catch_unwind();

            let (outcome, error) = match tokio::time::timeout(self.timeout, run).await {
                Ok(Ok(Ok(Some(replacement)))) => {
                    current = replacement;
                    (HookOutcome::Changed, None)
                }
                Ok(Ok(Ok(None))) => (HookOutcome::Unchanged, None),
                Ok(Ok(Err(e))) => {
                    warn!(%point, strategy = %strategy_id, error = %e, "Hook callback failed, ignoring");
                    (HookOutcome::Failed, Some(e.to_string()))
                }
                Ok(Err(panic)) => {
                    let message = panic_message(panic.as_ref());
                    warn!(%point, strategy = %strategy_id, panic = %message, "Hook callback panicked, ignoring");
                    (HookOutcome::Panicked, Some(message))
                }
                Err(_) => {
                    warn!(
                        %point,
                        strategy = %strategy_id,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Hook callback timed out, ignoring"
                    );
                    (HookOutcome::TimedOut, None)
                }
            };
            debug!(%point, strategy = %strategy_id, ?outcome, "Hook callback finished");
            ctx.record(HookTraceEntry {
                point,
                strategy_id,
                outcome,
                error,
            });
        }
        current
    }

    /// [`dispatch`](Self::dispatch) for typed payloads.
    ///
    /// If the hooks leave behind something that no longer deserializes as
    /// `T`, the original value is kept.
    pub async fn dispatch_typed<T>(&self, point: HookPoint, value: T, ctx: &HookContext) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        if !self.has_hooks(point).await {
            return value;
        }
        let data = match serde_json::to_value(&value) {
            Ok(data) => data,
            Err(e) => {
                warn!(%point, error = %e, "Hook payload not serializable, skipping hooks");
                return value;
            }
        };
        let out = self.dispatch(point, data, ctx).await;
        match serde_json::from_value(out) {
            Ok(replaced) => replaced,
            Err(e) => {
                warn!(%point, error = %e, "Hook output has the wrong shape, keeping original");
                value
            }
        }
    }
}

impl Default for HookDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
