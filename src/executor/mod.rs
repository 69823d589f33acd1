//! Executors: the pluggable operations that perform a task's side effect.
//!
//! Built-in executors are a closed set of variants ([`BuiltinExecutor`]);
//! custom executors are registered by name as trait objects or closures.
//! A custom registration shadows a built-in of the same name, and the last
//! registration for a name wins.

mod builtin;
pub mod capability;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::task::TaskId;
use crate::error::{Error, Result};

pub use builtin::BuiltinExecutor;
pub use capability::{
    Capabilities, HttpCaller, LogNotifier, Notifier, OutboundCaller, OutboundRequest,
    ProcessShell, QueryBackend, ShellRunner,
};

/// Executor used when a task's automation names none.
pub const DEFAULT_EXECUTOR: &str = "default";

/// What an executor sees when it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    pub title: String,
    pub task_type: String,
    /// The task's `automation.params`.
    pub params: Value,
    /// Caller context (workflow context for step tasks).
    pub context: Value,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// A named operation `(context) -> result` that may fail.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value>;
}

/// Adapter for async closures.
struct FnExecutor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value> {
        (self.f)(ctx).await
    }
}

/// Name → executor lookup.
pub struct ExecutorRegistry {
    custom: HashMap<String, Arc<dyn Executor>>,
    capabilities: Arc<Capabilities>,
}

impl ExecutorRegistry {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            custom: HashMap::new(),
            capabilities: Arc::new(capabilities),
        }
    }

    /// Register a custom executor. Returns true if a previous custom
    /// registration under the same name was replaced.
    pub fn register(&mut self, name: &str, executor: Arc<dyn Executor>) -> bool {
        let replaced = self.custom.insert(name.to_string(), executor).is_some();
        tracing::debug!(executor = name, replaced, "executor registered");
        replaced
    }

    pub fn register_fn<F, Fut>(&mut self, name: &str, f: F) -> bool
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(name, Arc::new(FnExecutor { f }))
    }

    /// Look up an executor by name.
    ///
    /// # Errors
    /// `ExecutorNotFound` when neither a custom registration nor a built-in
    /// carries the name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Executor>> {
        if let Some(executor) = self.custom.get(name) {
            return Ok(executor.clone());
        }
        match BuiltinExecutor::from_name(name) {
            Some(kind) => Ok(Arc::new(builtin::BoundBuiltin {
                kind,
                capabilities: self.capabilities.clone(),
            })),
            None => Err(Error::ExecutorNotFound(name.to_string())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.custom.contains_key(name) || BuiltinExecutor::from_name(name).is_some()
    }

    /// Every resolvable name, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = BuiltinExecutor::ALL
            .iter()
            .map(|kind| kind.name().to_string())
            .chain(self.custom.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new(Capabilities::default())
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}
