//! Built-in executors.
//!
//! The built-ins are a closed set of variants; each one reads its params
//! from the task and delegates the side effect to a capability.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::capability::{Capabilities, OutboundRequest};
use super::{ExecutionContext, Executor};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinExecutor {
    Notification,
    Webhook,
    Command,
    DatabaseQuery,
    Noop,
}

impl BuiltinExecutor {
    pub const ALL: [BuiltinExecutor; 5] = [
        BuiltinExecutor::Notification,
        BuiltinExecutor::Webhook,
        BuiltinExecutor::Command,
        BuiltinExecutor::DatabaseQuery,
        BuiltinExecutor::Noop,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "notification" => Some(Self::Notification),
            "webhook" => Some(Self::Webhook),
            "command" => Some(Self::Command),
            "database-query" => Some(Self::DatabaseQuery),
            "default" => Some(Self::Noop),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::Webhook => "webhook",
            Self::Command => "command",
            Self::DatabaseQuery => "database-query",
            Self::Noop => "default",
        }
    }
}

impl std::fmt::Display for BuiltinExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct NotificationParams {
    recipient: String,
    message: Option<String>,
    channel: String,
}

impl Default for NotificationParams {
    fn default() -> Self {
        Self {
            recipient: String::new(),
            message: None,
            channel: "log".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookParams {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Deserialize)]
struct CommandParams {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    query: String,
    #[serde(default)]
    params: Value,
}

fn parse_params<T: for<'de> Deserialize<'de>>(kind: BuiltinExecutor, params: &Value) -> Result<T> {
    let params = if params.is_null() { json!({}) } else { params.clone() };
    serde_json::from_value(params)
        .map_err(|e| Error::Executor(format!("invalid {} params: {}", kind, e)))
}

/// A built-in executor bound to the engine's capabilities.
pub(crate) struct BoundBuiltin {
    pub(crate) kind: BuiltinExecutor,
    pub(crate) capabilities: Arc<Capabilities>,
}

#[async_trait]
impl Executor for BoundBuiltin {
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value> {
        let caps = &self.capabilities;
        match self.kind {
            BuiltinExecutor::Notification => {
                let p: NotificationParams = parse_params(self.kind, &ctx.params)?;
                let message = p.message.unwrap_or_else(|| ctx.title.clone());
                caps.notifier.notify(&p.recipient, &message, &p.channel).await
            }
            BuiltinExecutor::Webhook => {
                let p: WebhookParams = parse_params(self.kind, &ctx.params)?;
                let body = p.body.or_else(|| {
                    Some(json!({
                        "taskId": ctx.task_id,
                        "title": ctx.title,
                        "context": ctx.context,
                    }))
                });
                caps.outbound
                    .call(OutboundRequest {
                        url: p.url,
                        method: p.method,
                        headers: p.headers,
                        body,
                    })
                    .await
            }
            BuiltinExecutor::Command => {
                let p: CommandParams = parse_params(self.kind, &ctx.params)?;
                caps.shell.run(&p.command, &p.args, p.cwd.as_deref()).await
            }
            BuiltinExecutor::DatabaseQuery => {
                let p: QueryParams = parse_params(self.kind, &ctx.params)?;
                let backend = caps.query.as_ref().ok_or_else(|| {
                    Error::Executor("no query backend configured".to_string())
                })?;
                backend.query(&p.query, &p.params).await
            }
            BuiltinExecutor::Noop => Ok(json!({ "executed": true })),
        }
    }
}
