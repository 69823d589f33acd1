//! Side-effect capabilities consumed by the built-in executors.
//!
//! The engine never owns a mail server, an HTTP endpoint or a database. The
//! hosting application injects these capabilities; the defaults below are
//! enough to run the engine standalone.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Delivers a notification to a recipient.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &str, message: &str, channel: &str) -> Result<Value>;
}

/// An outbound HTTP-style call.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

#[async_trait]
pub trait OutboundCaller: Send + Sync {
    async fn call(&self, request: OutboundRequest) -> Result<Value>;
}

#[async_trait]
pub trait ShellRunner: Send + Sync {
    async fn run(&self, command: &str, args: &[String], cwd: Option<&str>) -> Result<Value>;
}

#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn query(&self, query: &str, params: &Value) -> Result<Value>;
}

/// The set of capabilities handed to built-in executors.
#[derive(Clone)]
pub struct Capabilities {
    pub notifier: Arc<dyn Notifier>,
    pub outbound: Arc<dyn OutboundCaller>,
    pub shell: Arc<dyn ShellRunner>,
    /// No query backend is installed unless the host supplies one.
    pub query: Option<Arc<dyn QueryBackend>>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            notifier: Arc::new(LogNotifier),
            outbound: Arc::new(HttpCaller::new()),
            shell: Arc::new(ProcessShell),
            query: None,
        }
    }
}

impl Capabilities {
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_outbound(mut self, outbound: Arc<dyn OutboundCaller>) -> Self {
        self.outbound = outbound;
        self
    }

    pub fn with_shell(mut self, shell: Arc<dyn ShellRunner>) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_query(mut self, query: Arc<dyn QueryBackend>) -> Self {
        self.query = Some(query);
        self
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("query", &self.query.is_some())
            .finish_non_exhaustive()
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipient: &str, message: &str, channel: &str) -> Result<Value> {
        tracing::info!(recipient, channel, message, "notification sent");
        Ok(json!({
            "delivered": true,
            "recipient": recipient,
            "channel": channel,
        }))
    }
}

/// Outbound calls over HTTP using reqwest.
#[derive(Debug, Clone)]
pub struct HttpCaller {
    client: reqwest::Client,
}

impl HttpCaller {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cadence/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpCaller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboundCaller for HttpCaller {
    async fn call(&self, request: OutboundRequest) -> Result<Value> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| Error::Executor(format!("unsupported method: {}", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Executor(format!("request to {} failed: {}", request.url, e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Executor(format!("reading response body: {}", e)))?;
        if !status.is_success() {
            return Err(Error::Executor(format!(
                "{} returned {}: {}",
                request.url, status, text
            )));
        }
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(json!({ "status": status.as_u16(), "body": body }))
    }
}

/// Runs commands as child processes.
#[derive(Debug, Default)]
pub struct ProcessShell;

#[async_trait]
impl ShellRunner for ProcessShell {
    async fn run(&self, command: &str, args: &[String], cwd: Option<&str>) -> Result<Value> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args).kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(Path::new(dir));
        }

        tracing::debug!(command, ?args, "running command");
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::Executor(format!("failed to run {}: {}", command, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(Error::Executor(format!(
                "{} exited with {}: {}",
                command, code, stderr
            )));
        }
        Ok(json!({
            "exitCode": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}
