use std::sync::Arc;

use async_trait::async_trait;

use farmhand_proto::{Handle, LogEnvelope, LogLevel, RequestFrame, RequestTarget, WireValue};

/// The parent endpoint a worker method talks back through. Inside a child
/// process this writes request frames up the pipe; on the in-process local
/// path it routes straight into the dispatcher.
#[async_trait]
pub trait MasterEndpoint: Send + Sync {
    /// Submit a request frame. Returns the response value when the frame
    /// awaits one, `None` for fire-and-forget.
    async fn request(&self, frame: RequestFrame) -> anyhow::Result<Option<serde_json::Value>>;

    async fn forward_log(&self, envelope: LogEnvelope) -> anyhow::Result<()>;
}

/// Per-invocation context handed to every worker method.
#[derive(Clone)]
pub struct WorkerContext {
    endpoint: Arc<dyn MasterEndpoint>,
}

impl WorkerContext {
    pub fn new(endpoint: Arc<dyn MasterEndpoint>) -> Self {
        Self { endpoint }
    }

    /// Invoke a method on a parent-registered module and await the result.
    pub async fn call_master(
        &self,
        location: impl Into<String>,
        method: impl Into<String>,
        args: Vec<WireValue>,
    ) -> anyhow::Result<serde_json::Value> {
        let response = self
            .endpoint
            .request(RequestFrame {
                idx: None,
                target: RequestTarget::Location(location.into()),
                method: Some(method.into()),
                args,
                await_response: true,
            })
            .await?;
        response.ok_or_else(|| anyhow::anyhow!("awaited master-call produced no response"))
    }

    /// Fire-and-forget variant of [`call_master`](Self::call_master);
    /// errors on the parent side are logged there and swallowed.
    pub async fn cast_master(
        &self,
        location: impl Into<String>,
        method: impl Into<String>,
        args: Vec<WireValue>,
    ) -> anyhow::Result<()> {
        self.endpoint
            .request(RequestFrame {
                idx: None,
                target: RequestTarget::Location(location.into()),
                method: Some(method.into()),
                args,
                await_response: false,
            })
            .await?;
        Ok(())
    }

    /// Call a reverse handle the parent passed in and await the result.
    pub async fn call_handle(
        &self,
        handle: Handle,
        args: Vec<WireValue>,
    ) -> anyhow::Result<serde_json::Value> {
        let response = self
            .endpoint
            .request(RequestFrame {
                idx: None,
                target: RequestTarget::Handle(handle),
                method: None,
                args,
                await_response: true,
            })
            .await?;
        response.ok_or_else(|| anyhow::anyhow!("awaited handle call produced no response"))
    }

    /// Fire-and-forget reverse-handle invocation.
    pub async fn cast_handle(&self, handle: Handle, args: Vec<WireValue>) -> anyhow::Result<()> {
        self.endpoint
            .request(RequestFrame {
                idx: None,
                target: RequestTarget::Handle(handle),
                method: None,
                args,
                await_response: false,
            })
            .await?;
        Ok(())
    }

    /// Forward a log event to the parent logger.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> anyhow::Result<()> {
        self.endpoint
            .forward_log(LogEnvelope {
                level,
                message: serde_json::Value::String(message.into()),
            })
            .await
    }
}
