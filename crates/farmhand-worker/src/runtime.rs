use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use farmhand_proto::{
    LogEnvelope, PROTOCOL_VERSION, ParentMessage, ProtoError, RequestFrame, ResponseContent,
    ResponseFrame, WireError, WorkerMessage, read_frame, write_frame,
};

use crate::context::{MasterEndpoint, WorkerContext};
use crate::module::WorkerModule;

/// Run the child main loop: announce readiness, serve call frames until the
/// parent sends `Stop` or closes the pipe. Call frames run as concurrent
/// tasks; the parent enforces the in-flight cap.
pub async fn run_worker(module: WorkerModule) -> anyhow::Result<()> {
    let mut stdin = tokio::io::stdin();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer = tokio::spawn(write_loop(frame_rx));

    let module = Arc::new(module);
    let endpoint = Arc::new(ChildEndpoint {
        frame_tx: frame_tx.clone(),
        pending: Mutex::new(HashMap::new()),
        next_idx: AtomicU64::new(0),
    });

    frame_tx.send(WorkerMessage::Ready {
        version: PROTOCOL_VERSION,
    })?;
    debug!("worker ready");

    loop {
        match read_frame::<_, ParentMessage>(&mut stdin).await {
            Ok(ParentMessage::Call { idx, method, args }) => {
                let module = Arc::clone(&module);
                let endpoint: Arc<dyn MasterEndpoint> = endpoint.clone();
                let ctx = WorkerContext::new(endpoint);
                let frame_tx = frame_tx.clone();
                tokio::spawn(async move {
                    let content = match module.invoke(ctx, &method, args).await {
                        Ok(value) => ResponseContent::Data(value),
                        Err(err) => ResponseContent::Error(WireError::new(format!("{err:#}"))),
                    };
                    let _ = frame_tx.send(WorkerMessage::Response(ResponseFrame { idx, content }));
                });
            }
            Ok(ParentMessage::Response(frame)) => endpoint.complete(frame),
            Ok(ParentMessage::Stop) => {
                debug!("stop requested by parent");
                break;
            }
            Err(ProtoError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("parent closed the pipe");
                break;
            }
            Err(ProtoError::Io(err)) => return Err(err.into()),
            Err(ProtoError::Postcard(err)) => {
                // Length and payload were fully consumed, framing is still
                // aligned; skip the bad frame.
                error!("undecodable frame from parent: {err}");
            }
        }
    }

    drop(frame_tx);
    drop(endpoint);
    let _ = writer.await;
    Ok(())
}

async fn write_loop(mut frame_rx: mpsc::UnboundedReceiver<WorkerMessage>) {
    let mut stdout = tokio::io::stdout();
    while let Some(frame) = frame_rx.recv().await {
        if let Err(err) = write_frame(&mut stdout, &frame).await {
            error!("failed to write frame to parent: {err}");
            break;
        }
    }
}

/// Child half of the master-call bridge: allocates request ids, pairs
/// response frames with their waiters.
struct ChildEndpoint {
    frame_tx: mpsc::UnboundedSender<WorkerMessage>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ResponseFrame>>>,
    next_idx: AtomicU64,
}

impl ChildEndpoint {
    fn complete(&self, frame: ResponseFrame) {
        let waiter = self
            .pending
            .lock()
            .expect("pending request table poisoned")
            .remove(&frame.idx);
        match waiter {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => error!("response for unknown request idx {}", frame.idx),
        }
    }
}

#[async_trait]
impl MasterEndpoint for ChildEndpoint {
    async fn request(&self, mut frame: RequestFrame) -> anyhow::Result<Option<serde_json::Value>> {
        if !frame.await_response {
            frame.idx = None;
            self.frame_tx
                .send(WorkerMessage::Request(frame))
                .map_err(|_| anyhow::anyhow!("parent pipe is closed"))?;
            return Ok(None);
        }

        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed);
        frame.idx = Some(idx);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending request table poisoned")
            .insert(idx, tx);
        self.frame_tx
            .send(WorkerMessage::Request(frame))
            .map_err(|_| anyhow::anyhow!("parent pipe is closed"))?;

        let response = rx
            .await
            .map_err(|_| anyhow::anyhow!("worker shut down before the parent responded"))?;
        match response.content {
            ResponseContent::Data(value) => Ok(Some(value)),
            ResponseContent::Error(err) => Err(err.into()),
        }
    }

    async fn forward_log(&self, envelope: LogEnvelope) -> anyhow::Result<()> {
        self.frame_tx
            .send(WorkerMessage::Log(envelope))
            .map_err(|_| anyhow::anyhow!("parent pipe is closed"))?;
        Ok(())
    }
}
