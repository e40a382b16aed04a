use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use farmhand_proto::{
    LogEnvelope, ParentMessage, ProtoError, RequestFrame, ResponseFrame, WorkerMessage, read_frame,
    write_frame,
};

use crate::config::FarmOptions;
use crate::error::{Error, Result};
use crate::farm::FarmMsg;
use crate::queue::QueuedCall;

pub(crate) type WorkerId = u64;

/// A call assigned to a worker, keyed by its per-worker idx.
pub(crate) struct InFlight {
    pub call: QueuedCall,
    /// Dispatched while warmup was still in progress; its completion counts
    /// toward the warmed-worker tally.
    pub counts_warmup: bool,
}

#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Ready { version: u32 },
    Response(ResponseFrame),
    Request(RequestFrame),
    Log(LogEnvelope),
    /// EOF or I/O failure on the worker pipe. Terminal for the worker.
    Closed,
}

/// Parent-side controller for one child process.
pub(crate) struct Worker {
    pub id: WorkerId,
    child: Option<Child>,
    frame_tx: mpsc::UnboundedSender<ParentMessage>,
    pub ready: bool,
    pub stopped: bool,
    pub is_stopping: bool,
    pub calls: HashMap<u64, InFlight>,
    next_idx: u64,
}

impl Worker {
    pub fn spawn(
        id: WorkerId,
        options: &FarmOptions,
        farm_tx: mpsc::UnboundedSender<FarmMsg>,
    ) -> Result<Self> {
        let mut command = Command::new(&options.worker_path);
        command
            .args(&options.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::operation("spawn worker", "failed to capture worker stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::operation("spawn worker", "failed to capture worker stdout"))?;

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(id, stdin, frame_rx));
        tokio::spawn(read_loop(id, stdout, farm_tx));

        Ok(Self {
            id,
            child: Some(child),
            frame_tx,
            ready: false,
            stopped: false,
            is_stopping: false,
            calls: HashMap::new(),
            next_idx: 0,
        })
    }

    pub fn can_accept(&self, cap: usize) -> bool {
        self.ready && !self.stopped && !self.is_stopping && self.calls.len() < cap
    }

    /// Assign a queued call to this worker and send the call frame.
    pub fn call(&mut self, call: QueuedCall, counts_warmup: bool) {
        let idx = self.next_idx;
        self.next_idx += 1;
        let frame = ParentMessage::Call {
            idx,
            method: call.method.clone(),
            args: call.args.clone(),
        };
        self.calls.insert(idx, InFlight {
            call,
            counts_warmup,
        });
        if self.frame_tx.send(frame).is_err() {
            // Writer is gone; the pipe-closed event will requeue this call.
            warn!("worker {} channel closed while dispatching", self.id);
        }
    }

    /// Channel for out-of-band frames (responses to the worker's own
    /// requests) that must be sendable after state borrows end.
    pub fn frame_sender(&self) -> mpsc::UnboundedSender<ParentMessage> {
        self.frame_tx.clone()
    }

    /// Request shutdown and hand the child out for the bounded-kill task.
    /// Terminal: no further sends after this.
    pub fn begin_stop(&mut self) -> Option<Child> {
        self.is_stopping = true;
        self.ready = false;
        let _ = self.frame_tx.send(ParentMessage::Stop);
        self.stopped = true;
        self.child.take()
    }
}

/// Wait out the grace period, then force-kill. Always terminates.
pub(crate) async fn stop_child(mut child: Child, forced_kill_time: Duration) {
    match tokio::time::timeout(forced_kill_time, child.wait()).await {
        Ok(Ok(status)) => debug!("worker exited with {status}"),
        Ok(Err(err)) => warn!("failed to await worker exit: {err}"),
        Err(_) => {
            warn!("worker did not exit within {forced_kill_time:?}, killing");
            if let Err(err) = child.kill().await {
                warn!("failed to kill worker: {err}");
            }
        }
    }
}

async fn write_loop(
    id: WorkerId,
    mut stdin: ChildStdin,
    mut frame_rx: mpsc::UnboundedReceiver<ParentMessage>,
) {
    while let Some(frame) = frame_rx.recv().await {
        if let Err(err) = write_frame(&mut stdin, &frame).await {
            error!("failed to write frame to worker {id}: {err}");
            break;
        }
    }
}

async fn read_loop(id: WorkerId, mut stdout: ChildStdout, farm_tx: mpsc::UnboundedSender<FarmMsg>) {
    loop {
        let event = match read_frame::<_, WorkerMessage>(&mut stdout).await {
            Ok(WorkerMessage::Ready { version }) => WorkerEvent::Ready { version },
            Ok(WorkerMessage::Response(frame)) => WorkerEvent::Response(frame),
            Ok(WorkerMessage::Request(frame)) => WorkerEvent::Request(frame),
            Ok(WorkerMessage::Log(envelope)) => WorkerEvent::Log(envelope),
            Err(ProtoError::Io(err)) => {
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    debug!("worker {id} closed its pipe");
                } else {
                    error!("worker {id} pipe error: {err}");
                }
                let _ = farm_tx.send(FarmMsg::Worker(id, WorkerEvent::Closed));
                break;
            }
            Err(ProtoError::Postcard(err)) => {
                // Length and payload were consumed, framing is still aligned.
                error!("undecodable frame from worker {id}: {err}");
                continue;
            }
        };
        if farm_tx.send(FarmMsg::Worker(id, event)).is_err() {
            break;
        }
    }
}
