use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u32 = 1;

/// Opaque reference to a parent-side function. Travels to workers by value;
/// the worker never executes it, it only sends the id back in requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub id: u64,
}

impl Handle {
    pub fn new(id: u64) -> Self {
        Self { id }
    }
}

// Dynamic values ride inside postcard frames as JSON text; postcard is not
// self-describing, so `serde_json::Value` cannot decode from it directly.
mod json_text {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &serde_json::Value,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<serde_json::Value, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(D::Error::custom)
    }
}

/// Argument/result slot: either plain data or a handle reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Data(#[serde(with = "json_text")] serde_json::Value),
    Handle(Handle),
}

impl WireValue {
    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            WireValue::Data(value) => Some(value),
            WireValue::Handle(_) => None,
        }
    }

    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            WireValue::Data(_) => None,
            WireValue::Handle(handle) => Some(*handle),
        }
    }
}

impl From<serde_json::Value> for WireValue {
    fn from(value: serde_json::Value) -> Self {
        WireValue::Data(value)
    }
}

impl From<Handle> for WireValue {
    fn from(handle: Handle) -> Self {
        WireValue::Handle(handle)
    }
}

/// User-code failure carried across the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct WireError {
    pub message: String,
}

impl WireError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestTarget {
    Handle(Handle),
    Location(String),
}

/// Child-originated request into the parent: a reverse-handle invocation or
/// a master-call against a registered module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub idx: Option<u64>,
    pub target: RequestTarget,
    pub method: Option<String>,
    pub args: Vec<WireValue>,
    pub await_response: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseContent {
    Data(#[serde(with = "json_text")] serde_json::Value),
    Error(WireError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub idx: u64,
    pub content: ResponseContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Progress,
    Verbose,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEnvelope {
    pub level: LogLevel,
    #[serde(with = "json_text")]
    pub message: serde_json::Value,
}

/// Parent -> child frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParentMessage {
    Call {
        idx: u64,
        method: String,
        args: Vec<WireValue>,
    },
    Response(ResponseFrame),
    Stop,
}

/// Child -> parent frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// Readiness announcement; the parent rejects mismatched protocols.
    Ready { version: u32 },
    Response(ResponseFrame),
    Request(RequestFrame),
    Log(LogEnvelope),
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
}

// Basic sanity limit for a single frame.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = postcard::to_stdvec(msg)?;
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"))?;
    w.write_all(&len.to_le_bytes()).await?;
    w.write_all(&payload).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(r: &mut R) -> Result<T, ProtoError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large").into());
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(postcard::from_bytes(&payload)?)
}

/// Encode-then-decode a value through the wire codec. The in-process call
/// path uses this so local and remote invocations observe identical value
/// semantics (fresh deep copies, no shared mutable arguments).
pub fn codec_round_trip<T>(value: &T) -> Result<T, ProtoError>
where
    T: Serialize + DeserializeOwned,
{
    let bytes = postcard::to_stdvec(value)?;
    Ok(postcard::from_bytes(&bytes)?)
}
