use std::{io::SeekFrom, path::PathBuf};

use async_trait::async_trait;
use beach_pier_core::ControlResponse;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub const DEFAULT_TAIL_BYTES: u64 = 64 * 1024;
pub const DEFAULT_MAX_BYTES: usize = 8 * 1024;
pub const LAN_MAX_BYTES: usize = 8 * 1024;
pub const TUNNEL_MAX_BYTES: usize = 4 * 1024;

/// Where a read begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStart {
    /// Absolute byte offset, clamped to the current size.
    At(u64),
    /// This many bytes before the end.
    Tail(u64),
}

impl LogStart {
    pub fn resolve(self, size: u64) -> u64 {
        match self {
            LogStart::At(offset) => offset.min(size),
            LogStart::Tail(bytes) => size.saturating_sub(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub data: Vec<u8>,
    pub offset: u64,
    pub next: u64,
    pub size: u64,
    pub eof: bool,
}

impl LogChunk {
    fn new(data: Vec<u8>, offset: u64, size: u64) -> Self {
        let next = offset + data.len() as u64;
        Self {
            data,
            offset,
            next,
            size,
            eof: next >= size,
        }
    }
}

#[derive(Debug, Error)]
pub enum LogReadError {
    #[error("log file not found")]
    NotFound,
    #[error("log storage unavailable")]
    Unavailable,
    #[error("log read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-range access to the device log.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Path reported to clients.
    fn path(&self) -> &str;

    /// Storage label reported to clients.
    fn source(&self) -> &str;

    async fn read_log_range(&self, start: LogStart, max_bytes: usize)
        -> Result<LogChunk, LogReadError>;
}

pub struct FileLog {
    path: PathBuf,
    display: String,
}

impl FileLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let display = path.display().to_string();
        Self { path, display }
    }
}

#[async_trait]
impl LogSource for FileLog {
    fn path(&self) -> &str {
        &self.display
    }

    fn source(&self) -> &str {
        "file"
    }

    async fn read_log_range(
        &self,
        start: LogStart,
        max_bytes: usize,
    ) -> Result<LogChunk, LogReadError> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(LogReadError::NotFound)
            }
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata().await?.len();
        let offset = start.resolve(size);
        file.seek(SeekFrom::Start(offset)).await?;

        let want = (size - offset).min(max_bytes as u64);
        let mut data = Vec::with_capacity(want as usize);
        file.take(want).read_to_end(&mut data).await?;
        Ok(LogChunk::new(data, offset, size))
    }
}

/// In-memory log, for devices without storage and for tests.
#[derive(Default)]
pub struct MemoryLog {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryLog {
    pub fn new(initial: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Mutex::new(initial.into()),
        }
    }

    pub fn append(&self, line: &[u8]) {
        self.bytes.lock().extend_from_slice(line);
    }
}

#[async_trait]
impl LogSource for MemoryLog {
    fn path(&self) -> &str {
        "memory"
    }

    fn source(&self) -> &str {
        "ram"
    }

    async fn read_log_range(
        &self,
        start: LogStart,
        max_bytes: usize,
    ) -> Result<LogChunk, LogReadError> {
        let bytes = self.bytes.lock();
        let size = bytes.len() as u64;
        let offset = start.resolve(size);
        let end = (offset + max_bytes as u64).min(size);
        let data = bytes[offset as usize..end as usize].to_vec();
        Ok(LogChunk::new(data, offset, size))
    }
}

/// Parsed `get_logs` parameters with their bounds applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRequest {
    pub offset: Option<u64>,
    pub tail_bytes: u64,
    pub max_bytes: usize,
}

impl LogRequest {
    /// Reads `offset`, `tailBytes` and `maxBytes`. A missing or negative
    /// offset selects tail mode. `maxBytes` is clamped to a smaller ceiling
    /// for tunnelled callers.
    pub fn from_command(request: &Value, via_tunnel: bool) -> Self {
        let cap = if via_tunnel {
            TUNNEL_MAX_BYTES
        } else {
            LAN_MAX_BYTES
        };
        let offset = request
            .get("offset")
            .and_then(Value::as_i64)
            .filter(|offset| *offset >= 0)
            .map(|offset| offset as u64);
        let tail_bytes = request
            .get("tailBytes")
            .and_then(Value::as_i64)
            .map(|bytes| bytes.max(0) as u64)
            .unwrap_or(DEFAULT_TAIL_BYTES);
        let max_bytes = request
            .get("maxBytes")
            .and_then(Value::as_i64)
            .map(|bytes| bytes.clamp(1, cap as i64) as usize)
            .unwrap_or(DEFAULT_MAX_BYTES.min(cap));
        Self {
            offset,
            tail_bytes,
            max_bytes,
        }
    }

    /// In tail mode the window is the last `min(tailBytes, maxBytes)` bytes,
    /// so a tail read always ends at the current end of the log.
    pub fn start(&self) -> LogStart {
        match self.offset {
            Some(offset) => LogStart::At(offset),
            None => LogStart::Tail(self.tail_bytes.min(self.max_bytes as u64)),
        }
    }
}

pub(super) async fn get_logs(
    source: Option<&dyn LogSource>,
    request: &Value,
    via_tunnel: bool,
) -> ControlResponse {
    const CMD: &str = "get_logs";
    let Some(source) = source else {
        return ControlResponse::error(Some(CMD), "fs_unavailable");
    };
    let params = LogRequest::from_command(request, via_tunnel);
    match source.read_log_range(params.start(), params.max_bytes).await {
        Ok(chunk) => ControlResponse::ok(CMD)
            .with("logs", String::from_utf8_lossy(&chunk.data))
            .with("offset", chunk.offset)
            .with("next", chunk.next)
            .with("size", chunk.size)
            .with("eof", chunk.eof)
            .with("path", source.path())
            .with("source", source.source()),
        Err(LogReadError::NotFound) => ControlResponse::error(Some(CMD), "log_not_found"),
        Err(LogReadError::Unavailable) => ControlResponse::error(Some(CMD), "fs_unavailable"),
        Err(LogReadError::Io(err)) => {
            ControlResponse::error(Some(CMD), "read_failed").detail(err.to_string())
        }
    }
}
