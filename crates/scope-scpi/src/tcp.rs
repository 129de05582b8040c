//! Raw SCPI over TCP (port 5025 on most instruments, 1861 for LeCroy VICP bridges).

use async_trait::async_trait;
use scope_core::{ProgressCallback, ScopeError, ScopeResult, Transport};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default raw-socket SCPI port.
pub const DEFAULT_PORT: u16 = 5025;

/// Default reply timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Chunk size used when reporting progress on large binary reads.
const RAW_CHUNK: usize = 64 * 1024;

/// Newline-framed SCPI socket.
pub struct TcpTransport {
    stream: BufReader<TcpStream>,
    name: String,
    timeout: Duration,
    connected: bool,
}

impl TcpTransport {
    /// Connect to `host:port`.
    pub async fn connect(host: &str, port: u16) -> ScopeResult<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ScopeError::Timeout(format!("connect to {}", addr)))?
            .map_err(|e| ScopeError::Transport(format!("failed to connect to {}: {}", addr, e)))?;

        tracing::info!("Connected to {}", addr);

        Ok(Self {
            stream: BufReader::new(stream),
            name: format!("tcp://{}", addr),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            connected: true,
        })
    }

    /// Set the reply timeout.
    pub fn set_timeout(&mut self, duration: Duration) {
        self.timeout = duration;
    }

    fn closed(&mut self) -> ScopeError {
        self.connected = false;
        ScopeError::ConnectionClosed
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_bytes(&mut self, bytes: &[u8]) -> ScopeResult<()> {
        let stream = self.stream.get_mut();
        timeout(self.timeout, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| ScopeError::Timeout("socket write".into()))??;
        tracing::trace!(bytes = bytes.len(), "tcp write");
        Ok(())
    }

    async fn read_reply(&mut self) -> ScopeResult<String> {
        let mut line = Vec::new();
        let read = timeout(self.timeout, self.stream.read_until(b'\n', &mut line))
            .await
            .map_err(|_| ScopeError::Timeout("reply".into()))??;
        if read == 0 {
            return Err(self.closed());
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    async fn read_raw(
        &mut self,
        len: usize,
        progress: Option<&ProgressCallback>,
    ) -> ScopeResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut done = 0;
        while done < len {
            let end = (done + RAW_CHUNK).min(len);
            let n = timeout(self.timeout, self.stream.read(&mut buf[done..end]))
                .await
                .map_err(|_| ScopeError::Timeout(format!("binary block ({} of {} bytes)", done, len)))??;
            if n == 0 {
                return Err(self.closed());
            }
            done += n;
            if let Some(cb) = progress {
                cb(done as f32 / len as f32);
            }
        }
        tracing::trace!(bytes = len, "tcp raw read");
        Ok(buf)
    }

    async fn flush_rx_buffer(&mut self) -> ScopeResult<()> {
        let buffered = self.stream.buffer().len();
        if buffered > 0 {
            tracing::debug!("Flushing {} bytes from buffer", buffered);
            self.stream.consume(buffered);
        }

        let mut discard = vec![0u8; 4096];
        loop {
            match timeout(Duration::from_millis(10), self.stream.get_mut().peek(&mut discard)).await {
                Ok(Ok(0)) | Err(_) | Ok(Err(_)) => break,
                Ok(Ok(n)) => {
                    let mut consume = vec![0u8; n];
                    let _ = self.stream.get_mut().try_read(&mut consume);
                    tracing::debug!("Flushed {} stale bytes from stream", n);
                }
            }
        }
        Ok(())
    }

    fn disable_nagle(&mut self) -> ScopeResult<()> {
        self.stream.get_ref().set_nodelay(true)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
