//! In-memory transport for tests and simulation.
//!
//! [`MockTransport`] splits every write into individual SCPI commands (on
//! newlines, and on `;` outside quotes), logs them, and hands each one to a
//! [`Responder`]. Whatever the responder returns is appended to a receive
//! buffer that `read_reply`/`read_raw` consume, so reply ordering behaves like
//! a real socket, including stale replies left over from an earlier session.
//!
//! ```rust,ignore
//! let transport = MockTransport::new(|cmd: &str| match cmd {
//!     "*IDN?" => vec![MockReply::text("LECROY,WAVERUNNER9254M,LCRY0001,9.6.0")],
//!     _ => vec![],
//! });
//! let handle = transport.handle();
//! let pipeline = ScpiPipeline::new(Box::new(transport));
//! ```

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use scope_core::{ProgressCallback, ScopeError, ScopeResult, Transport};
use std::sync::Arc;
use tokio::time::Instant;

/// One chunk the simulated instrument sends back.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// Text line; a trailing newline is added.
    Text(String),
    /// Raw bytes, sent exactly as given.
    Raw(Vec<u8>),
}

impl MockReply {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// IEEE 488.2 definite-length block followed by a newline.
    pub fn block(body: &[u8]) -> Self {
        Self::Raw(encode_block(body, body.len()))
    }
}

/// Encode `body` as `#9<len:9 digits>` + body + `\n`, with an explicit header
/// length so firmware that reports samples instead of bytes can be imitated.
pub fn encode_block(body: &[u8], header_len: usize) -> Vec<u8> {
    let header = format!("#9{:09}", header_len);
    let mut out = Vec::with_capacity(body.len() + header.len() + 1);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out.push(b'\n');
    out
}

/// Simulated instrument behaviour.
pub trait Responder: Send {
    /// React to one command; return the bytes the instrument would send.
    fn respond(&mut self, command: &str) -> Vec<MockReply>;
}

impl<F> Responder for F
where
    F: FnMut(&str) -> Vec<MockReply> + Send,
{
    fn respond(&mut self, command: &str) -> Vec<MockReply> {
        self(command)
    }
}

#[derive(Debug, Default)]
struct MockState {
    rx: BytesMut,
    commands: Vec<String>,
    writes: Vec<(Instant, String)>,
    connected: bool,
}

/// Shared view of a [`MockTransport`] that stays usable after the transport
/// has been moved into a pipeline.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Every command received, in order, after batch splitting.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Number of `send_bytes` calls, each with its time of arrival.
    pub fn writes(&self) -> Vec<(Instant, String)> {
        self.state.lock().writes.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.commands.clear();
        state.writes.clear();
    }

    /// Put a reply in the receive buffer as if a previous session left it behind.
    pub fn inject_reply(&self, text: &str) {
        let mut state = self.state.lock();
        state.rx.put_slice(text.as_bytes());
        state.rx.put_u8(b'\n');
    }

    /// Bytes waiting to be read.
    pub fn pending_rx(&self) -> usize {
        self.state.lock().rx.len()
    }

    /// Simulate the far end hanging up.
    pub fn disconnect(&self) {
        self.state.lock().connected = false;
    }
}

pub struct MockTransport {
    responder: Box<dyn Responder>,
    state: Arc<Mutex<MockState>>,
    name: String,
}

impl MockTransport {
    pub fn new(responder: impl Responder + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            state: Arc::new(Mutex::new(MockState {
                connected: true,
                ..MockState::default()
            })),
            name: "mock://".to_string(),
        }
    }

    /// Transport answering from a fixed command → reply table; unknown
    /// commands get no reply.
    pub fn scripted(table: &[(&str, &str)]) -> Self {
        let table: Vec<(String, String)> = table
            .iter()
            .map(|(c, r)| (c.to_string(), r.to_string()))
            .collect();
        Self::new(move |cmd: &str| {
            table
                .iter()
                .find(|(c, _)| c == cmd)
                .map(|(_, r)| vec![MockReply::text(r.clone())])
                .unwrap_or_default()
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

/// Split one write into commands on newlines and on `;` outside quotes.
pub fn split_commands(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in text.split('\n') {
        let mut current = String::new();
        let mut quote: Option<char> = None;
        for c in line.chars() {
            match (c, quote) {
                ('"' | '\'', None) => {
                    quote = Some(c);
                    current.push(c);
                }
                (q, Some(open)) if q == open => {
                    quote = None;
                    current.push(c);
                }
                (';', None) => {
                    out.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            }
        }
        out.push(current);
    }
    out.into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_bytes(&mut self, bytes: &[u8]) -> ScopeResult<()> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        let commands = split_commands(&text);
        {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(ScopeError::ConnectionClosed);
            }
            state.writes.push((Instant::now(), text));
            state.commands.extend(commands.iter().cloned());
        }
        for command in &commands {
            let replies = self.responder.respond(command);
            let mut state = self.state.lock();
            for reply in replies {
                match reply {
                    MockReply::Text(t) => {
                        state.rx.put_slice(t.as_bytes());
                        state.rx.put_u8(b'\n');
                    }
                    MockReply::Raw(b) => state.rx.put_slice(&b),
                }
            }
        }
        Ok(())
    }

    async fn read_reply(&mut self) -> ScopeResult<String> {
        let mut state = self.state.lock();
        match state.rx.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let line = state.rx.split_to(pos + 1);
                let text = String::from_utf8_lossy(&line[..pos]);
                Ok(text.trim_end_matches('\r').to_string())
            }
            None if !state.connected => Err(ScopeError::ConnectionClosed),
            None => Err(ScopeError::Timeout("reply".into())),
        }
    }

    async fn read_raw(
        &mut self,
        len: usize,
        progress: Option<&ProgressCallback>,
    ) -> ScopeResult<Vec<u8>> {
        let mut state = self.state.lock();
        if state.rx.len() < len {
            // a real socket would block until the timeout fires
            let have = state.rx.len();
            state.rx.clear();
            return Err(ScopeError::Timeout(format!(
                "binary block ({} of {} bytes)",
                have, len
            )));
        }
        let mut out = vec![0u8; len];
        state.rx.copy_to_slice(&mut out);
        if let Some(cb) = progress {
            cb(1.0);
        }
        Ok(out)
    }

    async fn flush_rx_buffer(&mut self) -> ScopeResult<()> {
        let mut state = self.state.lock();
        if !state.rx.is_empty() {
            tracing::debug!("Flushing {} bytes from mock buffer", state.rx.len());
            state.rx.clear();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}
