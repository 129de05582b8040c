//! SCPI command pipeline.
//!
//! Serialises host requests onto one transport while keeping replies aligned
//! with the queries that produced them.
//!
//! # Modalities
//!
//! - **Queued** ([`ScpiPipeline::send_queued`]): appended to a FIFO and written
//!   lazily. Never blocks on the transport.
//! - **Queued with reply** ([`ScpiPipeline::send_queued_with_reply`]): flushes
//!   the FIFO, writes the query, reads exactly one reply.
//! - **Immediate** ([`ScpiPipeline::send_immediate`]): flushes the FIFO, then
//!   writes the command on its own so nothing queued later can be batched with it.
//!
//! Multi-command sequences that must not be interleaved with other tasks take
//! the link with [`ScpiPipeline::lock`] and use the returned [`PipelineGuard`].
//!
//! # Flushing
//!
//! Queued commands are flushed in submission order. Runs of consecutive
//! commands with the same header are collapsed to the last one when that
//! header was registered with [`ScpiPipeline::deduplicate_command`]. Without
//! rate limiting the whole queue goes out in a single write joined by the
//! transport's batch separator; with rate limiting every command is its own
//! write, spaced at least the configured interval apart.

use crate::block::{read_block, BlockLength};
use parking_lot::{Mutex, RwLock};
use scope_core::{ProgressCallback, ScopeError, ScopeResult, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Header token of a command: everything before the first space, uppercased,
/// without a leading colon.
pub fn command_head(command: &str) -> String {
    command
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_start_matches(':')
        .to_ascii_uppercase()
}

/// Whether `head` falls under the registered dedup header `registered`
/// (`C1:OFFSET` matches `OFFSET`).
fn head_matches(head: &str, registered: &str) -> bool {
    head == registered
        || head
            .strip_suffix(registered)
            .is_some_and(|prefix| prefix.ends_with(':'))
}

/// Collapse runs of same-header commands for the registered headers.
pub fn collapse_duplicates(commands: Vec<String>, registered: &[String]) -> Vec<String> {
    if registered.is_empty() {
        return commands;
    }
    let heads: Vec<String> = commands.iter().map(|c| command_head(c)).collect();
    let mut out = Vec::with_capacity(commands.len());
    for (i, command) in commands.into_iter().enumerate() {
        let eligible = registered.iter().any(|r| head_matches(&heads[i], r));
        let superseded = eligible && heads.get(i + 1).is_some_and(|next| *next == heads[i]);
        if superseded {
            tracing::trace!(command = %command, "Dropping superseded command");
        } else {
            out.push(command);
        }
    }
    out
}

struct Link {
    transport: Box<dyn Transport>,
    last_write: Option<Instant>,
}

/// Command pipeline over one transport.
pub struct ScpiPipeline {
    link: tokio::sync::Mutex<Link>,
    queue: Mutex<Vec<String>>,
    dedup: RwLock<Vec<String>>,
    rate_limit: Mutex<Option<Duration>>,
    failed: AtomicBool,
    name: String,
}

impl ScpiPipeline {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let name = transport.name().to_string();
        Self {
            link: tokio::sync::Mutex::new(Link {
                transport,
                last_write: None,
            }),
            queue: Mutex::new(Vec::new()),
            dedup: RwLock::new(Vec::new()),
            rate_limit: Mutex::new(None),
            failed: AtomicBool::new(false),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collapse consecutive queued writes whose header is (or ends in) `head`.
    pub fn deduplicate_command(&self, head: &str) {
        let head = head.trim_start_matches(':').to_ascii_uppercase();
        let mut dedup = self.dedup.write();
        if !dedup.contains(&head) {
            dedup.push(head);
        }
    }

    /// Space successive transport writes at least `interval` apart.
    pub fn enable_rate_limiting(&self, interval: Duration) {
        *self.rate_limit.lock() = Some(interval);
    }

    /// Number of commands waiting to be flushed.
    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True once resynchronisation has failed; every later call errors out.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    fn check_alive(&self) -> ScopeResult<()> {
        if self.is_failed() {
            Err(ScopeError::ResyncFailed(format!(
                "connection to {} was abandoned",
                self.name
            )))
        } else {
            Ok(())
        }
    }

    /// Take exclusive use of the transport.
    pub async fn lock(&self) -> PipelineGuard<'_> {
        PipelineGuard {
            pipeline: self,
            link: self.link.lock().await,
        }
    }

    // =========================================================================
    // Single-call entry points
    // =========================================================================

    /// Queue a write; does not touch the transport.
    pub fn send_queued(&self, command: impl Into<String>) {
        let command = command.into();
        tracing::trace!(command = %command, "queued");
        self.queue.lock().push(command);
    }

    /// Write everything queued so far.
    pub async fn flush(&self) -> ScopeResult<()> {
        self.lock().await.flush_queue().await
    }

    /// Flush the queue, send `query`, read one reply.
    pub async fn send_queued_with_reply(&self, query: &str) -> ScopeResult<String> {
        self.lock().await.query(query).await
    }

    /// Flush the queue, then write `command` on its own.
    pub async fn send_immediate(&self, command: &str) -> ScopeResult<()> {
        self.lock().await.send(command).await
    }

    /// Flush the queue, then write `query` on its own and read one reply.
    pub async fn send_immediate_with_reply(&self, query: &str) -> ScopeResult<String> {
        self.lock().await.query(query).await
    }

    pub async fn query(&self, query: &str) -> ScopeResult<String> {
        self.send_queued_with_reply(query).await
    }

    pub async fn query_f64(&self, query: &str) -> ScopeResult<f64> {
        parse_f64(&self.query(query).await?)
    }

    pub async fn query_i64(&self, query: &str) -> ScopeResult<i64> {
        parse_i64(&self.query(query).await?)
    }

    pub async fn query_bool(&self, query: &str) -> ScopeResult<bool> {
        parse_bool(&self.query(query).await?)
    }

    /// Flush, send `query`, read one binary block.
    pub async fn query_block(&self, query: &str, length: BlockLength) -> ScopeResult<Vec<u8>> {
        let mut guard = self.lock().await;
        guard.send(query).await?;
        guard.read_block(length, None).await
    }

    /// Drop anything buffered on the receive side.
    pub async fn flush_rx(&self) -> ScopeResult<()> {
        self.lock().await.flush_rx().await
    }
}

/// Exclusive access to the transport for an atomic command sequence.
pub struct PipelineGuard<'a> {
    pipeline: &'a ScpiPipeline,
    link: tokio::sync::MutexGuard<'a, Link>,
}

impl PipelineGuard<'_> {
    async fn write(&mut self, text: &str) -> ScopeResult<()> {
        self.pipeline.check_alive()?;
        let interval = *self.pipeline.rate_limit.lock();
        if let (Some(interval), Some(last)) = (interval, self.link.last_write) {
            tokio::time::sleep_until(last + interval).await;
        }
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.link.transport.send_bytes(line.as_bytes()).await?;
        self.link.last_write = Some(Instant::now());
        Ok(())
    }

    /// Write every queued command.
    pub async fn flush_queue(&mut self) -> ScopeResult<()> {
        let pending = std::mem::take(&mut *self.pipeline.queue.lock());
        if pending.is_empty() {
            return Ok(());
        }
        let commands = collapse_duplicates(pending, &self.pipeline.dedup.read());
        for command in &commands {
            tracing::debug!(target: "scpi", "{} <- {}", self.pipeline.name, command);
        }
        let rate_limited = self.pipeline.rate_limit.lock().is_some();
        if rate_limited {
            for command in &commands {
                self.write(command).await?;
            }
            Ok(())
        } else {
            let separator = self.link.transport.batch_separator();
            let batch = commands.join(separator);
            self.write(&batch).await
        }
    }

    /// Flush the queue, then write `command` alone.
    pub async fn send(&mut self, command: &str) -> ScopeResult<()> {
        self.flush_queue().await?;
        tracing::debug!(target: "scpi", "{} <- {}", self.pipeline.name, command);
        self.write(command).await
    }

    /// Flush the queue, then write `commands` as one batch.
    pub async fn send_batch(&mut self, commands: &[String]) -> ScopeResult<()> {
        self.flush_queue().await?;
        if commands.is_empty() {
            return Ok(());
        }
        for command in commands {
            tracing::debug!(target: "scpi", "{} <- {}", self.pipeline.name, command);
        }
        let rate_limited = self.pipeline.rate_limit.lock().is_some();
        if rate_limited {
            for command in commands {
                self.write(command).await?;
            }
            Ok(())
        } else {
            let separator = self.link.transport.batch_separator();
            let batch = commands.join(separator);
            self.write(&batch).await
        }
    }

    pub async fn read_reply(&mut self) -> ScopeResult<String> {
        self.pipeline.check_alive()?;
        let reply = self.link.transport.read_reply().await?;
        tracing::debug!(target: "scpi", "{} -> {}", self.pipeline.name, reply);
        Ok(reply)
    }

    /// Flush, send `query`, read one reply.
    pub async fn query(&mut self, query: &str) -> ScopeResult<String> {
        self.send(query).await?;
        self.read_reply().await
    }

    pub async fn query_f64(&mut self, query: &str) -> ScopeResult<f64> {
        parse_f64(&self.query(query).await?)
    }

    pub async fn read_block(
        &mut self,
        length: BlockLength,
        progress: Option<&ProgressCallback>,
    ) -> ScopeResult<Vec<u8>> {
        self.pipeline.check_alive()?;
        let body = read_block(self.link.transport.as_mut(), length, progress).await?;
        tracing::debug!(target: "scpi", "{} -> <{} byte block>", self.pipeline.name, body.len());
        Ok(body)
    }

    pub async fn flush_rx(&mut self) -> ScopeResult<()> {
        self.link.transport.flush_rx_buffer().await
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.link.transport.as_mut()
    }

    pub(crate) fn pipeline(&self) -> &ScpiPipeline {
        self.pipeline
    }
}

// =============================================================================
// Reply parsing
// =============================================================================

/// Strip an echoed command header (`C1:VDIV 1.00E+00 V` → `1.00E+00`).
fn reply_value(reply: &str) -> &str {
    let trimmed = reply.trim();
    let mut parts = trimmed.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(first), Some(second))
            if first.parse::<f64>().is_err() && first.chars().any(|c| c.is_ascii_alphabetic()) =>
        {
            second
        }
        (Some(first), _) => first,
        _ => trimmed,
    }
}

pub fn parse_f64(reply: &str) -> ScopeResult<f64> {
    let value = reply_value(reply).trim_matches('"');
    value.parse::<f64>().map_err(|_| ScopeError::parse(reply, "f64"))
}

pub fn parse_i64(reply: &str) -> ScopeResult<i64> {
    let value = reply_value(reply).trim_matches('"');
    value
        .parse::<i64>()
        .or_else(|_| value.parse::<f64>().map(|v| v.round() as i64))
        .map_err(|_| ScopeError::parse(reply, "i64"))
}

pub fn parse_bool(reply: &str) -> ScopeResult<bool> {
    match reply_value(reply)
        .trim_matches('"')
        .to_ascii_uppercase()
        .as_str()
    {
        "ON" | "1" | "TRUE" | "-1" => Ok(true),
        "OFF" | "0" | "FALSE" => Ok(false),
        _ => Err(ScopeError::parse(reply, "bool")),
    }
}
