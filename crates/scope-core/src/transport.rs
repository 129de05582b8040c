//! Byte-level transport capability.
//!
//! A transport moves bytes and nothing else: it holds no protocol state, does
//! not know about queued commands and never interprets replies. The SCPI
//! pipeline in `scope-scpi` layers ordering, batching, deduplication, rate
//! limiting and resynchronisation on top.

use crate::error::ScopeResult;
use async_trait::async_trait;

/// Progress callback for long binary reads, called with a fraction in `[0, 1]`.
pub type ProgressCallback = dyn Fn(f32) + Send + Sync;

#[async_trait]
pub trait Transport: Send {
    /// Human-readable endpoint, e.g. `"tcp://10.0.0.5:5025"`.
    fn name(&self) -> &str;

    /// Write raw bytes. Returns once the runtime has accepted all of them.
    async fn send_bytes(&mut self, bytes: &[u8]) -> ScopeResult<()>;

    /// Read one newline-terminated text reply, without the terminator.
    async fn read_reply(&mut self) -> ScopeResult<String>;

    /// Read exactly `len` bytes.
    async fn read_raw(
        &mut self,
        len: usize,
        progress: Option<&ProgressCallback>,
    ) -> ScopeResult<Vec<u8>>;

    /// Discard anything already received but not yet read.
    async fn flush_rx_buffer(&mut self) -> ScopeResult<()>;

    /// Send small writes immediately. No-op where the transport has no such knob.
    fn disable_nagle(&mut self) -> ScopeResult<()> {
        Ok(())
    }

    /// Separator used when several queued commands go out in one write.
    fn batch_separator(&self) -> &'static str {
        ";"
    }

    fn is_connected(&self) -> bool {
        true
    }
}
