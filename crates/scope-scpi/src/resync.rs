//! Reply-stream resynchronisation.
//!
//! After an aborted session an instrument may still hold replies to queries
//! the host never read. To find out how many, the pipeline sends a PRBS-3
//! sequence of two distinguishable queries: one whose reply contains a vendor
//! magic string (`*IDN?`) and one with a numeric reply (`*OPC?`). The seven
//! replies read back are correlated with the sent pattern at offsets 0, 1 and
//! 2. A match at offset `k` means `k` stale replies preceded ours, so `k` of
//! our replies are still in flight and get read and thrown away.
//!
//! If no offset matches the connection is abandoned.

use crate::pipeline::{PipelineGuard, ScpiPipeline};
use scope_core::{ScopeError, ScopeResult};

/// The 7-element PRBS-3 sequence; `true` selects the magic query.
pub const PRBS3: [bool; 7] = [true, true, true, false, false, true, false];

/// Largest number of stale replies the correlation searches for.
pub const MAX_STALE_REPLIES: usize = 2;

/// The two queries used for correlation.
#[derive(Debug, Clone)]
pub struct ResyncProbe {
    pub magic_query: String,
    /// Substring present in every reply to `magic_query`.
    pub magic: String,
    pub numeric_query: String,
}

impl ResyncProbe {
    /// `*IDN?` against `*OPC?`, with the vendor name as magic string.
    pub fn idn(vendor_magic: impl Into<String>) -> Self {
        Self {
            magic_query: "*IDN?".into(),
            magic: vendor_magic.into(),
            numeric_query: "*OPC?".into(),
        }
    }
}

/// Offset at which `observed` matches `pattern`, preferring the smallest.
///
/// At offset `k`, `observed[i]` must equal `pattern[i - k]` for every
/// `i >= k`; the first `k` observations are stale and ignored.
pub fn correlate(observed: &[bool], pattern: &[bool]) -> Option<usize> {
    (0..=MAX_STALE_REPLIES).find(|&k| {
        observed.len() == pattern.len()
            && observed
                .iter()
                .skip(k)
                .zip(pattern.iter())
                .all(|(o, p)| o == p)
    })
}

impl PipelineGuard<'_> {
    /// Run the PRBS-3 pass on an already locked link. Returns the number of
    /// stale replies that were drained.
    pub async fn resync(&mut self, probe: &ResyncProbe) -> ScopeResult<usize> {
        tracing::info!("Resynchronising reply stream on {}", self.pipeline().name());
        self.flush_queue().await?;

        let commands: Vec<String> = PRBS3
            .iter()
            .map(|&magic| {
                if magic {
                    probe.magic_query.clone()
                } else {
                    probe.numeric_query.clone()
                }
            })
            .collect();
        for command in &commands {
            self.send(command).await?;
        }

        let mut observed = Vec::with_capacity(PRBS3.len());
        for _ in 0..PRBS3.len() {
            match self.read_reply().await {
                Ok(reply) => observed.push(reply.contains(&probe.magic)),
                Err(e) => {
                    tracing::error!("Resync read failed: {}", e);
                    self.pipeline().mark_failed();
                    return Err(ScopeError::ResyncFailed(format!(
                        "reply stream ended during correlation: {}",
                        e
                    )));
                }
            }
        }

        let Some(offset) = correlate(&observed, &PRBS3) else {
            tracing::error!(?observed, "PRBS-3 correlation found no offset");
            self.pipeline().mark_failed();
            return Err(ScopeError::ResyncFailed(format!(
                "no offset in 0..={} matches {:?}",
                MAX_STALE_REPLIES, observed
            )));
        };

        for _ in 0..offset {
            let discarded = self.read_reply().await?;
            tracing::debug!(reply = %discarded, "Discarded throwaway reply");
        }
        tracing::info!(offset, "Reply stream locked");
        Ok(offset)
    }
}

impl ScpiPipeline {
    /// Lock the link and resynchronise it.
    pub async fn resync(&self, probe: &ResyncProbe) -> ScopeResult<usize> {
        self.lock().await.resync(probe).await
    }
}
