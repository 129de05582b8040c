//! SCPI plumbing for scope-daq.
//!
//! - [`tcp::TcpTransport`]: raw SCPI socket
//! - [`mock::MockTransport`]: in-memory transport driven by a [`mock::Responder`]
//! - [`pipeline::ScpiPipeline`]: queued / immediate / reply-bearing commands,
//!   deduplication and rate limiting
//! - [`block`]: IEEE 488.2 binary blocks, including the samples-for-bytes quirk
//! - [`resync`]: PRBS-3 reply-stream resynchronisation
//! - [`idn::Identity`]: `*IDN?` parsing

pub mod block;
pub mod idn;
pub mod mock;
pub mod pipeline;
pub mod resync;
pub mod tcp;

pub use block::BlockLength;
pub use idn::Identity;
pub use mock::{MockHandle, MockReply, MockTransport, Responder};
pub use pipeline::{parse_bool, parse_f64, parse_i64, PipelineGuard, ScpiPipeline};
pub use resync::ResyncProbe;
pub use tcp::TcpTransport;
