//! # scope-daq
//!
//! Application layer over the oscilloscope drivers: configuration loading,
//! logging setup and the instrument registry used by the `scope-daq` binary.
//!
//! The drivers themselves live in the workspace crates:
//!
//! - **`scope-core`**: waveform model, capability traits, errors
//! - **`scope-scpi`**: SCPI transports and the command pipeline
//! - **`scope-drivers`**: the LeCroy / Tektronix / Siglent driver and simulators
//!
//! ```rust,ignore
//! let config = ScopeConfig::load()?;
//! config.validate()?;
//! logging::init_from_config(&config)?;
//!
//! let registry = InstrumentRegistry::new();
//! registry.connect_all(&config).await?;
//! let scope = registry.get("bench").unwrap();
//! ```

pub mod config;
pub mod logging;
pub mod registry;

pub use config::{InstrumentDefinition, ScopeConfig};
pub use registry::InstrumentRegistry;

pub use scope_core::{ScopeError, ScopeResult, SequenceSet, Waveform};
pub use scope_drivers::{Oscilloscope, ScopeDriver};
