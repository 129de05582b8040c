//! Oscilloscope drivers for scope-daq.
//!
//! One [`ScopeDriver`] type serves every supported instrument. What differs
//! between vendors and model lines is decided by a runtime [`Family`] tag
//! at each point where the SCPI phrasing or the semantics diverge; there is
//! no per-vendor driver type.
//!
//! # Example
//!
//! ```rust,ignore
//! use scope_drivers::{DriverSettings, ScopeDriver};
//! use scope_scpi::TcpTransport;
//!
//! let transport = TcpTransport::connect("192.168.1.50", 1861).await?;
//! let scope = ScopeDriver::connect(Box::new(transport), DriverSettings::default()).await?;
//!
//! scope.enable_channel(1).await?;
//! scope.start_single_trigger().await?;
//! while !scope.acquire_data().await? {
//!     tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//! }
//! let set = scope.pop_pending().expect("one capture");
//! ```
//!
//! # Modules
//!
//! - [`family`], [`options`], [`channel`], [`probe`]: what the instrument is
//! - [`cache`]: mirrored settings
//! - [`vertical`], [`timebase`], [`acquisition`]: the oscilloscope proper
//! - [`trigger`]: the trigger model and its vendor adapters
//! - [`dmm`], [`awg`], [`spectrum`]: secondary instrument modes
//! - [`facade`]: capability dispatch by channel
//! - [`snapshot`]: bulk configuration push/pull
//! - [`factory`]: construction from a TOML table
//! - [`sim`]: simulated instruments

pub mod acquisition;
pub mod awg;
pub mod cache;
pub mod channel;
pub mod codec;
pub mod dmm;
pub mod driver;
pub mod facade;
pub mod factory;
pub mod family;
pub mod options;
pub mod probe;
pub mod sim;
pub mod snapshot;
pub mod spectrum;
pub mod timebase;
pub mod trigger;
pub mod vertical;
pub mod wire;

pub use acquisition::{AcquisitionHandle, TriggerStatus};
pub use cache::ConfigCache;
pub use channel::{Channel, ChannelKind};
pub use driver::{DriverSettings, ScopeDriver};
pub use facade::Oscilloscope;
pub use factory::{DriverFactory, ScopeDriverConfig, ScopeDriverFactory};
pub use family::{Family, Vendor};
pub use options::InstrumentOptions;
pub use probe::{Coupling, ProbeKind};
pub use snapshot::{ChannelConfig, InstrumentConfig, TriggerConfig};
pub use trigger::{EdgeSlope, Trigger, TriggerCondition, TriggerKind};
