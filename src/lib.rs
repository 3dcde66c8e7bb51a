//! # Debug-probe signal mapping and target bring-up
//!
//! This crate turns a declarative description of how logical debug signals
//! (reset, TMS, TDI, TDO, TCK, enable) map onto the GPIO bits of one channel
//! of a USB debug adapter into a validated, applied pin layout, and then
//! sequences reset and JTAG tap discovery until ready-to-use target handles
//! come out the other end.
//!
//! The physical adapter and the target protocol layer stay behind two
//! capability traits, [`AdapterLink`] and [`ChainAccess`]; the crate ships a
//! recording fake for both so the whole sequence can run in tests and dry
//! runs.
//!
//! ## Bringing up a Cortex-M target
//! ```no_run
//! use jtag_bringup::{
//!     AdapterBinding, BringUpOptions, DriveMode, LayoutConfig, Level, Orchestrator,
//!     ResetPolicy, Signal, SignalBinding, TapConfig,
//! };
//! # use jtag_bringup::fake::{FakeAdapter, FakeChain, FakeTap};
//!
//! let config = LayoutConfig {
//!     channel: 0,
//!     clock_khz: 1000,
//!     bindings: vec![
//!         SignalBinding::output(Signal::Reset, 7, Level::High, DriveMode::PushPull),
//!         SignalBinding::output(Signal::Enable, 5, Level::High, DriveMode::PushPull),
//!         SignalBinding::output(Signal::Tms, 3, Level::High, DriveMode::PushPull),
//!         SignalBinding::input(Signal::Tdo, 2, Level::High),
//!         SignalBinding::output(Signal::Tdi, 1, Level::Low, DriveMode::PushPull),
//!         SignalBinding::output(Signal::Tck, 0, Level::Low, DriveMode::PushPull),
//!     ],
//! };
//!
//! # let mut chain = FakeChain::new(vec![FakeTap::with_idcode(0x4ba00477)]);
//! let binding = AdapterBinding::new(Box::new(FakeAdapter::new()));
//! let mut orchestrator = Orchestrator::new(binding);
//! let handles = orchestrator
//!     .bring_up(
//!         &mut chain,
//!         &config,
//!         &ResetPolicy::default(),
//!         &[TapConfig::cortex_m(vec![0x4ba00477])],
//!         &BringUpOptions::default(),
//!     )
//!     .unwrap();
//! assert_eq!(handles.len(), 1);
//! ```

#![warn(missing_docs)]

pub mod binding;
pub mod discovery;
mod error;
pub mod fake;
pub mod layout;
pub mod reset;
pub mod sequencer;

pub use crate::binding::{AdapterBinding, AdapterLink};
pub use crate::discovery::{
    ChainAccess, CoreKind, DiscoveryEngine, Endianness, IdCode, TapConfig, TapDescriptor,
    TapRole, TargetHandle,
};
pub use crate::error::{AdapterError, BringUpError, BringUpFailure, Stage};
pub use crate::layout::{
    ChannelLayout, Direction, DriveMode, Level, LayoutConfig, Signal, SignalBinding,
};
pub use crate::reset::{ResetMode, ResetPolicy, ResetState, ResetStrategy};
pub use crate::sequencer::{
    BringUpEvent, BringUpOptions, BringUpResult, CancelToken, ClockOverride, Orchestrator,
};
