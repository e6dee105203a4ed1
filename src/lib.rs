//! Configuration and run-control core for multi-channel X-ray pulse-processing
//! modules.
//!
//! A [`Handel`] holds the detector, firmware, defaults and module registries,
//! maps detChans onto module channels and dispatches every operation to the
//! product backend ([`Psl`]) of the module that owns the channel. The
//! [`Controller`] adds a polling worker that reads out and decodes
//! acquisitions.

#[macro_use]
mod error;

pub mod chan_data;
pub mod channels;
mod config;
mod controller;
mod counter;
pub mod defaults;
pub mod detector;
pub mod firmware;
mod frame;
mod handel;
pub mod ini;
mod logging;
pub mod mapping;
pub mod module;
pub mod params;
pub mod poller;
pub mod psl;
pub mod registry;
mod run;
pub mod sim;
mod validate;
mod value;
#[cfg(feature = "hdf5")]
mod writer;

pub use config::{Conf, FrameMode, LoggingSettings, PollingSettings};
pub use controller::Controller;
pub use counter::Counter;
pub use defaults::XiaDefaults;
pub use detector::Detector;
pub use error::{ErrorKind, HandelError, Result};
pub use firmware::FirmwareSet;
pub use frame::{ChannelAttributes, Frame, FrameData};
pub use handel::{Handel, SharedHandel, SystemState};
pub use logging::init_logging;
pub use module::Module;
pub use poller::CollectMode;
pub use psl::{ChannelContext, Psl};
pub use sim::SimulatedFalconX;
pub use value::Value;
#[cfg(feature = "hdf5")]
pub use writer::FrameWriter;
