//! Serial telemetry acquisition and crash-log diagnosis for leaf profile
//! plotters.
//!
//! The microcontroller streams `x,y` pairs over a serial link once it receives
//! `START`, stops on `STOP`, and answers `IOSTATUS` with the levels of its 38
//! I/O pins. This crate owns that conversation and leaves rendering to the
//! caller.
//!
//! # Layers
//!
//! - [`ports`]: serial port discovery and the ESP32 match heuristic.
//! - [`link`]: connection state machine, START/STOP handshake, line framing.
//! - [`telemetry`]: `x,y` line parsing.
//! - [`store`] and [`record`]: the sample series and its CSV-like file format.
//! - [`pins`]: the `IOSTATUS` poll cycle and pin table.
//! - [`diagnostics`]: offline analysis of ESP32 crash logs.
//! - [`session`]: a worker thread that owns the link and ties it all together.
//!
//! # Staleness
//!
//! Idle firmware keeps repeating its last reading. A sample equal to its
//! predecessor is *stale*; it still counts as "device alive" but does not make
//! the link status [`LinkStatus::Active`]. Whether stale samples are stored is
//! set by [`DedupPolicy`].

pub mod config;
pub mod diagnostics;
mod errors;
pub mod link;
pub mod logging;
pub mod mock;
pub mod pins;
pub mod ports;
pub mod record;
pub mod session;
pub mod store;
pub mod telemetry;

pub use config::EngineConfig;
pub use diagnostics::{run_diagnosis, CrashEvent, Issue, IssueKind, Report};
pub use errors::*;
pub use link::{ConnectionState, Connector, LinkManager, SerialConnector, Transport};
pub use pins::{PinLevel, PinPoller, PinState};
pub use ports::{find_preferred_port, list_ports, PortDescriptor};
pub use record::RecordMetadata;
pub use session::{AcquisitionSession, LinkStatus, SessionEvent};
pub use store::{DedupPolicy, SampleStore, Staleness};
pub use telemetry::{parse_line, Sample};
