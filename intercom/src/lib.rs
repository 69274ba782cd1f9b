//! Peer-to-peer voice intercom runtime for local wireless meshes.
//!
//! Devices find each other through a [`PeerTransport`], connect, and continuously
//! exchange tiny audio messages, one level reading per tick, for near-real-time
//! playback.
//!
//! ## Architecture
//!
//! ```text
//!  user ─► IntercomController ─► CaptureScheduler ─► SessionManager ─► PeerTransport
//!                                                                            │
//!  OutputDevice ◄─ PlaybackReconstructor ◄─ SessionManager ◄─ TransportEvent ◄┘
//! ```
//!
//! - [`SessionManager`]: the set of known peers, their connection lifecycle, and the
//!   fan-out of outgoing samples. Consumes every [`TransportEvent`] from one ordered
//!   queue.
//! - [`CaptureScheduler`]: samples the [`CaptureDevice`] on a fixed cadence while the
//!   user is talking.
//! - [`PlaybackReconstructor`]: per-peer jitter buffers, underrun smoothing, and
//!   additive mixing into the [`OutputDevice`].
//! - [`IntercomController`]: owns all of the above and the threads driving them.
//!
//! ## Threads
//!
//! A running intercom has three threads: a capture ticker (only while talking), a
//! playback ticker, and an event loop draining transport events. Shared state sits
//! behind one lock per structure.
//!
//! ## Logging
//!
//! Everything is reported through the [`log`] facade. No logger is installed by this
//! crate.

pub use intercom_proto as proto;
pub use intercom_utils as utils;

pub mod capture;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod jitter;
pub mod playback;
pub mod session;
pub mod transport;

pub use capture::{CaptureScheduler, CaptureState};
pub use config::IntercomConfig;
pub use controller::IntercomController;
pub use device::{CaptureDevice, DeviceErrorHandler, OutputDevice};
pub use error::{DeviceError, Error, Result, TransportError};
pub use playback::{PlaybackReconstructor, PlaybackStats};
pub use proto::{AudioSample, ConnectionState, Level, PeerIdentity};
pub use session::{
    AcceptPolicy, AlwaysAccept, BroadcastReport, PeerConnection, SessionManager, SessionStats,
};
pub use transport::{EventSink, EventSource, PeerTransport, TransportEvent, event_queue};
