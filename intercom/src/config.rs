//! Runtime configuration.
//!
//! The core reads no files or environment variables. Hosts build an
//! [`IntercomConfig`] (usually [`Default`]), or deserialize one from their own
//! configuration, where every missing field falls back to its default.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    proto::wire::WireVersion,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntercomConfig {
    /// Service name peers advertise and browse for.
    pub service_type: String,
    /// Capture and playback cadence, in milliseconds.
    ///
    /// 50 ms (20 Hz) trades perceived latency against the message rate on the mesh.
    pub tick_interval_ms: u64,
    /// How many sequence numbers behind the newest one a sample may arrive and still
    /// be reordered into place. Anything older is dropped.
    ///
    /// A sample can only be reordered while its successor is still buffered. With a
    /// `prefill` of 1, each sample plays on the tick it arrives, so a sample one tick
    /// late is dropped even inside the window. Raising `prefill` buys that time.
    pub reorder_window: u64,
    /// Maximum number of samples buffered per peer. When full, the oldest are dropped.
    pub jitter_depth: usize,
    /// Samples a peer's buffer must hold before playback of that peer starts.
    pub prefill: usize,
    /// Ticks during which the last output of an underrunning peer is held.
    ///
    /// Also bounds how long a disconnected peer keeps fading out.
    pub hold_ticks: u32,
    /// Ticks taken to fade an underrunning peer to silence, after the hold.
    pub fade_ticks: u32,
    /// Consecutive failed sends after which a peer is disconnected. `0` never
    /// disconnects.
    pub max_send_failures: u32,
    /// How long a peer may stay in a handshake state before its record is dropped,
    /// in milliseconds.
    pub handshake_timeout_ms: u64,
    /// How often the event loop wakes up when idle, in milliseconds.
    pub event_poll_interval_ms: u64,
    /// Encoding of outgoing audio messages.
    pub wire_version: WireVersion,
}

impl Default for IntercomConfig {
    fn default() -> Self {
        Self {
            service_type: "voice-intercom".into(),
            tick_interval_ms: 50,
            reorder_window: 3,
            jitter_depth: 8,
            prefill: 1,
            hold_ticks: 2,
            fade_ticks: 1,
            max_send_failures: 5,
            handshake_timeout_ms: 10_000,
            event_poll_interval_ms: 100,
            wire_version: WireVersion::V1,
        }
    }
}

impl IntercomConfig {
    #[inline(always)]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    #[inline(always)]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[inline(always)]
    pub const fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }

    /// Checks that the values can drive the runtime.
    pub fn validate(&self) -> Result<()> {
        let problem = if self.tick_interval_ms == 0 {
            "tick_interval_ms must be non-zero"
        } else if self.jitter_depth == 0 {
            "jitter_depth must be non-zero"
        } else if self.prefill == 0 || self.prefill > self.jitter_depth {
            "prefill must be between 1 and jitter_depth"
        } else if self.fade_ticks == 0 {
            "fade_ticks must be non-zero"
        } else if self.event_poll_interval_ms == 0 {
            "event_poll_interval_ms must be non-zero"
        } else if self.service_type.is_empty() {
            "service_type must not be empty"
        } else {
            return Ok(());
        };

        Err(Error::Config(problem.into()))
    }
}
