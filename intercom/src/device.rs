//! Audio device contracts.
//!
//! Platform audio-session setup (sample rate, channel negotiation, routing) is
//! the host's business. The runtime only needs to read one input level per capture
//! tick and write one output value per playback tick.

use std::sync::Arc;

use crate::{error::DeviceError, proto::Level};

/// Called from the capture or playback thread when a device fails.
pub type DeviceErrorHandler = Arc<dyn Fn(&DeviceError) + Send + Sync>;

/// The local audio input.
pub trait CaptureDevice: Send {
    /// Reads the current input level.
    fn read_current_level(&mut self) -> Result<Level, DeviceError>;
}

/// The local audio output.
pub trait OutputDevice: Send {
    /// Writes the mixed output value for the current playback tick.
    fn write_output_frame(&mut self, level: Level) -> Result<(), DeviceError>;
}

impl<F: FnMut() -> Result<Level, DeviceError> + Send> CaptureDevice for F {
    #[inline(always)]
    fn read_current_level(&mut self) -> Result<Level, DeviceError> {
        self()
    }
}

impl<F: FnMut(Level) -> Result<(), DeviceError> + Send> OutputDevice for F {
    #[inline(always)]
    fn write_output_frame(&mut self, level: Level) -> Result<(), DeviceError> {
        self(level)
    }
}
