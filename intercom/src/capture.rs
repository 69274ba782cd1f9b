//! Fixed-cadence sampling of the local audio input.

use core::{
    ops::ControlFlow,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use std::sync::Arc;

use atomic_float::AtomicF32;
use intercom_utils::Ticker;
use parking_lot::Mutex;

use crate::{
    config::IntercomConfig,
    device::{CaptureDevice, DeviceErrorHandler},
    error::{DeviceError, Error, Result},
    proto::{AudioSample, Level, PeerIdentity, SILENCE},
    session::SampleSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureState {
    Idle,
    Capturing,
}

struct Shared {
    local: PeerIdentity,
    /// Held for the whole of a tick.
    device: Mutex<Box<dyn CaptureDevice>>,
    sink: Arc<dyn SampleSink>,
    capturing: AtomicBool,
    next_sequence: AtomicU64,
    last_level: AtomicF32,
    on_error: Option<DeviceErrorHandler>,
}

impl Shared {
    fn tick(&self) -> Result<Option<AudioSample>, DeviceError> {
        let mut device = self.device.lock();

        if !self.capturing.load(Ordering::Acquire) {
            return Ok(None);
        }

        match device.read_current_level() {
            Ok(level) => {
                let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                self.last_level.store(level, Ordering::Relaxed);

                let sample = AudioSample::new(level, self.local.clone(), sequence);
                self.sink.submit(sample.clone());

                Ok(Some(sample))
            }
            Err(e) => {
                self.capturing.store(false, Ordering::Release);
                self.last_level.store(SILENCE, Ordering::Relaxed);
                drop(device);

                log::error!("capture halted: {e}");

                if let Some(on_error) = &self.on_error {
                    on_error(&e);
                }

                Err(e)
            }
        }
    }
}

/// Produces one [`AudioSample`] per tick while capturing, and hands it to a
/// [`SampleSink`].
///
/// Sequence numbers keep increasing across stops and restarts.
pub struct CaptureScheduler {
    shared: Arc<Shared>,
    tick_interval: Duration,
    ticker: Mutex<Option<Ticker>>,
}

impl CaptureScheduler {
    pub fn new(
        config: &IntercomConfig,
        local: PeerIdentity,
        device: impl CaptureDevice + 'static,
        sink: Arc<dyn SampleSink>,
        on_error: Option<DeviceErrorHandler>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                local,
                device: Mutex::new(Box::new(device)),
                sink,
                capturing: AtomicBool::new(false),
                next_sequence: AtomicU64::new(0),
                last_level: AtomicF32::new(SILENCE),
                on_error,
            }),
            tick_interval: config.tick_interval(),
            ticker: Mutex::new(None),
        }
    }

    #[inline]
    pub fn state(&self) -> CaptureState {
        if self.is_capturing() {
            CaptureState::Capturing
        } else {
            CaptureState::Idle
        }
    }

    #[inline]
    pub fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::Acquire)
    }

    /// The most recently captured level, for metering. Silence while idle after a
    /// device error.
    #[inline]
    pub fn last_level(&self) -> Level {
        self.shared.last_level.load(Ordering::Relaxed)
    }

    /// The sequence number the next sample will carry.
    #[inline]
    pub fn next_sequence(&self) -> u64 {
        self.shared.next_sequence.load(Ordering::Relaxed)
    }

    /// Starts capturing. Does nothing if already capturing.
    pub fn start(&self) -> Result<()> {
        let mut ticker = self.ticker.lock();

        if self.is_capturing() {
            return Ok(());
        }

        // left behind by a device error
        if let Some(mut stale) = ticker.take() {
            stale.stop();
        }

        self.shared.capturing.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let spawned = Ticker::spawn("intercom-capture", self.tick_interval, move || {
            match shared.tick() {
                Ok(Some(_)) => ControlFlow::Continue(()),
                Ok(None) | Err(_) => ControlFlow::Break(()),
            }
        });

        match spawned {
            Ok(t) => *ticker = Some(t),
            Err(e) => {
                self.shared.capturing.store(false, Ordering::Release);
                return Err(Error::spawn("capture", e));
            }
        }

        log::info!("capture started");
        Ok(())
    }

    /// Runs one capture tick by hand.
    ///
    /// Returns the produced sample, `None` when idle, or the device error that just
    /// stopped capturing.
    #[inline]
    pub fn tick(&self) -> Result<Option<AudioSample>, DeviceError> {
        self.shared.tick()
    }

    /// Stops capturing. No sample is produced once this returns. Does nothing if idle.
    pub fn stop(&self) {
        let was_capturing = {
            // waits for a running tick to complete
            let _device = self.shared.device.lock();
            self.shared.capturing.swap(false, Ordering::AcqRel)
        };

        let ticker = self.ticker.lock().take();
        if let Some(mut ticker) = ticker {
            ticker.stop();
        }

        if was_capturing {
            log::info!("capture stopped");
        }
    }
}

impl Drop for CaptureScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
