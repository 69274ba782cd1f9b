//! The top-level intercom lifecycle.

use core::sync::atomic::{AtomicBool, Ordering};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;

use crate::{
    capture::{CaptureScheduler, CaptureState},
    config::IntercomConfig,
    device::{CaptureDevice, DeviceErrorHandler, OutputDevice},
    error::{DeviceError, Error, Result},
    playback::PlaybackReconstructor,
    proto::PeerIdentity,
    session::{AcceptPolicy, AlwaysAccept, PlaybackSink, SampleSink, SessionManager},
    transport::{EventSource, PeerTransport},
};

/// Owns every part of a running intercom: the session, the capture scheduler and
/// the playback reconstructor, plus the threads driving them.
///
/// Reception is always on. Transmission is toggled by the user with
/// [`toggle_talk`](Self::toggle_talk).
///
/// Everything is torn down by [`shutdown`](Self::shutdown), or on drop.
pub struct IntercomController {
    local: PeerIdentity,
    transport: Arc<dyn PeerTransport>,
    session: Arc<SessionManager>,
    playback: Arc<PlaybackReconstructor>,
    capture: CaptureScheduler,
    last_capture_error: Arc<Mutex<Option<DeviceError>>>,
    last_output_error: Arc<Mutex<Option<DeviceError>>>,
    stop_events: Arc<AtomicBool>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Logs a device error and keeps it for the UI.
fn recording_handler(slot: &Arc<Mutex<Option<DeviceError>>>) -> DeviceErrorHandler {
    let slot = Arc::clone(slot);
    Arc::new(move |e: &DeviceError| *slot.lock() = Some(e.clone()))
}

impl IntercomController {
    /// Starts an intercom accepting every invitation.
    ///
    /// See [`init_with_policy`](Self::init_with_policy).
    pub fn init(
        config: IntercomConfig,
        local: PeerIdentity,
        transport: Arc<dyn PeerTransport>,
        events: EventSource,
        capture_device: impl CaptureDevice + 'static,
        output_device: impl OutputDevice + 'static,
    ) -> Result<Self> {
        Self::init_with_policy(
            config,
            local,
            transport,
            events,
            capture_device,
            output_device,
            AlwaysAccept,
        )
    }

    /// Starts an intercom: spawns the event loop consuming `events` (the queue
    /// `transport` pushes into) and the playback driver, then starts advertising and
    /// browsing. Capture stays idle.
    pub fn init_with_policy(
        config: IntercomConfig,
        local: PeerIdentity,
        transport: Arc<dyn PeerTransport>,
        events: EventSource,
        capture_device: impl CaptureDevice + 'static,
        output_device: impl OutputDevice + 'static,
        accept_policy: impl AcceptPolicy + 'static,
    ) -> Result<Self> {
        config.validate()?;

        let last_capture_error = Arc::new(Mutex::new(None));
        let last_output_error = Arc::new(Mutex::new(None));

        let playback = Arc::new(PlaybackReconstructor::new(
            &config,
            output_device,
            Some(recording_handler(&last_output_error)),
        ));

        let session = Arc::new(
            SessionManager::new(
                &config,
                local.clone(),
                Arc::clone(&transport),
                Arc::clone(&playback) as Arc<dyn PlaybackSink>,
            )
            .with_accept_policy(accept_policy),
        );

        let capture = CaptureScheduler::new(
            &config,
            local.clone(),
            capture_device,
            Arc::clone(&session) as Arc<dyn SampleSink>,
            Some(recording_handler(&last_capture_error)),
        );

        // from here on, dropping `this` on error tears down whatever was started
        let this = Self {
            local,
            transport,
            session,
            playback,
            capture,
            last_capture_error,
            last_output_error,
            stop_events: Arc::new(AtomicBool::new(false)),
            event_thread: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        };

        let session = Arc::clone(&this.session);
        let stop_events = Arc::clone(&this.stop_events);

        let handle = thread::Builder::new()
            .name("intercom-events".into())
            .spawn(move || session.run(&events, &stop_events))
            .map_err(|e| Error::spawn("event", e))?;

        *this.event_thread.lock() = Some(handle);

        this.playback.start()?;

        this.transport.advertise()?;
        this.transport.browse()?;

        log::info!(
            "intercom started as {} on {}",
            this.local,
            config.service_type
        );

        Ok(this)
    }

    #[inline(always)]
    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    #[inline(always)]
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    #[inline(always)]
    pub fn playback(&self) -> &Arc<PlaybackReconstructor> {
        &self.playback
    }

    #[inline(always)]
    pub fn capture(&self) -> &CaptureScheduler {
        &self.capture
    }

    #[inline]
    pub fn is_talking(&self) -> bool {
        self.capture.is_capturing()
    }

    /// Starts transmitting if idle, stops if transmitting. Returns the new state.
    pub fn toggle_talk(&self) -> Result<CaptureState> {
        if self.is_talking() {
            self.stop_talking();
        } else {
            self.start_talking()?;
        }

        Ok(self.capture.state())
    }

    pub fn start_talking(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }

        if self.is_talking() {
            return Ok(());
        }

        self.last_capture_error.lock().take();
        self.capture.start()?;

        log::info!("talking");
        Ok(())
    }

    pub fn stop_talking(&self) {
        if self.is_talking() {
            self.capture.stop();
            log::info!("stopped talking");
        }
    }

    /// The device error that last stopped capture, if it hasn't been restarted since.
    pub fn last_capture_error(&self) -> Option<DeviceError> {
        self.last_capture_error.lock().clone()
    }

    /// The most recent audio output failure.
    pub fn last_output_error(&self) -> Option<DeviceError> {
        self.last_output_error.lock().clone()
    }

    /// Stops capture, the event loop and playback, and leaves the mesh. Every thread
    /// has exited once this returns. Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.capture.stop();

        self.stop_events.store(true, Ordering::Release);
        let handle = self.event_thread.lock().take();

        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                log::warn!("shutdown requested from the event loop, not joining it");
            } else if handle.join().is_err() {
                log::error!("event loop panicked");
            }
        }

        self.transport.stop();
        self.session.disconnect_all();
        self.playback.stop();

        log::info!("intercom shut down");
    }
}

impl Drop for IntercomController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(all(test, feature = "loopback"))]
mod tests {
    use super::*;
    use crate::{
        proto::Level,
        transport::{
            event_queue,
            loopback::{LoopbackMesh, LoopbackTransport},
        },
    };

    fn silent_output() -> impl OutputDevice + 'static {
        |_: Level| -> Result<(), DeviceError> { Ok(()) }
    }

    fn controller_on(
        mesh: &LoopbackMesh,
        id: u64,
        capture: impl CaptureDevice + 'static,
    ) -> IntercomController {
        controller_with_output(mesh, id, capture, silent_output())
    }

    fn controller_with_output(
        mesh: &LoopbackMesh,
        id: u64,
        capture: impl CaptureDevice + 'static,
        output: impl OutputDevice + 'static,
    ) -> IntercomController {
        let config = IntercomConfig {
            // capture is ticked by hand
            tick_interval_ms: 3_600_000,
            event_poll_interval_ms: 5,
            ..Default::default()
        };

        let local = PeerIdentity::new(id, format!("peer-{id}"));
        let (sink, events) = event_queue();
        let transport: Arc<LoopbackTransport> =
            Arc::new(mesh.join(local.clone(), config.service_type.clone(), sink));

        IntercomController::init(config, local, transport, events, capture, output).unwrap()
    }

    #[test]
    fn toggle_starts_and_stops_capture() {
        let mesh = LoopbackMesh::new();
        let controller = controller_on(&mesh, 1, || -> Result<Level, DeviceError> { Ok(0.2) });

        assert!(!controller.is_talking());
        assert_eq!(controller.toggle_talk(), Ok(CaptureState::Capturing));
        assert!(controller.is_talking());
        assert_eq!(controller.toggle_talk(), Ok(CaptureState::Idle));
        assert_eq!(controller.capture().tick(), Ok(None));
    }

    #[test]
    fn capture_errors_are_kept_for_the_ui() {
        let mesh = LoopbackMesh::new();
        let controller = controller_on(&mesh, 1, || -> Result<Level, DeviceError> {
            Err(DeviceError::Unavailable("no microphone".into()))
        });

        controller.start_talking().unwrap();
        assert!(controller.capture().tick().is_err());

        assert!(!controller.is_talking());
        assert_eq!(
            controller.last_capture_error(),
            Some(DeviceError::Unavailable("no microphone".into()))
        );
    }

    #[test]
    fn output_errors_are_kept_for_the_ui() {
        let mesh = LoopbackMesh::new();
        let controller = controller_with_output(
            &mesh,
            1,
            || -> Result<Level, DeviceError> { Ok(0.2) },
            |_: Level| -> Result<(), DeviceError> {
                Err(DeviceError::Unavailable("speaker unplugged".into()))
            },
        );

        assert_eq!(controller.last_output_error(), None);

        controller.playback().tick();
        controller.playback().tick();

        assert_eq!(
            controller.last_output_error(),
            Some(DeviceError::Unavailable("speaker unplugged".into()))
        );
        assert_eq!(controller.playback().stats().output_errors, 2);
        assert_eq!(controller.last_capture_error(), None);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mesh = LoopbackMesh::new();
        let controller = controller_on(&mesh, 1, || -> Result<Level, DeviceError> { Ok(0.2) });

        controller.start_talking().unwrap();
        controller.shutdown();
        controller.shutdown();

        assert!(!controller.is_talking());
        assert_eq!(controller.start_talking(), Err(Error::ShutDown));
    }

    #[test]
    fn rejects_invalid_config() {
        let mesh = LoopbackMesh::new();
        let local = PeerIdentity::new(1, "peer-1");
        let (sink, events) = event_queue();
        let transport = Arc::new(mesh.join(local.clone(), "voice-intercom", sink));

        let config = IntercomConfig {
            jitter_depth: 0,
            ..Default::default()
        };

        let result = IntercomController::init(
            config,
            local,
            transport,
            events,
            || -> Result<Level, DeviceError> { Ok(0.) },
            silent_output(),
        );

        assert!(matches!(result, Err(Error::Config(_))));
    }
}
