//! Turning per-peer sample arrivals into one continuous output signal.
//!
//! Each remote peer gets a [`JitterBuffer`]. A playback driver ticks on the same
//! cadence as capture: every tick it takes the oldest buffered sample of every peer,
//! sums the results, and writes the sum to the output device.
//!
//! When a peer's buffer runs dry, its last output is held for a few ticks, then faded
//! to silence, so short gaps don't click. When a peer disconnects, its buffer is
//! dropped at once and its contribution fades out within the hold window.
//!
//! Mixing is a plain sum, without loudness normalization: several peers talking at
//! once add up.

use std::sync::{Arc, Weak};

use intercom_utils::Ticker;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{
    config::IntercomConfig,
    device::{DeviceErrorHandler, OutputDevice},
    error::{Error, Result},
    jitter::{InsertOutcome, JitterBuffer},
    proto::{AudioSample, Level, PeerIdentity, SILENCE},
    session::PlaybackSink,
};

/// Counters, since creation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStats {
    pub played: u64,
    pub late: u64,
    pub duplicates: u64,
    pub overflowed: u64,
    pub underruns: u64,
    pub output_errors: u64,
    /// Times a peer's sequence numbers jumped and its buffer started over.
    pub resyncs: u64,
}

#[derive(Debug, Clone, Copy)]
struct Smoothing {
    prefill: usize,
    hold_ticks: u32,
    fade_ticks: u32,
}

#[derive(Debug)]
struct PeerChannel {
    identity: PeerIdentity,
    buffer: JitterBuffer,
    /// Whether playback of this peer has started.
    primed: bool,
    last_output: Level,
    underrun_ticks: u32,
    /// Ticks elapsed since the peer disconnected.
    departing: Option<u32>,
}

impl PeerChannel {
    fn new(identity: PeerIdentity, buffer: JitterBuffer) -> Self {
        Self {
            identity,
            buffer,
            primed: false,
            last_output: SILENCE,
            underrun_ticks: 0,
            departing: None,
        }
    }

    /// This channel's contribution to the current tick, `None` once it has faded out
    /// after a disconnect.
    fn next_output(&mut self, smoothing: Smoothing, stats: &mut PlaybackStats) -> Option<Level> {
        if let Some(ticks) = &mut self.departing {
            *ticks = ticks.saturating_add(1);

            let hold = smoothing.hold_ticks;
            return (*ticks < hold)
                .then(|| self.last_output * (hold - *ticks) as Level / hold as Level);
        }

        if self.primed || self.buffer.len() >= smoothing.prefill {
            if let Some((_seq, level)) = self.buffer.pop() {
                self.primed = true;
                self.last_output = level;
                self.underrun_ticks = 0;
                stats.played += 1;
                return Some(level);
            }
        }

        if !self.primed {
            return Some(SILENCE);
        }

        stats.underruns += 1;
        self.underrun_ticks = self.underrun_ticks.saturating_add(1);

        let Some(fade_step) = self.underrun_ticks.checked_sub(smoothing.hold_ticks) else {
            return Some(self.last_output);
        };

        if fade_step == 0 {
            return Some(self.last_output);
        }

        if fade_step >= smoothing.fade_ticks {
            // faded out, wait for a full prefill before playing again
            self.primed = false;
            self.last_output = SILENCE;
            self.underrun_ticks = 0;
            return Some(SILENCE);
        }

        let fade = smoothing.fade_ticks;
        Some(self.last_output * (fade - fade_step) as Level / fade as Level)
    }
}

#[derive(Debug)]
struct Mixer {
    channels: FxHashMap<u64, PeerChannel>,
    stats: PlaybackStats,
    smoothing: Smoothing,
    jitter_depth: usize,
    reorder_window: u64,
}

impl Mixer {
    fn new_buffer(&self) -> JitterBuffer {
        JitterBuffer::new(self.jitter_depth, self.reorder_window)
    }

    fn insert(&mut self, sample: AudioSample) -> InsertOutcome {
        let id = sample.source_peer.id();

        let revive = self
            .channels
            .get(&id)
            .is_some_and(|channel| channel.departing.is_some());

        if revive || !self.channels.contains_key(&id) {
            log::debug!("new jitter buffer for {}", sample.source_peer);
            let channel = PeerChannel::new(sample.source_peer.clone(), self.new_buffer());
            self.channels.insert(id, channel);
        }

        let Some(channel) = self.channels.get_mut(&id) else {
            return InsertOutcome::Late;
        };

        let outcome = channel.buffer.insert(sample.sequence, sample.level);

        match outcome {
            InsertOutcome::Buffered => (),
            InsertOutcome::BufferedEvictingOldest => self.stats.overflowed += 1,
            InsertOutcome::Late => {
                self.stats.late += 1;
                log::trace!(
                    "dropped late sample {} from {}",
                    sample.sequence,
                    channel.identity
                );
            }
            InsertOutcome::Duplicate => self.stats.duplicates += 1,
            InsertOutcome::Resynced => {
                self.stats.resyncs += 1;
                log::info!(
                    "sequence numbers from {} jumped, restarting at {}",
                    channel.identity,
                    sample.sequence
                );
            }
        }

        outcome
    }

    fn mix(&mut self) -> Level {
        let smoothing = self.smoothing;
        let stats = &mut self.stats;
        let mut mixed = SILENCE;

        self.channels.retain(|_, channel| match channel.next_output(smoothing, stats) {
            Some(level) => {
                mixed += level;
                true
            }
            None => {
                log::debug!("{} faded out", channel.identity);
                false
            }
        });

        mixed
    }
}

/// Reconstructs and mixes the audio of every remote peer.
pub struct PlaybackReconstructor {
    mixer: Mutex<Mixer>,
    output: Mutex<OutputState>,
    tick_interval: core::time::Duration,
    ticker: Mutex<Option<Ticker>>,
}

struct OutputState {
    device: Box<dyn OutputDevice>,
    failing: bool,
    on_error: Option<DeviceErrorHandler>,
}

impl PlaybackReconstructor {
    pub fn new(
        config: &IntercomConfig,
        output: impl OutputDevice + 'static,
        on_error: Option<DeviceErrorHandler>,
    ) -> Self {
        Self {
            mixer: Mutex::new(Mixer {
                channels: FxHashMap::default(),
                stats: PlaybackStats::default(),
                smoothing: Smoothing {
                    prefill: config.prefill.max(1),
                    hold_ticks: config.hold_ticks,
                    fade_ticks: config.fade_ticks.max(1),
                },
                jitter_depth: config.jitter_depth,
                reorder_window: config.reorder_window,
            }),
            output: Mutex::new(OutputState {
                device: Box::new(output),
                failing: false,
                on_error,
            }),
            tick_interval: config.tick_interval(),
            ticker: Mutex::new(None),
        }
    }

    /// Buffers a sample received from a remote peer.
    pub fn on_sample_received(&self, sample: AudioSample) -> InsertOutcome {
        self.mixer.lock().insert(sample)
    }

    /// Plays one tick: pops one sample per peer, mixes, and writes the result to the
    /// output device. Returns the mixed value.
    ///
    /// Output failures are reported and counted, but never stop playback.
    pub fn tick(&self) -> Level {
        let mixed = self.mixer.lock().mix();

        let mut output = self.output.lock();

        match output.device.write_output_frame(mixed) {
            Ok(()) => {
                if core::mem::take(&mut output.failing) {
                    log::info!("audio output recovered");
                }
            }
            Err(e) => {
                self.mixer.lock().stats.output_errors += 1;

                // only report the first failure of a streak
                if !core::mem::replace(&mut output.failing, true) {
                    log::warn!("playback tick failed: {e}");
                    if let Some(on_error) = &output.on_error {
                        on_error(&e);
                    }
                }
            }
        }

        mixed
    }

    /// Drops a peer's buffer and contribution immediately.
    pub fn remove_peer(&self, peer: &PeerIdentity) {
        if self.mixer.lock().channels.remove(&peer.id()).is_some() {
            log::debug!("removed jitter buffer for {peer}");
        }
    }

    /// Drops a disconnected peer's buffer. Its contribution fades out over at most
    /// `hold_ticks` ticks, after which the peer is forgotten.
    pub fn on_peer_disconnected(&self, peer: &PeerIdentity) {
        let mut mixer = self.mixer.lock();
        let hold_ticks = mixer.smoothing.hold_ticks;

        let Some(channel) = mixer.channels.get_mut(&peer.id()) else {
            return;
        };

        channel.buffer.clear();

        if hold_ticks == 0 || channel.last_output == SILENCE || !channel.primed {
            mixer.channels.remove(&peer.id());
            log::debug!("removed jitter buffer for {peer}");
        } else if channel.departing.is_none() {
            channel.departing = Some(0);
            log::debug!("fading out {peer}");
        }
    }

    /// Peers currently contributing to the mix, including fading ones.
    pub fn active_peers(&self) -> Vec<PeerIdentity> {
        self.mixer
            .lock()
            .channels
            .values()
            .map(|channel| channel.identity.clone())
            .collect()
    }

    /// Number of samples buffered for `peer`, `None` if it has no buffer.
    pub fn buffered(&self, peer: &PeerIdentity) -> Option<usize> {
        self.mixer
            .lock()
            .channels
            .get(&peer.id())
            .filter(|channel| channel.departing.is_none())
            .map(|channel| channel.buffer.len())
    }

    pub fn stats(&self) -> PlaybackStats {
        self.mixer.lock().stats
    }

    /// Starts the playback driver. Does nothing if it is already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut ticker = self.ticker.lock();

        if ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let this: Weak<Self> = Arc::downgrade(self);

        *ticker = Some(
            Ticker::spawn("intercom-playback", self.tick_interval, move || {
                match this.upgrade() {
                    Some(this) => {
                        this.tick();
                        core::ops::ControlFlow::Continue(())
                    }
                    None => core::ops::ControlFlow::Break(()),
                }
            })
            .map_err(|e| Error::spawn("playback", e))?,
        );

        log::debug!("playback driver started");
        Ok(())
    }

    /// Stops the playback driver, waiting for any running tick to complete.
    pub fn stop(&self) {
        let ticker = self.ticker.lock().take();

        if let Some(mut ticker) = ticker {
            ticker.stop();
            log::debug!("playback driver stopped");
        }
    }
}

impl PlaybackSink for PlaybackReconstructor {
    #[inline]
    fn on_sample_received(&self, sample: AudioSample) {
        PlaybackReconstructor::on_sample_received(self, sample);
    }

    #[inline]
    fn on_peer_disconnected(&self, peer: &PeerIdentity) {
        PlaybackReconstructor::on_peer_disconnected(self, peer);
    }
}

impl Drop for PlaybackReconstructor {
    fn drop(&mut self) {
        self.stop();
    }
}
