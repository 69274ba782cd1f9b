//! Peer session management.
//!
//! The [`SessionManager`] owns the authoritative set of known peers and drives their
//! connection lifecycle from [`TransportEvent`]s:
//!
//! ```text
//!   PeerFound ─► Discovering ─┐
//!                             ├─► Connected ─► (removed)
//!   Invitation ─► Connecting ─┘        ▲
//!                                      └── only state that sends or receives
//! ```
//!
//! A record that stays in a handshake state (`Discovering`/`Connecting`) longer than
//! the handshake timeout is dropped. Outbound samples are fanned out to every
//! connected peer independently: one peer failing never prevents delivery to the
//! others, and a peer failing too many sends in a row is disconnected.

use core::{
    cmp,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::{sync::Arc, time::Instant};

use intercom_utils::ActivityTimer;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;

use crate::{
    config::IntercomConfig,
    error::Result,
    proto::{
        AudioSample, ConnectionState, PeerIdentity,
        wire::{self, WireVersion},
    },
    transport::{EventSource, InvitationResponder, NoEvent, PeerTransport, TransportEvent},
};

/// Per-peer state, keyed by peer id.
type PeerMap<V> = rustc_hash::FxHashMap<u64, V>;

/// Priority queue keyed by peer id. Used with [`cmp::Reverse`] deadlines, so the
/// earliest one has the highest priority.
type PeerPQ<V> = priority_queue::PriorityQueue<u64, V, FxBuildHasher>;

/// Where received samples go.
pub trait PlaybackSink: Send + Sync {
    fn on_sample_received(&self, sample: AudioSample);

    /// Called before the peer's record is removed.
    fn on_peer_disconnected(&self, peer: &PeerIdentity);
}

/// Where captured samples go.
pub trait SampleSink: Send + Sync {
    fn submit(&self, sample: AudioSample);
}

/// Decides whether an invitation is accepted.
pub trait AcceptPolicy: Send + Sync {
    fn should_accept(&self, peer: &PeerIdentity) -> bool;
}

/// Accepts every invitation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AlwaysAccept;

impl AcceptPolicy for AlwaysAccept {
    #[inline(always)]
    fn should_accept(&self, _peer: &PeerIdentity) -> bool {
        true
    }
}

impl<F: Fn(&PeerIdentity) -> bool + Send + Sync> AcceptPolicy for F {
    #[inline(always)]
    fn should_accept(&self, peer: &PeerIdentity) -> bool {
        self(peer)
    }
}

/// The record kept for every known remote peer.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    identity: PeerIdentity,
    state: ConnectionState,
    last_activity: ActivityTimer,
    send_failures: u32,
}

impl PeerConnection {
    #[inline(always)]
    fn new(identity: PeerIdentity, state: ConnectionState) -> Self {
        Self {
            identity,
            state,
            last_activity: ActivityTimer::new(),
            send_failures: 0,
        }
    }

    #[inline(always)]
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    #[inline(always)]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// When a message was last sent to or received from this peer, or its state last
    /// changed.
    #[inline(always)]
    pub const fn last_activity(&self) -> Instant {
        self.last_activity.last_reset()
    }

    /// Consecutive failed sends.
    #[inline(always)]
    pub const fn send_failures(&self) -> u32 {
        self.send_failures
    }
}

/// The outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Soft failure counters, since creation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub send_failures: u64,
    pub decode_failures: u64,
}

struct Peers {
    records: PeerMap<PeerConnection>,
    /// Handshake deadlines, one per record in a pending state.
    deadlines: PeerPQ<cmp::Reverse<Instant>>,
    /// Next sequence number assigned to an unsequenced message, per sender.
    receive_counters: PeerMap<u64>,
    stats: SessionStats,
}

impl Peers {
    fn remove(&mut self, id: u64) -> Option<PeerConnection> {
        self.deadlines.remove(&id);
        self.receive_counters.remove(&id);
        self.records.remove(&id)
    }
}

/// Owns the set of known peers and mediates every inbound and outbound message.
pub struct SessionManager {
    local: PeerIdentity,
    transport: Arc<dyn PeerTransport>,
    playback: Arc<dyn PlaybackSink>,
    policy: Box<dyn AcceptPolicy>,
    peers: Mutex<Peers>,
    wire_version: WireVersion,
    max_send_failures: u32,
    handshake_timeout: Duration,
    poll_interval: Duration,
}

impl SessionManager {
    /// Creates a session manager with no known peers, accepting every invitation.
    pub fn new(
        config: &IntercomConfig,
        local: PeerIdentity,
        transport: Arc<dyn PeerTransport>,
        playback: Arc<dyn PlaybackSink>,
    ) -> Self {
        Self {
            local,
            transport,
            playback,
            policy: Box::new(AlwaysAccept),
            peers: Mutex::new(Peers {
                records: PeerMap::default(),
                deadlines: PeerPQ::with_hasher(FxBuildHasher),
                receive_counters: PeerMap::default(),
                stats: SessionStats::default(),
            }),
            wire_version: config.wire_version,
            max_send_failures: config.max_send_failures,
            handshake_timeout: config.handshake_timeout(),
            poll_interval: config.event_poll_interval(),
        }
    }

    /// Replaces the invitation policy.
    pub fn with_accept_policy(mut self, policy: impl AcceptPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    #[inline(always)]
    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    #[inline(always)]
    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Called when a peer advertising our service is found. Invites it, unless it is
    /// already known.
    pub fn on_peer_discovered(&self, identity: PeerIdentity) {
        if identity == self.local {
            return;
        }

        {
            let mut peers = self.peers.lock();

            if let Some(record) = peers.records.get(&identity.id()) {
                log::trace!("{identity} rediscovered while {}", record.state);
                return;
            }

            let record = PeerConnection::new(identity.clone(), ConnectionState::Discovering);
            let deadline = record.last_activity.deadline(self.handshake_timeout);

            peers.deadlines.push(identity.id(), cmp::Reverse(deadline));
            peers.records.insert(identity.id(), record);
        }

        log::debug!("discovered {identity}, inviting");

        if let Err(e) = self.transport.invite(&identity) {
            log::warn!("failed to invite {identity}: {e}");

            // forget it, so that the next discovery retries
            let mut peers = self.peers.lock();
            if peers
                .records
                .get(&identity.id())
                .is_some_and(|r| r.state == ConnectionState::Discovering)
            {
                peers.remove(identity.id());
            }
        }
    }

    /// Called when a previously discovered peer stops advertising.
    ///
    /// Only forgets peers we have not connected to: connected peers leave through
    /// [`on_connection_state_changed`](Self::on_connection_state_changed).
    pub fn on_peer_lost(&self, identity: &PeerIdentity) {
        let mut peers = self.peers.lock();

        if peers
            .records
            .get(&identity.id())
            .is_some_and(|r| r.state.is_pending())
        {
            peers.remove(identity.id());
            log::debug!("lost {identity} before connecting");
        }
    }

    /// Answers an invitation according to the accept policy.
    pub fn on_invitation_received(&self, identity: PeerIdentity, responder: InvitationResponder) {
        if identity == self.local {
            responder.accept(false);
            return;
        }

        if self.state_of(&identity) == Some(ConnectionState::Connected) {
            log::debug!("{identity} invited us again while connected");
            responder.accept(true);
            return;
        }

        if !self.policy.should_accept(&identity) {
            log::info!("declined invitation from {identity}");
            responder.accept(false);
            return;
        }

        {
            let mut peers = self.peers.lock();
            let Peers {
                records, deadlines, ..
            } = &mut *peers;

            let record = records
                .entry(identity.id())
                .or_insert_with(|| PeerConnection::new(identity.clone(), ConnectionState::Connecting));

            record.state = ConnectionState::Connecting;
            record.last_activity.reset();

            let deadline = record.last_activity.deadline(self.handshake_timeout);
            deadlines.push(identity.id(), cmp::Reverse(deadline));
        }

        log::debug!("accepted invitation from {identity}");
        responder.accept(true);
    }

    /// Applies a connection state change reported by the transport.
    ///
    /// A peer becoming [`Disconnected`](ConnectionState::Disconnected) is removed, after
    /// the playback sink has dropped its samples.
    pub fn on_connection_state_changed(&self, identity: PeerIdentity, new_state: ConnectionState) {
        if identity == self.local {
            return;
        }

        if new_state == ConnectionState::Disconnected {
            self.playback.on_peer_disconnected(&identity);

            if self.peers.lock().remove(identity.id()).is_some() {
                log::info!("disconnected from {identity}");
            }

            return;
        }

        let mut peers = self.peers.lock();
        let Peers {
            records, deadlines, ..
        } = &mut *peers;

        let record = records
            .entry(identity.id())
            .or_insert_with(|| PeerConnection::new(identity.clone(), new_state));

        let old_state = core::mem::replace(&mut record.state, new_state);
        record.last_activity.reset();

        match new_state {
            ConnectionState::Connected => {
                record.send_failures = 0;
                deadlines.remove(&identity.id());

                if old_state != ConnectionState::Connected {
                    log::info!("connected to {identity}");
                }
            }
            _ => {
                // keep the running deadline of an ongoing handshake
                if deadlines.get(&identity.id()).is_none() {
                    let deadline = record.last_activity.deadline(self.handshake_timeout);
                    deadlines.push(identity.id(), cmp::Reverse(deadline));
                }

                log::debug!("{identity}: {old_state} -> {new_state}");
            }
        }
    }

    /// Encodes `sample` once and sends it to every connected peer.
    ///
    /// Fails only if the sample can't be encoded. Per-peer send failures are logged and
    /// counted in the returned report.
    pub fn broadcast(&self, sample: &AudioSample) -> Result<BroadcastReport> {
        let message = wire::encode_sample(sample.level, sample.sequence, self.wire_version)?;

        let targets: Vec<PeerIdentity> = self
            .peers
            .lock()
            .records
            .values()
            .filter(|r| r.state == ConnectionState::Connected)
            .map(|r| r.identity.clone())
            .collect();

        // no lock held while the transport works
        let results: Vec<_> = targets
            .into_iter()
            .map(|peer| {
                let result = self.transport.send(&message, &peer);
                (peer, result)
            })
            .collect();

        let mut report = BroadcastReport::default();
        let mut exhausted = Vec::new();

        {
            let mut peers = self.peers.lock();
            let Peers { records, stats, .. } = &mut *peers;

            for (peer, result) in results {
                let record = records.get_mut(&peer.id());

                match result {
                    Ok(()) => {
                        report.delivered += 1;

                        if let Some(record) = record {
                            record.send_failures = 0;
                            record.last_activity.reset();
                        }
                    }
                    Err(e) => {
                        report.failed += 1;
                        stats.send_failures += 1;
                        log::warn!("{e}");

                        let Some(record) = record else { continue };
                        record.send_failures = record.send_failures.saturating_add(1);

                        if self.max_send_failures != 0
                            && record.send_failures >= self.max_send_failures
                        {
                            exhausted.push(peer);
                        }
                    }
                }
            }
        }

        for peer in exhausted {
            log::warn!(
                "{peer} failed {} sends in a row, disconnecting",
                self.max_send_failures
            );
            self.transport.disconnect(&peer);
            self.on_connection_state_changed(peer, ConnectionState::Disconnected);
        }

        Ok(report)
    }

    /// Decodes a message received from `from` and forwards it to the playback sink.
    ///
    /// Undecodable messages are dropped and counted, the error is returned for
    /// reporting. Messages from peers we are not connected to are dropped silently.
    pub fn on_message_received(&self, from: &PeerIdentity, bytes: &[u8]) -> Result<()> {
        let decoded = wire::decode_sample(bytes);

        let sequence = {
            let mut peers = self.peers.lock();

            let decoded = match decoded {
                Ok(decoded) => decoded,
                Err(e) => {
                    peers.stats.decode_failures += 1;
                    log::warn!("dropped message from {from}: {e}");
                    return Err(e.into());
                }
            };

            let Some(record) = peers.records.get_mut(&from.id()) else {
                log::debug!("dropped message from unknown peer {from}");
                return Ok(());
            };

            if record.state != ConnectionState::Connected {
                log::debug!("dropped message from {from} while {}", record.state);
                return Ok(());
            }

            record.last_activity.reset();

            let counter = peers.receive_counters.entry(from.id()).or_insert(0);

            let sequence = decoded.sequence.unwrap_or(*counter);
            *counter = (*counter).max(sequence.saturating_add(1));

            (decoded.level, sequence)
        };

        let (level, sequence) = sequence;
        self.playback
            .on_sample_received(AudioSample::new(level, from.clone(), sequence));

        Ok(())
    }

    /// Dispatches one transport event.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerFound(peer) => self.on_peer_discovered(peer),
            TransportEvent::PeerLost(peer) => self.on_peer_lost(&peer),
            TransportEvent::ConnectionChanged(peer, state) => {
                self.on_connection_state_changed(peer, state)
            }
            TransportEvent::InvitationReceived(peer, responder) => {
                self.on_invitation_received(peer, responder)
            }
            TransportEvent::DataReceived(peer, bytes) => {
                // already logged and counted
                let _ = self.on_message_received(&peer, &bytes);
            }
            TransportEvent::StreamReceived(peer) => {
                log::debug!("ignoring stream from {peer}");
            }
        }
    }

    /// Consumes transport events until `shutdown` is set or every event sink is gone,
    /// expiring stale handshakes in between.
    pub fn run(&self, events: &EventSource, shutdown: &AtomicBool) {
        log::debug!("session event loop started");

        while !shutdown.load(Ordering::Acquire) {
            match events.next_timeout(self.poll_interval) {
                Ok(event) => self.handle_event(event),
                Err(NoEvent::Timeout) => (),
                Err(NoEvent::Closed) => {
                    log::debug!("transport event queue closed");
                    break;
                }
            }

            self.expire_stale();
        }

        log::debug!("session event loop exited");
    }

    /// Drops every record stuck in a handshake past its deadline. Returns the dropped
    /// peers.
    #[inline]
    pub fn expire_stale(&self) -> Vec<PeerIdentity> {
        self.expire_stale_at(Instant::now())
    }

    pub fn expire_stale_at(&self, now: Instant) -> Vec<PeerIdentity> {
        let mut expired = Vec::new();

        {
            let mut peers = self.peers.lock();

            while peers
                .deadlines
                .peek()
                .is_some_and(|(_, cmp::Reverse(deadline))| *deadline <= now)
            {
                let Some((id, _)) = peers.deadlines.pop() else {
                    break;
                };

                if let Some(record) = peers.remove(id) {
                    expired.push(record.identity);
                }
            }
        }

        for peer in &expired {
            log::info!("handshake with {peer} timed out");
            self.transport.disconnect(peer);
        }

        expired
    }

    /// Disconnects from every known peer and forgets them.
    pub fn disconnect_all(&self) {
        let records: Vec<_> = {
            let mut peers = self.peers.lock();
            peers.deadlines.clear();
            peers.receive_counters.clear();
            peers.records.drain().map(|(_, r)| r).collect()
        };

        for record in records {
            self.playback.on_peer_disconnected(&record.identity);
            self.transport.disconnect(&record.identity);
            log::info!("disconnected from {}", record.identity);
        }
    }

    /// A snapshot of every known peer.
    pub fn peers(&self) -> Vec<PeerConnection> {
        self.peers.lock().records.values().cloned().collect()
    }

    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.peers
            .lock()
            .records
            .values()
            .filter(|r| r.state == ConnectionState::Connected)
            .map(|r| r.identity.clone())
            .collect()
    }

    pub fn state_of(&self, peer: &PeerIdentity) -> Option<ConnectionState> {
        self.peers.lock().records.get(&peer.id()).map(|r| r.state)
    }

    pub fn stats(&self) -> SessionStats {
        self.peers.lock().stats
    }
}

impl SampleSink for SessionManager {
    fn submit(&self, sample: AudioSample) {
        if let Err(e) = self.broadcast(&sample) {
            log::warn!("dropped captured sample {}: {e}", sample.sequence);
        }
    }
}
