//! An in-process mesh, for tests and demos.
//!
//! Every [`LoopbackTransport`] joined to the same [`LoopbackMesh`] behaves like a
//! nearby device: advertising peers are found by browsing peers of the same service
//! type, invitations are delivered to the invitee's event queue, and accepted ones
//! connect both ends. Messages are delivered in order, one event per `send`.
//!
//! The mesh can also sever links and make sends fail, to simulate a flaky radio.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{EventSink, InvitationResponder, PeerTransport, TransportEvent};
use crate::{
    error::TransportError,
    proto::{ConnectionState, PeerIdentity},
};

/// Events to push once the mesh lock is released.
///
/// Pushing may drop an event (and so answer an [`InvitationResponder`], which locks the
/// mesh) when its queue is gone.
type Outbox = Vec<(EventSink, TransportEvent)>;

#[inline]
fn deliver(outbox: Outbox) {
    for (sink, event) in outbox {
        sink.push(event);
    }
}

/// An unordered pair of peer ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Link(u64, u64);

impl Link {
    #[inline(always)]
    fn new(a: u64, b: u64) -> Self {
        Self(a.min(b), a.max(b))
    }

    #[inline(always)]
    fn other(self, id: u64) -> Option<u64> {
        match self {
            Self(a, b) if a == id => Some(b),
            Self(a, b) if b == id => Some(a),
            _ => None,
        }
    }
}

struct Node {
    identity: PeerIdentity,
    service_type: String,
    events: EventSink,
    advertising: bool,
    browsing: bool,
}

#[derive(Default)]
struct MeshState {
    nodes: FxHashMap<u64, Node>,
    links: FxHashSet<Link>,
    /// `(from, to)` pairs whose sends fail.
    failing: FxHashSet<(u64, u64)>,
}

impl MeshState {
    fn event_to(&self, id: u64, event: TransportEvent, outbox: &mut Outbox) {
        if let Some(node) = self.nodes.get(&id) {
            outbox.push((node.events.clone(), event));
        }
    }

    /// Other nodes of `id`'s service type matching `filter`.
    fn neighbours(&self, id: u64, filter: impl Fn(&Node) -> bool) -> Vec<&Node> {
        let Some(me) = self.nodes.get(&id) else {
            return Vec::new();
        };

        self.nodes
            .values()
            .filter(|n| n.identity.id() != id && n.service_type == me.service_type && filter(n))
            .collect()
    }

    fn unlink(&mut self, a: &PeerIdentity, b: &PeerIdentity, outbox: &mut Outbox) -> bool {
        if !self.links.remove(&Link::new(a.id(), b.id())) {
            return false;
        }

        self.event_to(
            a.id(),
            TransportEvent::ConnectionChanged(b.clone(), ConnectionState::Disconnected),
            outbox,
        );
        self.event_to(
            b.id(),
            TransportEvent::ConnectionChanged(a.clone(), ConnectionState::Disconnected),
            outbox,
        );

        true
    }

    fn answer(&mut self, inviter: &PeerIdentity, invitee: &PeerIdentity, accept: bool) -> Outbox {
        let mut outbox = Outbox::new();

        if !self.nodes.contains_key(&inviter.id()) || !self.nodes.contains_key(&invitee.id()) {
            return outbox;
        }

        if !accept {
            if !self.links.contains(&Link::new(inviter.id(), invitee.id())) {
                self.event_to(
                    inviter.id(),
                    TransportEvent::ConnectionChanged(
                        invitee.clone(),
                        ConnectionState::Disconnected,
                    ),
                    &mut outbox,
                );
            }
            return outbox;
        }

        if self.links.insert(Link::new(inviter.id(), invitee.id())) {
            self.event_to(
                inviter.id(),
                TransportEvent::ConnectionChanged(invitee.clone(), ConnectionState::Connected),
                &mut outbox,
            );
            self.event_to(
                invitee.id(),
                TransportEvent::ConnectionChanged(inviter.clone(), ConnectionState::Connected),
                &mut outbox,
            );
        }

        outbox
    }
}

/// A shared in-process mesh. Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackMesh {
    state: Arc<Mutex<MeshState>>,
}

impl LoopbackMesh {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device to the mesh. Its transport events are pushed into `events`.
    ///
    /// A device already present under the same id is replaced.
    pub fn join(
        &self,
        identity: PeerIdentity,
        service_type: impl Into<String>,
        events: EventSink,
    ) -> LoopbackTransport {
        let node = Node {
            identity: identity.clone(),
            service_type: service_type.into(),
            events,
            advertising: false,
            browsing: false,
        };

        if self.state.lock().nodes.insert(identity.id(), node).is_some() {
            log::warn!("{identity} joined the loopback mesh twice");
        }

        LoopbackTransport {
            mesh: self.clone(),
            local: identity,
        }
    }

    pub fn is_linked(&self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        self.state.lock().links.contains(&Link::new(a.id(), b.id()))
    }

    /// Drops the session between `a` and `b`, as a lost radio link would. Both ends
    /// are notified. Returns whether they were connected.
    pub fn sever(&self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        let mut outbox = Outbox::new();
        let severed = self.state.lock().unlink(a, b, &mut outbox);
        deliver(outbox);
        severed
    }

    /// Makes every send from `from` to `to` fail, or succeed again.
    pub fn fail_sends(&self, from: &PeerIdentity, to: &PeerIdentity, fail: bool) {
        let mut state = self.state.lock();
        let pair = (from.id(), to.id());

        if fail {
            state.failing.insert(pair);
        } else {
            state.failing.remove(&pair);
        }
    }

    /// Delivers raw bytes from `from` to `to` over their session, bypassing the
    /// sender's transport. Returns whether they are connected.
    pub fn inject(&self, from: &PeerIdentity, to: &PeerIdentity, bytes: Vec<u8>) -> bool {
        let mut outbox = Outbox::new();

        {
            let state = self.state.lock();

            if !state.links.contains(&Link::new(from.id(), to.id())) {
                return false;
            }

            state.event_to(
                to.id(),
                TransportEvent::DataReceived(from.clone(), bytes),
                &mut outbox,
            );
        }

        deliver(outbox);
        true
    }

    fn weak(&self) -> Weak<Mutex<MeshState>> {
        Arc::downgrade(&self.state)
    }
}

/// One device's view of a [`LoopbackMesh`]. Leaves the mesh when dropped.
pub struct LoopbackTransport {
    mesh: LoopbackMesh,
    local: PeerIdentity,
}

impl LoopbackTransport {
    #[inline(always)]
    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    #[inline(always)]
    pub fn mesh(&self) -> &LoopbackMesh {
        &self.mesh
    }
}

impl PeerTransport for LoopbackTransport {
    fn advertise(&self) -> Result<(), TransportError> {
        let mut outbox = Outbox::new();

        {
            let mut state = self.mesh.state.lock();
            let id = self.local.id();

            let node = state
                .nodes
                .get_mut(&id)
                .ok_or_else(|| TransportError::Session("left the mesh".into()))?;

            if core::mem::replace(&mut node.advertising, true) {
                return Ok(());
            }

            for browser in state.neighbours(id, |n| n.browsing) {
                outbox.push((
                    browser.events.clone(),
                    TransportEvent::PeerFound(self.local.clone()),
                ));
            }
        }

        deliver(outbox);
        Ok(())
    }

    fn browse(&self) -> Result<(), TransportError> {
        let mut outbox = Outbox::new();

        {
            let mut state = self.mesh.state.lock();
            let id = self.local.id();

            let node = state
                .nodes
                .get_mut(&id)
                .ok_or_else(|| TransportError::Session("left the mesh".into()))?;

            if core::mem::replace(&mut node.browsing, true) {
                return Ok(());
            }

            let events = node.events.clone();

            for advertiser in state.neighbours(id, |n| n.advertising) {
                outbox.push((
                    events.clone(),
                    TransportEvent::PeerFound(advertiser.identity.clone()),
                ));
            }
        }

        deliver(outbox);
        Ok(())
    }

    fn invite(&self, peer: &PeerIdentity) -> Result<(), TransportError> {
        let mut outbox = Outbox::new();

        {
            let state = self.mesh.state.lock();

            let reachable = state
                .nodes
                .get(&peer.id())
                .is_some_and(|n| n.advertising);

            if !reachable {
                return Err(TransportError::Session(format!("{peer} is not reachable")));
            }

            let mesh = self.mesh.weak();
            let inviter = self.local.clone();
            let invitee = peer.clone();

            let responder = InvitationResponder::new(move |accept| {
                let Some(mesh) = mesh.upgrade() else {
                    return;
                };
                let outbox = mesh.lock().answer(&inviter, &invitee, accept);
                deliver(outbox);
            });

            state.event_to(
                self.local.id(),
                TransportEvent::ConnectionChanged(peer.clone(), ConnectionState::Connecting),
                &mut outbox,
            );
            state.event_to(
                peer.id(),
                TransportEvent::InvitationReceived(self.local.clone(), responder),
                &mut outbox,
            );
        }

        deliver(outbox);
        Ok(())
    }

    fn send(&self, bytes: &[u8], to: &PeerIdentity) -> Result<(), TransportError> {
        let mut outbox = Outbox::new();

        {
            let state = self.mesh.state.lock();

            if !state.links.contains(&Link::new(self.local.id(), to.id())) {
                return Err(TransportError::NotConnected(to.clone()));
            }

            if state.failing.contains(&(self.local.id(), to.id())) {
                return Err(TransportError::SendFailed {
                    peer: to.clone(),
                    reason: "simulated link failure".into(),
                });
            }

            state.event_to(
                to.id(),
                TransportEvent::DataReceived(self.local.clone(), bytes.to_vec()),
                &mut outbox,
            );
        }

        deliver(outbox);
        Ok(())
    }

    fn disconnect(&self, peer: &PeerIdentity) {
        self.mesh.sever(&self.local, peer);
    }

    fn stop(&self) {
        let mut outbox = Outbox::new();

        {
            let mut state = self.mesh.state.lock();
            let id = self.local.id();

            let Some(node) = state.nodes.get_mut(&id) else {
                return;
            };

            node.browsing = false;

            if !core::mem::replace(&mut node.advertising, false) {
                return;
            }

            for browser in state.neighbours(id, |n| n.browsing) {
                outbox.push((
                    browser.events.clone(),
                    TransportEvent::PeerLost(self.local.clone()),
                ));
            }
        }

        deliver(outbox);
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.stop();

        let mut outbox = Outbox::new();

        {
            let mut state = self.mesh.state.lock();
            let id = self.local.id();

            let peers: Vec<_> = state
                .links
                .iter()
                .filter_map(|link| link.other(id))
                .filter_map(|other| state.nodes.get(&other))
                .map(|node| node.identity.clone())
                .collect();

            for peer in peers {
                state.unlink(&self.local, &peer, &mut outbox);
            }

            state.nodes.remove(&id);
            state.failing.retain(|&(from, to)| from != id && to != id);
        }

        deliver(outbox);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{EventSource, event_queue};

    fn peer(id: u64) -> PeerIdentity {
        PeerIdentity::new(id, format!("peer-{id}"))
    }

    fn node(mesh: &LoopbackMesh, id: u64) -> (LoopbackTransport, EventSource) {
        let (sink, source) = event_queue();
        (mesh.join(peer(id), "test", sink), source)
    }

    fn drain(source: &EventSource) -> Vec<TransportEvent> {
        core::iter::from_fn(|| source.try_next()).collect()
    }

    /// Connects `a` to `b`, leaving both queues empty.
    fn connected_pair(mesh: &LoopbackMesh) -> [(LoopbackTransport, EventSource); 2] {
        let (a, a_events) = node(mesh, 1);
        let (b, b_events) = node(mesh, 2);

        b.advertise().unwrap();
        a.invite(&peer(2)).unwrap();

        for event in drain(&b_events) {
            if let TransportEvent::InvitationReceived(_, responder) = event {
                responder.accept(true);
            }
        }

        drain(&a_events);
        drain(&b_events);

        [(a, a_events), (b, b_events)]
    }

    #[test]
    fn browsing_finds_advertisers_both_ways() {
        let mesh = LoopbackMesh::new();
        let (a, a_events) = node(&mesh, 1);
        let (b, b_events) = node(&mesh, 2);

        // different service, never found
        let (c, _c_events) = {
            let (sink, source) = event_queue();
            (mesh.join(peer(3), "other", sink), source)
        };
        c.advertise().unwrap();

        a.advertise().unwrap();
        b.browse().unwrap();
        b.advertise().unwrap();
        a.browse().unwrap();

        let found = |events: Vec<TransportEvent>| -> Vec<u64> {
            events
                .into_iter()
                .filter_map(|e| match e {
                    TransportEvent::PeerFound(p) => Some(p.id()),
                    _ => None,
                })
                .collect()
        };

        assert_eq!(found(drain(&a_events)), [2]);
        assert_eq!(found(drain(&b_events)), [1]);
    }

    #[test]
    fn accepted_invitation_connects_both_ends() {
        let mesh = LoopbackMesh::new();
        let (a, a_events) = node(&mesh, 1);
        let (b, b_events) = node(&mesh, 2);

        assert!(a.invite(&peer(2)).is_err());

        b.advertise().unwrap();
        a.invite(&peer(2)).unwrap();

        let Some(TransportEvent::InvitationReceived(from, responder)) = b_events.try_next() else {
            panic!("no invitation");
        };
        assert_eq!(from, peer(1));
        responder.accept(true);

        assert!(mesh.is_linked(&peer(1), &peer(2)));

        let states = |events: Vec<TransportEvent>| -> Vec<ConnectionState> {
            events
                .into_iter()
                .filter_map(|e| match e {
                    TransportEvent::ConnectionChanged(_, s) => Some(s),
                    _ => None,
                })
                .collect()
        };

        assert_eq!(
            states(drain(&a_events)),
            [ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(states(drain(&b_events)), [ConnectionState::Connected]);
    }

    #[test]
    fn declined_invitation_reports_disconnected() {
        let mesh = LoopbackMesh::new();
        let (a, a_events) = node(&mesh, 1);
        let (b, b_events) = node(&mesh, 2);

        b.advertise().unwrap();
        a.invite(&peer(2)).unwrap();

        // dropped unanswered
        drop(drain(&b_events));

        assert!(!mesh.is_linked(&peer(1), &peer(2)));
        assert!(matches!(
            drain(&a_events).last(),
            Some(TransportEvent::ConnectionChanged(_, ConnectionState::Disconnected))
        ));
    }

    #[test]
    fn sends_arrive_in_order() {
        let mesh = LoopbackMesh::new();
        let [(a, _), (_b, b_events)] = connected_pair(&mesh);

        for byte in 0..5u8 {
            a.send(&[byte], &peer(2)).unwrap();
        }

        let received: Vec<_> = drain(&b_events)
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::DataReceived(from, bytes) if from == peer(1) => Some(bytes[0]),
                _ => None,
            })
            .collect();

        assert_eq!(received, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn sends_fail_when_asked_or_unlinked() {
        let mesh = LoopbackMesh::new();
        let [(a, _), (_b, _)] = connected_pair(&mesh);

        mesh.fail_sends(&peer(1), &peer(2), true);
        assert!(matches!(
            a.send(&[0], &peer(2)),
            Err(TransportError::SendFailed { .. })
        ));

        mesh.fail_sends(&peer(1), &peer(2), false);
        assert!(a.send(&[0], &peer(2)).is_ok());

        assert!(mesh.sever(&peer(1), &peer(2)));
        assert_eq!(
            a.send(&[0], &peer(2)),
            Err(TransportError::NotConnected(peer(2)))
        );
    }

    #[test]
    fn leaving_disconnects_and_unadvertises() {
        let mesh = LoopbackMesh::new();
        let [(a, a_events), (b, _)] = connected_pair(&mesh);

        a.browse().unwrap();
        drain(&a_events);

        drop(b);

        let events = drain(&a_events);
        assert!(events.iter().any(|e| matches!(e, TransportEvent::PeerLost(p) if *p == peer(2))));
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::ConnectionChanged(p, ConnectionState::Disconnected) if *p == peer(2)
        )));
        assert!(!mesh.is_linked(&peer(1), &peer(2)));
    }
}
