//! The peer transport contract.
//!
//! A transport discovers nearby peers, advertises the local one, and delivers
//! messages reliably, in order, with message boundaries preserved, once a session is
//! established. The runtime never touches sockets or radios: it drives a
//! [`PeerTransport`], and the transport reports back through an [`EventSink`].
//!
//! Every notification a transport can produce is a [`TransportEvent`] variant. All of
//! them go through a single ordered queue, consumed by the
//! [`SessionManager`](crate::session::SessionManager), so that shared state is only
//! ever mutated from one place.

#[cfg(feature = "loopback")]
pub mod loopback;

use core::{fmt, time::Duration};

use crate::{
    error::TransportError,
    proto::{ConnectionState, PeerIdentity},
};

/// Discovery, invitation and delivery, as provided by the underlying mesh.
pub trait PeerTransport: Send + Sync {
    /// Starts advertising the local peer.
    fn advertise(&self) -> Result<(), TransportError>;

    /// Starts looking for other peers. Found peers are reported as
    /// [`TransportEvent::PeerFound`].
    fn browse(&self) -> Result<(), TransportError>;

    /// Invites `peer` to join the local session.
    fn invite(&self, peer: &PeerIdentity) -> Result<(), TransportError>;

    /// Sends one message to one connected peer.
    ///
    /// Returns once the transport has taken the message. Delivery itself is the
    /// transport's responsibility.
    fn send(&self, bytes: &[u8], to: &PeerIdentity) -> Result<(), TransportError>;

    /// Tears down the session with `peer`.
    fn disconnect(&self, peer: &PeerIdentity);

    /// Stops advertising and browsing.
    fn stop(&self);
}

/// The answer to an invitation. Must be used exactly once.
///
/// Dropping a responder without answering declines the invitation.
pub struct InvitationResponder(Option<Box<dyn FnOnce(bool) + Send>>);

impl InvitationResponder {
    #[inline(always)]
    pub fn new(respond: impl FnOnce(bool) + Send + 'static) -> Self {
        Self(Some(Box::new(respond)))
    }

    /// Accepts (`true`) or declines (`false`) the invitation.
    #[inline]
    pub fn accept(mut self, accept: bool) {
        if let Some(respond) = self.0.take() {
            respond(accept)
        }
    }
}

impl Drop for InvitationResponder {
    fn drop(&mut self) {
        if let Some(respond) = self.0.take() {
            respond(false)
        }
    }
}

impl fmt::Debug for InvitationResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InvitationResponder")
            .field(&if self.0.is_some() { "pending" } else { "answered" })
            .finish()
    }
}

/// Everything a transport may report.
#[derive(Debug)]
pub enum TransportEvent {
    /// A peer advertising our service was found.
    PeerFound(PeerIdentity),
    /// A previously found peer stopped advertising.
    PeerLost(PeerIdentity),
    ConnectionChanged(PeerIdentity, ConnectionState),
    InvitationReceived(PeerIdentity, InvitationResponder),
    DataReceived(PeerIdentity, Vec<u8>),
    /// A byte stream was opened by a peer. Streams are not used, these are ignored.
    StreamReceived(PeerIdentity),
}

/// Creates the ordered event queue connecting a transport to a session manager.
pub fn event_queue() -> (EventSink, EventSource) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (EventSink(tx), EventSource(rx))
}

/// The producing end of the event queue. Cheap to clone, usable from any thread.
#[derive(Debug, Clone)]
pub struct EventSink(crossbeam_channel::Sender<TransportEvent>);

impl EventSink {
    /// Queues an event.
    ///
    /// Returns `false` if the consuming end is gone, in which case the event is
    /// discarded.
    #[inline]
    pub fn push(&self, event: TransportEvent) -> bool {
        self.0.send(event).is_ok()
    }
}

/// Why [`EventSource::next_timeout`] returned without an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoEvent {
    Timeout,
    /// Every [`EventSink`] has been dropped.
    Closed,
}

/// The consuming end of the event queue.
#[derive(Debug)]
pub struct EventSource(crossbeam_channel::Receiver<TransportEvent>);

impl EventSource {
    /// Waits at most `timeout` for the next event.
    #[inline]
    pub fn next_timeout(&self, timeout: Duration) -> Result<TransportEvent, NoEvent> {
        self.0.recv_timeout(timeout).map_err(|e| match e {
            crossbeam_channel::RecvTimeoutError::Timeout => NoEvent::Timeout,
            crossbeam_channel::RecvTimeoutError::Disconnected => NoEvent::Closed,
        })
    }

    /// Returns the next event if one is already queued.
    #[inline]
    pub fn try_next(&self) -> Option<TransportEvent> {
        self.0.try_recv().ok()
    }
}
