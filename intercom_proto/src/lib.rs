#![cfg_attr(not(test), no_std)]
//! Data model and wire format for a local-mesh voice intercom.
//!
//! This crate describes *what* peers exchange, not how the bytes travel. Discovery,
//! invitations and reliable delivery are provided by a peer transport elsewhere; once
//! a session is established, peers exchange a stream of tiny audio messages, each
//! carrying a single level value sampled on a fixed cadence.
//!
//! ## Identities
//!
//! Every device is represented by a [`PeerIdentity`]: an opaque, unique id assigned
//! by the transport, plus a human-readable display name. Identities are immutable
//! once assigned. Two identities are the same peer if, and only if, their ids match.
//!
//! ## Connections
//!
//! The lifecycle of a remote peer, as seen locally, is described by
//! [`ConnectionState`]. Only [`ConnectionState::Connected`] peers may exchange audio.
//!
//! ## Audio
//!
//! An [`AudioSample`] is one level reading, tagged with its source peer and a
//! per-source sequence number. Only the level (and, in the framed form, the sequence
//! number) goes on the wire: the source is derived from the transport's sender
//! metadata. See the [`wire`] module for the exact encodings.

extern crate alloc;

pub mod wire;

use alloc::string::String;
use core::{fmt, hash};
use serde::{Deserialize, Serialize};

/// The level value carried by each audio message.
///
/// Its range is defined by the capture device (commonly a normalized power or
/// amplitude). The protocol treats it as an opaque 4-byte payload.
pub type Level = f32;

/// The level used to represent silence.
pub const SILENCE: Level = 0.;

/// A peer's identity: an opaque unique id and a display name.
///
/// Equality and hashing only consider the [`id`](Self::id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    id: u64,
    display_name: String,
}

impl PeerIdentity {
    #[inline(always)]
    pub fn new(id: u64, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }

    #[inline(always)]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl PartialEq for PeerIdentity {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerIdentity {}

impl hash::Hash for PeerIdentity {
    #[inline(always)]
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:016x})", self.display_name, self.id)
    }
}

/// Connection lifecycle of a remote peer.
///
/// `Discovering` and `Connecting` are transient. `Connected` is the only state in
/// which audio may be exchanged. `Disconnected` is terminal: a peer that comes back
/// starts over with a fresh record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// The peer has been seen, and we have invited it.
    Discovering,
    /// An invitation was accepted, and the transport is establishing the session.
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    /// Returns whether this is one of the handshake states.
    #[inline(always)]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Discovering | Self::Connecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discovering => "discovering",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        })
    }
}

/// A single audio level reading from a given source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSample {
    pub level: Level,
    pub source_peer: PeerIdentity,
    /// Monotonically increasing, per source.
    pub sequence: u64,
}

impl AudioSample {
    #[inline(always)]
    pub const fn new(level: Level, source_peer: PeerIdentity, sequence: u64) -> Self {
        Self {
            level,
            source_peer,
            sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_equality_ignores_display_name() {
        let a = PeerIdentity::new(7, "kitchen");
        let b = PeerIdentity::new(7, "renamed");
        let c = PeerIdentity::new(8, "kitchen");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn pending_states() {
        assert!(ConnectionState::Discovering.is_pending());
        assert!(ConnectionState::Connecting.is_pending());
        assert!(!ConnectionState::Connected.is_pending());
        assert!(!ConnectionState::Disconnected.is_pending());
    }
}
