//! Event plumbing between backends and the router.
//!
//! Everything that happens outside the poller thread — host-MIDI callbacks,
//! mDNS browse results, session-driver completions — is marshalled here as
//! an [`Event`] on a single channel. The router drains that channel and
//! dispatches on the poller thread, so no component ever needs a lock
//! around router state.

use crossbeam_channel::{Receiver, Sender};

use crate::port::PeerDescriptor;
use crate::session::DisconnectReason;

/// Stable identifier for a client-role session or one accepted peer
/// session on a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// Stable identifier for a server-role acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub u64);

/// A completion delivered to the router.
///
/// Events from a single source arrive in order; no ordering is promised
/// across sources.
#[derive(Debug, Clone)]
pub enum Event {
    /// An external application attached to a local port.
    Subscribed {
        port: String,
        subscriber: PeerDescriptor,
        name: String,
    },
    /// An external application detached from a local port.
    Unsubscribed {
        port: String,
        subscriber: PeerDescriptor,
    },
    /// Raw MIDI bytes arrived on a local port (one message per buffer).
    MidiIn { port: String, bytes: Vec<u8> },

    /// mDNS found a remote RTP-MIDI service.
    Discovered {
        name: String,
        address: String,
        service: String,
    },
    /// mDNS lost a remote RTP-MIDI service.
    Removed { name: String },

    /// A client-role session finished its handshake.
    SessionConnected { session: SessionId },
    /// An RTP-MIDI command list arrived on a session.
    SessionMidi { session: SessionId, payload: Vec<u8> },
    /// A session ended; the router decides what happens next.
    SessionDisconnected {
        session: SessionId,
        reason: DisconnectReason,
    },
    /// A server acceptor completed a handshake with a new remote peer.
    PeerConnected {
        server: ServerId,
        session: SessionId,
        remote_name: String,
    },
}

/// Cloneable producer handle given to every backend.
///
/// Sends never block; once the daemon is shutting down and the receiver is
/// gone, events are dropped silently.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<Event>,
}

impl EventSender {
    pub fn send(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event dropped, router gone");
        }
    }
}

/// Create the event channel shared by the daemon and its backends.
pub fn channel() -> (EventSender, Receiver<Event>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (EventSender { tx }, rx)
}
