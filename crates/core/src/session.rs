//! Typed façade over the RTP-MIDI session library.
//!
//! The AppleMIDI handshake, recovery journal and UDP plumbing live in a
//! driver crate behind [`SessionBackend`]; this module owns the shapes the
//! router works with:
//!
//! - [`ClientSession`] — initiator role, one per outbound remote. Created
//!   lazily when the first local subscriber needs the remote, torn down
//!   when the last one detaches.
//! - [`ServerSession`] — acceptor role, bound to a UDP control port and
//!   announced over mDNS.
//!
//! Drivers report completions through the daemon event channel:
//! [`Event::SessionConnected`], [`Event::SessionMidi`],
//! [`Event::SessionDisconnected`] and [`Event::PeerConnected`]
//! (see [`crate::event`]). All payloads are opaque byte buffers; the codec
//! sits above this seam.

pub mod loopback;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::event::{EventSender, ServerId, SessionId};
use crate::poller::TimerHandle;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);
static SERVER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Allocate a process-unique session id. Used for client sessions and for
/// peers accepted by a server acceptor.
pub fn next_session_id() -> SessionId {
    SessionId(SESSION_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Allocate a process-unique server id.
pub fn next_server_id() -> ServerId {
    ServerId(SERVER_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Why a session ended, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The control handshake could not be started (network unreachable,
    /// port closed).
    CantConnect,
    /// The remote side closed an established session.
    PeerDisconnected,
    /// The remote refused the session invitation.
    ConnectionRejected,
    /// Clean local shutdown.
    Disconnect,
    /// The invitation timed out; the driver keeps retrying.
    ConnectTimeout,
    /// Clock-synchronisation timed out during the handshake; the driver
    /// keeps retrying.
    CkTimeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::CantConnect => "can't connect",
            Self::PeerDisconnected => "peer disconnected",
            Self::ConnectionRejected => "connection rejected",
            Self::Disconnect => "disconnect",
            Self::ConnectTimeout => "connection timeout",
            Self::CkTimeout => "CK timeout",
        };
        f.write_str(text)
    }
}

/// Handshake state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
}

/// Driver half of an initiator session.
pub trait ClientDriver {
    fn connect_to(&mut self, address: &str, service: &str);
    fn send_midi(&mut self, payload: &[u8]);
}

/// Driver half of an acceptor bound to a UDP control port.
pub trait ServerDriver {
    fn control_port(&self) -> u16;
    fn send_midi_to_all_peers(&mut self, payload: &[u8]);
    fn send_midi_to(&mut self, peer: SessionId, payload: &[u8]);
}

/// The RTP-MIDI protocol library. Constructs driver objects that report
/// back through the daemon event channel under the ids given here.
pub trait SessionBackend {
    fn client(&mut self, name: &str, session: SessionId, events: EventSender)
        -> Box<dyn ClientDriver>;

    /// `service` may be empty to let the OS pick the control port.
    fn server(
        &mut self,
        name: &str,
        service: &str,
        server: ServerId,
        events: EventSender,
    ) -> Result<Box<dyn ServerDriver>>;
}

/// An initiator session to one remote.
pub struct ClientSession {
    id: SessionId,
    pub status: SessionStatus,
    /// Pending failover retry; dropping the handle cancels it.
    pub connect_timer: Option<TimerHandle>,
    driver: Box<dyn ClientDriver>,
}

impl ClientSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    pub fn connect_to(&mut self, address: &str, service: &str) {
        tracing::debug!(session = self.id.0, address, service, "connecting");
        self.driver.connect_to(address, service);
    }

    pub fn send_midi(&mut self, payload: &[u8]) {
        self.driver.send_midi(payload);
    }

    /// Called by the router when the driver reports the handshake done.
    pub fn mark_connected(&mut self) {
        self.status = SessionStatus::Connected;
        self.connect_timer = None;
    }
}

/// An acceptor session bound to a control port.
///
/// Peer membership lives in the driver (which owns the handshakes) and in
/// the router's session table; this wrapper only carries identity and the
/// send paths.
pub struct ServerSession {
    id: ServerId,
    name: String,
    driver: Box<dyn ServerDriver>,
}

impl ServerSession {
    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The UDP control port actually bound (relevant when the OS picked it).
    pub fn control_port(&self) -> u16 {
        self.driver.control_port()
    }

    pub fn send_midi_to_all_peers(&mut self, payload: &[u8]) {
        self.driver.send_midi_to_all_peers(payload);
    }

    pub fn send_midi_to(&mut self, peer: SessionId, payload: &[u8]) {
        self.driver.send_midi_to(peer, payload);
    }
}

/// Factory wrapper owning the driver library and the event sender handed
/// to every driver object it creates.
pub struct SessionLayer {
    backend: Box<dyn SessionBackend>,
    events: EventSender,
}

impl SessionLayer {
    pub fn new(backend: Box<dyn SessionBackend>, events: EventSender) -> Self {
        SessionLayer { backend, events }
    }

    /// Create a client session in the `Connecting` state. No network
    /// activity happens until [`ClientSession::connect_to`].
    pub fn open_client(&mut self, name: &str) -> ClientSession {
        let id = next_session_id();
        let driver = self.backend.client(name, id, self.events.clone());
        tracing::debug!(session = id.0, name, "client session created");
        ClientSession {
            id,
            status: SessionStatus::Connecting,
            connect_timer: None,
            driver,
        }
    }

    /// Bind an acceptor. An empty `service` lets the OS pick the port.
    pub fn open_server(&mut self, name: &str, service: &str) -> Result<ServerSession> {
        let id = next_server_id();
        let driver = self.backend.server(name, service, id, self.events.clone())?;
        tracing::info!(
            server = id.0,
            name,
            control_port = driver.control_port(),
            "server session bound"
        );
        Ok(ServerSession {
            id,
            name: name.to_string(),
            driver,
        })
    }
}
