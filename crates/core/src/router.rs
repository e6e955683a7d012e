//! Router and peer lifecycle management.
//!
//! The router owns every peer record and coordinates all transitions. It
//! reacts to three event sources — the local port registry, discovery, and
//! the session layer — and never polls. Peers live in a table keyed by
//! stable id; handlers and timers capture ids or names, re-look-up their
//! target when they run, and tolerate absence. Anything that would tear a
//! peer down from inside one of its own handlers is deferred to the next
//! poll tick.
//!
//! Routing itself is a walk of the [`PeerGraph`]: when a peer emits a
//! message, the router delivers it along that peer's outgoing edges.
//!
//! ```text
//!  local app ⇄ LocalPort ⇄ KnownClient ──▶ remote server     (outbound)
//!  remote client ──▶ import server ⇄ LocalPort ⇄ local app   (inbound)
//!  local app ⇄ "Network" port ⇄ export server ──▶ remote     (export)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::codec::{self, Decoder, MidiMessage};
use crate::config::{Config, RemoteSpec};
use crate::discovery::{Discovery, DiscoveryBackend};
use crate::error::Result;
use crate::event::{Event, EventSender, ServerId, SessionId};
use crate::graph::{PeerGraph, PeerId};
use crate::poller::Poller;
use crate::port::{MidiBackend, PeerDescriptor, PortRegistry};
use crate::session::{
    ClientSession, DisconnectReason, ServerSession, SessionBackend, SessionLayer, SessionStatus,
};

/// Name of the local port through which applications export MIDI sources
/// to the network.
pub const NETWORK_PORT: &str = "Network";

/// Delay before a failed connect moves on to the next address.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Connect attempts allowed per known address before a client is removed.
const MAX_ATTEMPTS_PER_ADDRESS: u32 = 3;

/// One way of reaching a remote. Several may coexist for the same logical
/// remote (IPv4 + IPv6, multiple interfaces).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddress {
    pub address: String,
    pub service: String,
}

/// Outbound session record for one remote name.
///
/// Created when the remote becomes known (statically or via discovery);
/// its session is opened lazily when the first local subscriber attaches
/// and dropped when the last one detaches.
pub struct KnownClient {
    pub name: String,
    pub addresses: Vec<RemoteAddress>,
    pub addr_idx: usize,
    /// Local subscribers currently requiring this session to be alive.
    pub use_count: u16,
    /// Subscribers that arrived while the connect was still in flight;
    /// folded into `use_count` once the session is established.
    pending_subscribers: u16,
    pub connect_attempts: u32,
    pub session: Option<ClientSession>,
    dropped_midi_logged: bool,
}

impl KnownClient {
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }
}

/// Inbound session record: one remote peer landed on a local port.
pub struct KnownServerConnection {
    pub remote_name: String,
    pub session: SessionId,
    pub server: ServerId,
}

/// Server created for one application exported through `"Network"`.
struct ExportServer {
    name: String,
    server: ServerSession,
    subscribers: Vec<PeerDescriptor>,
}

/// Tagged peer record; the router matches on the tag where the original
/// design would downcast.
enum Peer {
    LocalPort { name: String },
    Client(KnownClient),
    ServerConnection(KnownServerConnection),
    Export(ExportServer),
}

/// The peer manager. All state is owned here and mutated only on the
/// poller thread; no locks by design.
pub struct Router {
    name: String,
    ports: PortRegistry,
    sessions: SessionLayer,
    discovery: Discovery,
    decoder: Decoder,

    peers: HashMap<PeerId, Peer>,
    graph: PeerGraph,
    next_peer_id: u64,

    port_peers: HashMap<String, PeerId>,
    clients_by_name: HashMap<String, PeerId>,
    conns_by_port: HashMap<String, PeerId>,
    exports_by_name: HashMap<String, PeerId>,
    export_by_subscriber: HashMap<PeerDescriptor, String>,
    session_peers: HashMap<SessionId, PeerId>,

    import_servers: Vec<ServerSession>,
}

impl Router {
    /// Build the router and perform startup: the `"Network"` port, one
    /// announced import server per configured listen port, and one known
    /// client per configured remote. Configuration errors are fatal.
    pub fn new(
        config: &Config,
        midi: Box<dyn MidiBackend>,
        rtp: Box<dyn SessionBackend>,
        mdns: Box<dyn DiscoveryBackend>,
        events: EventSender,
    ) -> Result<Router> {
        let mut router = Router {
            name: config.name.clone(),
            ports: PortRegistry::new(midi),
            sessions: SessionLayer::new(rtp, events),
            discovery: Discovery::new(mdns),
            decoder: Decoder::new(),
            peers: HashMap::new(),
            graph: PeerGraph::new(),
            next_peer_id: 0,
            port_peers: HashMap::new(),
            clients_by_name: HashMap::new(),
            conns_by_port: HashMap::new(),
            exports_by_name: HashMap::new(),
            export_by_subscriber: HashMap::new(),
            session_peers: HashMap::new(),
            import_servers: Vec::new(),
        };

        router.ensure_port(NETWORK_PORT)?;

        for service in &config.ports {
            let server = router.sessions.open_server(&config.name, service)?;
            router.discovery.announce(&config.name, server.control_port());
            router.import_servers.push(server);
        }

        for spec in &config.connect_to {
            let remote = RemoteSpec::parse(spec)?;
            tracing::info!(spec = %spec, "adding configured remote");
            router.add_remote(&remote.name, &remote.address, &remote.service);
        }

        Ok(router)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn client(&self, name: &str) -> Option<&KnownClient> {
        let id = self.clients_by_name.get(name)?;
        match self.peers.get(id) {
            Some(Peer::Client(client)) => Some(client),
            _ => None,
        }
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.exports_by_name.contains_key(name)
    }

    pub fn inbound_connection(&self, port: &str) -> Option<&KnownServerConnection> {
        let id = self.conns_by_port.get(port)?;
        match self.peers.get(id) {
            Some(Peer::ServerConnection(conn)) => Some(conn),
            _ => None,
        }
    }

    fn alloc_peer(&mut self, peer: Peer) -> PeerId {
        self.next_peer_id += 1;
        let id = PeerId(self.next_peer_id);
        self.peers.insert(id, peer);
        id
    }

    /// Open a local port if it does not exist yet; either way return its
    /// peer id.
    fn ensure_port(&mut self, name: &str) -> Result<PeerId> {
        if let Some(&id) = self.port_peers.get(name) {
            return Ok(id);
        }
        self.ports.create_port(name)?;
        let id = self.alloc_peer(Peer::LocalPort { name: name.to_string() });
        self.port_peers.insert(name.to_string(), id);
        Ok(id)
    }

    /// Close a local port and forget its peer.
    fn remove_port_peer(&mut self, name: &str) {
        if let Some(id) = self.port_peers.remove(name) {
            self.graph.remove_peer(id);
            self.peers.remove(&id);
        }
        self.ports.remove_port(name);
    }

    /// Register a remote; static config and discovery both land here.
    ///
    /// A known name only collects the new address; a new name gets a local
    /// port and a client record. No network activity happens here —
    /// connection is lazy, driven by the first subscriber.
    pub fn add_remote(&mut self, name: &str, address: &str, service: &str) {
        let addr = RemoteAddress {
            address: address.to_string(),
            service: service.to_string(),
        };

        if let Some(&id) = self.clients_by_name.get(name) {
            if let Some(Peer::Client(client)) = self.peers.get_mut(&id) {
                if !client.addresses.contains(&addr) {
                    tracing::debug!(
                        remote = name,
                        address,
                        service,
                        total = client.addresses.len() + 1,
                        "new address for known remote"
                    );
                    client.addresses.push(addr);
                }
            }
            return;
        }

        let port_peer = match self.ensure_port(name) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(remote = name, error = %e, "cannot open local port for remote");
                return;
            }
        };

        tracing::info!(remote = name, address, service, "new remote known");
        let id = self.alloc_peer(Peer::Client(KnownClient {
            name: name.to_string(),
            addresses: vec![addr],
            addr_idx: 0,
            use_count: 0,
            pending_subscribers: 0,
            connect_attempts: 0,
            session: None,
            dropped_midi_logged: false,
        }));
        self.clients_by_name.insert(name.to_string(), id);
        self.graph.add_edge(port_peer, id);
        self.graph.add_edge(id, port_peer);
    }

    /// Schedule removal of a known client. Always deferred so it cannot
    /// happen inside an event dispatch originating from the same object.
    pub fn remove_client(&mut self, name: &str, poller: &mut Poller<Router>) {
        let name = name.to_string();
        poller.call_later(move |router: &mut Router, _| {
            let Some(id) = router.clients_by_name.remove(&name) else {
                tracing::debug!(remote = %name, "client already removed");
                return;
            };
            tracing::info!(remote = %name, "removing client");
            if let Some(Peer::Client(client)) = router.peers.remove(&id) {
                if let Some(session) = client.session {
                    router.session_peers.remove(&session.id());
                }
            }
            router.graph.remove_peer(id);
            router.remove_port_peer(&name);
        });
    }

    /// Dispatch one marshalled event. Runs to completion; deferred work
    /// queued here executes after this returns.
    pub fn handle_event(&mut self, poller: &mut Poller<Router>, event: Event) {
        match event {
            Event::Subscribed { port, subscriber, name } => {
                let _ = self.ports.record_subscribe(&port, subscriber.clone());
                if port == NETWORK_PORT {
                    self.network_subscribe(subscriber, &name);
                } else if self.clients_by_name.contains_key(&port) {
                    self.connect_client(&port, &name);
                } else {
                    tracing::debug!(port = %port, "subscriber on passive port");
                }
            }
            Event::Unsubscribed { port, subscriber } => {
                self.ports.record_unsubscribe(&port, &subscriber);
                if port == NETWORK_PORT {
                    self.network_unsubscribe(&subscriber, poller);
                } else if self.clients_by_name.contains_key(&port) {
                    self.client_unsubscribed(&port, poller);
                }
            }
            Event::MidiIn { port, bytes } => self.local_midi(&port, &bytes),
            Event::Discovered { name, address, service } => {
                tracing::debug!(name = %name, address = %address, service = %service, "service discovered");
                self.add_remote(&name, &address, &service);
            }
            Event::Removed { name } => {
                tracing::debug!(name = %name, "service removed");
                if self.clients_by_name.contains_key(&name) {
                    self.remove_client(&name, poller);
                }
            }
            Event::SessionConnected { session } => self.session_connected(session),
            Event::SessionMidi { session, payload } => self.session_midi(session, &payload),
            Event::SessionDisconnected { session, reason } => {
                self.session_disconnected(session, reason, poller)
            }
            Event::PeerConnected { server, session, remote_name } => {
                self.peer_connected(server, session, &remote_name)
            }
        }
    }

    // ---- local side ------------------------------------------------------

    /// A subscriber attached to a known client's port: connect lazily.
    /// The session announces itself under the subscriber's name.
    fn connect_client(&mut self, port_name: &str, subscriber_name: &str) {
        let Some(&peer_id) = self.clients_by_name.get(port_name) else { return };
        let Router { peers, sessions, session_peers, name, .. } = self;
        let Some(Peer::Client(client)) = peers.get_mut(&peer_id) else { return };

        match client.session.as_ref().map(|s| s.status) {
            Some(SessionStatus::Connected) => {
                client.use_count += 1;
                tracing::debug!(remote = %client.name, users = client.use_count, "already connected");
            }
            Some(SessionStatus::Connecting) => {
                client.pending_subscribers += 1;
                tracing::debug!(remote = %client.name, "connect already in flight");
            }
            None => {
                let mut session = sessions.open_client(&format!("{name}/{subscriber_name}"));
                session_peers.insert(session.id(), peer_id);
                client.use_count += 1;
                client.dropped_midi_logged = false;
                let addr = client.addresses[client.addr_idx].clone();
                tracing::info!(
                    remote = %client.name,
                    address = %addr.address,
                    service = %addr.service,
                    users = client.use_count,
                    "opening session"
                );
                session.connect_to(&addr.address, &addr.service);
                client.session = Some(session);
            }
        }
    }

    fn client_unsubscribed(&mut self, port_name: &str, poller: &mut Poller<Router>) {
        let Some(&peer_id) = self.clients_by_name.get(port_name) else { return };
        let Some(Peer::Client(client)) = self.peers.get_mut(&peer_id) else { return };

        if client.pending_subscribers > 0 {
            client.pending_subscribers -= 1;
            return;
        }
        if client.use_count > 0 {
            client.use_count -= 1;
        }
        tracing::debug!(remote = %client.name, users = client.use_count, "subscriber detached");

        if client.use_count == 0 {
            // Tear down on the next tick; the detach may have been driven
            // by a handler still holding this session.
            let name = client.name.clone();
            poller.call_later(move |router: &mut Router, _| router.drop_idle_session(&name));
        }
    }

    /// Deferred: drop a client's session if it is still unused.
    fn drop_idle_session(&mut self, name: &str) {
        let Some(&peer_id) = self.clients_by_name.get(name) else { return };
        if let Some(Peer::Client(client)) = self.peers.get_mut(&peer_id) {
            if client.use_count == 0 && client.pending_subscribers == 0 {
                if let Some(session) = client.session.take() {
                    tracing::info!(remote = %client.name, "no more users, closing session");
                    self.session_peers.remove(&session.id());
                }
            }
        }
    }

    /// MIDI emitted by a local application on one of our ports.
    fn local_midi(&mut self, port_name: &str, bytes: &[u8]) {
        let Some(&from) = self.port_peers.get(port_name) else {
            tracing::debug!(port = %port_name, "MIDI on unknown port");
            return;
        };
        let mut messages = Vec::new();
        if let Err(e) = self.decoder.decode(bytes, |m| messages.push(m)) {
            tracing::debug!(port = %port_name, error = %e, "undecodable local MIDI");
        }
        for message in &messages {
            self.forward_midi(from, message);
        }
    }

    // ---- export servers --------------------------------------------------

    /// A local application attached to `"Network"`: create (or reuse) the
    /// export server carrying its name.
    fn network_subscribe(&mut self, subscriber: PeerDescriptor, app_name: &str) {
        let full = format!("{}/{}", self.name, app_name);

        if let Some(&id) = self.exports_by_name.get(&full) {
            if let Some(Peer::Export(export)) = self.peers.get_mut(&id) {
                tracing::info!(
                    name = %full,
                    control_port = export.server.control_port(),
                    "export server already exists"
                );
                if !export.subscribers.contains(&subscriber) {
                    export.subscribers.push(subscriber.clone());
                }
                self.export_by_subscriber.insert(subscriber, full);
            }
            return;
        }

        let server = match self.sessions.open_server(&full, "") {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!(name = %full, error = %e, "cannot create export server");
                return;
            }
        };
        self.discovery.announce(&full, server.control_port());

        let id = self.alloc_peer(Peer::Export(ExportServer {
            name: full.clone(),
            server,
            subscribers: vec![subscriber.clone()],
        }));
        self.exports_by_name.insert(full.clone(), id);
        self.export_by_subscriber.insert(subscriber, full);

        let network_peer = self.port_peers[NETWORK_PORT];
        self.graph.add_edge(network_peer, id);
        self.graph.add_edge(id, network_peer);
    }

    fn network_unsubscribe(&mut self, subscriber: &PeerDescriptor, poller: &mut Poller<Router>) {
        let Some(full) = self.export_by_subscriber.remove(subscriber) else { return };
        let Some(&id) = self.exports_by_name.get(&full) else { return };

        let last = match self.peers.get_mut(&id) {
            Some(Peer::Export(export)) => {
                export.subscribers.retain(|s| s != subscriber);
                export.subscribers.is_empty()
            }
            _ => false,
        };
        if last {
            poller.call_later(move |router: &mut Router, _| router.destroy_export(&full));
        }
    }

    /// Deferred: withdraw and drop an export server that lost its last
    /// local subscriber (unless one re-attached meanwhile).
    fn destroy_export(&mut self, full: &str) {
        let Some(&id) = self.exports_by_name.get(full) else { return };
        let still_unused =
            matches!(self.peers.get(&id), Some(Peer::Export(e)) if e.subscribers.is_empty());
        if !still_unused {
            return;
        }

        self.exports_by_name.remove(full);
        if let Some(Peer::Export(export)) = self.peers.remove(&id) {
            self.discovery.unannounce(&export.name, export.server.control_port());
            tracing::info!(name = %export.name, "export server destroyed");
        }
        self.session_peers.retain(|_, peer| *peer != id);
        self.graph.remove_peer(id);
    }

    // ---- session side ----------------------------------------------------

    fn session_connected(&mut self, session: SessionId) {
        let Some(&peer_id) = self.session_peers.get(&session) else { return };
        let Some(Peer::Client(client)) = self.peers.get_mut(&peer_id) else { return };
        let Some(active) = client.session.as_mut() else { return };
        if active.id() != session {
            return;
        }
        active.mark_connected();
        client.use_count += client.pending_subscribers;
        client.pending_subscribers = 0;
        tracing::info!(remote = %client.name, users = client.use_count, "session established");
    }

    fn session_midi(&mut self, session: SessionId, payload: &[u8]) {
        let Some(&from) = self.session_peers.get(&session) else {
            tracing::debug!(session = session.0, "MIDI from unknown session");
            return;
        };
        let mut messages = Vec::new();
        if let Err(e) = self.decoder.decode(payload, |m| messages.push(m)) {
            tracing::debug!(session = session.0, error = %e, "stopped decoding payload");
        }
        for message in &messages {
            self.forward_midi(from, message);
        }
    }

    fn session_disconnected(
        &mut self,
        session: SessionId,
        reason: DisconnectReason,
        poller: &mut Poller<Router>,
    ) {
        let Some(&peer_id) = self.session_peers.get(&session) else {
            tracing::debug!(session = session.0, %reason, "disconnect for unknown session");
            return;
        };
        match self.peers.get(&peer_id) {
            Some(Peer::Client(_)) => self.client_disconnected(peer_id, session, reason, poller),
            Some(Peer::ServerConnection(_)) => self.inbound_peer_gone(peer_id, session),
            Some(Peer::Export(export)) => {
                tracing::debug!(name = %export.name, "remote peer left export server");
                self.session_peers.remove(&session);
            }
            _ => {
                self.session_peers.remove(&session);
            }
        }
    }

    /// Outbound client disconnect handling: retry/failover, local
    /// detach, or nothing, depending on the reason.
    fn client_disconnected(
        &mut self,
        peer_id: PeerId,
        session: SessionId,
        reason: DisconnectReason,
        poller: &mut Poller<Router>,
    ) {
        let Some(Peer::Client(client)) = self.peers.get(&peer_id) else { return };
        if client.session.as_ref().map(|s| s.id()) != Some(session) {
            tracing::debug!(remote = %client.name, "disconnect for stale session");
            self.session_peers.remove(&session);
            return;
        }
        let name = client.name.clone();
        tracing::debug!(remote = %name, %reason, "session disconnect");

        match reason {
            DisconnectReason::CantConnect | DisconnectReason::ConnectionRejected => {
                let give_up = {
                    let Some(Peer::Client(client)) = self.peers.get_mut(&peer_id) else { return };
                    client.connect_attempts += 1;
                    let bound = MAX_ATTEMPTS_PER_ADDRESS as usize * client.addresses.len();
                    client.connect_attempts as usize >= bound
                };
                if give_up {
                    let Some(Peer::Client(client)) = self.peers.get(&peer_id) else { return };
                    tracing::warn!(
                        remote = %name,
                        attempts = client.connect_attempts,
                        "too many connect attempts, giving up"
                    );
                    self.remove_client(&name, poller);
                    return;
                }
                let retry = name.clone();
                let timer = poller.add_timer_event(RETRY_DELAY, move |router: &mut Router, _| {
                    router.retry_next_address(&retry);
                });
                if let Some(Peer::Client(client)) = self.peers.get_mut(&peer_id) {
                    if let Some(active) = client.session.as_mut() {
                        active.status = SessionStatus::Connecting;
                        active.connect_timer = Some(timer);
                    }
                }
            }

            DisconnectReason::ConnectTimeout | DisconnectReason::CkTimeout => {
                // The driver keeps inviting; keep the session object.
                tracing::warn!(remote = %name, %reason, "timeout, driver keeps trying");
            }

            DisconnectReason::PeerDisconnected => {
                self.ports.disconnect(&name);
                let reached_zero = {
                    let Some(Peer::Client(client)) = self.peers.get_mut(&peer_id) else { return };
                    if client.use_count > 0 {
                        client.use_count -= 1;
                    }
                    tracing::warn!(
                        remote = %name,
                        users = client.use_count,
                        "remote peer disconnected, local port detached"
                    );
                    client.use_count == 0
                };
                if reached_zero {
                    poller.call_later(move |router: &mut Router, _| router.drop_idle_session(&name));
                }
            }

            DisconnectReason::Disconnect => {
                tracing::debug!(remote = %name, "clean disconnect");
            }
        }
    }

    /// Failover timer fired: advance to the next address and reconnect.
    /// The client may have been removed meanwhile; absence is tolerated.
    fn retry_next_address(&mut self, name: &str) {
        let Some(&peer_id) = self.clients_by_name.get(name) else { return };
        let Some(Peer::Client(client)) = self.peers.get_mut(&peer_id) else { return };
        if client.addresses.is_empty() {
            return;
        }
        client.addr_idx = (client.addr_idx + 1) % client.addresses.len();
        let addr = client.addresses[client.addr_idx].clone();
        tracing::debug!(
            remote = %name,
            index = client.addr_idx,
            of = client.addresses.len(),
            "trying next address"
        );
        if let Some(session) = client.session.as_mut() {
            session.connect_timer = None;
            session.connect_to(&addr.address, &addr.service);
        }
    }

    // ---- inbound side ----------------------------------------------------

    /// A server acceptor finished a handshake with a remote peer.
    fn peer_connected(&mut self, server: ServerId, session: SessionId, remote_name: &str) {
        // Peers accepted by an export server need no landing port; their
        // traffic goes through "Network".
        let export = self
            .exports_by_name
            .values()
            .copied()
            .find(|id| matches!(self.peers.get(id), Some(Peer::Export(e)) if e.server.id() == server));
        if let Some(id) = export {
            if let Some(Peer::Export(export)) = self.peers.get(&id) {
                tracing::info!(name = %export.name, remote = %remote_name, "remote peer joined export server");
            }
            self.session_peers.insert(session, id);
            return;
        }

        if !self.import_servers.iter().any(|s| s.id() == server) {
            tracing::warn!(server = server.0, "peer on unknown server");
            return;
        }
        tracing::info!(remote = %remote_name, "remote client connected to local server");

        let port_peer = match self.ensure_port(remote_name) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(remote = %remote_name, error = %e, "cannot open landing port");
                return;
            }
        };

        // One active connection per landing port: a reconnecting remote
        // replaces its session binding.
        if let Some(&existing) = self.conns_by_port.get(remote_name) {
            if let Some(Peer::ServerConnection(conn)) = self.peers.get_mut(&existing) {
                tracing::warn!(port = %remote_name, "replacing inbound session on landing port");
                let stale = conn.session;
                self.session_peers.remove(&stale);
                conn.session = session;
                conn.server = server;
                self.session_peers.insert(session, existing);
                return;
            }
        }

        let id = self.alloc_peer(Peer::ServerConnection(KnownServerConnection {
            remote_name: remote_name.to_string(),
            session,
            server,
        }));
        self.conns_by_port.insert(remote_name.to_string(), id);
        self.session_peers.insert(session, id);
        self.graph.add_edge(port_peer, id);
        self.graph.add_edge(id, port_peer);
    }

    /// The remote end of an inbound connection went away: drop the record
    /// and its landing port.
    fn inbound_peer_gone(&mut self, peer_id: PeerId, session: SessionId) {
        self.session_peers.remove(&session);
        let Some(Peer::ServerConnection(conn)) = self.peers.get(&peer_id) else { return };
        if conn.session != session {
            // Superseded by a reconnect; nothing to tear down.
            return;
        }
        let port = conn.remote_name.clone();
        tracing::info!(port = %port, "inbound session closed, removing landing port");

        self.peers.remove(&peer_id);
        self.conns_by_port.remove(&port);
        self.graph.remove_peer(peer_id);

        // The port may be shared with a known client of the same name.
        if !self.clients_by_name.contains_key(&port) {
            self.remove_port_peer(&port);
        }
    }

    // ---- forwarding ------------------------------------------------------

    /// Deliver a message along every outgoing edge of `from`.
    pub fn forward_midi(&mut self, from: PeerId, message: &MidiMessage) {
        let targets = self.graph.targets(from).to_vec();
        for target in targets {
            self.deliver_to(target, message);
        }
    }

    fn deliver_to(&mut self, target: PeerId, message: &MidiMessage) {
        if let Some(Peer::LocalPort { name }) = self.peers.get(&target) {
            let name = name.clone();
            if let Err(e) = self.ports.deliver(&name, message) {
                tracing::warn!(port = %name, error = %e, "local delivery failed");
            }
            return;
        }

        if let Some(Peer::ServerConnection(conn)) = self.peers.get(&target) {
            let (server, peer_session) = (conn.server, conn.session);
            let Some(wire) = encode_or_log(message) else { return };
            if let Some(index) = self.import_servers.iter().position(|s| s.id() == server) {
                self.import_servers[index].send_midi_to(peer_session, &wire);
            }
            return;
        }

        match self.peers.get_mut(&target) {
            Some(Peer::Client(client)) => match client.session.as_mut() {
                Some(session) if session.is_connected() => {
                    if let Some(wire) = encode_or_log(message) {
                        session.send_midi(&wire);
                    }
                }
                _ => {
                    if !client.dropped_midi_logged {
                        tracing::warn!(remote = %client.name, "dropping MIDI, session not connected");
                        client.dropped_midi_logged = true;
                    }
                }
            },
            Some(Peer::Export(export)) => {
                if let Some(wire) = encode_or_log(message) {
                    export.server.send_midi_to_all_peers(&wire);
                }
            }
            _ => {}
        }
    }

    // ---- shutdown --------------------------------------------------------

    /// Withdraw announcements and close every local port. The daemon keeps
    /// no state across restarts.
    pub fn shutdown(&mut self) {
        tracing::info!(name = %self.name, "shutting down");
        for server in &self.import_servers {
            self.discovery.unannounce(&self.name, server.control_port());
        }
        let exports: Vec<PeerId> = self.exports_by_name.values().copied().collect();
        for id in exports {
            if let Some(Peer::Export(export)) = self.peers.get(&id) {
                let (name, port) = (export.name.clone(), export.server.control_port());
                self.discovery.unannounce(&name, port);
            }
        }
        for name in self.ports.names() {
            self.ports.remove_port(&name);
        }
    }
}

fn encode_or_log(message: &MidiMessage) -> Option<Vec<u8>> {
    let mut wire = Vec::new();
    match codec::encode(message, &mut wire) {
        Ok(()) => Some(wire),
        Err(e) => {
            tracing::warn!(error = %e, "cannot encode message, not sending");
            None
        }
    }
}

/// The assembled daemon: router, poller and the event inbox, plus the
/// production run loop.
pub struct Daemon {
    pub router: Router,
    pub poller: Poller<Router>,
    inbox: Receiver<Event>,
}

impl Daemon {
    pub fn new(
        config: &Config,
        midi: Box<dyn MidiBackend>,
        rtp: Box<dyn SessionBackend>,
        mdns: Box<dyn DiscoveryBackend>,
        events: EventSender,
        inbox: Receiver<Event>,
    ) -> Result<Daemon> {
        Ok(Daemon {
            router: Router::new(config, midi, rtp, mdns, events)?,
            poller: Poller::new(),
            inbox,
        })
    }

    /// Drain everything currently actionable: queued events, the deferred
    /// calls they schedule, and events those produce in turn. Returns once
    /// both queues are empty. Used by tests and embedders.
    pub fn pump(&mut self) {
        loop {
            let mut idle = true;
            while let Ok(event) = self.inbox.try_recv() {
                idle = false;
                self.router.handle_event(&mut self.poller, event);
                self.poller.process(&mut self.router);
            }
            if self.poller.pending_deferred() > 0 {
                idle = false;
                self.poller.process(&mut self.router);
            }
            if idle {
                break;
            }
        }
    }

    /// Advance the poller clock (fires due timers), then drain like
    /// [`pump`](Self::pump).
    pub fn advance(&mut self, dt: Duration) {
        self.poller.advance(&mut self.router, dt);
        self.pump();
    }

    /// Blocking event loop. Returns when `running` clears or the event
    /// channel closes; shuts the router down on the way out.
    pub fn run(&mut self, running: Arc<AtomicBool>) {
        const IDLE_TICK: Duration = Duration::from_millis(200);
        let mut last = Instant::now();

        while running.load(Ordering::SeqCst) {
            let timeout = self
                .poller
                .until_next_timer()
                .unwrap_or(IDLE_TICK)
                .min(IDLE_TICK);
            match self.inbox.recv_timeout(timeout) {
                Ok(event) => {
                    self.router.handle_event(&mut self.poller, event);
                    self.poller.process(&mut self.router);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            let now = Instant::now();
            self.poller.advance(&mut self.router, now - last);
            last = now;
        }

        self.router.shutdown();
    }
}
