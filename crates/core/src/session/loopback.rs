//! In-process session driver.
//!
//! Pairs client sessions with server acceptors living in the same process,
//! keyed by name: `connect_to(address, _)` matches a server whose name
//! equals `address`. Useful for development and demos of the routing layer
//! before a real RTP-MIDI protocol driver is plugged in, and for bridging
//! two daemons hosted by one process.
//!
//! No bytes ever touch a socket; "transmitted" payloads surface on the
//! other endpoint's event channel unchanged.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::Result;
use crate::event::{Event, EventSender, ServerId, SessionId};
use crate::session::{
    next_session_id, ClientDriver, DisconnectReason, ServerDriver, SessionBackend,
};

struct ServerEntry {
    id: ServerId,
    events: EventSender,
    control_port: u16,
    peers: Vec<SessionId>,
}

#[derive(Default)]
struct Shared {
    servers: HashMap<String, ServerEntry>,
    /// Endpoint to its opposite endpoint and that endpoint's channel.
    links: HashMap<SessionId, (SessionId, EventSender)>,
    next_port: u16,
}

impl Shared {
    fn unlink(&mut self, endpoint: SessionId) -> Option<(SessionId, EventSender)> {
        let (other, events) = self.links.remove(&endpoint)?;
        self.links.remove(&other);
        Some((other, events))
    }
}

/// [`SessionBackend`] connecting clients to in-process servers by name.
#[derive(Default)]
pub struct LoopbackBackend {
    shared: Rc<RefCell<Shared>>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionBackend for LoopbackBackend {
    fn client(
        &mut self,
        name: &str,
        session: SessionId,
        events: EventSender,
    ) -> Box<dyn ClientDriver> {
        Box::new(LoopbackClient {
            id: session,
            name: name.to_string(),
            events,
            shared: self.shared.clone(),
        })
    }

    fn server(
        &mut self,
        name: &str,
        service: &str,
        server: ServerId,
        events: EventSender,
    ) -> Result<Box<dyn ServerDriver>> {
        let mut shared = self.shared.borrow_mut();
        let control_port = if service.is_empty() {
            shared.next_port += 2;
            20000 + shared.next_port
        } else {
            service.parse().unwrap_or(0)
        };
        shared.servers.insert(
            name.to_string(),
            ServerEntry {
                id: server,
                events,
                control_port,
                peers: Vec::new(),
            },
        );
        Ok(Box::new(LoopbackServer {
            name: name.to_string(),
            control_port,
            shared: self.shared.clone(),
        }))
    }
}

struct LoopbackClient {
    id: SessionId,
    name: String,
    events: EventSender,
    shared: Rc<RefCell<Shared>>,
}

impl ClientDriver for LoopbackClient {
    fn connect_to(&mut self, address: &str, _service: &str) {
        let mut guard = self.shared.borrow_mut();
        let shared = &mut *guard;
        let Some(server) = shared.servers.get_mut(address) else {
            tracing::debug!(client = self.id.0, address, "no loopback server with that name");
            self.events.send(Event::SessionDisconnected {
                session: self.id,
                reason: DisconnectReason::CantConnect,
            });
            return;
        };

        let peer = next_session_id();
        server.peers.push(peer);
        server.events.send(Event::PeerConnected {
            server: server.id,
            session: peer,
            remote_name: self.name.clone(),
        });
        let server_events = server.events.clone();
        shared.links.insert(self.id, (peer, server_events));
        shared.links.insert(peer, (self.id, self.events.clone()));

        self.events.send(Event::SessionConnected { session: self.id });
    }

    fn send_midi(&mut self, payload: &[u8]) {
        let shared = self.shared.borrow();
        if let Some((other, events)) = shared.links.get(&self.id) {
            events.send(Event::SessionMidi {
                session: *other,
                payload: payload.to_vec(),
            });
        }
    }
}

impl Drop for LoopbackClient {
    fn drop(&mut self) {
        let mut shared = self.shared.borrow_mut();
        if let Some((peer, server_events)) = shared.unlink(self.id) {
            for server in shared.servers.values_mut() {
                server.peers.retain(|p| *p != peer);
            }
            server_events.send(Event::SessionDisconnected {
                session: peer,
                reason: DisconnectReason::PeerDisconnected,
            });
        }
    }
}

struct LoopbackServer {
    name: String,
    control_port: u16,
    shared: Rc<RefCell<Shared>>,
}

impl ServerDriver for LoopbackServer {
    fn control_port(&self) -> u16 {
        self.control_port
    }

    fn send_midi_to_all_peers(&mut self, payload: &[u8]) {
        let shared = self.shared.borrow();
        let Some(server) = shared.servers.get(&self.name) else { return };
        for peer in &server.peers {
            if let Some((client, events)) = shared.links.get(peer) {
                events.send(Event::SessionMidi {
                    session: *client,
                    payload: payload.to_vec(),
                });
            }
        }
    }

    fn send_midi_to(&mut self, peer: SessionId, payload: &[u8]) {
        let shared = self.shared.borrow();
        if let Some((client, events)) = shared.links.get(&peer) {
            events.send(Event::SessionMidi {
                session: *client,
                payload: payload.to_vec(),
            });
        }
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        let mut shared = self.shared.borrow_mut();
        let Some(server) = shared.servers.remove(&self.name) else { return };
        for peer in server.peers {
            if let Some((client, events)) = shared.unlink(peer) {
                events.send(Event::SessionDisconnected {
                    session: client,
                    reason: DisconnectReason::PeerDisconnected,
                });
            }
        }
    }
}
