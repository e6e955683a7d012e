//! Local virtual MIDI port registry.
//!
//! Each entry pairs a name with a virtual input/output endpoint opened in
//! the host MIDI subsystem: a port exists in the registry exactly as long
//! as the host has those endpoints open. Ports are created on demand by
//! the router (a discovered remote, an accepted inbound session) and
//! destroyed when no peer references them anymore.
//!
//! Inbound traffic and attach/detach notifications from the host arrive as
//! [`Event`](crate::event::Event)s on the daemon channel; the registry only
//! handles the outbound direction and subscriber bookkeeping.

#[cfg(unix)]
pub mod midir_backend;

use std::collections::HashMap;
use std::fmt;

use crate::codec::{self, MidiMessage};
use crate::error::{BridgeError, Result};

/// Address of an external endpoint attached to one of our ports, as
/// reported by the host MIDI subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerDescriptor {
    pub client: String,
    pub port: String,
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.port)
    }
}

/// Host MIDI subsystem collaborator.
///
/// Implementations open a named pair of virtual endpoints per port,
/// accept outbound bytes, and deliver inbound messages plus
/// subscribe/unsubscribe notifications through the daemon event channel.
pub trait MidiBackend {
    fn open(&mut self, name: &str) -> Result<()>;
    fn close(&mut self, name: &str);
    fn send(&mut self, name: &str, bytes: &[u8]) -> Result<()>;

    /// The host's per-event buffer limit, when it has one. Messages over
    /// the limit are segmented by the registry before delivery.
    fn max_event_size(&self) -> Option<usize> {
        None
    }
}

/// A named virtual port and the endpoints currently attached to it.
#[derive(Debug, Default)]
pub struct LocalPort {
    subscribers: Vec<PeerDescriptor>,
}

/// Registry of local virtual MIDI ports, keyed by name.
pub struct PortRegistry {
    backend: Box<dyn MidiBackend>,
    ports: HashMap<String, LocalPort>,
}

impl PortRegistry {
    pub fn new(backend: Box<dyn MidiBackend>) -> Self {
        PortRegistry {
            backend,
            ports: HashMap::new(),
        }
    }

    /// Open a new virtual port.
    pub fn create_port(&mut self, name: &str) -> Result<()> {
        if self.ports.contains_key(name) {
            return Err(BridgeError::DuplicatePort(name.to_string()));
        }
        self.backend.open(name)?;
        self.ports.insert(name.to_string(), LocalPort::default());
        tracing::info!(port = name, total = self.ports.len(), "local port created");
        Ok(())
    }

    /// Close a virtual port. Idempotent.
    pub fn remove_port(&mut self, name: &str) {
        if self.ports.remove(name).is_some() {
            self.backend.close(name);
            tracing::info!(port = name, total = self.ports.len(), "local port removed");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ports.contains_key(name)
    }

    /// Names of all open ports (used during shutdown).
    pub fn names(&self) -> Vec<String> {
        self.ports.keys().cloned().collect()
    }

    /// Forward raw bytes to the host output of a port.
    pub fn send_midi(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        if !self.ports.contains_key(name) {
            return Err(BridgeError::UnknownPort(name.to_string()));
        }
        self.backend.send(name, bytes)
    }

    /// Encode a message and deliver it to a port, segmenting SysEx that
    /// exceeds the host's per-event buffer.
    pub fn deliver(&mut self, name: &str, message: &MidiMessage) -> Result<()> {
        let mut bytes = Vec::new();
        codec::encode(message, &mut bytes)?;

        if let (MidiMessage::SysEx(_), Some(max)) = (message, self.backend.max_event_size()) {
            if bytes.len() > max {
                for frame in codec::segment_sysex(&bytes, max) {
                    self.send_midi(name, &frame)?;
                }
                return Ok(());
            }
        }
        self.send_midi(name, &bytes)
    }

    /// Note an attach reported by the host. Duplicate notifications are
    /// tolerated (at-least-once delivery).
    pub fn record_subscribe(&mut self, name: &str, subscriber: PeerDescriptor) -> Result<()> {
        let port = self
            .ports
            .get_mut(name)
            .ok_or_else(|| BridgeError::UnknownPort(name.to_string()))?;
        if !port.subscribers.contains(&subscriber) {
            tracing::debug!(port = name, %subscriber, "subscriber attached");
            port.subscribers.push(subscriber);
        }
        Ok(())
    }

    /// Note a detach reported by the host. Unknown subscribers are ignored.
    pub fn record_unsubscribe(&mut self, name: &str, subscriber: &PeerDescriptor) {
        if let Some(port) = self.ports.get_mut(name) {
            if let Some(pos) = port.subscribers.iter().position(|s| s == subscriber) {
                port.subscribers.swap_remove(pos);
                tracing::debug!(port = name, %subscriber, "subscriber detached");
            }
        }
    }

    /// Drop every subscriber of a port without closing it (used when the
    /// remote end of the bridge goes away).
    pub fn disconnect(&mut self, name: &str) {
        if let Some(port) = self.ports.get_mut(name) {
            if !port.subscribers.is_empty() {
                tracing::debug!(
                    port = name,
                    subscribers = port.subscribers.len(),
                    "disconnecting port subscribers"
                );
                port.subscribers.clear();
            }
        }
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.ports.get(name).map_or(0, |p| p.subscribers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct RecordingState {
        open: Vec<String>,
        sent: Vec<(String, Vec<u8>)>,
    }

    struct RecordingBackend {
        state: Rc<RefCell<RecordingState>>,
        max_event_size: Option<usize>,
    }

    impl MidiBackend for RecordingBackend {
        fn open(&mut self, name: &str) -> Result<()> {
            self.state.borrow_mut().open.push(name.to_string());
            Ok(())
        }

        fn close(&mut self, name: &str) {
            self.state.borrow_mut().open.retain(|n| n != name);
        }

        fn send(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
            self.state
                .borrow_mut()
                .sent
                .push((name.to_string(), bytes.to_vec()));
            Ok(())
        }

        fn max_event_size(&self) -> Option<usize> {
            self.max_event_size
        }
    }

    fn registry(max_event_size: Option<usize>) -> (PortRegistry, Rc<RefCell<RecordingState>>) {
        let state = Rc::new(RefCell::new(RecordingState::default()));
        let backend = RecordingBackend {
            state: state.clone(),
            max_event_size,
        };
        (PortRegistry::new(Box::new(backend)), state)
    }

    fn subscriber(n: u32) -> PeerDescriptor {
        PeerDescriptor {
            client: format!("app{n}"),
            port: "out".into(),
        }
    }

    #[test]
    fn create_duplicate_rejected() {
        let (mut reg, state) = registry(None);
        reg.create_port("Piano").unwrap();
        let err = reg.create_port("Piano").unwrap_err();
        assert!(matches!(err, BridgeError::DuplicatePort(_)));
        assert_eq!(state.borrow().open, vec!["Piano"]);
    }

    #[test]
    fn remove_is_idempotent() {
        let (mut reg, state) = registry(None);
        reg.create_port("Piano").unwrap();
        reg.remove_port("Piano");
        reg.remove_port("Piano");
        assert!(!reg.contains("Piano"));
        assert!(state.borrow().open.is_empty());
    }

    #[test]
    fn send_to_unknown_port() {
        let (mut reg, _) = registry(None);
        let err = reg.send_midi("nope", &[0xf8]).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownPort(_)));
    }

    #[test]
    fn subscribe_deduplicates() {
        let (mut reg, _) = registry(None);
        reg.create_port("Piano").unwrap();
        reg.record_subscribe("Piano", subscriber(1)).unwrap();
        reg.record_subscribe("Piano", subscriber(1)).unwrap();
        reg.record_subscribe("Piano", subscriber(2)).unwrap();
        assert_eq!(reg.subscriber_count("Piano"), 2);

        reg.record_unsubscribe("Piano", &subscriber(1));
        assert_eq!(reg.subscriber_count("Piano"), 1);
        reg.disconnect("Piano");
        assert_eq!(reg.subscriber_count("Piano"), 0);
        assert!(reg.contains("Piano"));
    }

    #[test]
    fn deliver_small_message_unsegmented() {
        let (mut reg, state) = registry(Some(256));
        reg.create_port("Piano").unwrap();
        reg.deliver(
            "Piano",
            &MidiMessage::NoteOn { channel: 0, note: 60, velocity: 64 },
        )
        .unwrap();
        assert_eq!(
            state.borrow().sent,
            vec![("Piano".to_string(), vec![0x90, 60, 64])]
        );
    }

    #[test]
    fn deliver_segments_large_sysex() {
        let (mut reg, state) = registry(Some(256));
        reg.create_port("Piano").unwrap();

        let mut message = vec![0xf0];
        message.extend(std::iter::repeat(0x42u8).take(598));
        message.push(0xf7);
        reg.deliver("Piano", &MidiMessage::SysEx(message.clone())).unwrap();

        let sent = state.borrow();
        assert_eq!(sent.sent.len(), 3);
        let mut rebuilt = vec![0xf0];
        for (port, frame) in &sent.sent {
            assert_eq!(port, "Piano");
            assert!(frame.len() <= 256);
            rebuilt.extend_from_slice(&frame[1..frame.len() - 1]);
        }
        rebuilt.push(0xf7);
        assert_eq!(rebuilt, message);
    }

    #[test]
    fn deliver_unlimited_backend_keeps_sysex_whole() {
        let (mut reg, state) = registry(None);
        reg.create_port("Piano").unwrap();

        let mut message = vec![0xf0];
        message.extend(std::iter::repeat(0x42u8).take(598));
        message.push(0xf7);
        reg.deliver("Piano", &MidiMessage::SysEx(message.clone())).unwrap();
        assert_eq!(state.borrow().sent, vec![("Piano".to_string(), message)]);
    }
}
