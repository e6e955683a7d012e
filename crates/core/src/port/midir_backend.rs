//! midir-backed host MIDI subsystem.
//!
//! Opens one pair of virtual endpoints per local port (unix only: ALSA
//! sequencer or CoreMIDI). Inbound messages are forwarded from midir's
//! callback thread onto the daemon channel as
//! [`Event::MidiIn`](crate::event::Event::MidiIn).
//!
//! midir has no notion of subscription announcements, so attach/detach
//! events are not produced by this backend; hosts that expose them (ALSA
//! `port_subscribed` announcements) need a backend of their own.

use std::collections::HashMap;

use midir::os::unix::{VirtualInput, VirtualOutput};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};

use crate::error::{BridgeError, Result};
use crate::event::{Event, EventSender};
use crate::port::MidiBackend;

struct VirtualPair {
    // Held for lifetime only; dropping closes the endpoint.
    _input: MidiInputConnection<()>,
    output: MidiOutputConnection,
}

/// [`MidiBackend`] over midir virtual ports.
pub struct MidirBackend {
    client_name: String,
    events: EventSender,
    ports: HashMap<String, VirtualPair>,
}

impl MidirBackend {
    pub fn new(client_name: impl Into<String>, events: EventSender) -> Self {
        MidirBackend {
            client_name: client_name.into(),
            events,
            ports: HashMap::new(),
        }
    }
}

impl MidiBackend for MidirBackend {
    fn open(&mut self, name: &str) -> Result<()> {
        let mut input = MidiInput::new(&format!("{} {name} in", self.client_name))
            .map_err(|e| BridgeError::Backend(e.to_string()))?;
        // Receive SysEx and realtime messages too.
        input.ignore(Ignore::None);

        let events = self.events.clone();
        let port_name = name.to_string();
        let input = input
            .create_virtual(
                name,
                move |_timestamp, bytes, _: &mut ()| {
                    events.send(Event::MidiIn {
                        port: port_name.clone(),
                        bytes: bytes.to_vec(),
                    });
                },
                (),
            )
            .map_err(|e| BridgeError::Backend(e.to_string()))?;

        let output = MidiOutput::new(&format!("{} {name} out", self.client_name))
            .map_err(|e| BridgeError::Backend(e.to_string()))?
            .create_virtual(name)
            .map_err(|e| BridgeError::Backend(e.to_string()))?;

        tracing::debug!(port = name, "virtual MIDI endpoints opened");
        self.ports.insert(name.to_string(), VirtualPair { _input: input, output });
        Ok(())
    }

    fn close(&mut self, name: &str) {
        if self.ports.remove(name).is_some() {
            tracing::debug!(port = name, "virtual MIDI endpoints closed");
        }
    }

    fn send(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let pair = self
            .ports
            .get_mut(name)
            .ok_or_else(|| BridgeError::UnknownPort(name.to_string()))?;
        pair.output
            .send(bytes)
            .map_err(|e| BridgeError::Backend(e.to_string()))
    }
}
