//! # midibridge — RTP-MIDI bridging daemon core
//!
//! Bridges local MIDI endpoints with remote RTP-MIDI endpoints over IP:
//! remote devices appear as virtual local ports, and local sources can be
//! exported to the network.
//!
//! ## Protocol references
//!
//! | Spec | Topic | How this crate uses it |
//! |------|-------|------------------------|
//! | [RFC 6295](https://tools.ietf.org/html/rfc6295) | RTP-MIDI | Command-list encoding: running status, delta times, SysEx |
//! | AppleMIDI | Session control | Handled by the session driver below the [`session`] seam |
//! | MIDI 1.0 | Messages | Channel-voice and system command wire formats |
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  CLI / embedder                             │
//! ├─────────────────────────────────────────────┤
//! │  Daemon    — run loop: events, timers       │
//! │  Router    — peer graph, lifecycle, retry   │
//! ├─────────────────────────────────────────────┤
//! │  Port      — virtual local MIDI registry    │
//! │  Session   — RTP-MIDI client/server façade  │
//! │  Discovery — mDNS announce/browse façade    │
//! ├─────────────────────────────────────────────┤
//! │  Codec     — wire bytes ⇄ typed messages    │
//! │  Poller    — deferred calls and timers      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one thread. Backends (host MIDI, the RTP-MIDI
//! driver, mDNS) marshal their completions onto the daemon channel created
//! by [`event::channel`]; the [`router::Daemon`] loop drains it.
//!
//! ## Quick start
//!
//! ```no_run
//! use midibridge::{config::Config, discovery::NullDiscovery, event};
//! use midibridge::port::midir_backend::MidirBackend;
//! use midibridge::router::Daemon;
//! use midibridge::session::loopback::LoopbackBackend;
//!
//! let mut config = Config::new("midibridge");
//! config.connect_to.push("piano:192.0.2.10:5004".into());
//!
//! let (events, inbox) = event::channel();
//! let midi = MidirBackend::new(&config.name, events.clone());
//! let mut daemon = Daemon::new(
//!     &config,
//!     Box::new(midi),
//!     Box::new(LoopbackBackend::new()),
//!     Box::new(NullDiscovery),
//!     events,
//!     inbox,
//! )
//! .unwrap();
//! daemon.run(std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true)));
//! ```
//!
//! ## Crate layout
//!
//! - [`router`] — [`Router`] peer manager and the [`Daemon`](router::Daemon) run loop.
//! - [`port`] — local virtual port registry and the host-MIDI seam.
//! - [`session`] — session-layer façade and the protocol-driver seam.
//! - [`discovery`] — mDNS façade.
//! - [`codec`] — MIDI command-list codec and SysEx segmentation.
//! - [`poller`] — single-threaded scheduler.
//! - [`graph`] — directed routing graph.
//! - [`config`] — daemon configuration and remote specs.
//! - [`event`] — the marshalling channel between backends and the router.
//! - [`error`] — [`BridgeError`] and [`Result`] alias.

pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod graph;
pub mod poller;
pub mod port;
pub mod router;
pub mod session;

pub use codec::MidiMessage;
pub use config::Config;
pub use error::{BridgeError, Result};
pub use router::{Daemon, Router, NETWORK_PORT};
