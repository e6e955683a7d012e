//! mDNS announce/browse façade.
//!
//! The mDNS responder itself is a collaborator behind
//! [`DiscoveryBackend`]; browse results reach the router as
//! [`Event::Discovered`](crate::event::Event::Discovered) /
//! [`Event::Removed`](crate::event::Event::Removed) on the daemon channel.
//! The same service may legitimately be announced once per network
//! interface — the façade passes every announcement through and the router
//! deduplicates addresses.

/// Conventional service type for AppleMIDI session acceptors.
pub const SERVICE_TYPE: &str = "_apple-midi._udp";

/// mDNS responder collaborator: registers and withdraws service records.
pub trait DiscoveryBackend {
    fn announce(&mut self, name: &str, port: u16);
    fn unannounce(&mut self, name: &str, port: u16);
}

/// Thin logging wrapper the router talks to.
pub struct Discovery {
    backend: Box<dyn DiscoveryBackend>,
}

impl Discovery {
    pub fn new(backend: Box<dyn DiscoveryBackend>) -> Self {
        Discovery { backend }
    }

    pub fn announce(&mut self, name: &str, port: u16) {
        tracing::info!(name, port, service = SERVICE_TYPE, "announcing server");
        self.backend.announce(name, port);
    }

    pub fn unannounce(&mut self, name: &str, port: u16) {
        tracing::info!(name, port, "withdrawing server announcement");
        self.backend.unannounce(name, port);
    }
}

/// Backend for hosts without an mDNS responder: announcements are logged
/// and dropped, nothing is ever discovered.
pub struct NullDiscovery;

impl DiscoveryBackend for NullDiscovery {
    fn announce(&mut self, name: &str, port: u16) {
        tracing::debug!(name, port, "mDNS disabled, announcement dropped");
    }

    fn unannounce(&mut self, _name: &str, _port: u16) {}
}
