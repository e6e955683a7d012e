//! Daemon configuration and remote descriptions.

use crate::error::{BridgeError, Result};

/// Default AppleMIDI control port.
pub const DEFAULT_SERVICE: &str = "5004";

/// Construction-time configuration. The daemon keeps no state across
/// restarts; everything it needs arrives here.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name announced over mDNS and used as the host-MIDI client name.
    pub name: String,
    /// UDP services on which to accept inbound sessions.
    pub ports: Vec<String>,
    /// Remotes to register at startup, in [`RemoteSpec`] string form.
    pub connect_to: Vec<String>,
}

impl Config {
    pub fn new(name: impl Into<String>) -> Self {
        Config {
            name: name.into(),
            ports: Vec::new(),
            connect_to: Vec::new(),
        }
    }
}

/// A parsed remote description.
///
/// Accepted string forms, split on `:` with `[...]` protecting an IPv6
/// literal host:
///
/// ```text
/// host                  → name = host,  service = 5004
/// name:host             → service = 5004
/// name:host:service
/// synth:[2001:db8::7]:5010
/// [::1]                 → name = host = ::1
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    pub name: String,
    pub address: String,
    pub service: String,
}

impl RemoteSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let tokens = tokenize(spec)?;

        let (name, address, service) = match tokens.as_slice() {
            [host] => (host.clone(), host.clone(), DEFAULT_SERVICE.to_string()),
            [host, service] => (host.clone(), host.clone(), service.clone()),
            [name, host, service] => (name.clone(), host.clone(), service.clone()),
            _ => {
                return Err(BridgeError::InvalidRemoteSpec {
                    spec: spec.to_string(),
                    reason: "expected name, name:host, or name:host:service",
                })
            }
        };

        if name.is_empty() || address.is_empty() || service.is_empty() {
            return Err(BridgeError::InvalidRemoteSpec {
                spec: spec.to_string(),
                reason: "empty field",
            });
        }

        Ok(RemoteSpec { name, address, service })
    }
}

/// Split on `:`, treating a bracketed IPv6 literal as one host token.
fn tokenize(spec: &str) -> Result<Vec<String>> {
    let Some(open) = spec.find('[') else {
        return Ok(spec.split(':').map(str::to_string).collect());
    };

    let invalid = |reason| BridgeError::InvalidRemoteSpec {
        spec: spec.to_string(),
        reason,
    };

    let close = spec.find(']').ok_or(invalid("missing ']' after '['"))?;
    if close < open {
        return Err(invalid("']' before '['"));
    }

    let mut tokens = Vec::new();
    if open > 0 {
        // "name:[host]..." — drop the ':' joining name and bracket.
        let prefix = spec[..open]
            .strip_suffix(':')
            .ok_or(invalid("expected ':' before '['"))?;
        tokens.push(prefix.to_string());
    }
    tokens.push(spec[open + 1..close].to_string());

    let rest = &spec[close + 1..];
    if !rest.is_empty() {
        let service = rest
            .strip_prefix(':')
            .ok_or(invalid("expected ':' after ']'"))?;
        tokens.push(service.to_string());
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(spec: &str) -> RemoteSpec {
        RemoteSpec::parse(spec).unwrap()
    }

    #[test]
    fn bare_host() {
        assert_eq!(
            parse("piano.local"),
            RemoteSpec {
                name: "piano.local".into(),
                address: "piano.local".into(),
                service: "5004".into(),
            }
        );
    }

    #[test]
    fn host_and_service() {
        assert_eq!(
            parse("192.0.2.10:5010"),
            RemoteSpec {
                name: "192.0.2.10".into(),
                address: "192.0.2.10".into(),
                service: "5010".into(),
            }
        );
    }

    #[test]
    fn name_host_service() {
        assert_eq!(
            parse("piano:192.0.2.10:5010"),
            RemoteSpec {
                name: "piano".into(),
                address: "192.0.2.10".into(),
                service: "5010".into(),
            }
        );
    }

    #[test]
    fn bracketed_ipv6_with_name_and_service() {
        assert_eq!(
            parse("synth:[2001:db8::7]:5010"),
            RemoteSpec {
                name: "synth".into(),
                address: "2001:db8::7".into(),
                service: "5010".into(),
            }
        );
    }

    #[test]
    fn bare_bracketed_ipv6() {
        assert_eq!(
            parse("[::1]"),
            RemoteSpec {
                name: "::1".into(),
                address: "::1".into(),
                service: "5004".into(),
            }
        );
    }

    #[test]
    fn bracketed_ipv6_with_service() {
        assert_eq!(
            parse("[::1]:5010"),
            RemoteSpec {
                name: "::1".into(),
                address: "::1".into(),
                service: "5010".into(),
            }
        );
    }

    #[test]
    fn too_many_fields() {
        assert!(RemoteSpec::parse("a:b:c:d").is_err());
    }

    #[test]
    fn unterminated_bracket() {
        assert!(RemoteSpec::parse("synth:[::1:5010").is_err());
    }

    #[test]
    fn junk_after_bracket() {
        assert!(RemoteSpec::parse("synth:[::1]5010").is_err());
    }

    #[test]
    fn empty_spec() {
        assert!(RemoteSpec::parse("").is_err());
        assert!(RemoteSpec::parse("piano:").is_err());
    }
}
