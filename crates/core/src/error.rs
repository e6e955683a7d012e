//! Error types for the MIDI bridging library.

/// Errors that can occur across the bridging stack.
///
/// Variants map to specific failure modes:
///
/// - **Registry**: [`DuplicatePort`](Self::DuplicatePort),
///   [`UnknownPort`](Self::UnknownPort).
/// - **Configuration**: [`InvalidRemoteSpec`](Self::InvalidRemoteSpec).
/// - **Codec**: [`MalformedSysEx`](Self::MalformedSysEx),
///   [`MessageTooLarge`](Self::MessageTooLarge),
///   [`UnsupportedCommand`](Self::UnsupportedCommand),
///   [`TruncatedCommand`](Self::TruncatedCommand).
/// - **Host MIDI**: [`Backend`](Self::Backend).
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `create_port` was called with a name already in the registry.
    #[error("local port already exists: {0}")]
    DuplicatePort(String),

    /// Operation on a port name not in the registry.
    #[error("unknown local port: {0}")]
    UnknownPort(String),

    /// Malformed remote description. The accepted forms are `name`,
    /// `name:host` and `name:host:service`, with `[...]` bracketing for
    /// IPv6 literals (e.g. `synth:[::1]:5004`).
    #[error("invalid remote spec {spec:?}: {reason}")]
    InvalidRemoteSpec { spec: String, reason: &'static str },

    /// A SysEx command ended without its `0xF7` terminator.
    #[error("SysEx missing end byte (0xF7)")]
    MalformedSysEx,

    /// An encoded message would exceed the encoder's SysEx cap.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A MIDI command type this codec does not handle.
    #[error("unsupported MIDI command {0:#04x}")]
    UnsupportedCommand(u8),

    /// The buffer ended in the middle of a command's data bytes.
    #[error("truncated MIDI command {0:#04x}")]
    TruncatedCommand(u8),

    /// Failure reported by the host MIDI subsystem.
    #[error("MIDI backend error: {0}")]
    Backend(String),
}

/// Convenience alias for `Result<T, BridgeError>`.
pub type Result<T> = std::result::Result<T, BridgeError>;
