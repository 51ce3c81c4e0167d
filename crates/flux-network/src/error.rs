use thiserror::Error;

/// Errors surfaced across the transport boundary: socket create/bind/connect/send/receive.
///
/// Client engines surface these via `on_disconnected(SocketError)`; the server engine
/// just closes the offending peer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("socket io failed: {0}")]
    Io(#[source] std::io::Error),
}

/// Bad header, checksum, sentinel or length. Always recovered locally by the
/// framer (discard up to the next sentinel); never propagated to the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("missing tcp sentinel")]
    MissingSentinel,
    #[error("payload length {0} exceeds max payload size {1}")]
    PayloadTooLarge(u16, usize),
}

/// Decompression failed, or the payload was shorter than the header claimed.
/// Recovered the same way as [`FramingError`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown compression mode {0}")]
    UnknownCompression(u8),
    #[error("non-zero encryption mode {0} rejected")]
    UnsupportedEncryption(u8),
    #[error("decompression failed")]
    DecompressFailure,
}

/// A reassembly entry's TTL elapsed before all chunks arrived.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("reassembly timed out before completion")]
pub struct ReassemblyError;

/// Caller misuse of the command registry: registering a reserved id, or
/// subscribing to an id with no deserializer. Reported back to the caller,
/// never silently swallowed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMisuse {
    #[error("command id {0:#06x} is reserved, user ids must be <= USER_COMMAND_LIMIT")]
    ReservedCommandId(u16),
    #[error("command id {0:#06x} has no registered deserializer")]
    UnknownCommandId(u16),
}

/// Outcome of a `send`/`send_to_all` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    None,
    Invalid,
    SocketError,
    Disconnected,
    PacketTooLarge,
}

/// Why a client was removed from the client table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    SocketError,
    TimeoutReset,
    Unspecified,
}

/// Outcome of awaiting `send_r`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    Timeout,
    Cancelled,
}
