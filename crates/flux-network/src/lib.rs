//! Message-oriented TCP/UDP client-server framing and dispatch engine.
//!
//! Turns raw byte streams (TCP) and datagrams (UDP) into application-level
//! commands with associated payloads: framing plus in-ring-buffer
//! resynchronization on TCP (`ring`, `framer`), multi-chunk reassembly
//! (`reassembly`), payload encode/decode with optional checksum and
//! compression (`codec`), and dispatch to per-command handlers with
//! request/response correlation (`registry`, `response`).
//!
//! Socket creation/polling lives under `tcp`/`udp`; the compression
//! primitive behind the wire's `Lz4` bit is `zstd`, consumed through the
//! narrow `codec::compress`/`codec::decompress` interface.

pub mod client;
pub mod client_table;
pub mod codec;
pub mod error;
pub mod frame;
pub mod framer;
pub mod pool;
pub mod reassembly;
pub mod registry;
pub mod response;
pub mod ring;
pub mod server;
pub mod tcp;
pub mod udp;

pub use client::ClientEngine;
pub use error::{DisconnectReason, ProtocolMisuse, ResponseOutcome, SendError, TransportError};
pub use frame::{CLIENT_INFO, CONNECT, DISCONNECT, PING, UDP_CONNECT, USER_COMMAND_LIMIT};
pub use registry::{CommandRegistry, SubscriptionId};
pub use server::{PeerKey, ServerEngine, ServerHandlers};
