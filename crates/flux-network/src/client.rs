//! Client engine (C10): connects to a single server, drives the CONNECT
//! handshake, and exposes fire-and-forget `send` plus response-correlated
//! `send_r`.
//!
//! Like the server engine, this is driven cooperatively: the embedder calls
//! [`ClientEngine::poll`] from its own loop rather than spawning a thread
//! per connection.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Instant as StdInstant,
};

use flux_timing::{Duration, Repeater};
use mio::Token;
use tracing::debug;

use crate::{
    codec,
    error::{SendError, TransportError},
    frame::{self, CompressionMode, TCP_PAYLOAD_SIZE_MAX},
    framer::{self, ReadyFrame},
    pool::BytePool,
    reassembly::{Reassembler, reassembly_ttl},
    registry::CommandRegistry,
    response::{ResponseHandle, ResponseTable, default_timeout},
    ring::CircularBuffer,
    tcp::{PollEvent, SendBehavior, TcpConnector},
};

/// Allocates the next `packet_id` for a chunked send. Never yields 0, which
/// is reserved to mean "single-chunk" on the wire.
fn alloc_packet_id(counter: &AtomicU32) -> u32 {
    loop {
        let id = counter.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Server-assigned identity handed back during the CONNECT handshake.
#[derive(Debug, Clone, Default)]
pub struct ServerIdentity {
    pub client_id: Option<i64>,
    pub name: Option<String>,
    pub udp_peer_id: Option<u32>,
}

struct PendingSend {
    command_id: u16,
    response_id: u32,
    payload: Vec<u8>,
}

/// Client-side message/dispatch engine (C10), connected to exactly one
/// server.
pub struct ClientEngine {
    tcp: TcpConnector,
    server: Token,
    pool: BytePool,
    registry: Arc<CommandRegistry>,
    response_table: ResponseTable,
    ring: CircularBuffer,
    reassembler: Reassembler,
    reassembly_sweep: Repeater,
    response_sweep: Repeater,
    identity: ServerIdentity,
    last_rtt: Option<Duration>,
    alive: bool,
    next_packet_id: AtomicU32,
}

impl ClientEngine {
    /// Connects to `addr`, performing the CONNECT handshake, and fails with
    /// [`TransportError::Connect`] if no connection is established within
    /// `timeout`.
    pub fn connect(
        addr: SocketAddr,
        timeout: Duration,
        registry: Arc<CommandRegistry>,
    ) -> Result<Self, TransportError> {
        let mut tcp = TcpConnector::default();
        let mut server = tcp.connect(addr);

        let deadline = StdInstant::now() + std::time::Duration::from(timeout);
        while server.is_none() {
            tcp.poll_with(|ev| {
                if let PollEvent::Accept { stream, peer_addr, .. } = ev {
                    if peer_addr == addr {
                        server = Some(stream);
                    }
                }
            });
            if server.is_some() {
                break;
            }
            if StdInstant::now() >= deadline {
                return Err(TransportError::Connect(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )));
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let server = server.expect("loop only exits once server is Some");

        let mut engine = Self {
            tcp,
            server,
            pool: BytePool::new(),
            registry,
            response_table: ResponseTable::new(),
            ring: CircularBuffer::with_capacity(frame::RING_CAPACITY_MIN * 16),
            reassembler: Reassembler::new(),
            reassembly_sweep: Repeater::every(reassembly_ttl()),
            response_sweep: Repeater::every(Duration::from_millis(250)),
            identity: ServerIdentity::default(),
            last_rtt: None,
            alive: true,
            next_packet_id: AtomicU32::new(1),
        };
        engine.send_raw(frame::CONNECT, 0, &[]);
        Ok(engine)
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Fire-and-forget send. Returns `SendError::Invalid` for reserved
    /// command ids.
    pub fn send(&mut self, command_id: u16, payload: &[u8]) -> SendError {
        if frame::is_reserved_command(command_id) {
            return SendError::Invalid;
        }
        self.send_raw(command_id, 0, payload)
    }

    /// Sends `payload` under `command_id` and returns a handle that resolves
    /// once the server replies with the same `response_id` (or times out).
    pub fn send_r(&mut self, command_id: u16, payload: &[u8], timeout: Duration) -> ResponseHandle {
        let (id, handle) = self.response_table.register(timeout);
        self.send_raw(command_id, id, payload);
        handle
    }

    /// Convenience wrapper around `send_r` using the spec's default 60s
    /// timeout.
    pub fn send_r_default(&mut self, command_id: u16, payload: &[u8]) -> ResponseHandle {
        self.send_r(command_id, payload, default_timeout())
    }

    /// Sends a PING carrying the current time, for RTT measurement once the
    /// server echoes it back.
    pub fn ping(&mut self) {
        let now = flux_timing::Nanos::now().0 as i64;
        self.send_raw(frame::PING, 0, &now.to_le_bytes());
    }

    pub fn disconnect(&mut self) {
        if !self.alive {
            return;
        }
        debug!("client: disconnecting (graceful)");
        self.send_raw(frame::DISCONNECT, 0, &[]);
        self.tcp.disconnect(self.server);
        self.alive = false;
    }

    /// Encodes and sends a frame, transparently fragmenting `payload` into
    /// chunked frames if it exceeds the TCP max payload size.
    fn send_raw(&mut self, command_id: u16, response_id: u32, payload: &[u8]) -> SendError {
        let mut out = Vec::new();
        let tcp = &mut self.tcp;
        let server = self.server;
        let next_packet_id = &self.next_packet_id;
        let result = codec::encode_message(
            &mut out,
            command_id,
            response_id,
            payload,
            CompressionMode::Lz4,
            TCP_PAYLOAD_SIZE_MAX,
            true,
            || alloc_packet_id(next_packet_id),
            |frame| tcp.send(SendBehavior::Single(server), frame),
        );
        match result {
            Ok(()) => SendError::None,
            Err(_) => SendError::PacketTooLarge,
        }
    }

    /// Drives one non-blocking tick: reads from the server, dispatches
    /// complete frames, and sweeps expired reassembly/response entries.
    pub fn poll(&mut self) {
        if self.reassembly_sweep.fired() {
            self.reassembler.expire_stale(&self.pool);
        }
        if self.response_sweep.fired() {
            self.response_table.expire_timed_out();
        }

        let pool = &self.pool;
        let registry = &self.registry;
        let response_table = &self.response_table;
        let ring = &mut self.ring;
        let reassembler = &mut self.reassembler;
        let identity = &mut self.identity;
        let last_rtt = &mut self.last_rtt;
        let mut alive = self.alive;
        let mut outbox: Vec<PendingSend> = Vec::new();

        self.tcp.poll_with(|ev| match ev {
            PollEvent::Accept { .. } => {}
            PollEvent::Disconnect { .. } => {
                debug!("client: disconnected (socket error)");
                alive = false;
            }
            PollEvent::Bytes { bytes, .. } => {
                ring.write(bytes);
                framer::pump_tcp(ring, pool, reassembler, TCP_PAYLOAD_SIZE_MAX, |f| {
                    dispatch_frame(f, pool, registry, response_table, identity, last_rtt, &mut outbox);
                });
            }
        });

        self.alive = alive;
        for pending in outbox {
            self.send_raw(pending.command_id, pending.response_id, &pending.payload);
        }
    }
}

fn dispatch_frame(
    frame: ReadyFrame,
    pool: &BytePool,
    registry: &Arc<CommandRegistry>,
    response_table: &ResponseTable,
    identity: &mut ServerIdentity,
    last_rtt: &mut Option<Duration>,
    outbox: &mut Vec<PendingSend>,
) {
    // Response correlation takes priority over command interpretation for
    // every command, reserved or not: `send_r(PING, ...)` resolves through
    // the response table exactly like a user command would, while a plain
    // fire-and-forget `ping()` (response_id 0) still falls through to the
    // RTT branch below.
    if frame.response_id != 0 {
        response_table.complete(pool, frame.response_id, frame.payload);
        return;
    }

    match frame.command_id {
        frame::PING => {
            if let Ok(sent) = frame.payload.as_slice().try_into().map(i64::from_le_bytes) {
                let now = flux_timing::Nanos::now().0 as i64;
                *last_rtt = Some(Duration::from_nanos((now - sent).max(0) as u64));
            } else {
                // Server-initiated ping: echo it straight back.
                outbox.push(PendingSend {
                    command_id: frame::PING,
                    response_id: 0,
                    payload: frame.payload,
                });
            }
        }
        frame::CONNECT => debug!("client: connect handshake acknowledged"),
        frame::DISCONNECT => debug!("client: server requested disconnect"),
        frame::UDP_CONNECT => {
            if let Ok(bytes) = frame.payload.as_slice().try_into() {
                identity.udp_peer_id = Some(u32::from_le_bytes(bytes));
            }
        }
        frame::CLIENT_INFO => {
            if frame.payload.len() >= 8 {
                let client_id = i64::from_le_bytes(frame.payload[..8].try_into().unwrap());
                let name = String::from_utf8_lossy(&frame.payload[8..]).into_owned();
                identity.client_id = Some(client_id);
                identity.name = Some(name);
            }
        }
        id => {
            registry.dispatch(id, &frame.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_to_closed_port_times_out() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let registry = Arc::new(CommandRegistry::new());
        let result = ClientEngine::connect(addr, Duration::from_millis(50), registry);
        assert!(result.is_err());
    }
}
