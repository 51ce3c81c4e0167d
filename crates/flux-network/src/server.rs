//! Server engine (C9): accepts TCP and UDP peers, terminates the five
//! reserved commands, and dispatches everything else through the shared
//! [`CommandRegistry`] (fire-and-forget) or a per-command responder
//! (request/response, driven by `send_r` on the client side).
//!
//! Driven cooperatively: the embedding application calls [`ServerEngine::poll`]
//! from its own loop, the same way the rest of this workspace drives
//! `flux_timing::Repeater`-based timers rather than spawning dedicated
//! threads per connection.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use flux_timing::Repeater;
use mio::Token;
use spin::Mutex;
use tracing::{debug, warn};

use crate::{
    client_table::ClientTable,
    codec,
    error::{DisconnectReason, SendError},
    frame::{self, CompressionMode, TCP_PAYLOAD_SIZE_MAX, UDP_PAYLOAD_SIZE_MAX},
    framer::{self, ReadyFrame},
    pool::BytePool,
    reassembly::Reassembler,
    registry::CommandRegistry,
    ring::CircularBuffer,
    tcp::{PollEvent, SendBehavior, TcpConnector},
    udp::UdpTransport,
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

/// Transport-level identity of a peer, unified across TCP and UDP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerKey {
    Tcp(Token),
    Udp(SocketAddr),
}

type Responder = Arc<dyn Fn(PeerKey, &[u8]) -> Vec<u8> + Send + Sync>;

/// User-supplied client lifecycle hooks, given ownership of the per-client
/// state `S`.
pub trait ServerHandlers<S>: Send {
    /// Called on CONNECT. Returning `None` rejects the peer (server replies
    /// with DISCONNECT and closes the socket).
    fn create_client(&mut self, peer: PeerKey) -> Option<S>;
    fn on_connected(&mut self, peer: PeerKey, state: &S);
    fn on_disconnected(&mut self, peer: PeerKey, state: &S, reason: DisconnectReason);
}

struct PeerRx {
    /// `Some` for TCP peers (ring-buffered stream); `None` for UDP peers,
    /// where every datagram is a standalone frame candidate.
    ring: Option<CircularBuffer>,
    reassembler: Reassembler,
}

impl PeerRx {
    fn tcp() -> Self {
        Self { ring: Some(CircularBuffer::with_capacity(frame::RING_CAPACITY_MIN * 16)), reassembler: Reassembler::new() }
    }

    fn udp() -> Self {
        Self { ring: None, reassembler: Reassembler::new() }
    }
}

/// Server-side message/dispatch engine (C9).
pub struct ServerEngine<S, H> {
    tcp: TcpConnector,
    udp: Option<UdpTransport>,
    pool: BytePool,
    registry: Arc<CommandRegistry>,
    responders: Mutex<HashMap<u16, Responder>>,
    clients: ClientTable<PeerKey, S>,
    peer_rx: HashMap<PeerKey, PeerRx>,
    handlers: H,
    reassembly_sweep: Repeater,
    disposing: bool,
    dispose_linger: Option<Repeater>,
    next_packet_id: AtomicU32,
}

impl<S, H> ServerEngine<S, H>
where
    H: ServerHandlers<S>,
{
    pub fn bind(
        tcp_addr: SocketAddr,
        udp_addr: Option<SocketAddr>,
        registry: Arc<CommandRegistry>,
        handlers: H,
    ) -> std::io::Result<Self> {
        let mut tcp = TcpConnector::default();
        tcp.listen_at(tcp_addr).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "couldn't bind tcp listener")
        })?;
        let udp = udp_addr.map(UdpTransport::bind).transpose()?;

        Ok(Self {
            tcp,
            udp,
            pool: BytePool::new(),
            registry,
            responders: Mutex::new(HashMap::new()),
            clients: ClientTable::new(),
            peer_rx: HashMap::new(),
            handlers,
            reassembly_sweep: Repeater::every(crate::reassembly::reassembly_ttl()),
            disposing: false,
            dispose_linger: None,
            next_packet_id: AtomicU32::new(1),
        })
    }

    /// Registers a request/response handler for `command_id`. Incoming
    /// frames for this id that carry a nonzero `response_id` are answered
    /// automatically with `handler`'s return value.
    pub fn add_responder<F>(&self, command_id: u16, handler: F)
    where
        F: Fn(PeerKey, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.responders.lock().insert(command_id, Arc::new(handler));
    }

    /// Drives one non-blocking tick: accepts/reads TCP, reads UDP, expires
    /// stale reassembly state, and runs the dispose linger countdown.
    ///
    /// Dispatch never sends through the transport from inside its own
    /// `poll_with` callback (that would double-borrow it); instead it queues
    /// outbound frames and disconnects, flushed once `poll_with` returns.
    pub fn poll(&mut self) {
        if self.reassembly_sweep.fired() {
            for rx in self.peer_rx.values_mut() {
                rx.reassembler.expire_stale(&self.pool);
            }
        }

        let pool = &self.pool;
        let registry = &self.registry;
        let responders = &self.responders;
        let clients = &mut self.clients;
        let handlers = &mut self.handlers;
        let peer_rx = &mut self.peer_rx;
        let mut outbox: Vec<PendingSend> = Vec::new();
        let mut disconnects: Vec<Token> = Vec::new();

        self.tcp.poll_with(|ev| match ev {
            PollEvent::Accept { stream, peer_addr, .. } => {
                debug!(?peer_addr, "server: tcp accept");
                peer_rx.insert(PeerKey::Tcp(stream), PeerRx::tcp());
            }
            PollEvent::Disconnect { token } => {
                let peer = PeerKey::Tcp(token);
                peer_rx.remove(&peer);
                if let Some(state) = clients.remove(&peer) {
                    debug!(?peer, "server: client disconnected (socket error)");
                    handlers.on_disconnected(peer, &state, DisconnectReason::SocketError);
                }
            }
            PollEvent::Bytes { token, bytes } => {
                let peer = PeerKey::Tcp(token);
                let Some(rx) = peer_rx.get_mut(&peer) else { return };
                let Some(ring) = rx.ring.as_mut() else { return };
                ring.write(bytes);
                framer::pump_tcp(ring, pool, &mut rx.reassembler, TCP_PAYLOAD_SIZE_MAX, |f| {
                    dispatch_frame(
                        peer, f, pool, registry, responders, clients, handlers, &mut outbox,
                        &mut disconnects,
                    );
                });
            }
        });

        if let Some(udp) = &mut self.udp {
            let mut pending: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
            udp.poll_with(|addr, bytes| pending.push((addr, bytes.to_vec())));
            for (addr, datagram) in pending {
                let peer = PeerKey::Udp(addr);
                let rx = peer_rx.entry(peer).or_insert_with(PeerRx::udp);
                framer::decode_udp(&datagram, pool, &mut rx.reassembler, UDP_PAYLOAD_SIZE_MAX, |f| {
                    dispatch_frame(
                        peer, f, pool, registry, responders, clients, handlers, &mut outbox,
                        &mut disconnects,
                    );
                });
            }
        }

        for token in disconnects {
            self.tcp.disconnect(token);
        }
        let next_packet_id = &self.next_packet_id;
        for pending in outbox {
            let _ = send_frame(
                &mut self.tcp,
                self.udp.as_ref(),
                pending.peer,
                pending.command_id,
                pending.response_id,
                &pending.payload,
                &mut || alloc_packet_id(next_packet_id),
            );
        }

        if self.disposing
            && let Some(linger) = &mut self.dispose_linger
            && linger.fired()
        {
            self.tcp.disconnect_outbound();
        }
    }

    /// Snapshots the client table and sends `payload` to every connected
    /// TCP client. UDP peers are not part of broadcast (no reliable
    /// membership signal beyond the last datagram seen).
    pub fn send_to_all(&mut self, command_id: u16, payload: &[u8]) -> SendError {
        if frame::is_reserved_command(command_id) {
            return SendError::Invalid;
        }
        if self.clients.is_empty() {
            return SendError::Disconnected;
        }
        let mut out = Vec::new();
        let tcp = &mut self.tcp;
        let next_packet_id = &self.next_packet_id;
        let result = codec::encode_message(
            &mut out,
            command_id,
            0,
            payload,
            CompressionMode::Lz4,
            TCP_PAYLOAD_SIZE_MAX,
            true,
            || alloc_packet_id(next_packet_id),
            |frame| tcp.send(SendBehavior::Broadcast, frame),
        );
        match result {
            Ok(()) => SendError::None,
            Err(_) => SendError::PacketTooLarge,
        }
    }

    /// Sends `payload` under `command_id` to `peer`, transparently
    /// fragmenting it into chunked frames if it exceeds the transport's max
    /// payload size.
    pub fn send(&mut self, peer: PeerKey, command_id: u16, payload: &[u8]) -> SendError {
        if !self.clients.contains(&peer) {
            return SendError::Disconnected;
        }
        let next_packet_id = &self.next_packet_id;
        send_frame(&mut self.tcp, self.udp.as_ref(), peer, command_id, 0, payload, &mut || {
            alloc_packet_id(next_packet_id)
        })
    }

    /// Begins an idempotent graceful shutdown: stops accepting new outbound
    /// reconnect attempts and, after a 10s linger, tears the transport down.
    /// Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.disposing {
            return;
        }
        self.disposing = true;
        self.dispose_linger = Some(Repeater::every(flux_timing::Duration::from_secs(10)));
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

/// A frame queued for sending once the transport's `poll_with` call returns.
struct PendingSend {
    peer: PeerKey,
    command_id: u16,
    response_id: u32,
    payload: Vec<u8>,
}

#[allow(clippy::too_many_arguments)]
fn dispatch_frame<S, H: ServerHandlers<S>>(
    peer: PeerKey,
    frame: ReadyFrame,
    pool: &BytePool,
    registry: &Arc<CommandRegistry>,
    responders: &Mutex<HashMap<u16, Responder>>,
    clients: &mut ClientTable<PeerKey, S>,
    handlers: &mut H,
    outbox: &mut Vec<PendingSend>,
    disconnects: &mut Vec<Token>,
) {
    let reply = |outbox: &mut Vec<PendingSend>, command_id: u16, response_id: u32, payload: Vec<u8>| {
        outbox.push(PendingSend { peer, command_id, response_id, payload });
    };

    match frame.command_id {
        frame::PING => reply(outbox, frame::PING, frame.response_id, frame.payload),
        frame::CONNECT => {
            let payload = frame.payload;
            let rejected = clients
                .insert_if(peer, |p| handlers.create_client(p))
                .inspect(|state| handlers.on_connected(peer, state))
                .is_none();
            if rejected {
                reply(outbox, frame::DISCONNECT, 0, Vec::new());
                if let PeerKey::Tcp(token) = peer {
                    disconnects.push(token);
                }
            } else {
                reply(outbox, frame::CONNECT, 0, payload);
            }
        }
        frame::DISCONNECT => {
            if let Some(state) = clients.remove(&peer) {
                debug!(?peer, "server: client disconnected (graceful)");
                handlers.on_disconnected(peer, &state, DisconnectReason::Graceful);
            }
            if let PeerKey::Tcp(token) = peer {
                disconnects.push(token);
            }
        }
        frame::UDP_CONNECT => {
            // UDP peers self-identify on first datagram; nothing further to do
            // beyond acknowledging so the client can measure reachability.
            reply(outbox, frame::UDP_CONNECT, 0, Vec::new());
        }
        frame::CLIENT_INFO => {
            pool.put(frame.payload);
        }
        id => {
            let responder = responders.lock().get(&id).cloned();
            if frame.response_id != 0 {
                if let Some(responder) = responder {
                    let reply_payload = responder(peer, &frame.payload);
                    reply(outbox, id, frame.response_id, reply_payload);
                    return;
                }
            }
            registry.dispatch(id, &frame.payload);
        }
    }
}

fn send_frame(
    tcp: &mut TcpConnector,
    udp: Option<&UdpTransport>,
    peer: PeerKey,
    command_id: u16,
    response_id: u32,
    payload: &[u8],
    next_packet_id: &mut dyn FnMut() -> u32,
) -> SendError {
    let mut out = Vec::new();
    match peer {
        PeerKey::Tcp(token) => {
            let result = codec::encode_message(
                &mut out,
                command_id,
                response_id,
                payload,
                CompressionMode::Lz4,
                TCP_PAYLOAD_SIZE_MAX,
                true,
                next_packet_id,
                |frame| tcp.send(SendBehavior::Single(token), frame),
            );
            match result {
                Ok(()) => SendError::None,
                Err(_) => SendError::PacketTooLarge,
            }
        }
        PeerKey::Udp(addr) => {
            let Some(udp) = udp else {
                warn!("server: no udp transport bound, dropping send to {addr}");
                return SendError::Invalid;
            };
            let result = codec::encode_message(
                &mut out,
                command_id,
                response_id,
                payload,
                CompressionMode::None,
                UDP_PAYLOAD_SIZE_MAX,
                false,
                next_packet_id,
                |frame| udp.send_to(addr, frame),
            );
            match result {
                Ok(()) => SendError::None,
                Err(_) => SendError::PacketTooLarge,
            }
        }
    }
}
