//! Non-blocking UDP transport.
//!
//! Unlike TCP there's no ring buffer or sentinel: each datagram is a
//! complete frame candidate, handed straight to
//! [`crate::framer::decode_udp`].

use std::net::SocketAddr;

use mio::{Events, Interest, Poll, Token, net::UdpSocket as MioUdpSocket};
use tracing::{error, warn};

const UDP_TOKEN: Token = Token(0);
const RECV_BUF_SIZE: usize = 65_536;

pub struct UdpTransport {
    socket: MioUdpSocket,
    poll: Poll,
    events: Events,
    recv_buf: [u8; RECV_BUF_SIZE],
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let mut socket = MioUdpSocket::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry().register(&mut socket, UDP_TOKEN, Interest::READABLE)?;
        Ok(Self { socket, poll, events: Events::with_capacity(64), recv_buf: [0; RECV_BUF_SIZE] })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Polls once (non-blocking) and hands every datagram received to
    /// `on_datagram`.
    pub fn poll_with<F>(&mut self, mut on_datagram: F)
    where
        F: FnMut(SocketAddr, &[u8]),
    {
        if let Err(e) = self.poll.poll(&mut self.events, Some(std::time::Duration::ZERO)) {
            error!("udp: poll error: {e}");
            return;
        }
        if self.events.is_empty() {
            return;
        }
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((n, peer)) => on_datagram(peer, &self.recv_buf[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("udp: recv_from error: {e}");
                    break;
                }
            }
        }
    }

    pub fn send_to(&self, addr: SocketAddr, bytes: &[u8]) {
        if let Err(e) = self.socket.send_to(bytes, addr) {
            warn!("udp: send_to {addr} failed: {e}");
        }
    }
}
