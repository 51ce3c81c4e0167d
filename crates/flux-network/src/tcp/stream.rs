use std::{
    collections::VecDeque,
    io::{self, IoSlice, Read, Write},
    net::SocketAddr,
};

use flux_communication::Timer;
use flux_timing::Nanos;
use mio::{Interest, Registry, Token, event::Event};
use tracing::{debug, warn};

/// Controls emission of allocation telemetry on the backlog path.
///
/// Has no effect on framing or delivery: this stream is a raw byte pump,
/// framing lives one layer up in the engine's [`crate::ring::CircularBuffer`]
/// + [`crate::framer`].
#[derive(Clone, Copy)]
pub enum TcpTelemetry {
    Disabled,
    Enabled { app_name: &'static str },
}

#[derive(Clone, Copy, Debug)]
struct TcpTimers {
    alloc: Timer,
}

impl TcpTimers {
    fn new(app_name: &'static str, label: &str) -> Self {
        Self { alloc: Timer::new(app_name, format!("tcp_alloc_{label}")) }
    }
}

const RX_BUF_SIZE: usize = 32 * 1024;

/// Response type for all external calls.
///
/// `Alive` means the connection is still usable.
/// `Disconnected` means the peer is gone and the connection must be rebuilt.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

enum ReadOutcome<'a> {
    Data(&'a [u8]),
    WouldBlock,
    Disconnected,
}

/// Single mio-backed TCP connection, carrying raw bytes with no framing of
/// its own.
///
/// Outbound:
///   - `send(bytes)` writes non-blocking to the socket.
///   - Any unwritten remainder is queued (this path allocates).
///   - Backlogged bytes are flushed whenever the socket becomes writable.
///
/// Inbound:
///   - `poll_with` reads whatever bytes the kernel has ready and hands them,
///     unparsed, to the caller's callback. The caller is responsible for
///     feeding them into its own framing state (a per-peer ring buffer).
///
/// Reconnect handling:
///   - If `ConnState::Disconnected` is returned the caller must treat the
///     connection as dead and rebuild the state.
pub struct TcpStream {
    stream: mio::net::TcpStream,
    peer_addr: SocketAddr,
    token: Token,

    rx_buf: Vec<u8>,
    send_backlog: VecDeque<Vec<u8>>,

    /// True if WRITABLE interest is currently registered in `poll`.
    /// Invariant: `writable_armed == !send_backlog.is_empty()`
    writable_armed: bool,

    timers: Option<TcpTimers>,
}

impl TcpStream {
    #[inline(never)]
    pub(crate) fn from_stream_with_telemetry(
        stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
        token: Token,
        telemetry: TcpTelemetry,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;

        let timers = match telemetry {
            TcpTelemetry::Disabled => None,
            TcpTelemetry::Enabled { app_name } => {
                let local_port = stream.local_addr().map(|a| a.port()).unwrap_or(0);
                let peer = peer_addr.to_string();
                let stream_label = format!("{local_port}-{peer}");
                Some(TcpTimers::new(app_name, &stream_label))
            }
        };

        Ok(Self {
            stream,
            peer_addr,
            token,
            rx_buf: vec![0; RX_BUF_SIZE],
            send_backlog: VecDeque::with_capacity(64),
            writable_armed: false,
            timers,
        })
    }

    /// Polls the socket and calls `on_bytes` with every chunk the kernel had
    /// ready. Chunks are not aligned to any message boundary; the caller
    /// feeds them into its own ring buffer and framer.
    #[inline]
    pub fn poll_with<F>(&mut self, registry: &Registry, ev: &Event, on_bytes: &mut F) -> ConnState
    where
        F: for<'a> FnMut(Token, &'a [u8]),
    {
        if ev.is_readable() {
            loop {
                match self.read_chunk() {
                    ReadOutcome::Data(bytes) => on_bytes(self.token, bytes),
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Disconnected => return ConnState::Disconnected,
                }
            }
        }

        if ev.is_writable() && self.drain_backlog(registry) == ConnState::Disconnected {
            return ConnState::Disconnected;
        }

        ConnState::Alive
    }

    /// Writes `frame` immediately, or enqueues it (and arms WRITABLE
    /// notifications) if the socket would block or already has a backlog.
    #[inline]
    pub fn send(&mut self, registry: &Registry, frame: &[u8]) -> ConnState {
        if !self.send_backlog.is_empty() {
            return self.enqueue_back(registry, self.alloc_vec(frame));
        }

        match self.stream.write_vectored(&[IoSlice::new(frame)]) {
            Ok(0) => {
                warn!("tcp: stream failed to write, disconnecting");
                ConnState::Disconnected
            }
            Ok(n) if n == frame.len() => ConnState::Alive,
            Ok(n) => {
                let remainder = self.alloc_vec(&frame[n..]);
                self.enqueue_front(registry, remainder)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue_back(registry, self.alloc_vec(frame))
            }
            Err(err) => {
                warn!(?err, "tcp: stream write fail");
                ConnState::Disconnected
            }
        }
    }

    #[inline]
    fn alloc_vec(&mut self, bytes: &[u8]) -> Vec<u8> {
        match &mut self.timers {
            Some(timers) => {
                let t0 = Nanos::now();
                let v = bytes.to_vec();
                timers.alloc.emit_latency_from_nanos(t0, Nanos::now());
                v
            }
            None => bytes.to_vec(),
        }
    }

    /// Flush queued data until kernel blocks, queue empty, or the stream
    /// disconnects.
    #[inline]
    fn drain_backlog(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Disconnected,

                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }

                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,

                Err(err) => {
                    debug!(?err, "tcp: write from backlog");
                    return ConnState::Disconnected;
                }
            }
        }

        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) =
                registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(?err, "tcp: reregister drop writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    /// Reads whatever bytes are currently available into `rx_buf`.
    #[inline]
    fn read_chunk(&mut self) -> ReadOutcome<'_> {
        match self.stream.read(&mut self.rx_buf) {
            Ok(0) => ReadOutcome::Disconnected,
            Ok(n) => ReadOutcome::Data(&self.rx_buf[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(err) => {
                debug!(?err, "tcp: read");
                ReadOutcome::Disconnected
            }
        }
    }

    #[inline]
    fn enqueue_front(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_front(data);
        self.arm_writable(registry)
    }

    #[inline]
    fn enqueue_back(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        self.arm_writable(registry)
    }

    /// Arm WRITABLE notifications when transitioning from empty -> non-empty
    /// queue.
    #[inline]
    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "tcp: poll reregister");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    pub fn close(&mut self, registry: &Registry) -> SocketAddr {
        debug!("terminating connection");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.peer_addr
    }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a mio TcpStream.
pub(crate) fn set_socket_buf_size(stream: &mio::net::TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
