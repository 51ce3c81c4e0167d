//! End-to-end roundtrip through the full engine: a server accepting a
//! client's CONNECT handshake, a user command dispatched through the
//! shared registry, and a `send_r` request/response correlated purely by
//! `response_id`.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use flux_network::{
    DisconnectReason, PeerKey, ServerEngine, ServerHandlers, client::ClientEngine,
    registry::CommandRegistry,
};

struct Handlers {
    connected: Arc<AtomicU32>,
}

impl ServerHandlers<()> for Handlers {
    fn create_client(&mut self, _peer: PeerKey) -> Option<()> {
        Some(())
    }

    fn on_connected(&mut self, _peer: PeerKey, _state: &()) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&mut self, _peer: PeerKey, _state: &(), _reason: DisconnectReason) {}
}

fn pump_until(mut f: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

const ECHO_COMMAND: u16 = 10;

#[test]
fn client_server_user_command_and_request_response_roundtrip() {
    // Land on a free port via a throwaway probe, the same pattern the
    // broadcast-burst test uses.
    let probe =
        std::net::TcpListener::bind(SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)))
            .unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let server_registry = Arc::new(CommandRegistry::new());
    server_registry.add_command::<_, Vec<u8>>(&[ECHO_COMMAND], |b| Some(b.to_vec())).unwrap();

    let connected = Arc::new(AtomicU32::new(0));
    let mut server =
        ServerEngine::bind(addr, None, server_registry, Handlers { connected: connected.clone() })
            .unwrap();
    server.add_responder(ECHO_COMMAND, |_peer, payload| payload.to_vec());

    let client_registry = Arc::new(CommandRegistry::new());
    let mut client = ClientEngine::connect(addr, Duration::from_secs(2), client_registry).unwrap();

    // Drive both sides until the CONNECT handshake lands on the server —
    // `on_connected` strictly precedes the first user-command dispatch.
    let handshake_ok = pump_until(
        || {
            server.poll();
            client.poll();
            connected.load(Ordering::SeqCst) == 1
        },
        Duration::from_secs(2),
    );
    assert!(handshake_ok, "server never observed the client's CONNECT handshake");
    assert_eq!(server.client_count(), 1);

    // Request/response: client send_r against the server's registered
    // responder, correlated purely by response_id. `poll` consumes the
    // handle's result exactly once, so stash it the first time it resolves.
    let mut handle = client.send_r_default(ECHO_COMMAND, b"ping-payload");
    let mut outcome = None;
    let resolved = pump_until(
        || {
            server.poll();
            client.poll();
            outcome = handle.poll();
            outcome.is_some()
        },
        Duration::from_secs(2),
    );
    assert!(resolved, "send_r never resolved");
    assert_eq!(outcome.unwrap().unwrap(), b"ping-payload".to_vec());

    client.disconnect();
}
