//! Keeper tests: heartbeat echo, round-trip tracking, dead-peer teardown
//!
//! The timers are shortened through `ConnConfig` so a full heartbeat cycle
//! and a dead-peer declaration both fit in test time.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cloak_protocol::{ConnPacket, MAGIC_WINDOW};
use cloak_tun::mock::MockTun;
use cloak_tun::TunDevice;
use cloakwire_conn::{ClientConn, ClientHandler, ConnConfig, ServerConn, ServerHandler};
use tokio::time::timeout;

const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const CLIENT_PORT: u16 = 5000;
const SERVER_PORT: u16 = 6000;

#[derive(Default)]
struct CountingClient {
    disconnects: AtomicUsize,
    data: Mutex<Vec<Vec<u8>>>,
}

impl ClientHandler for CountingClient {
    fn on_connect(&self, _conn: &Arc<ClientConn>) {}

    fn on_data(&self, payload: &[u8]) {
        self.data.lock().unwrap().push(payload.to_vec());
    }

    fn on_disconnect(&self, _conn: &Arc<ClientConn>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CountingServer {
    data: Mutex<Vec<Vec<u8>>>,
}

impl ServerHandler for CountingServer {
    fn on_data(&self, payload: &[u8], _conn: &Arc<ServerConn>) {
        self.data.lock().unwrap().push(payload.to_vec());
    }

    fn on_disconnect(&self) {}
}

async fn establish(
    config: ConnConfig,
) -> (
    Arc<ClientConn>,
    Arc<CountingClient>,
    Arc<CountingServer>,
    Arc<MockTun>,
    Arc<MockTun>,
) {
    let (client_tun, server_tun) = MockTun::pair(1500);

    let server_handler = Arc::new(CountingServer::default());
    let _server = ServerConn::new(
        SERVER_IP,
        SERVER_PORT,
        server_tun.clone(),
        server_handler.clone(),
    )
    .await;

    let client_handler = Arc::new(CountingClient::default());
    let client = ClientConn::new(
        client_tun.clone(),
        CLIENT_IP,
        SERVER_IP,
        CLIENT_PORT,
        SERVER_PORT,
        config,
    )
    .await;
    client.add_handler(client_handler.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while client.state().await != "estb" {
        assert!(tokio::time::Instant::now() < deadline, "handshake stalled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    (client, client_handler, server_handler, client_tun, server_tun)
}

fn fast_config() -> ConnConfig {
    ConnConfig {
        keeper_interval_millis: 50,
        dead_threshold_millis: 10_000,
        ..ConnConfig::default()
    }
}

#[tokio::test]
async fn test_heartbeats_echoed_and_timed() {
    let (client, client_handler, server_handler, client_tun, server_tun) =
        establish(fast_config()).await;

    // Several heartbeat cycles.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The client stamped PSH frames with an 8-byte clock...
    let heartbeats: Vec<Vec<u8>> = client_tun
        .written_frames()
        .iter()
        .filter_map(|frame| {
            let cp = ConnPacket::decode(frame).ok()?;
            (cp.flags.is_push() && cp.payload.len() == 8).then(|| cp.payload.to_vec())
        })
        .collect();
    assert!(!heartbeats.is_empty(), "no heartbeats emitted");

    // ...the server echoed the stamps back verbatim, magic window intact...
    let echoes: Vec<(Vec<u8>, u16)> = server_tun
        .written_frames()
        .iter()
        .filter_map(|frame| {
            let cp = ConnPacket::decode(frame).ok()?;
            cp.flags
                .is_push()
                .then(|| (cp.payload.to_vec(), cp.window))
        })
        .collect();
    assert!(!echoes.is_empty(), "no echoes emitted");
    for (echo, window) in &echoes {
        assert!(heartbeats.contains(echo), "echo does not match any stamp");
        assert_eq!(echo.len(), 8);
        assert_eq!(*window, MAGIC_WINDOW);
    }

    // ...and the round trip was measured.
    let latency = client.latency().expect("no round-trip estimate");
    assert!(latency < Duration::from_secs(1));

    // Liveness traffic never reaches either upper layer.
    assert!(client_handler.data.lock().unwrap().is_empty());
    assert!(server_handler.data.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_dead_peer_tears_down_once() {
    let config = ConnConfig {
        keeper_interval_millis: 50,
        dead_threshold_millis: 300,
        ..ConnConfig::default()
    };
    let (client, client_handler, _server_handler, _client_tun, server_tun) =
        establish(config).await;

    // Let a few echoes arrive first, then the server falls off the network.
    tokio::time::sleep(Duration::from_millis(200)).await;
    server_tun.interrupt();

    timeout(Duration::from_secs(5), client.wait_stop())
        .await
        .expect("wait_stop did not return after the peer died");

    assert_eq!(client.state().await, "stop");
    assert_eq!(client_handler.disconnects.load(Ordering::SeqCst), 1);
    assert!(client.latency().is_some());
}
