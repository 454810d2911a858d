//! Shared test harness: a scripted mock switcher on loopback UDP.
//!
//! The mock owns a plain `tokio::net::UdpSocket` and speaks raw packets via
//! the crate's own codec types, so tests can assert on exact wire bytes.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use atem_client::packet::{flags, OwnedPacket, PacketView, HEADER_LEN, PRE_SESSION_ID};
use atem_client::{ConnectionConfig, StateEvent};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Session id the mock mints on accept.
pub const SESSION: u16 = 0x5555;

const RECV_DEADLINE: Duration = Duration::from_secs(5);

pub struct MockSwitcher {
    socket: UdpSocket,
    client_addr: Option<SocketAddr>,
}

impl MockSwitcher {
    /// Bind on an OS-assigned loopback port.
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock");
        MockSwitcher {
            socket,
            client_addr: None,
        }
    }

    /// Address the client should connect to.
    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("mock local addr")
    }

    /// A client config pointed at this mock with the given probe interval.
    pub fn config(&self, recv_timeout_ms: u32) -> ConnectionConfig {
        let addr = self.addr();
        let mut config = ConnectionConfig::new(addr.ip());
        config.peer_port = addr.port();
        config.recv_timeout_ms = recv_timeout_ms;
        config
    }

    /// Receive the next datagram from the client, remembering its address.
    pub async fn recv(&mut self) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let (n, addr) = timeout(RECV_DEADLINE, self.socket.recv_from(&mut buf))
            .await
            .expect("mock recv timed out")
            .expect("mock recv failed");
        self.client_addr = Some(addr);
        buf[..n].to_vec()
    }

    /// Receive until `matches` accepts a datagram, discarding the rest.
    pub async fn recv_matching(&mut self, matches: impl Fn(&PacketView<'_>) -> bool) -> Vec<u8> {
        loop {
            let datagram = self.recv().await;
            if let Ok(view) = PacketView::parse(&datagram) {
                if matches(&view) {
                    return datagram;
                }
            }
        }
    }

    /// Send raw bytes to the last seen client address.
    pub async fn send(&self, datagram: &[u8]) {
        let addr = self.client_addr.expect("no client address yet");
        self.socket
            .send_to(datagram, addr)
            .await
            .expect("mock send failed");
    }

    /// Build and send a command-carrying ack-request packet.
    pub async fn send_commands(&self, local_id: u16, commands: &[(&[u8; 4], &[u8])]) {
        let packet = command_packet(SESSION, local_id, commands);
        self.send(packet.as_bytes()).await;
    }

    /// Drive the full handshake: HELLO → accept → HELLO_ACK → init-done
    /// (local id 1) → ACK. Returns once the client has acknowledged.
    pub async fn establish(&mut self) {
        // Client hello.
        let hello = self
            .recv_matching(|view| view.has(flags::HELLO))
            .await;
        let view = PacketView::parse(&hello).expect("hello parse");
        assert_eq!(view.session_id(), PRE_SESSION_ID);
        assert_eq!(view.length(), 20);
        assert_eq!(view.payload()[0], 0x01);

        // Accept it.
        let mut accept = OwnedPacket::new(flags::HELLO, SESSION, 20);
        accept.payload_mut()[0] = 0x02;
        self.send(accept.as_bytes()).await;

        // Client acknowledges the handshake.
        self.recv_matching(|view| view.has(flags::HELLO_ACK) && !view.has(flags::HELLO))
            .await;

        // End of (empty) state burst: bare ack-request with id 1.
        let mut done = OwnedPacket::new(
            flags::ACK_REQUEST | flags::HELLO_ACK,
            SESSION,
            HEADER_LEN,
        );
        done.set_local_id(1);
        self.send(done.as_bytes()).await;

        // Client acks it; the session is active on its side.
        self.recv_matching(|view| view.has(flags::ACK_RESPONSE) && view.ack_id() == 1)
            .await;
    }
}

/// Assemble an ack-request packet carrying the given command TLVs.
pub fn command_packet(
    session_id: u16,
    local_id: u16,
    commands: &[(&[u8; 4], &[u8])],
) -> OwnedPacket {
    let total = HEADER_LEN
        + commands
            .iter()
            .map(|(_, body)| 8 + body.len())
            .sum::<usize>();
    let mut packet = OwnedPacket::new(flags::ACK_REQUEST, session_id, total);
    packet.set_local_id(local_id);

    let payload = packet.payload_mut();
    let mut offset = 0;
    for (tag, body) in commands {
        let len = (8 + body.len()) as u16;
        payload[offset..offset + 2].copy_from_slice(&len.to_be_bytes());
        payload[offset + 4..offset + 8].copy_from_slice(&tag[..]);
        payload[offset + 8..offset + 8 + body.len()].copy_from_slice(body);
        offset += len as usize;
    }
    packet
}

/// An event sink that appends to a shared vector.
pub fn recording_sink() -> (
    Arc<Mutex<Vec<StateEvent>>>,
    impl Fn(StateEvent) + Send + Sync + 'static,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let writer = Arc::clone(&events);
    (events, move |event: StateEvent| {
        writer.lock().unwrap().push(event);
    })
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// `PrgI` body bytes for an m/e and raw source value.
pub fn prgi_body(me: u8, source: u16) -> [u8; 4] {
    let source = source.to_be_bytes();
    [me, 0, source[0], source[1]]
}
