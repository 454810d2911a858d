//! Session engine: handshake, reliability, retransmission and liveness.
//!
//! The engine owns the receive loop. It drives the connection state machine,
//! acknowledges every packet the switcher wants acknowledged, answers resend
//! requests from the retransmit cache, asks for packets the sequence tracker
//! reports missing, and probes the peer when the line goes quiet.
//!
//! ```text
//!        (spawn)
//!           │ send HELLO
//!           ▼
//!     ┌────────────┐  HELLO status 0x02: send HELLO_ACK   ┌──────────────┐
//!     │ HelloSent  ├─────────────────────────────────────▶│ Initializing │
//!     └────────────┘                                      └──────┬───────┘
//!           ▲        first ack-request with bare header          │
//!           │        (state burst complete)                      ▼
//!           │                                             ┌──────────────┐
//!           └──────── probes exhausted: reset mirror ─────┤    Active    │
//!                     drop cache, HELLO again             └──────────────┘
//! ```
//!
//! All mirror writes happen here, under the state mutex, in packet arrival
//! order as admitted by the sequence tracker.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::timeout;

use crate::config::ConnectionConfig;
use crate::delta;
use crate::event::{EventSink, StateEvent};
use crate::packet::{
    flags, OwnedPacket, PacketError, PacketView, HEADER_LEN, PRE_SESSION_ID, RECV_BUFFER_LEN,
};
use crate::sequence::SequenceTracker;
use crate::socket::Socket;
use crate::state::StateMirror;

/// HELLO status byte: connection accepted.
const HELLO_ACCEPTED: u8 = 0x02;
/// HELLO status byte: no connection slot available on the switcher.
const HELLO_FULL: u8 = 0x03;
/// HELLO status byte: reconnect attempt rejected.
const HELLO_RECONNECT_REJECTED: u8 = 0x04;

/// Mirror writes for one packet should finish well inside a video frame.
const APPLY_BUDGET: Duration = Duration::from_millis(16);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Everything that can go wrong talking to a switcher.
#[derive(Debug, Error)]
pub enum AtemError {
    /// Socket I/O failure on send or receive.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// The peer sent bytes that do not parse as a transport packet.
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] PacketError),
    /// An active-state packet carried the wrong session id.
    #[error("unexpected session id {found:#06x} (expected {expected:#06x})")]
    SessionMismatch { expected: u16, found: u16 },
    /// The switcher refused the handshake.
    #[error("handshake rejected by switcher (status {status:#04x})")]
    HandshakeRejected { status: u8 },
    /// A caller-supplied argument was unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The liveness threshold was exceeded.
    #[error("connection timed out")]
    Timeout,
}

impl AtemError {
    /// `true` when retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AtemError::Transport(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
            AtemError::Timeout => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection state machine
// ---------------------------------------------------------------------------

/// All possible states of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; a HELLO is about to go out.
    Disconnected,
    /// HELLO sent; waiting for the switcher's verdict.
    HelloSent,
    /// Handshake accepted; the switcher is replaying its full state.
    Initializing,
    /// State burst complete; normal delta traffic.
    Active,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

// ---------------------------------------------------------------------------
// Send-side shared state
// ---------------------------------------------------------------------------

/// State shared between sending callers and the receive loop, guarded by its
/// own mutex so callers never contend with mirror reads.
#[derive(Debug)]
pub(crate) struct SendState {
    /// Session id stamped on every outbound packet.
    pub(crate) session_id: u16,
    /// Last assigned local packet id.
    last_local_id: u16,
    /// Sent-but-unacknowledged packets, oldest first.
    unacked: Vec<OwnedPacket>,
}

impl SendState {
    pub(crate) fn new() -> Self {
        SendState {
            session_id: PRE_SESSION_ID,
            last_local_id: 0,
            unacked: Vec::new(),
        }
    }

    /// Next monotonic 15-bit packet id; zero is skipped because it means
    /// "no id" on the wire.
    pub(crate) fn assign_local_id(&mut self) -> u16 {
        self.last_local_id = self.last_local_id.wrapping_add(1) & 0x7FFF;
        if self.last_local_id == 0 {
            self.last_local_id = 1;
        }
        self.last_local_id
    }

    /// Cache a sent packet for retransmission, evicting the oldest entry
    /// when the cache is full (its retransmit is forfeit; the gap-filler
    /// path covers the loss).
    pub(crate) fn cache(&mut self, packet: OwnedPacket, max: usize) {
        if self.unacked.len() >= max.max(1) {
            self.unacked.remove(0);
        }
        self.unacked.push(packet);
    }

    /// The cached packet with local id `id`, if still held.
    pub(crate) fn lookup(&self, id: u16) -> Option<&OwnedPacket> {
        self.unacked.iter().find(|p| p.local_id() == id)
    }

    /// Drop the entry acknowledged by `ack`, plus anything more than 32 ids
    /// behind it (wrap-aware) as garbage collection.
    pub(crate) fn acknowledge(&mut self, ack: u16) {
        self.unacked.retain(|p| {
            let behind = ack.wrapping_sub(p.local_id()) & 0x7FFF;
            behind != 0 && !(behind > 32 && behind < 0x4000)
        });
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.unacked.len()
    }

    /// Forget the session: back to the pre-handshake id, empty cache.
    pub(crate) fn reset(&mut self) {
        self.session_id = PRE_SESSION_ID;
        self.last_local_id = 0;
        self.unacked.clear();
    }
}

/// Everything the receive loop and the caller-facing handle share.
pub(crate) struct Shared {
    pub(crate) socket: Socket,
    pub(crate) config: ConnectionConfig,
    pub(crate) mirror: Mutex<StateMirror>,
    pub(crate) send: Mutex<SendState>,
    pub(crate) connected: AtomicBool,
    pub(crate) sink: Box<dyn EventSink>,
}

// ---------------------------------------------------------------------------
// SessionEngine
// ---------------------------------------------------------------------------

/// Drives one connection; consumed by the receive loop task.
pub(crate) struct SessionEngine {
    shared: Arc<Shared>,
    state: SessionState,
    tracker: SequenceTracker,
    /// Last peer packet id we acknowledged; echoed in keepalive probes.
    remote_id: u16,
    /// Consecutive probe intervals without any inbound traffic.
    probes: u32,
    /// Missing ids already asked for; each gap is requested at most once.
    gap_requested: HashSet<i16>,
    /// Events observed during `Initializing`, delivered when `Active`.
    pending_events: Vec<StateEvent>,
}

impl SessionEngine {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        SessionEngine {
            shared,
            state: SessionState::Disconnected,
            tracker: SequenceTracker::new(),
            remote_id: 0,
            probes: 0,
            gap_requested: HashSet::new(),
            pending_events: Vec::new(),
        }
    }

    /// The receive loop. Runs until the owning task is aborted.
    pub(crate) async fn run(mut self) {
        let interval = self.shared.config.probe_interval();
        let mut buf = vec![0u8; RECV_BUFFER_LEN];

        self.send_hello().await;

        loop {
            match timeout(interval, self.shared.socket.recv(&mut buf)).await {
                Err(_elapsed) => self.on_probe_timeout().await,
                Ok(Err(e)) => {
                    // UDP is lossy by design; log and keep listening.
                    log::warn!("[atem] recv error: {e}");
                }
                Ok(Ok(n)) => {
                    self.probes = 0;
                    self.on_datagram(&buf[..n]).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    async fn on_probe_timeout(&mut self) {
        self.probes += 1;

        if self.state != SessionState::Active {
            // Handshake made no progress within a probe interval; start over.
            log::debug!("[atem] no handshake reply, resending HELLO");
            self.send_hello().await;
            return;
        }

        // Probe the peer with a bare ACK of the last id we saw.
        log::debug!(
            "[atem] silent for {} probe(s), sending keepalive",
            self.probes
        );
        let mut probe = OwnedPacket::new(flags::ACK_RESPONSE, self.current_session_id(), HEADER_LEN);
        probe.set_ack_id(self.remote_id);
        self.send_packet(&probe).await;

        if self.probes >= self.shared.config.liveness_probes_before_reset {
            log::warn!(
                "[atem] peer silent for {} probes: {}",
                self.probes,
                AtemError::Timeout
            );
            self.reset_session().await;
        }
    }

    /// Tear the session down and immediately try to re-establish it.
    async fn reset_session(&mut self) {
        let event = self.shared.mirror.lock().unwrap().reset();
        self.shared.connected.store(false, Ordering::Relaxed);
        self.shared.send.lock().unwrap().reset();
        self.tracker = SequenceTracker::new();
        self.remote_id = 0;
        self.gap_requested.clear();
        self.pending_events.clear();
        self.state = SessionState::Disconnected;
        // Hosts learn about the drop through the synthetic product-id event.
        self.shared.sink.on_event(event);
        self.send_hello().await;
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    async fn send_hello(&mut self) {
        let mut hello = OwnedPacket::new(flags::HELLO, PRE_SESSION_ID, 20);
        hello.payload_mut()[0] = 0x01;
        log::debug!("[atem] → HELLO");
        self.send_packet(&hello).await;
        self.state = SessionState::HelloSent;
        self.probes = 0;
    }

    async fn on_hello_reply(&mut self, view: PacketView<'_>) {
        let status = view.payload().first().copied().unwrap_or(0);
        match status {
            HELLO_ACCEPTED => {
                log::debug!(
                    "[atem] ← HELLO accepted, session {:#06x}",
                    view.session_id()
                );
                self.shared.send.lock().unwrap().session_id = view.session_id();
                let ack = OwnedPacket::new(flags::HELLO_ACK, view.session_id(), HEADER_LEN);
                self.send_packet(&ack).await;
                self.state = SessionState::Initializing;
            }
            HELLO_FULL => {
                log::warn!(
                    "[atem] {}: no free connection slot",
                    AtemError::HandshakeRejected { status }
                );
            }
            HELLO_RECONNECT_REJECTED => {
                log::warn!(
                    "[atem] {}: reconnect rejected",
                    AtemError::HandshakeRejected { status }
                );
            }
            other => {
                log::warn!("[atem] unknown HELLO status {other:#04x}, ignoring");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound path
    // -----------------------------------------------------------------------

    async fn on_datagram(&mut self, datagram: &[u8]) {
        let view = match PacketView::parse(datagram) {
            Ok(view) => view,
            Err(e) => {
                log::warn!("[atem] dropping datagram: {e}");
                return;
            }
        };

        let session_id = self.current_session_id();
        if self.state == SessionState::Active && view.session_id() != session_id {
            log::warn!(
                "[atem] dropping packet: {}",
                AtemError::SessionMismatch {
                    expected: session_id,
                    found: view.session_id(),
                }
            );
            return;
        }

        if view.has(flags::HELLO) {
            if self.state != SessionState::Active {
                self.on_hello_reply(view).await;
            }
            return;
        }

        // The state burst ends with the first bare ack-request.
        if self.state == SessionState::Initializing
            && view.has(flags::ACK_REQUEST)
            && view.length() as usize == HEADER_LEN
        {
            log::info!("[atem] initialization done, session active");
            self.shared.send.lock().unwrap().session_id = view.session_id();
            self.state = SessionState::Active;
            self.shared.connected.store(true, Ordering::Relaxed);
            for event in self.pending_events.drain(..) {
                self.shared.sink.on_event(event);
            }
        }

        if view.has(flags::ACK_RESPONSE) {
            self.shared.send.lock().unwrap().acknowledge(view.ack_id());
        }

        if view.has(flags::RESEND) {
            self.on_resend_request(view.resend_id(), view.session_id())
                .await;
        }

        // Admit the packet id once per packet, whatever it carries.
        let id = (view.local_id() & 0x7FFF) as i16;
        let fresh = if id != 0 { self.tracker.add(id) } else { true };

        if fresh && view.length() as usize > HEADER_LEN {
            self.apply_commands(view, id);
        } else if !fresh {
            log::debug!("[atem] duplicate packet {id}, re-acking only");
        }

        if view.has(flags::ACK_REQUEST) {
            self.remote_id = view.local_id();
            let mut ack = OwnedPacket::new(flags::ACK_RESPONSE, view.session_id(), HEADER_LEN);
            ack.set_ack_id(view.local_id());
            self.send_packet(&ack).await;
        }

        self.request_missing(view.session_id()).await;
    }

    /// Decode and apply every command in the packet under the state mutex,
    /// then emit (or buffer) the resulting events.
    fn apply_commands(&mut self, view: PacketView<'_>, packet_id: i16) {
        let mut events = Vec::new();
        let started = Instant::now();
        {
            let mut mirror = self.shared.mirror.lock().unwrap();
            for (tag, body) in view.commands() {
                match delta::decode(tag, body) {
                    Some(delta) => {
                        if let Some(kind) = mirror.apply(&delta, packet_id) {
                            events.push(StateEvent { kind, packet_id });
                        }
                    }
                    None => {
                        log::trace!(
                            "[atem] ignoring command {:?}",
                            String::from_utf8_lossy(&tag)
                        );
                    }
                }
            }
        }
        let held = started.elapsed();
        if held > APPLY_BUDGET {
            log::warn!("[atem] state mutex held for {held:?} applying packet {packet_id}");
        }

        if self.state == SessionState::Active {
            for event in events {
                self.shared.sink.on_event(event);
            }
        } else {
            self.pending_events.extend(events);
        }
    }

    /// Answer a retransmission request: replay the cached packet when we
    /// still hold it, otherwise synthesize a bare ack-request with the
    /// requested id so the peer's sequence stays intact.
    async fn on_resend_request(&mut self, resend_id: u16, session_id: u16) {
        let cached = self
            .shared
            .send
            .lock()
            .unwrap()
            .lookup(resend_id)
            .cloned();
        match cached {
            Some(packet) => {
                log::debug!("[atem] ← resend request {resend_id}, replaying cached packet");
                self.send_packet(&packet).await;
            }
            None => {
                log::warn!("[atem] ← resend request {resend_id}, not cached; sending filler");
                let mut filler = OwnedPacket::new(flags::ACK_REQUEST, session_id, HEADER_LEN);
                filler.set_local_id(resend_id);
                self.send_packet(&filler).await;
            }
        }
    }

    /// Ask the peer for the oldest missing packet, at most once per id; the
    /// bookkeeping set is pruned as the window scrolls.
    async fn request_missing(&mut self, session_id: u16) {
        if self.state == SessionState::HelloSent || self.state == SessionState::Disconnected {
            return;
        }
        let tracker = &self.tracker;
        self.gap_requested.retain(|&id| tracker.contains(id));

        if let Some(missing) = self.tracker.missing() {
            if self.gap_requested.insert(missing) {
                log::debug!("[atem] packet {missing} missing, requesting resend");
                let mut request = OwnedPacket::new(
                    flags::ACK_RESPONSE | flags::RESEND,
                    session_id,
                    HEADER_LEN,
                );
                request.set_ack_id((missing as u16).wrapping_sub(1) & 0x7FFF);
                request.set_resend_id(missing as u16);
                self.send_packet(&request).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn current_session_id(&self) -> u16 {
        self.shared.send.lock().unwrap().session_id
    }

    /// Send, logging failures; the loop never dies on a transport error.
    async fn send_packet(&self, packet: &OwnedPacket) {
        if let Err(e) = self.shared.socket.send(packet.as_bytes()).await {
            log::warn!("[atem] send error: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
