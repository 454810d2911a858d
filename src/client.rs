//! The public connection handle.
//!
//! [`AtemClient`] is what the embedding application holds: constructing one
//! opens the UDP socket, spawns the receive loop and starts the handshake;
//! dropping it stops the loop and releases everything. Snapshot queries copy
//! values out under the state mutex and return `None` until the switcher has
//! reported the field; command sends are serialized onto the session with
//! fresh packet ids.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::command::Command;
use crate::config::ConnectionConfig;
use crate::event::EventSink;
use crate::packet::{flags, OwnedPacket, HEADER_LEN, MAX_PACKET_LEN};
use crate::session::{AtemError, SendState, SessionEngine, Shared};
use crate::socket::Socket;
use crate::state::StateMirror;
use crate::types::{
    DskProperties, DskSource, DskState, DveState, FadeToBlack, InputProperty, MediaPlayerSource,
    MediaPoolCounts, ProtocolVersion, Source, StreamState, Topology, TransitionPosition,
    TransitionState, UskState,
};

/// Version assumed by version-gated encoders until `_ver` arrives.
const FALLBACK_VERSION: ProtocolVersion = ProtocolVersion {
    major: 2,
    minor: 28,
};

/// A live connection to one switcher.
///
/// The handle is cheap to query from any thread; the receive loop updates
/// the mirror behind it. Dropping the handle aborts the loop at its next
/// wakeup and closes the socket.
pub struct AtemClient {
    shared: Arc<Shared>,
    recv_loop: JoinHandle<()>,
}

impl AtemClient {
    /// Open the socket, spawn the receive loop and send the initial HELLO.
    ///
    /// `sink` receives a notification for every mirror change once the
    /// session is active; changes observed during initialization arrive in
    /// one batch when the session activates.
    pub async fn connect(
        config: ConnectionConfig,
        sink: impl EventSink,
    ) -> Result<Self, AtemError> {
        let socket = Socket::connect(config.peer_addr()).await?;
        log::info!(
            "[atem] {} → {}",
            socket.local_addr,
            config.peer_addr()
        );

        let shared = Arc::new(Shared {
            socket,
            config,
            mirror: Mutex::new(StateMirror::default()),
            send: Mutex::new(SendState::new()),
            connected: AtomicBool::new(false),
            sink: Box::new(sink),
        });

        let recv_loop = tokio::spawn(SessionEngine::new(Arc::clone(&shared)).run());
        Ok(AtemClient { shared, recv_loop })
    }

    /// `true` while a session is active.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Encode `commands` into a single packet and transmit it.
    ///
    /// The packet gets a fresh local id and, when the retransmit cache is
    /// enabled, is kept for replay until the switcher acknowledges it.
    /// Version-gated encoders resolve against the session's reported
    /// protocol version.
    pub async fn send_commands(&self, commands: &[Command]) -> Result<(), AtemError> {
        if commands.is_empty() {
            return Err(AtemError::InvalidArgument("empty command list"));
        }

        let total: usize = HEADER_LEN + commands.iter().map(Command::encoded_len).sum::<usize>();
        if total > MAX_PACKET_LEN {
            return Err(AtemError::InvalidArgument(
                "commands exceed the maximum packet size",
            ));
        }

        let version = self
            .shared
            .mirror
            .lock()
            .unwrap()
            .protocol_version()
            .unwrap_or(FALLBACK_VERSION);

        let packet = {
            let mut send = self.shared.send.lock().unwrap();
            let mut packet = OwnedPacket::new(flags::ACK_REQUEST, send.session_id, total);
            packet.set_local_id(send.assign_local_id());

            let mut offset = 0;
            let payload = packet.payload_mut();
            for command in commands {
                command.encode_into(&mut payload[offset..], version);
                offset += command.encoded_len();
            }

            if self.shared.config.store_send_enabled {
                send.cache(packet.clone(), self.shared.config.max_unacked as usize);
            }
            packet
        };

        log::debug!(
            "[atem] → {} command(s) in packet {}",
            commands.len(),
            packet.local_id()
        );
        self.shared.socket.send(packet.as_bytes()).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Snapshot queries
    // -----------------------------------------------------------------------
    //
    // Each getter copies the value out under the state mutex and returns
    // `None` until the corresponding field has been reported.

    fn mirror(&self) -> std::sync::MutexGuard<'_, StateMirror> {
        self.shared.mirror.lock().unwrap()
    }

    pub fn topology(&self) -> Option<Topology> {
        self.mirror().topology()
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.mirror().protocol_version()
    }

    pub fn product_id(&self) -> Option<String> {
        self.mirror().product_id()
    }

    pub fn input_property(&self, source: Source) -> Option<InputProperty> {
        self.mirror().input_property(source)
    }

    pub fn program_input(&self, me: u8) -> Option<Source> {
        self.mirror().program_input(me)
    }

    pub fn preview_input(&self, me: u8) -> Option<Source> {
        self.mirror().preview_input(me)
    }

    pub fn aux_output(&self, channel: u8) -> Option<Source> {
        self.mirror().aux_output(channel)
    }

    pub fn usk_count(&self, me: u8) -> Option<u8> {
        self.mirror().usk_count(me)
    }

    pub fn usk_on_air(&self, me: u8, keyer: u8) -> Option<bool> {
        self.mirror().usk_on_air(me, keyer)
    }

    pub fn usk_properties(&self, me: u8, keyer: u8) -> Option<UskState> {
        self.mirror().usk_properties(me, keyer)
    }

    pub fn usk_dve(&self, me: u8, keyer: u8) -> Option<DveState> {
        self.mirror().usk_dve(me, keyer)
    }

    pub fn usk_at_key_frame(&self, me: u8, keyer: u8) -> Option<bool> {
        self.mirror().usk_at_key_frame(me, keyer)
    }

    pub fn dsk_state(&self, keyer: u8) -> Option<DskState> {
        self.mirror().dsk_state(keyer)
    }

    pub fn dsk_source(&self, keyer: u8) -> Option<DskSource> {
        self.mirror().dsk_source(keyer)
    }

    pub fn dsk_properties(&self, keyer: u8) -> Option<DskProperties> {
        self.mirror().dsk_properties(keyer)
    }

    pub fn transition_state(&self, me: u8) -> Option<TransitionState> {
        self.mirror().transition_state(me)
    }

    pub fn transition_position(&self, me: u8) -> Option<TransitionPosition> {
        self.mirror().transition_position(me)
    }

    pub fn fade_to_black(&self, me: u8) -> Option<FadeToBlack> {
        self.mirror().fade_to_black(me)
    }

    pub fn media_pool(&self) -> Option<MediaPoolCounts> {
        self.mirror().media_pool()
    }

    pub fn media_player_source(&self, player: u8) -> Option<MediaPlayerSource> {
        self.mirror().media_player_source(player)
    }

    pub fn media_pool_file(&self, index: u16) -> Option<String> {
        self.mirror().media_pool_file(index)
    }

    pub fn stream_state(&self) -> Option<StreamState> {
        self.mirror().stream_state()
    }
}

impl Drop for AtemClient {
    fn drop(&mut self) {
        self.recv_loop.abort();
    }
}
