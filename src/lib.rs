//! `atem-client` — a client for the Blackmagic Design ATEM switcher control
//! protocol over UDP.
//!
//! The ATEM speaks its own reliable transport on top of UDP: every packet
//! carries a 12-byte header with flags, a session id and a 15-bit packet id,
//! and the payload is a stream of tagged command TLVs. The switcher pushes
//! state deltas at video-frame cadence; this crate keeps a live mirror of
//! that state and encodes outbound control commands.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │  snapshot queries / send_commands()
//!      ▼
//!  AtemClient ──────────────────────────────┐
//!      │                                    │ receive-loop task
//!  ┌───▼───────────┐   deltas   ┌───────────▼─────────┐
//!  │  StateMirror  │◀───────────│    SessionEngine    │
//!  │ (state mutex) │            │ handshake + ACKs +  │
//!  └───────────────┘            │ retransmit + probes │
//!                               └───────────┬─────────┘
//!                                           │ raw UDP datagrams
//!                                     ┌─────▼─────┐
//!                                     │  Socket   │
//!                                     └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]   — transport header wire format and command TLV iteration
//! - [`sequence`] — out-of-order detection in the 15-bit packet id space
//! - [`command`]  — outbound typed commands and their encoders
//! - [`delta`]    — inbound command decoding into typed state deltas
//! - [`state`]    — the switcher state mirror with per-field versioning
//! - [`event`]    — change notifications delivered to the host
//! - [`session`]  — connection state machine, reliability and liveness
//! - [`socket`]   — async UDP socket abstraction
//! - [`client`]   — the public connection handle
//! - [`config`]   — resolved connection parameters
//! - [`types`]    — protocol value types (sources, topology, keyers, …)

pub mod client;
pub mod command;
pub mod config;
pub mod delta;
pub mod event;
pub mod packet;
pub mod sequence;
pub mod session;
pub mod socket;
pub mod state;
pub mod types;

pub use client::AtemClient;
pub use command::Command;
pub use config::ConnectionConfig;
pub use event::{EventKind, EventSink, StateEvent};
pub use session::{AtemError, SessionState};
pub use types::Source;
