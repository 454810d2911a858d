//! Inbound command decoding.
//!
//! The switcher reports state as a stream of tagged commands; [`decode`]
//! turns one `(tag, body)` pair into a typed [`Delta`] for the state mirror.
//! Unknown tags and truncated bodies decode to `None` and are ignored — new
//! firmware adds tags freely and the mirror must keep working.
//!
//! All multi-byte integers are big-endian; offsets below are into the body,
//! after the 8-byte TLV header.

use crate::types::{
    DskProperties, DskSource, DskState, DveState, FadeToBlack, InputProperty, MediaPlayerSource,
    MediaPoolCounts, ProtocolVersion, Source, StreamState, Topology, TransitionPosition,
    TransitionState, TransitionStyle, UskState,
};

/// Longest product id the mirror stores.
const MAX_PRODUCT_ID_LEN: usize = 44;

/// A typed state change decoded from one inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// `_ver` — control protocol version.
    Version(ProtocolVersion),
    /// `_pin` — product id string.
    ProductId(String),
    /// `_top` — device topology.
    Topology(Topology),
    /// `_MeC` — number of keyers on one M/E.
    MixEffectConfig { me: u8, keyers: u8 },
    /// `_mpl` — media pool capacity.
    MediaPool(MediaPoolCounts),
    /// `AuxS` — aux output routing.
    AuxSource { channel: u8, source: Source },
    /// `DskB` — downstream keyer fill/key sources.
    DskSources { keyer: u8, source: DskSource },
    /// `DskP` — downstream keyer tie.
    DskTie { keyer: u8, properties: DskProperties },
    /// `DskS` — downstream keyer on-air state.
    DskState { keyer: u8, state: DskState },
    /// `FtbS` — fade-to-black state.
    FadeToBlack { me: u8, state: FadeToBlack },
    /// `InPr` — input display names.
    InputProperty { source: Source, property: InputProperty },
    /// `KeBP` — upstream keyer base properties.
    UskProperties { me: u8, keyer: u8, state: UskState },
    /// `KeDV` — upstream keyer DVE transform.
    UskDve { me: u8, keyer: u8, dve: DveState },
    /// `KeFS` — flying key at-key-frame state.
    UskAtKeyFrame { me: u8, keyer: u8, at_key_frame: u8 },
    /// `KeOn` — upstream keyer on-air.
    UskOnAir { me: u8, keyer: u8, on_air: bool },
    /// `MPCE` — media player selected source.
    MediaPlayerSource { player: u8, source: MediaPlayerSource },
    /// `MPfe` — media pool still slot (only stills are reported).
    MediaPoolFile {
        index: u16,
        is_used: bool,
        name: String,
    },
    /// `PrgI` — program bus source.
    Program { me: u8, source: Source },
    /// `PrvI` — preview bus source.
    Preview { me: u8, source: Source },
    /// `StRS` — streaming state.
    Stream(StreamState),
    /// `TrPs` — transition slider position.
    TransitionPosition { me: u8, position: TransitionPosition },
    /// `TrSS` — transition style selection.
    TransitionState { me: u8, state: TransitionState },
}

/// Decode one command into a [`Delta`], or `None` when the tag is unknown
/// or the body is too short for its fields.
pub fn decode(tag: [u8; 4], body: &[u8]) -> Option<Delta> {
    match &tag {
        b"_ver" => Some(Delta::Version(ProtocolVersion {
            major: u16_at(body, 0)?,
            minor: u16_at(body, 2)?,
        })),
        b"_pin" => Some(Delta::ProductId(ascii_at(
            body,
            0,
            MAX_PRODUCT_ID_LEN.min(body.len()),
        )?)),
        b"_top" => Some(Delta::Topology(Topology {
            me: u8_at(body, 0)?,
            sources: u8_at(body, 1)?,
            dsk: u8_at(body, 2)?,
            aux: u8_at(body, 3)?,
            mixminus: u8_at(body, 4)?,
            mediaplayers: u8_at(body, 5)?,
            multiviewers: u8_at(body, 6)?,
            rs485: u8_at(body, 7)?,
            hyperdecks: u8_at(body, 8)?,
            dve: u8_at(body, 9)?,
            stingers: u8_at(body, 10)?,
            supersources: u8_at(body, 11)?,
            talkback_channels: u8_at(body, 13)?,
            camera_control: u8_at(body, 18)?,
        })),
        b"_MeC" => Some(Delta::MixEffectConfig {
            me: u8_at(body, 0)?,
            keyers: u8_at(body, 1)?,
        }),
        b"_mpl" => Some(Delta::MediaPool(MediaPoolCounts {
            stills: u8_at(body, 0)?,
            clips: u8_at(body, 1)?,
        })),
        b"AuxS" => Some(Delta::AuxSource {
            channel: u8_at(body, 0)?,
            source: Source::from_u16(u16_at(body, 2)?),
        }),
        b"DskB" => Some(Delta::DskSources {
            keyer: u8_at(body, 0)?,
            source: DskSource {
                fill: Source::from_u16(u16_at(body, 2)?),
                key: Source::from_u16(u16_at(body, 4)?),
            },
        }),
        b"DskP" => Some(Delta::DskTie {
            keyer: u8_at(body, 0)?,
            properties: DskProperties {
                tie: bool_at(body, 1)?,
            },
        }),
        b"DskS" => Some(Delta::DskState {
            keyer: u8_at(body, 0)?,
            state: DskState {
                on_air: bool_at(body, 1)?,
                in_transition: bool_at(body, 2)?,
                auto_in_progress: bool_at(body, 3)?,
            },
        }),
        b"FtbS" => Some(Delta::FadeToBlack {
            me: u8_at(body, 0)?,
            state: FadeToBlack {
                fully_black: bool_at(body, 1)?,
                in_transition: bool_at(body, 2)?,
            },
        }),
        b"InPr" => Some(Delta::InputProperty {
            source: Source::from_u16(u16_at(body, 0)?),
            property: InputProperty {
                name_long: ascii_at(body, 2, 20)?,
                name_short: ascii_at(body, 22, 4)?,
            },
        }),
        b"KeBP" => Some(Delta::UskProperties {
            me: u8_at(body, 0)?,
            keyer: u8_at(body, 1)?,
            state: UskState {
                key_type: u8_at(body, 2)?,
                fill: Source::from_u16(u16_at(body, 6)?),
                key: Source::from_u16(u16_at(body, 8)?),
                top: i16_at(body, 12)?,
                bottom: i16_at(body, 14)?,
                left: i16_at(body, 16)?,
                right: i16_at(body, 18)?,
            },
        }),
        b"KeDV" => Some(Delta::UskDve {
            me: u8_at(body, 0)?,
            keyer: u8_at(body, 1)?,
            dve: DveState {
                size_x: i32_at(body, 4)?,
                size_y: i32_at(body, 8)?,
                pos_x: i32_at(body, 12)?,
                pos_y: i32_at(body, 16)?,
                rotation: i32_at(body, 20)?,
            },
        }),
        b"KeFS" => Some(Delta::UskAtKeyFrame {
            me: u8_at(body, 0)?,
            keyer: u8_at(body, 1)?,
            at_key_frame: u8_at(body, 6)?,
        }),
        b"KeOn" => Some(Delta::UskOnAir {
            me: u8_at(body, 0)?,
            keyer: u8_at(body, 1)?,
            on_air: bool_at(body, 2)?,
        }),
        b"MPCE" => Some(Delta::MediaPlayerSource {
            player: u8_at(body, 0)?,
            source: MediaPlayerSource {
                kind: u8_at(body, 1)?,
                still: u8_at(body, 2)?,
                clip: u8_at(body, 3)?,
            },
        }),
        b"MPfe" => {
            // Only type 0 (stills) is stored; clips are not mirrored.
            if u8_at(body, 0)? != 0 {
                return None;
            }
            let name_len = u8_at(body, 23)? as usize;
            Some(Delta::MediaPoolFile {
                index: u16_at(body, 1)?,
                is_used: bool_at(body, 4)?,
                name: ascii_at(body, 24, name_len)?,
            })
        }
        b"PrgI" => Some(Delta::Program {
            me: u8_at(body, 0)?,
            source: Source::from_u16(u16_at(body, 2)?),
        }),
        b"PrvI" => Some(Delta::Preview {
            me: u8_at(body, 0)?,
            source: Source::from_u16(u16_at(body, 2)?),
        }),
        b"StRS" => {
            // Some firmware pads this command; only the documented 4-byte
            // body (TLV length 12) is accepted.
            if body.len() != 4 {
                return None;
            }
            Some(Delta::Stream(StreamState::from_u8(u8_at(body, 1)?)))
        }
        b"TrPs" => Some(Delta::TransitionPosition {
            me: u8_at(body, 0)?,
            position: TransitionPosition {
                in_transition: u8_at(body, 1)? & 0x01 != 0,
                position: u16_at(body, 4)?,
            },
        }),
        b"TrSS" => Some(Delta::TransitionState {
            me: u8_at(body, 0)?,
            state: TransitionState {
                style: TransitionStyle::from_u8(u8_at(body, 1)?),
                next: u8_at(body, 2)?,
            },
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Field readers
// ---------------------------------------------------------------------------

fn u8_at(body: &[u8], offset: usize) -> Option<u8> {
    body.get(offset).copied()
}

fn bool_at(body: &[u8], offset: usize) -> Option<bool> {
    Some(u8_at(body, offset)? != 0)
}

fn u16_at(body: &[u8], offset: usize) -> Option<u16> {
    let bytes = body.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn i16_at(body: &[u8], offset: usize) -> Option<i16> {
    Some(u16_at(body, offset)? as i16)
}

fn i32_at(body: &[u8], offset: usize) -> Option<i32> {
    let bytes = body.get(offset..offset + 4)?;
    Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read `len` ASCII bytes at `offset`, stopping at the first NUL.
fn ascii_at(body: &[u8], offset: usize, len: usize) -> Option<String> {
    let raw = body.get(offset..offset + len)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Some(String::from_utf8_lossy(&raw[..end]).into_owned())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
