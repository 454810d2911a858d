//! Outbound control commands and their TLV encoders.
//!
//! Every command the host can send is one case of [`Command`]; encoding
//! dispatches on the discriminant and writes the command's TLV (8-byte
//! header + fixed-size body, all integers big-endian) into a caller
//! buffer. Encoding is infallible once a command value exists — the typed
//! constructors only admit bounded fields.
//!
//! Two commands are version-sensitive (`DDsA` moved its keyer byte in
//! protocol 2.28, `CKTp` writes through an enable mask), which is why the
//! encoder takes the session's [`ProtocolVersion`] as an explicit argument
//! instead of consulting shared state.

use crate::packet::COMMAND_HEADER_LEN;
use crate::types::{ProtocolVersion, Source, UskDveProperty};

/// First protocol version with the relocated `DDsA` keyer byte.
const DDSA_KEYER_MOVED: ProtocolVersion = ProtocolVersion {
    major: 2,
    minor: 28,
};

/// An outbound switcher command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `DAut` — run the configured transition on an M/E.
    Auto { me: u8 },
    /// `DCut` — cut program/preview on an M/E.
    Cut { me: u8 },
    /// `CAuS` — route a source to an aux output.
    AuxSource { channel: u8, source: Source },
    /// `CPgI` — set the program bus source.
    ProgramInput { me: u8, source: Source },
    /// `CPvI` — set the preview bus source.
    PreviewInput { me: u8, source: Source },
    /// `CTPs` — move the transition slider.
    TransitionPosition { me: u8, position: u16 },
    /// `CTTp` — select the layers of the next transition.
    TransitionNext { me: u8, next: u8 },
    /// `CKeF` — set an upstream keyer's fill source.
    UskFill { me: u8, keyer: u8, source: Source },
    /// `CKOn` — take an upstream keyer on or off air.
    UskOnAir { me: u8, keyer: u8, on_air: bool },
    /// `CKTp` — change an upstream keyer's type and/or flying-key flag.
    ///
    /// `None` fields are left unchanged on the switcher; the enable mask
    /// only covers the fields that are present.
    UskType {
        me: u8,
        keyer: u8,
        key_type: Option<u8>,
        flying: Option<bool>,
    },
    /// `CKDV` — write DVE transform components of a flying keyer.
    ///
    /// Only the listed properties are marked valid in the 32-bit property
    /// mask; unlisted slots stay zero and are ignored by the switcher.
    UskDve {
        me: u8,
        keyer: u8,
        props: Vec<(UskDveProperty, i32)>,
    },
    /// `CKFP` — write DVE key-frame transform components.
    UskDveKeyFrame {
        me: u8,
        keyer: u8,
        key_frame: u8,
        props: Vec<(UskDveProperty, i32)>,
    },
    /// `RFlK` — run a flying-key key-frame transition.
    RunKeyFrame { me: u8, keyer: u8, key_frame: u8 },
    /// `DDsA` — run the auto transition of a downstream keyer.
    ///
    /// The keyer byte sits at body offset 0 up to protocol 2.27 and at
    /// offset 1 from 2.28 on.
    DskAuto { keyer: u8 },
}

impl Command {
    /// The four-character wire tag.
    pub fn tag(&self) -> [u8; 4] {
        match self {
            Command::Auto { .. } => *b"DAut",
            Command::Cut { .. } => *b"DCut",
            Command::AuxSource { .. } => *b"CAuS",
            Command::ProgramInput { .. } => *b"CPgI",
            Command::PreviewInput { .. } => *b"CPvI",
            Command::TransitionPosition { .. } => *b"CTPs",
            Command::TransitionNext { .. } => *b"CTTp",
            Command::UskFill { .. } => *b"CKeF",
            Command::UskOnAir { .. } => *b"CKOn",
            Command::UskType { .. } => *b"CKTp",
            Command::UskDve { .. } => *b"CKDV",
            Command::UskDveKeyFrame { .. } => *b"CKFP",
            Command::RunKeyFrame { .. } => *b"RFlK",
            Command::DskAuto { .. } => *b"DDsA",
        }
    }

    /// Total TLV length including the 8-byte command header.
    pub fn encoded_len(&self) -> usize {
        match self {
            Command::UskType { .. } | Command::RunKeyFrame { .. } => 16,
            Command::UskDveKeyFrame { .. } => 64,
            Command::UskDve { .. } => 72,
            _ => 12,
        }
    }

    /// Serialize into `out`, which must hold at least
    /// [`encoded_len`](Self::encoded_len) bytes. Bytes beyond the fields
    /// written below are zero.
    pub fn encode_into(&self, out: &mut [u8], version: ProtocolVersion) {
        let len = self.encoded_len();
        let out = &mut out[..len];
        out.fill(0);
        out[0..2].copy_from_slice(&(len as u16).to_be_bytes());
        out[4..8].copy_from_slice(&self.tag());
        let body = &mut out[COMMAND_HEADER_LEN..];

        match *self {
            Command::Auto { me } | Command::Cut { me } => {
                body[0] = me;
            }
            Command::AuxSource { channel, source } => {
                body[0] = 1; // mask: source valid
                body[1] = channel;
                body[2..4].copy_from_slice(&source.to_u16().to_be_bytes());
            }
            Command::ProgramInput { me, source } | Command::PreviewInput { me, source } => {
                body[0] = me;
                body[2..4].copy_from_slice(&source.to_u16().to_be_bytes());
            }
            Command::TransitionPosition { me, position } => {
                body[0] = me;
                body[2..4].copy_from_slice(&position.to_be_bytes());
            }
            Command::TransitionNext { me, next } => {
                body[0] = 0x2; // mask: next-transition layers valid
                body[1] = me;
                body[3] = next;
            }
            Command::UskFill { me, keyer, source } => {
                body[0] = me;
                body[1] = keyer;
                body[2..4].copy_from_slice(&source.to_u16().to_be_bytes());
            }
            Command::UskOnAir { me, keyer, on_air } => {
                body[0] = me;
                body[1] = keyer;
                body[2] = on_air as u8;
            }
            Command::UskType {
                me,
                keyer,
                key_type,
                flying,
            } => {
                let mut mask = 0u8;
                body[1] = me;
                body[2] = keyer;
                if let Some(key_type) = key_type {
                    mask |= 0x1;
                    body[3] = key_type;
                }
                if let Some(flying) = flying {
                    mask |= 0x2;
                    body[4] = flying as u8;
                }
                body[0] = mask;
            }
            Command::UskDve {
                me,
                keyer,
                ref props,
            } => {
                encode_dve_mask(body, props);
                body[4] = me;
                body[5] = keyer;
            }
            Command::UskDveKeyFrame {
                me,
                keyer,
                key_frame,
                ref props,
            } => {
                encode_dve_mask(body, props);
                body[4] = me;
                body[5] = keyer;
                body[6] = key_frame;
            }
            Command::RunKeyFrame {
                me,
                keyer,
                key_frame,
            } => {
                body[1] = me;
                body[2] = keyer;
                body[4] = key_frame;
            }
            Command::DskAuto { keyer } => {
                if version >= DDSA_KEYER_MOVED {
                    body[1] = keyer;
                } else {
                    body[0] = keyer;
                }
            }
        }
    }

    /// Serialize into a fresh buffer.
    pub fn encode(&self, version: ProtocolVersion) -> Vec<u8> {
        let mut out = vec![0u8; self.encoded_len()];
        self.encode_into(&mut out, version);
        out
    }
}

/// Write the 32-bit property mask at body offset 0 and the valid 32-bit
/// slots at body offset `8 + 4 * property`.
fn encode_dve_mask(body: &mut [u8], props: &[(UskDveProperty, i32)]) {
    let mut mask = 0u32;
    for &(property, value) in props {
        let slot = property as usize;
        mask |= 1 << slot;
        body[8 + 4 * slot..12 + 4 * slot].copy_from_slice(&value.to_be_bytes());
    }
    body[0..4].copy_from_slice(&mask.to_be_bytes());
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
