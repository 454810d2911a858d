//! The switcher state mirror.
//!
//! [`StateMirror`] holds a typed copy of every field the protocol reports.
//! Each leaf field remembers the packet id that last wrote it; a field is
//! valid only once some packet has written it, and a delta only lands when
//! its packet id is not older than the field's current id (last-writer-wins
//! in the wrapping 15-bit id space). That rule is what makes out-of-order
//! delivery safe: when a delayed-but-newer packet arrives first, the earlier
//! one becomes a no-op on that field.
//!
//! The mirror itself is lock-free data; the session layer wraps it in the
//! state mutex and is its only writer. Snapshot getters copy values out so
//! callers never hold references into guarded state.

use std::collections::HashMap;

use crate::delta::Delta;
use crate::event::{EventKind, StateEvent};
use crate::sequence::id_newer;
use crate::types::{
    DskProperties, DskSource, DskState, DveState, FadeToBlack, InputProperty, MediaPlayerSource,
    MediaPoolCounts, ProtocolVersion, Source, StreamState, Topology, TransitionPosition,
    TransitionState, UskState,
};

/// Sentinel for "no packet has ever written this field".
const NEVER_SET: i16 = i16::MIN;

// ---------------------------------------------------------------------------
// Tracked — one versioned field
// ---------------------------------------------------------------------------

/// A field plus the packet id of its last write.
#[derive(Debug, Clone)]
struct Tracked<T> {
    value: T,
    last_change_id: i16,
}

impl<T: Default> Default for Tracked<T> {
    fn default() -> Self {
        Tracked {
            value: T::default(),
            last_change_id: NEVER_SET,
        }
    }
}

impl<T> Tracked<T> {
    fn is_valid(&self) -> bool {
        self.last_change_id != NEVER_SET
    }

    fn get(&self) -> Option<&T> {
        self.is_valid().then_some(&self.value)
    }

    /// Write `value` under last-writer-wins.
    ///
    /// The write is refused only when the stored id is strictly newer than
    /// `id`. An unset field always accepts; id 0 carries handshake data and
    /// always wins so the initial state burst survives window rollover.
    fn set(&mut self, id: i16, value: T) -> bool {
        if self.is_valid() && id != 0 && id_newer(self.last_change_id, id) {
            return false;
        }
        self.last_change_id = id;
        self.value = value;
        true
    }
}

// ---------------------------------------------------------------------------
// Per-index groups
// ---------------------------------------------------------------------------

/// One upstream keyer of an M/E.
#[derive(Debug, Clone, Default)]
struct Keyer {
    state: Tracked<UskState>,
    dve: Tracked<DveState>,
    at_key_frame: Tracked<u8>,
}

/// One mix-effect bank.
#[derive(Debug, Clone, Default)]
struct MixEffect {
    program: Tracked<Source>,
    preview: Tracked<Source>,
    /// Bit `k` set iff upstream keyer `k` is on air.
    usk_on_air: Tracked<u16>,
    transition_state: Tracked<TransitionState>,
    transition_position: Tracked<TransitionPosition>,
    ftb: Tracked<FadeToBlack>,
    /// Sized by `_MeC`; empty until the keyer count is observed.
    keyer: Vec<Keyer>,
}

/// One downstream keyer.
#[derive(Debug, Clone, Default)]
struct DownstreamKeyer {
    state: Tracked<DskState>,
    source: Tracked<DskSource>,
    properties: Tracked<DskProperties>,
}

// ---------------------------------------------------------------------------
// StateMirror
// ---------------------------------------------------------------------------

/// Typed in-memory model of the switcher state.
#[derive(Debug, Default)]
pub struct StateMirror {
    topology: Tracked<Topology>,
    product_id: Tracked<String>,
    version: Tracked<ProtocolVersion>,
    input_properties: HashMap<Source, Tracked<InputProperty>>,
    mix_effect: Vec<MixEffect>,
    dsk: Vec<DownstreamKeyer>,
    aux_out: Vec<Tracked<Source>>,
    media_pool: Tracked<MediaPoolCounts>,
    media_player_source: Vec<Tracked<MediaPlayerSource>>,
    /// `None` is a versioned tombstone: removals stay in the map so a late
    /// out-of-order add cannot resurrect a removed still (and vice versa).
    media_pool_file: HashMap<u16, Tracked<Option<String>>>,
    stream: Tracked<StreamState>,
}

impl StateMirror {
    /// Apply one decoded delta carried by packet `packet_id`.
    ///
    /// Returns the event kind when the mirror changed; `None` when the delta
    /// was stale, out of the current topology's range, or a no-op.
    pub fn apply(&mut self, delta: &Delta, packet_id: i16) -> Option<EventKind> {
        match *delta {
            Delta::Version(version) => self
                .version
                .set(packet_id, version)
                .then_some(EventKind::Version),
            Delta::ProductId(ref product_id) => self
                .product_id
                .set(packet_id, product_id.clone())
                .then_some(EventKind::ProductId),
            Delta::Topology(topology) => {
                if !self.topology.set(packet_id, topology) {
                    return None;
                }
                // Resize the per-index arrays; indices that survive keep
                // their fields, new indices start unset.
                self.mix_effect
                    .resize_with(topology.me as usize, MixEffect::default);
                self.dsk
                    .resize_with(topology.dsk as usize, DownstreamKeyer::default);
                self.aux_out
                    .resize_with(topology.aux as usize, Tracked::default);
                self.media_player_source
                    .resize_with(topology.mediaplayers as usize, Tracked::default);
                Some(EventKind::Topology)
            }
            Delta::MixEffectConfig { me, keyers } => {
                let bank = self.mix_effect.get_mut(me as usize)?;
                bank.keyer.resize_with(keyers as usize, Keyer::default);
                Some(EventKind::Topology)
            }
            Delta::MediaPool(counts) => self
                .media_pool
                .set(packet_id, counts)
                .then_some(EventKind::MediaPool),
            Delta::AuxSource { channel, source } => self
                .aux_out
                .get_mut(channel as usize)?
                .set(packet_id, source)
                .then_some(EventKind::Aux),
            Delta::DskSources { keyer, source } => self
                .dsk
                .get_mut(keyer as usize)?
                .source
                .set(packet_id, source)
                .then_some(EventKind::Dsk),
            Delta::DskTie { keyer, properties } => self
                .dsk
                .get_mut(keyer as usize)?
                .properties
                .set(packet_id, properties)
                .then_some(EventKind::Dsk),
            Delta::DskState { keyer, state } => self
                .dsk
                .get_mut(keyer as usize)?
                .state
                .set(packet_id, state)
                .then_some(EventKind::Dsk),
            Delta::FadeToBlack { me, state } => self
                .mix_effect
                .get_mut(me as usize)?
                .ftb
                .set(packet_id, state)
                .then_some(EventKind::Ftb),
            Delta::InputProperty {
                source,
                ref property,
            } => self
                .input_properties
                .entry(source)
                .or_default()
                .set(packet_id, property.clone())
                .then_some(EventKind::InputProperties),
            Delta::UskProperties { me, keyer, state } => self
                .mix_effect
                .get_mut(me as usize)?
                .keyer
                .get_mut(keyer as usize)?
                .state
                .set(packet_id, state)
                .then_some(EventKind::Usk),
            Delta::UskDve { me, keyer, dve } => self
                .mix_effect
                .get_mut(me as usize)?
                .keyer
                .get_mut(keyer as usize)?
                .dve
                .set(packet_id, dve)
                .then_some(EventKind::UskDve),
            Delta::UskAtKeyFrame {
                me,
                keyer,
                at_key_frame,
            } => self
                .mix_effect
                .get_mut(me as usize)?
                .keyer
                .get_mut(keyer as usize)?
                .at_key_frame
                .set(packet_id, at_key_frame)
                .then_some(EventKind::Usk),
            Delta::UskOnAir { me, keyer, on_air } => {
                if keyer > 15 {
                    return None;
                }
                let bank = self.mix_effect.get_mut(me as usize)?;
                let mut mask = bank.usk_on_air.value;
                if on_air {
                    mask |= 1 << keyer;
                } else {
                    mask &= !(1 << keyer);
                }
                bank.usk_on_air
                    .set(packet_id, mask)
                    .then_some(EventKind::Usk)
            }
            Delta::MediaPlayerSource { player, source } => self
                .media_player_source
                .get_mut(player as usize)?
                .set(packet_id, source)
                .then_some(EventKind::MediaPlayer),
            Delta::MediaPoolFile {
                index,
                is_used,
                ref name,
            } => {
                let slot = self.media_pool_file.entry(index).or_default();
                let value = is_used.then(|| name.clone());
                let previous = slot.value.clone();
                if !slot.set(packet_id, value) {
                    return None;
                }
                (slot.value != previous).then_some(EventKind::MediaPool)
            }
            Delta::Program { me, source } => self
                .mix_effect
                .get_mut(me as usize)?
                .program
                .set(packet_id, source)
                .then_some(EventKind::Source),
            Delta::Preview { me, source } => self
                .mix_effect
                .get_mut(me as usize)?
                .preview
                .set(packet_id, source)
                .then_some(EventKind::Source),
            Delta::Stream(state) => self
                .stream
                .set(packet_id, state)
                .then_some(EventKind::Stream),
            Delta::TransitionPosition { me, position } => self
                .mix_effect
                .get_mut(me as usize)?
                .transition_position
                .set(packet_id, position)
                .then_some(EventKind::TransitionPosition),
            Delta::TransitionState { me, state } => self
                .mix_effect
                .get_mut(me as usize)?
                .transition_state
                .set(packet_id, state)
                .then_some(EventKind::TransitionState),
        }
    }

    /// Drop everything back to "never set".
    ///
    /// Returns the synthetic product-id event the host uses to notice the
    /// disconnection (the product id reads as absent afterwards).
    pub fn reset(&mut self) -> StateEvent {
        *self = StateMirror::default();
        StateEvent {
            kind: EventKind::ProductId,
            packet_id: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Snapshot queries
    // -----------------------------------------------------------------------

    pub fn topology(&self) -> Option<Topology> {
        self.topology.get().copied()
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.version.get().copied()
    }

    pub fn product_id(&self) -> Option<String> {
        self.product_id.get().cloned()
    }

    pub fn input_property(&self, source: Source) -> Option<InputProperty> {
        self.input_properties.get(&source)?.get().cloned()
    }

    pub fn program_input(&self, me: u8) -> Option<Source> {
        self.mix_effect.get(me as usize)?.program.get().copied()
    }

    pub fn preview_input(&self, me: u8) -> Option<Source> {
        self.mix_effect.get(me as usize)?.preview.get().copied()
    }

    pub fn aux_output(&self, channel: u8) -> Option<Source> {
        self.aux_out.get(channel as usize)?.get().copied()
    }

    /// Number of upstream keyers observed on an M/E (zero until `_MeC`).
    pub fn usk_count(&self, me: u8) -> Option<u8> {
        Some(self.mix_effect.get(me as usize)?.keyer.len() as u8)
    }

    pub fn usk_on_air(&self, me: u8, keyer: u8) -> Option<bool> {
        if keyer > 15 {
            return None;
        }
        let mask = self.mix_effect.get(me as usize)?.usk_on_air.get().copied()?;
        Some(mask & (1 << keyer) != 0)
    }

    pub fn usk_properties(&self, me: u8, keyer: u8) -> Option<UskState> {
        self.mix_effect
            .get(me as usize)?
            .keyer
            .get(keyer as usize)?
            .state
            .get()
            .copied()
    }

    pub fn usk_dve(&self, me: u8, keyer: u8) -> Option<DveState> {
        self.mix_effect
            .get(me as usize)?
            .keyer
            .get(keyer as usize)?
            .dve
            .get()
            .copied()
    }

    pub fn usk_at_key_frame(&self, me: u8, keyer: u8) -> Option<bool> {
        self.mix_effect
            .get(me as usize)?
            .keyer
            .get(keyer as usize)?
            .at_key_frame
            .get()
            .map(|&raw| raw != 0)
    }

    pub fn dsk_state(&self, keyer: u8) -> Option<DskState> {
        self.dsk.get(keyer as usize)?.state.get().copied()
    }

    pub fn dsk_source(&self, keyer: u8) -> Option<DskSource> {
        self.dsk.get(keyer as usize)?.source.get().copied()
    }

    pub fn dsk_properties(&self, keyer: u8) -> Option<DskProperties> {
        self.dsk.get(keyer as usize)?.properties.get().copied()
    }

    pub fn transition_state(&self, me: u8) -> Option<TransitionState> {
        self.mix_effect
            .get(me as usize)?
            .transition_state
            .get()
            .copied()
    }

    pub fn transition_position(&self, me: u8) -> Option<TransitionPosition> {
        self.mix_effect
            .get(me as usize)?
            .transition_position
            .get()
            .copied()
    }

    pub fn fade_to_black(&self, me: u8) -> Option<FadeToBlack> {
        self.mix_effect.get(me as usize)?.ftb.get().copied()
    }

    pub fn media_pool(&self) -> Option<MediaPoolCounts> {
        self.media_pool.get().copied()
    }

    pub fn media_player_source(&self, player: u8) -> Option<MediaPlayerSource> {
        self.media_player_source.get(player as usize)?.get().copied()
    }

    pub fn media_pool_file(&self, index: u16) -> Option<String> {
        self.media_pool_file.get(&index)?.get()?.clone()
    }

    pub fn stream_state(&self) -> Option<StreamState> {
        self.stream.get().copied()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// A mirror with a 2 M/E, 1 DSK, 2 aux, 1 media player topology applied.
    fn mirror_with_topology() -> StateMirror {
        let mut mirror = StateMirror::default();
        let topology = Topology {
            me: 2,
            dsk: 1,
            aux: 2,
            mediaplayers: 1,
            ..Topology::default()
        };
        assert_eq!(
            mirror.apply(&Delta::Topology(topology), 1),
            Some(EventKind::Topology)
        );
        mirror
    }

    #[test]
    fn fields_are_invalid_until_written() {
        let mirror = mirror_with_topology();
        assert_eq!(mirror.program_input(0), None);
        assert_eq!(mirror.aux_output(0), None);
        assert_eq!(mirror.stream_state(), None);
        assert_eq!(mirror.product_id(), None);
    }

    #[test]
    fn program_applies_and_emits_source_event() {
        let mut mirror = mirror_with_topology();
        let delta = Delta::Program {
            me: 0,
            source: Source::Input(1),
        };
        assert_eq!(mirror.apply(&delta, 2), Some(EventKind::Source));
        assert_eq!(mirror.program_input(0), Some(Source::Input(1)));
    }

    #[test]
    fn out_of_range_indices_are_dropped() {
        let mut mirror = mirror_with_topology();
        let delta = Delta::Program {
            me: 5,
            source: Source::Input(1),
        };
        assert_eq!(mirror.apply(&delta, 2), None);
        assert_eq!(mirror.aux_output(7), None);
    }

    #[test]
    fn older_packet_id_loses() {
        let mut mirror = mirror_with_topology();
        mirror.apply(
            &Delta::Program {
                me: 0,
                source: Source::Input(2),
            },
            10,
        );
        // A delayed packet with an older id must not clobber the field.
        assert_eq!(
            mirror.apply(
                &Delta::Program {
                    me: 0,
                    source: Source::Input(1),
                },
                9,
            ),
            None
        );
        assert_eq!(mirror.program_input(0), Some(Source::Input(2)));
    }

    #[test]
    fn same_packet_id_write_lands() {
        // Two commands in one packet touching the same field: the later one
        // (applied second, same id) must stand.
        let mut mirror = mirror_with_topology();
        mirror.apply(
            &Delta::Program {
                me: 0,
                source: Source::Input(2),
            },
            5,
        );
        assert_eq!(
            mirror.apply(
                &Delta::Program {
                    me: 0,
                    source: Source::Input(3),
                },
                5,
            ),
            Some(EventKind::Source)
        );
        assert_eq!(mirror.program_input(0), Some(Source::Input(3)));
    }

    #[test]
    fn id_zero_always_wins() {
        let mut mirror = mirror_with_topology();
        mirror.apply(
            &Delta::Program {
                me: 0,
                source: Source::Input(2),
            },
            100,
        );
        assert_eq!(
            mirror.apply(
                &Delta::Program {
                    me: 0,
                    source: Source::Input(9),
                },
                0,
            ),
            Some(EventKind::Source)
        );
        assert_eq!(mirror.program_input(0), Some(Source::Input(9)));
    }

    #[test]
    fn wrapping_newer_id_wins() {
        let mut mirror = mirror_with_topology();
        mirror.apply(
            &Delta::Program {
                me: 0,
                source: Source::Input(2),
            },
            0x7FFE,
        );
        // Id 3 is newer than 0x7FFE once the id space wraps.
        assert_eq!(
            mirror.apply(
                &Delta::Program {
                    me: 0,
                    source: Source::Input(4),
                },
                3,
            ),
            Some(EventKind::Source)
        );
        assert_eq!(mirror.program_input(0), Some(Source::Input(4)));
    }

    #[test]
    fn topology_shrink_makes_higher_indices_unreachable() {
        let mut mirror = mirror_with_topology();
        mirror.apply(
            &Delta::Program {
                me: 1,
                source: Source::Input(4),
            },
            2,
        );
        assert_eq!(mirror.program_input(1), Some(Source::Input(4)));

        let shrunk = Topology {
            me: 1,
            dsk: 1,
            aux: 2,
            mediaplayers: 1,
            ..Topology::default()
        };
        mirror.apply(&Delta::Topology(shrunk), 3);
        assert_eq!(mirror.program_input(1), None, "m/e 1 no longer exists");
        assert_eq!(mirror.program_input(0), None, "m/e 0 fields preserved-but-unset");
    }

    #[test]
    fn topology_grow_preserves_surviving_fields() {
        let mut mirror = mirror_with_topology();
        mirror.apply(
            &Delta::Program {
                me: 0,
                source: Source::Input(7),
            },
            2,
        );
        let grown = Topology {
            me: 4,
            dsk: 2,
            aux: 6,
            mediaplayers: 2,
            ..Topology::default()
        };
        mirror.apply(&Delta::Topology(grown), 3);
        assert_eq!(mirror.program_input(0), Some(Source::Input(7)));
        assert_eq!(mirror.program_input(3), None);
    }

    #[test]
    fn keyer_arrays_are_sized_by_me_config() {
        let mut mirror = mirror_with_topology();
        assert_eq!(mirror.usk_count(0), Some(0), "zero keyers until _MeC");

        let delta = Delta::UskProperties {
            me: 0,
            keyer: 0,
            state: UskState::default(),
        };
        assert_eq!(mirror.apply(&delta, 2), None, "no keyer slot yet");

        mirror.apply(&Delta::MixEffectConfig { me: 0, keyers: 2 }, 3);
        assert_eq!(mirror.usk_count(0), Some(2));
        assert_eq!(mirror.apply(&delta, 4), Some(EventKind::Usk));
        assert!(mirror.usk_properties(0, 0).is_some());
    }

    #[test]
    fn usk_on_air_updates_one_bit() {
        let mut mirror = mirror_with_topology();
        mirror.apply(
            &Delta::UskOnAir {
                me: 0,
                keyer: 1,
                on_air: true,
            },
            2,
        );
        assert_eq!(mirror.usk_on_air(0, 1), Some(true));
        assert_eq!(mirror.usk_on_air(0, 0), Some(false));

        mirror.apply(
            &Delta::UskOnAir {
                me: 0,
                keyer: 0,
                on_air: true,
            },
            3,
        );
        mirror.apply(
            &Delta::UskOnAir {
                me: 0,
                keyer: 1,
                on_air: false,
            },
            4,
        );
        assert_eq!(mirror.usk_on_air(0, 0), Some(true));
        assert_eq!(mirror.usk_on_air(0, 1), Some(false));
        assert_eq!(mirror.usk_on_air(0, 16), None, "keyer index out of range");
    }

    #[test]
    fn media_pool_file_add_and_remove() {
        let mut mirror = mirror_with_topology();
        mirror.apply(
            &Delta::MediaPoolFile {
                index: 3,
                is_used: true,
                name: "logo".into(),
            },
            2,
        );
        assert_eq!(mirror.media_pool_file(3), Some("logo".into()));

        mirror.apply(
            &Delta::MediaPoolFile {
                index: 3,
                is_used: false,
                name: String::new(),
            },
            3,
        );
        assert_eq!(mirror.media_pool_file(3), None);
    }

    #[test]
    fn stale_media_pool_file_removal_is_refused() {
        let mut mirror = mirror_with_topology();
        mirror.apply(
            &Delta::MediaPoolFile {
                index: 3,
                is_used: true,
                name: "logo".into(),
            },
            5,
        );
        // A delayed removal with an older packet id must not erase the
        // newer entry.
        assert_eq!(
            mirror.apply(
                &Delta::MediaPoolFile {
                    index: 3,
                    is_used: false,
                    name: String::new(),
                },
                4,
            ),
            None
        );
        assert_eq!(mirror.media_pool_file(3), Some("logo".into()));
    }

    #[test]
    fn late_add_cannot_resurrect_removed_media_pool_file() {
        let mut mirror = mirror_with_topology();
        mirror.apply(
            &Delta::MediaPoolFile {
                index: 3,
                is_used: false,
                name: String::new(),
            },
            6,
        );
        // The removal leaves a versioned tombstone, so an out-of-order add
        // from before the removal stays dead.
        assert_eq!(
            mirror.apply(
                &Delta::MediaPoolFile {
                    index: 3,
                    is_used: true,
                    name: "logo".into(),
                },
                5,
            ),
            None
        );
        assert_eq!(mirror.media_pool_file(3), None);
    }

    #[test]
    fn noop_media_pool_file_removal_emits_no_event() {
        let mut mirror = mirror_with_topology();
        // Removing a slot that was never reported changes nothing visible.
        assert_eq!(
            mirror.apply(
                &Delta::MediaPoolFile {
                    index: 9,
                    is_used: false,
                    name: String::new(),
                },
                2,
            ),
            None
        );
        // Re-delivering the same removal is a no-op too.
        assert_eq!(
            mirror.apply(
                &Delta::MediaPoolFile {
                    index: 9,
                    is_used: false,
                    name: String::new(),
                },
                2,
            ),
            None
        );
        assert_eq!(mirror.media_pool_file(9), None);
    }

    #[test]
    fn idempotent_reapplication() {
        let mut mirror = mirror_with_topology();
        let delta = Delta::Program {
            me: 0,
            source: Source::Input(2),
        };
        mirror.apply(&delta, 5);
        mirror.apply(&delta, 5);
        assert_eq!(mirror.program_input(0), Some(Source::Input(2)));
    }

    #[test]
    fn reset_invalidates_everything_and_emits_product_id() {
        let mut mirror = mirror_with_topology();
        mirror.apply(&Delta::ProductId("ATEM Mini".into()), 2);
        mirror.apply(
            &Delta::Program {
                me: 0,
                source: Source::Input(1),
            },
            3,
        );
        mirror.apply(&Delta::Stream(StreamState::Streaming), 4);

        let event = mirror.reset();
        assert_eq!(event.kind, EventKind::ProductId);
        assert_eq!(event.packet_id, 0);
        assert_eq!(mirror.product_id(), None);
        assert_eq!(mirror.program_input(0), None);
        assert_eq!(mirror.stream_state(), None);
        assert_eq!(mirror.topology(), None);
    }

    #[test]
    fn final_value_is_newest_for_any_interleaving() {
        // Monotonicity: apply the same field with ids in two different
        // orders; the newest id's value must win in both.
        let orders: [&[(i16, u8)]; 2] = [&[(3, 1), (7, 2), (5, 3)], &[(7, 2), (3, 1), (5, 3)]];
        for order in orders {
            let mut mirror = mirror_with_topology();
            for &(id, input) in order {
                mirror.apply(
                    &Delta::Program {
                        me: 0,
                        source: Source::Input(input),
                    },
                    id,
                );
            }
            assert_eq!(
                mirror.program_input(0),
                Some(Source::Input(2)),
                "order {order:?}"
            );
        }
    }
}
