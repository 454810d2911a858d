//! Out-of-order detection in the 15-bit packet id space.
//!
//! [`SequenceTracker`] decides, for every inbound packet id, whether it is
//! new, a duplicate, or evidence of a gap. It keeps six bytes of state: the
//! id of the highest packet seen (the *anchor*) and a 32-bit window in which
//! bit `i` records whether packet `anchor − i` (mod 2¹⁵) has arrived.
//!
//! # Protocol contract
//!
//! - Ids live in `0..=0x7FFF` and wrap; the `i16` representation is a
//!   convenience, not an escape from modular arithmetic.
//! - An id more than 32 behind the anchor is lost forever: its first
//!   appearance still reports "new", but the window cannot distinguish a
//!   re-delivery. The switcher never retransmits that far back.
//! - A fresh tracker starts "caught up" (anchor 1, every older bit set) so
//!   ids from before the session are never reported missing.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

/// Width of the sliding window in bits.
const WINDOW: u16 = u32::BITS as u16;

/// Returns `true` when id `a` is strictly newer than `b` in the wrapping
/// 15-bit id space.
///
/// The comparison works correctly as long as the two ids are less than half
/// the id space apart, which always holds for a 32-deep window.
#[inline]
pub(crate) fn id_newer(a: i16, b: i16) -> bool {
    let delta = (a.wrapping_sub(b) as u16) & 0x7FFF;
    delta != 0 && delta < 0x4000
}

/// Compact out-of-order detector over the 15-bit packet id space.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    /// Id of the highest packet received (top of the window).
    anchor: i16,
    /// Most recent argument to [`add`](Self::add).
    last_id: i16,
    /// Bit `i` set iff packet `anchor − i` (mod 2¹⁵) has been received.
    received: u32,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceTracker {
    /// A tracker that considers everything before the session received.
    pub fn new() -> Self {
        SequenceTracker {
            anchor: 1,
            last_id: 0,
            received: u32::MAX - 1,
        }
    }

    /// Record an inbound id.
    ///
    /// Returns `true` when the id is new, `false` when it was already
    /// received within the window.
    pub fn add(&mut self, id: i16) -> bool {
        self.last_id = id;

        // Slide the window forward when the id is ahead of the anchor.
        // Ones shift out at the top, zeros (not-yet-received) shift in.
        let ahead = (id.wrapping_sub(self.anchor) as u16) & 0x7FFF;
        if ahead < WINDOW {
            self.received <<= ahead;
            self.anchor = id;
        }

        // The anchor may have moved; recompute the id's position in the window.
        let offset = (self.anchor.wrapping_sub(id) as u16) & 0x7FFF;
        if offset >= WINDOW {
            // Too far behind to track: report new, leave the window alone.
            return true;
        }

        if self.received & (1 << offset) != 0 {
            return false;
        }
        self.received |= 1 << offset;
        true
    }

    /// The oldest id below the anchor that has not been seen, if any.
    pub fn missing(&self) -> Option<i16> {
        if self.received == u32::MAX {
            return None;
        }
        for i in (1..WINDOW).rev() {
            if self.received & (1 << i) == 0 {
                return Some((self.anchor.wrapping_sub(i as i16) as u16 & 0x7FFF) as i16);
            }
        }
        None
    }

    /// The most recent argument to [`add`](Self::add).
    pub fn last_id(&self) -> i16 {
        self.last_id
    }

    /// `true` iff the last added id is newer than `other` under wrapping
    /// comparison.
    pub fn is_newer(&self, other: i16) -> bool {
        id_newer(self.last_id, other)
    }

    /// `true` when `id` falls inside the window below the anchor.
    pub fn contains(&self, id: i16) -> bool {
        ((self.anchor.wrapping_sub(id) as u16) & 0x7FFF) < WINDOW
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
