//! Change notifications delivered to the embedding host.
//!
//! The session engine reports every mirror change as a [`StateEvent`]
//! through an [`EventSink`] the host injects at connect time. The sink is a
//! capability, not a global bus: whoever owns the handle decides where
//! events go (a channel, a UI queue, a log).
//!
//! During session bring-up the switcher replays its entire state; those
//! events are buffered and delivered in one batch when the session turns
//! active, so the host never observes a half-initialized mirror.

/// What part of the mirror changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Aux output routing.
    Aux,
    /// Downstream keyer state, sources or properties.
    Dsk,
    /// Fade-to-black state.
    Ftb,
    /// Input display names.
    InputProperties,
    /// Upstream keyer state (base properties, on-air, key frame).
    Usk,
    /// Upstream keyer DVE transform.
    UskDve,
    /// Media player selection.
    MediaPlayer,
    /// Media pool contents or capacity.
    MediaPool,
    /// Product id; also emitted (with an empty value) when the session drops.
    ProductId,
    /// Control protocol version.
    Version,
    /// Program or preview bus routing.
    Source,
    /// Streaming state.
    Stream,
    /// Device topology or M/E configuration.
    Topology,
    /// Transition slider movement.
    TransitionPosition,
    /// Transition style selection.
    TransitionState,
}

/// One mirror change: what changed and the packet id that carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateEvent {
    pub kind: EventKind,
    /// The sender's packet id, or 0 for synthetic events (session reset).
    pub packet_id: i16,
}

/// Receiver for state change notifications.
///
/// Called from the receive loop; implementations must return quickly and
/// must not call back into the client handle.
pub trait EventSink: Send + Sync + 'static {
    fn on_event(&self, event: StateEvent);
}

impl<F> EventSink for F
where
    F: Fn(StateEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: StateEvent) {
        self(event)
    }
}
