//! Physical stream lifecycle and phase-dependent message routing.
//!
//! One [`StreamStateMachine`] tracks one session's current physical stream:
//!
//! ```text
//! NoStream ──begin_attempt──► OpeningStream ──CONOK──► ReadingStream
//!     ▲                            │                        │
//!     │                            └──transport lost────────┴──► StreamClosed
//!     └──────────────(new create/bind/recovery restarts the cycle)──┘
//! ```
//!
//! Every attempt carries a fresh [`StreamEpoch`]. Transport callbacks from a
//! superseded stream carry a stale epoch and are discarded outright, so
//! closing the old stream while opening a new one never retriggers session
//! interruption.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::identifiers::StreamEpoch;
use crate::protocol::Message;

// ============================================================================
// StreamPhase
// ============================================================================

/// Lifecycle phase of the current physical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// No stream attempt has been made yet.
    NoStream,
    /// A create/bind/recovery request is in flight; the session is not
    /// established on this stream yet.
    OpeningStream,
    /// The session is bound and the full message catalog is dispatched.
    ReadingStream,
    /// The stream ended; inbound messages are discarded until a new attempt.
    StreamClosed,
}

impl StreamPhase {
    /// Human-readable phase name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::NoStream => "NoStream",
            Self::OpeningStream => "OpeningStream",
            Self::ReadingStream => "ReadingStream",
            Self::StreamClosed => "StreamClosed",
        }
    }

    /// Returns `true` if no live stream exists in this phase.
    #[inline]
    #[must_use]
    pub fn is_closed(self) -> bool {
        matches!(self, Self::NoStream | Self::StreamClosed)
    }
}

// ============================================================================
// Routed
// ============================================================================

/// Outcome of routing one inbound message through the state machine.
#[derive(Debug, PartialEq)]
pub enum Routed {
    /// Messages to hand to the session engine, in order. Contains more than
    /// one element when a `CONOK` releases previously deferred messages.
    Dispatch(Vec<Message>),
    /// The message is not meaningful while the stream is opening; it is held
    /// back and released after `CONOK`.
    Deferred,
    /// The message came from a superseded or closed stream and was dropped.
    Discarded,
}

// ============================================================================
// StreamStateMachine
// ============================================================================

/// Owns one physical stream's lifecycle and routes inbound decoded messages
/// by the current phase.
#[derive(Debug)]
pub struct StreamStateMachine {
    phase: StreamPhase,
    epoch: StreamEpoch,
    deferred: VecDeque<Message>,
}

impl StreamStateMachine {
    /// Creates a machine with no stream.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: StreamPhase::NoStream,
            epoch: StreamEpoch::INITIAL,
            deferred: VecDeque::new(),
        }
    }

    /// Current phase.
    #[inline]
    #[must_use]
    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    /// Epoch of the current stream attempt.
    #[inline]
    #[must_use]
    pub fn epoch(&self) -> StreamEpoch {
        self.epoch
    }

    /// Starts a new stream attempt, superseding any previous stream.
    ///
    /// Bumps the epoch so that late callbacks from the old stream are
    /// recognized as stale, and enters `OpeningStream`.
    pub fn begin_attempt(&mut self) -> StreamEpoch {
        self.epoch = self.epoch.next();
        self.phase = StreamPhase::OpeningStream;
        self.deferred.clear();
        debug!(epoch = %self.epoch, "stream attempt started");
        self.epoch
    }

    /// Closes the current stream on the engine's own initiative.
    ///
    /// Late transport callbacks for this epoch are no longer treated as an
    /// interruption.
    pub fn close(&mut self) {
        if !self.phase.is_closed() {
            debug!(epoch = %self.epoch, "stream closed by engine");
        }
        self.phase = StreamPhase::StreamClosed;
        self.deferred.clear();
    }

    /// Handles a transport `closed`/`broken` callback.
    ///
    /// Returns `true` when the callback interrupts a live stream of the
    /// current epoch; stale or redundant callbacks return `false`.
    pub fn on_disconnect(&mut self, epoch: StreamEpoch) -> bool {
        if epoch != self.epoch {
            trace!(%epoch, current = %self.epoch, "disconnect from superseded stream ignored");
            return false;
        }
        if self.phase.is_closed() {
            return false;
        }
        debug!(%epoch, phase = self.phase.name(), "stream interrupted by transport");
        self.phase = StreamPhase::StreamClosed;
        self.deferred.clear();
        true
    }

    /// Routes one decoded message received on the stream with the given
    /// epoch.
    pub fn route(&mut self, epoch: StreamEpoch, message: Message) -> Routed {
        if epoch != self.epoch {
            trace!(%epoch, current = %self.epoch, "message from superseded stream discarded");
            return Routed::Discarded;
        }
        match self.phase {
            StreamPhase::ReadingStream => Routed::Dispatch(vec![message]),

            StreamPhase::OpeningStream => self.route_opening(message),

            StreamPhase::NoStream | StreamPhase::StreamClosed => {
                warn!(
                    phase = self.phase.name(),
                    ?message,
                    "unexpected message on dead stream discarded"
                );
                Routed::Discarded
            }
        }
    }

    /// Routing while the connection outcome is still unknown: only
    /// connection-establishment and control-response messages are meaningful;
    /// data messages are held back until `CONOK`.
    fn route_opening(&mut self, message: Message) -> Routed {
        match message {
            Message::Conok { .. } => {
                self.phase = StreamPhase::ReadingStream;
                debug!(epoch = %self.epoch, "stream reading");
                let mut batch = Vec::with_capacity(1 + self.deferred.len());
                batch.push(message);
                batch.extend(self.deferred.drain(..));
                Routed::Dispatch(batch)
            }
            Message::Reqok { .. } | Message::Reqerr { .. } => Routed::Dispatch(vec![message]),
            other if other.is_connection_outcome() => Routed::Dispatch(vec![other]),
            other => {
                trace!(?other, "message deferred until CONOK");
                self.deferred.push_back(other);
                Routed::Deferred
            }
        }
    }
}

impl Default for StreamStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn conok() -> Message {
        Message::Conok {
            session_id: "S1".into(),
            request_limit: 50000,
            keepalive_ms: 5000,
            control_link: None,
        }
    }

    fn update() -> Message {
        Message::Update {
            table: 1,
            item: 1,
            fields: vec![],
        }
    }

    #[test]
    fn test_initial_state() {
        let machine = StreamStateMachine::new();
        assert_eq!(machine.phase(), StreamPhase::NoStream);
        assert_eq!(machine.epoch(), StreamEpoch::INITIAL);
    }

    #[test]
    fn test_conok_opens_reading_exactly_once() {
        let mut machine = StreamStateMachine::new();
        let epoch = machine.begin_attempt();
        assert_eq!(machine.phase(), StreamPhase::OpeningStream);

        let routed = machine.route(epoch, conok());
        assert_eq!(routed, Routed::Dispatch(vec![conok()]));
        assert_eq!(machine.phase(), StreamPhase::ReadingStream);

        // a second CONOK is just dispatched; the phase does not regress
        let routed = machine.route(epoch, conok());
        assert_eq!(routed, Routed::Dispatch(vec![conok()]));
        assert_eq!(machine.phase(), StreamPhase::ReadingStream);
    }

    #[test]
    fn test_data_deferred_until_conok() {
        let mut machine = StreamStateMachine::new();
        let epoch = machine.begin_attempt();

        assert_eq!(machine.route(epoch, update()), Routed::Deferred);
        let routed = machine.route(epoch, conok());
        assert_eq!(routed, Routed::Dispatch(vec![conok(), update()]));
    }

    #[test]
    fn test_closed_stream_discards() {
        let mut machine = StreamStateMachine::new();
        let epoch = machine.begin_attempt();
        machine.route(epoch, conok());
        assert!(machine.on_disconnect(epoch));

        assert_eq!(machine.phase(), StreamPhase::StreamClosed);
        assert_eq!(machine.route(epoch, update()), Routed::Discarded);
    }

    #[test]
    fn test_superseded_epoch_discarded() {
        let mut machine = StreamStateMachine::new();
        let old = machine.begin_attempt();
        machine.route(old, conok());

        let fresh = machine.begin_attempt();
        // late events from the old stream are stale in every form
        assert_eq!(machine.route(old, update()), Routed::Discarded);
        assert!(!machine.on_disconnect(old));
        assert_eq!(machine.phase(), StreamPhase::OpeningStream);

        // the new stream still works
        assert_eq!(machine.route(fresh, conok()), Routed::Dispatch(vec![conok()]));
    }

    #[test]
    fn test_requested_close_is_not_interruption() {
        let mut machine = StreamStateMachine::new();
        let epoch = machine.begin_attempt();
        machine.route(epoch, conok());

        machine.close();
        assert!(!machine.on_disconnect(epoch));
    }

    #[test]
    fn test_disconnect_only_once() {
        let mut machine = StreamStateMachine::new();
        let epoch = machine.begin_attempt();
        assert!(machine.on_disconnect(epoch));
        assert!(!machine.on_disconnect(epoch));
    }

    #[test]
    fn test_connection_outcomes_dispatched_while_opening() {
        let mut machine = StreamStateMachine::new();
        let epoch = machine.begin_attempt();

        let end = Message::End {
            code: 48,
            message: "expired".into(),
        };
        assert_eq!(
            machine.route(epoch, end.clone()),
            Routed::Dispatch(vec![end])
        );
        let error = Message::Error {
            code: 65,
            message: "violation".into(),
        };
        assert_eq!(
            machine.route(epoch, error.clone()),
            Routed::Dispatch(vec![error])
        );
    }

    #[test]
    fn test_conerr_dispatched_while_opening() {
        let mut machine = StreamStateMachine::new();
        let epoch = machine.begin_attempt();
        let conerr = Message::Conerr {
            code: 20,
            message: "refused".into(),
        };
        assert_eq!(
            machine.route(epoch, conerr.clone()),
            Routed::Dispatch(vec![conerr])
        );
        // CONERR alone does not move the phase; the engine decides
        assert_eq!(machine.phase(), StreamPhase::OpeningStream);
    }
}
