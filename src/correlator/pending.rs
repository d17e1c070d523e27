//! Pending control-request bookkeeping.
//!
//! Each submitted request is tracked as a [`PendingRequest`] until its
//! terminal resolution. The request's purpose is a tagged-union
//! [`PendingKind`], so response handling is one generic resolution path
//! plus a per-kind dispatch in the session engine, instead of one listener
//! subclass per request type.

// ============================================================================
// Imports
// ============================================================================

use crate::correlator::tutor::Tutor;
use crate::identifiers::SubscriptionId;
use crate::protocol::ControlRequest;

// ============================================================================
// PendingKind
// ============================================================================

/// What a pending control request is for; drives the per-kind success and
/// error handling once the response arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingKind {
    /// Subscription activation.
    Subscribe {
        /// Table being activated.
        subscription: SubscriptionId,
    },
    /// Subscription removal.
    Unsubscribe {
        /// Table being removed.
        subscription: SubscriptionId,
    },
    /// Subscription frequency change.
    Reconf {
        /// Table being reconfigured.
        subscription: SubscriptionId,
    },
    /// User message delivery.
    Message {
        /// Sequence the message belongs to.
        sequence: String,
        /// Progressive number within the sequence.
        prog: u32,
        /// Whether the application expects an outcome notification.
        needs_ack: bool,
    },
    /// Bandwidth constraint.
    Constrain,
    /// Force-rebind instruction; response errors are ignored.
    ForceRebind,
    /// Session destroy; response errors are ignored.
    Destroy,
    /// Reverse heartbeat; never retried, response errors are ignored.
    Heartbeat,
}

// ============================================================================
// PendingPhase
// ============================================================================

/// Lifecycle of one pending request across its physical attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingPhase {
    /// Handed to the transport; not yet confirmed sent.
    Sent,
    /// The transport confirmed the request left the client.
    Opened,
    /// The current attempt failed; a retransmission has been approved and is
    /// waiting for its backoff delay.
    AwaitingRetry,
}

// ============================================================================
// PendingRequest
// ============================================================================

/// One outbound control request awaiting terminal resolution.
///
/// Owned exclusively by the correlator from submission until it completes,
/// exhausts its retries, or is discarded.
#[derive(Debug)]
pub struct PendingRequest {
    /// The request payload; re-encoded on retransmission.
    pub request: ControlRequest,
    /// Purpose tag for per-kind resolution.
    pub kind: PendingKind,
    /// Retry policy.
    pub tutor: Box<dyn Tutor>,
    /// Current attempt lifecycle phase.
    pub phase: PendingPhase,
    /// 1-based physical attempt counter; stale retry timers carry an older
    /// value and are ignored.
    pub attempt: u32,
    /// Accumulated response body fragments for the current attempt.
    pub body: String,
}

impl PendingRequest {
    /// Creates the bookkeeping entry for a freshly submitted request.
    #[must_use]
    pub fn new(request: ControlRequest, kind: PendingKind, tutor: Box<dyn Tutor>) -> Self {
        Self {
            request,
            kind,
            tutor,
            phase: PendingPhase::Sent,
            attempt: 1,
            body: String::new(),
        }
    }

    /// Resets per-attempt state for a retransmission.
    pub fn begin_attempt(&mut self) {
        self.attempt += 1;
        self.phase = PendingPhase::Sent;
        self.body.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
