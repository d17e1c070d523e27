//! Application-facing session events.
//!
//! The engine reports everything through one [`SessionEvent`] enum sent over
//! an unbounded channel, so the application observes a single ordered event
//! stream instead of registering per-concern listeners.

// ============================================================================
// Imports
// ============================================================================

use crate::error::Error;
use crate::identifiers::SubscriptionId;
use crate::protocol::FieldValue;

// ============================================================================
// SessionEvent
// ============================================================================

/// One event emitted by the session engine.
///
/// Events appear in the exact order the engine processed their causes; for
/// data notifications this is the server's delivery order with duplicates
/// already suppressed.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------
    /// A session was established.
    Connected {
        /// Server-assigned session identifier.
        session_id: String,
        /// Control-link address to use for control requests, if any.
        control_link: Option<String>,
    },

    /// A transport or retry failure; the engine may already be reconnecting.
    ConnectionError {
        /// The underlying error.
        error: Error,
    },

    /// The server terminated the session fatally.
    ServerError {
        /// Protocol error code.
        code: i32,
        /// Server-supplied description.
        message: String,
    },

    /// The session is gone and no automatic recovery will follow.
    Closed {
        /// Terminal error, or `None` for a client-requested disconnect.
        cause: Option<Error>,
    },

    // ------------------------------------------------------------------
    // Subscription lifecycle
    // ------------------------------------------------------------------
    /// A subscription table went live.
    Subscribed {
        /// The activated table.
        subscription: SubscriptionId,
        /// Number of items.
        items: u32,
        /// Number of fields.
        fields: u32,
        /// Key and command field positions for command-mode tables.
        command_positions: Option<(u32, u32)>,
    },

    /// A subscription request was rejected.
    SubscriptionError {
        /// The rejected table.
        subscription: SubscriptionId,
        /// Error code.
        code: i32,
        /// Server-supplied description.
        message: String,
    },

    /// A subscription table was removed.
    Unsubscribed {
        /// The removed table.
        subscription: SubscriptionId,
    },

    /// An item update, `Unchanged` markers included.
    Update {
        /// The table the update belongs to.
        subscription: SubscriptionId,
        /// 1-based item position.
        item: u32,
        /// Decoded field values.
        fields: Vec<FieldValue>,
    },

    /// The server cleared an item's snapshot.
    ClearSnapshot {
        /// The table.
        subscription: SubscriptionId,
        /// 1-based item position.
        item: u32,
    },

    /// The snapshot of an item is complete.
    EndOfSnapshot {
        /// The table.
        subscription: SubscriptionId,
        /// 1-based item position.
        item: u32,
    },

    /// The server dropped updates for an item due to buffer overflow.
    LostUpdates {
        /// The table.
        subscription: SubscriptionId,
        /// 1-based item position.
        item: u32,
        /// Number of lost updates.
        lost: u32,
    },

    /// The server reconfigured a subscription's effective frequency.
    SubscriptionConf {
        /// The table.
        subscription: SubscriptionId,
        /// Real maximum update frequency (`unlimited` or updates/second).
        frequency: String,
        /// Whether the subscription is filtered.
        filtered: bool,
    },

    // ------------------------------------------------------------------
    // User-message lifecycle
    // ------------------------------------------------------------------
    /// A user message was processed by the server.
    MessageOk {
        /// Sequence name.
        sequence: String,
        /// Progressive number within the sequence.
        prog: u32,
    },

    /// A user message failed with a generic error.
    MessageError {
        /// Sequence name.
        sequence: String,
        /// Progressive number within the sequence.
        prog: u32,
        /// Error code.
        code: i32,
        /// Server-supplied description.
        message: String,
    },

    /// A user message was refused by the metadata adapter.
    MessageDenied {
        /// Sequence name.
        sequence: String,
        /// Progressive number within the sequence.
        prog: u32,
        /// Adapter-chosen denial code (non-positive on the wire).
        code: i32,
        /// Adapter-supplied description.
        message: String,
    },

    /// A user message was discarded without processing.
    MessageDiscarded {
        /// Sequence name.
        sequence: String,
        /// Progressive number within the sequence.
        prog: u32,
    },

    // ------------------------------------------------------------------
    // Session metadata
    // ------------------------------------------------------------------
    /// Name of the cluster node serving the session.
    ServerName(String),

    /// Client IP address as seen by the server.
    ClientIp(String),

    /// Granted session bandwidth: a kbps figure, `unlimited`, or
    /// `unmanaged`.
    Bandwidth(String),
}
