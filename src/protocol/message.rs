//! Decoded protocol message types.
//!
//! A [`Message`] is one decoded protocol line; it is immutable once parsed.
//! Field-level update payloads decode into [`FieldValue`] variants.
//!
//! # Message Catalog
//!
//! | Prefix | Variant | Countable |
//! |--------|---------|-----------|
//! | `CONOK` | [`Message::Conok`] | no |
//! | `CONERR` | [`Message::Conerr`] | no |
//! | `REQOK` | [`Message::Reqok`] | no |
//! | `REQERR` | [`Message::Reqerr`] | no |
//! | `ERROR` | [`Message::Error`] | no |
//! | `SUBOK` | [`Message::Subok`] | yes |
//! | `SUBCMD` | [`Message::Subcmd`] | yes |
//! | `UNSUB` | [`Message::Unsub`] | yes |
//! | `CONS` | [`Message::Constrain`] | no |
//! | `CONF` | [`Message::Conf`] | no |
//! | `SYNC` | [`Message::Sync`] | no |
//! | `CS` | [`Message::ClearSnapshot`] | yes |
//! | `EOS` | [`Message::EndOfSnapshot`] | yes |
//! | `OV` | [`Message::Overflow`] | yes |
//! | `LOOP` | [`Message::Loop`] | no |
//! | `END` | [`Message::End`] | no |
//! | `U` | [`Message::Update`] | yes |
//! | `MSGDONE` | [`Message::MsgDone`] | yes |
//! | `MSGFAIL` | [`Message::MsgFail`] | yes |
//! | `PROG` | [`Message::Prog`] | no |
//! | `PROBE` | [`Message::Probe`] | no |
//! | `NOOP` | [`Message::Noop`] | no |
//! | `SERVNAME` | [`Message::ServerName`] | no |
//! | `CLIENTIP` | [`Message::ClientIp`] | no |
//!
//! "Countable" messages pass through the session's progressive-counter
//! duplicate-suppression check before being forwarded.

// ============================================================================
// Constants
// ============================================================================

/// Sequence name used by the server for unordered user messages (`*`).
pub const UNORDERED_MESSAGES: &str = "UNORDERED_MESSAGES";

// ============================================================================
// FieldValue
// ============================================================================

/// One subscription field's value inside an update message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// The field did not change since the previous update.
    Unchanged,
    /// The field is explicitly null (`#` token).
    Null,
    /// The field is the empty string (`$` token).
    Empty,
    /// Literal text, already unquoted.
    Literal(String),
}

impl FieldValue {
    /// Returns `true` if the field carries no new value.
    #[inline]
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }
}

// ============================================================================
// Message
// ============================================================================

/// A decoded protocol line.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Session established: `CONOK,<session id>,<request limit>,<keepalive>,<control link>`.
    Conok {
        /// Server-assigned session identifier.
        session_id: String,
        /// Maximum length in bytes of a control request body.
        request_limit: u64,
        /// Server-mandated keepalive interval in milliseconds.
        keepalive_ms: u64,
        /// Address of the server to use for control requests, if any
        /// (`*` on the wire means none).
        control_link: Option<String>,
    },

    /// Session refused or lost: `CONERR,<code>,<message>`.
    Conerr {
        /// Error code.
        code: i32,
        /// Server-supplied description.
        message: String,
    },

    /// Control request accepted: `REQOK,<request id>` (or bare `REQOK`).
    Reqok {
        /// Request this response refers to; absent for batched
        /// acknowledgements that carry no id.
        request_id: Option<u64>,
    },

    /// Control request rejected: `REQERR,<request id>,<code>,<message>`.
    Reqerr {
        /// Request this response refers to.
        request_id: u64,
        /// Error code.
        code: i32,
        /// Server-supplied description.
        message: String,
    },

    /// Asynchronous server error: `ERROR,<code>,<message>`.
    Error {
        /// Error code.
        code: i32,
        /// Server-supplied description.
        message: String,
    },

    /// Subscription activated: `SUBOK,<table>,<items>,<fields>`.
    Subok {
        /// Subscription table number.
        table: u32,
        /// Number of items.
        items: u32,
        /// Number of fields.
        fields: u32,
    },

    /// Command-mode subscription activated:
    /// `SUBCMD,<table>,<items>,<fields>,<key pos>,<command pos>`.
    Subcmd {
        /// Subscription table number.
        table: u32,
        /// Number of items.
        items: u32,
        /// Number of fields.
        fields: u32,
        /// 1-based position of the key field.
        key_position: u32,
        /// 1-based position of the command field.
        command_position: u32,
    },

    /// Subscription removed: `UNSUB,<table>`.
    Unsub {
        /// Subscription table number.
        table: u32,
    },

    /// Bandwidth constraint notification: `CONS,<bandwidth>`.
    Constrain {
        /// Granted bandwidth: a kbps figure, `unlimited`, or `unmanaged`.
        bandwidth: String,
    },

    /// Subscription reconfiguration: `CONF,<table>,<frequency>,<filtered|unfiltered>`.
    Conf {
        /// Subscription table number.
        table: u32,
        /// Real maximum update frequency (`unlimited` or updates/second).
        frequency: String,
        /// Whether the subscription is filtered.
        filtered: bool,
    },

    /// Clock synchronization hint: `SYNC,<seconds>`.
    Sync {
        /// Seconds elapsed on the server since session start.
        seconds: u64,
    },

    /// Snapshot cleared: `CS,<table>,<item>`.
    ClearSnapshot {
        /// Subscription table number.
        table: u32,
        /// 1-based item position.
        item: u32,
    },

    /// End of snapshot: `EOS,<table>,<item>`.
    EndOfSnapshot {
        /// Subscription table number.
        table: u32,
        /// 1-based item position.
        item: u32,
    },

    /// Updates lost due to buffer overflow: `OV,<table>,<item>,<lost>`.
    Overflow {
        /// Subscription table number.
        table: u32,
        /// 1-based item position.
        item: u32,
        /// Number of lost updates.
        lost: u32,
    },

    /// Rebind instruction: `LOOP,<expected delay millis>`.
    Loop {
        /// Delay the server suggests before rebinding.
        expected_delay_ms: u64,
    },

    /// Session terminated by the server: `END,<code>,<message>`.
    End {
        /// Cause code.
        code: i32,
        /// Server-supplied description.
        message: String,
    },

    /// Item update: `U,<table>,<item>,<f1>|<f2>|...`.
    Update {
        /// Subscription table number.
        table: u32,
        /// 1-based item position.
        item: u32,
        /// Decoded field values, `Unchanged` markers included.
        fields: Vec<FieldValue>,
    },

    /// User message processed: `MSGDONE,<sequence>,<prog>`.
    MsgDone {
        /// Sequence name; `*` on the wire maps to [`UNORDERED_MESSAGES`].
        sequence: String,
        /// Progressive number of the message within the sequence.
        prog: u32,
    },

    /// User message failed: `MSGFAIL,<sequence>,<prog>,<code>,<message>`.
    MsgFail {
        /// Sequence name; `*` on the wire maps to [`UNORDERED_MESSAGES`].
        sequence: String,
        /// Progressive number of the message within the sequence.
        prog: u32,
        /// Error code; 39 and 38 mean discarded, non-positive means denied.
        code: i32,
        /// Error message (for code 39, a count of discarded messages).
        message: String,
    },

    /// Recovery counter: `PROG,<prog>`.
    Prog {
        /// Count of countable notifications the server believes it sent.
        prog: u64,
    },

    /// Keepalive probe; carries no payload.
    Probe,

    /// Explicit no-op padding line.
    Noop,

    /// Server cluster node name: `SERVNAME,<name>`.
    ServerName(String),

    /// Client IP as seen by the server: `CLIENTIP,<ip>`.
    ClientIp(String),
}

impl Message {
    /// Returns `true` if this message must pass the progressive-counter
    /// duplicate-suppression check before being forwarded.
    #[must_use]
    pub fn is_countable(&self) -> bool {
        matches!(
            self,
            Self::Subok { .. }
                | Self::Subcmd { .. }
                | Self::Unsub { .. }
                | Self::ClearSnapshot { .. }
                | Self::EndOfSnapshot { .. }
                | Self::Overflow { .. }
                | Self::Update { .. }
                | Self::MsgDone { .. }
                | Self::MsgFail { .. }
        )
    }

    /// Returns `true` if this message establishes or refuses a session and
    /// is therefore meaningful while the stream is still opening.
    #[must_use]
    pub fn is_connection_outcome(&self) -> bool {
        matches!(
            self,
            Self::Conok { .. } | Self::Conerr { .. } | Self::End { .. } | Self::Error { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_countable_catalog() {
        assert!(Message::Subok { table: 1, items: 1, fields: 1 }.is_countable());
        assert!(Message::Unsub { table: 1 }.is_countable());
        assert!(
            Message::Update { table: 1, item: 1, fields: vec![] }.is_countable()
        );
        assert!(
            Message::MsgDone { sequence: "seq".into(), prog: 1 }.is_countable()
        );

        assert!(!Message::Probe.is_countable());
        assert!(!Message::Sync { seconds: 1 }.is_countable());
        assert!(
            !Message::Conf { table: 1, frequency: "unlimited".into(), filtered: true }
                .is_countable()
        );
    }

    #[test]
    fn test_connection_outcome() {
        let conok = Message::Conok {
            session_id: "S1".into(),
            request_limit: 50000,
            keepalive_ms: 5000,
            control_link: None,
        };
        assert!(conok.is_connection_outcome());
        assert!(Message::Conerr { code: 20, message: String::new() }.is_connection_outcome());
        assert!(!Message::Probe.is_connection_outcome());
    }

    #[test]
    fn test_field_value_unchanged() {
        assert!(FieldValue::Unchanged.is_unchanged());
        assert!(!FieldValue::Null.is_unchanged());
        assert!(!FieldValue::Literal("x".into()).is_unchanged());
    }
}
