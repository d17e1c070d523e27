//! Outbound request encoding.
//!
//! Requests are `LS_*` key=value pairs joined by `&`, with values
//! percent-encoded. Two families exist:
//!
//! - [`SessionRequest`] — opens a physical stream (create / bind / recovery);
//!   sent through the transport's `open_stream` path and never correlated.
//! - [`ControlRequest`] — rides an existing session; carries an `LS_reqId`
//!   assigned by the request correlator and is answered by
//!   `REQOK`/`REQERR`/`ERROR`.
//!
//! Parameter names are frozen by the protocol version and are not
//! redesigned here.

// ============================================================================
// Imports
// ============================================================================

use crate::identifiers::{RequestId, SubscriptionId};

// ============================================================================
// ParamWriter
// ============================================================================

/// Accumulates `key=value` pairs in the control-request grammar.
struct ParamWriter {
    buf: String,
}

impl ParamWriter {
    fn new() -> Self {
        Self { buf: String::new() }
    }

    fn param(&mut self, key: &str, value: &str) -> &mut Self {
        if !self.buf.is_empty() {
            self.buf.push('&');
        }
        self.buf.push_str(key);
        self.buf.push('=');
        self.buf.push_str(&urlencoding::encode(value));
        self
    }

    fn opt_param(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.param(key, value);
        }
        self
    }

    fn finish(self) -> String {
        self.buf
    }
}

// ============================================================================
// SessionRequest
// ============================================================================

/// A stream-opening request: create a new session, bind an existing one to a
/// fresh stream, or recover one after a transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    /// Start a brand-new session.
    Create {
        /// Adapter set to attach to.
        adapter_set: Option<String>,
        /// User credential.
        user: Option<String>,
        /// Password credential.
        password: Option<String>,
        /// Session being replaced, when reconnecting after expiry.
        old_session: Option<String>,
    },

    /// Bind an existing session to a new physical stream.
    Bind {
        /// Session to bind.
        session_id: String,
        /// Maximum client inactivity the server should tolerate, in
        /// milliseconds; drives the reverse-heartbeat ceiling.
        inactivity_ms: Option<u64>,
    },

    /// Recover an existing session, replaying from a known counter.
    Recover {
        /// Session to recover.
        session_id: String,
        /// Count of countable notifications already received; the server
        /// resumes delivery just past this point.
        recovery_from: u64,
    },
}

impl SessionRequest {
    /// The `LS_op`-style operation name for this request.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create_session",
            Self::Bind { .. } => "bind_session",
            Self::Recover { .. } => "recovery",
        }
    }

    /// Encodes the request body.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut w = ParamWriter::new();
        w.param("LS_op", self.operation());
        match self {
            Self::Create {
                adapter_set,
                user,
                password,
                old_session,
            } => {
                w.opt_param("LS_adapter_set", adapter_set.as_deref())
                    .opt_param("LS_user", user.as_deref())
                    .opt_param("LS_password", password.as_deref())
                    .opt_param("LS_old_session", old_session.as_deref());
            }
            Self::Bind {
                session_id,
                inactivity_ms,
            } => {
                w.param("LS_session", session_id);
                if let Some(ms) = inactivity_ms {
                    w.param("LS_inactivity_millis", &ms.to_string());
                }
            }
            Self::Recover {
                session_id,
                recovery_from,
            } => {
                w.param("LS_session", session_id)
                    .param("LS_recovery_from", &recovery_from.to_string());
            }
        }
        w.finish()
    }
}

// ============================================================================
// SubscriptionMode
// ============================================================================

/// Delivery mode of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Per-field merging of consecutive updates.
    Merge,
    /// Every update delivered separately.
    Distinct,
    /// Add/update/delete command interpretation.
    Command,
    /// No server-side interpretation.
    Raw,
}

impl SubscriptionMode {
    /// Wire name of the mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "MERGE",
            Self::Distinct => "DISTINCT",
            Self::Command => "COMMAND",
            Self::Raw => "RAW",
        }
    }
}

// ============================================================================
// ControlRequest
// ============================================================================

/// A control request riding an established session.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// Activate a subscription table.
    Subscribe {
        /// Table number chosen by the client.
        subscription: SubscriptionId,
        /// Data adapter within the adapter set.
        data_adapter: Option<String>,
        /// Item group name.
        group: String,
        /// Field schema name.
        schema: String,
        /// Delivery mode.
        mode: SubscriptionMode,
        /// Whether a snapshot is requested.
        snapshot: bool,
    },

    /// Remove a subscription table.
    Unsubscribe {
        /// Table to remove.
        subscription: SubscriptionId,
    },

    /// Change a live subscription's requested max frequency.
    Reconf {
        /// Table to reconfigure.
        subscription: SubscriptionId,
        /// New frequency: updates/second or `unlimited`.
        max_frequency: String,
    },

    /// Deliver a user message to the server.
    Message {
        /// Sequence the message belongs to.
        sequence: String,
        /// Progressive number within the sequence.
        prog: u32,
        /// Message payload.
        payload: String,
        /// Whether the client expects a processing outcome notification.
        needs_ack: bool,
    },

    /// Constrain session bandwidth.
    Constrain {
        /// Requested max bandwidth in kbps; `None` means unlimited.
        max_bandwidth_kbps: Option<f64>,
    },

    /// Ask the server to close the stream so the client can rebind.
    ForceRebind {
        /// Session to rebind.
        session_id: String,
    },

    /// Destroy a session server-side.
    Destroy {
        /// Session to destroy.
        session_id: String,
        /// Optional close cause reported to the server.
        cause: Option<String>,
    },

    /// Reverse heartbeat; carries no application payload.
    Heartbeat,
}

impl ControlRequest {
    /// The `LS_op` operation name for this request.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "add",
            Self::Unsubscribe { .. } => "delete",
            Self::Reconf { .. } => "reconf",
            Self::Message { .. } => "msg",
            Self::Constrain { .. } => "constrain",
            Self::ForceRebind { .. } => "force_rebind",
            Self::Destroy { .. } => "destroy",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Encodes the request body with its correlation id.
    #[must_use]
    pub fn encode(&self, request_id: RequestId) -> String {
        let mut w = ParamWriter::new();
        w.param("LS_reqId", &request_id.to_string())
            .param("LS_op", self.operation());
        match self {
            Self::Subscribe {
                subscription,
                data_adapter,
                group,
                schema,
                mode,
                snapshot,
            } => {
                w.param("LS_subId", &subscription.to_string())
                    .opt_param("LS_data_adapter", data_adapter.as_deref())
                    .param("LS_group", group)
                    .param("LS_schema", schema)
                    .param("LS_mode", mode.as_str())
                    .param("LS_snapshot", if *snapshot { "true" } else { "false" });
            }
            Self::Unsubscribe { subscription } => {
                w.param("LS_subId", &subscription.to_string());
            }
            Self::Reconf {
                subscription,
                max_frequency,
            } => {
                w.param("LS_subId", &subscription.to_string())
                    .param("LS_requested_max_frequency", max_frequency);
            }
            Self::Message {
                sequence,
                prog,
                payload,
                needs_ack,
            } => {
                w.param("LS_sequence", sequence)
                    .param("LS_msg_prog", &prog.to_string())
                    .param("LS_message", payload);
                if !needs_ack {
                    w.param("LS_outcome", "false");
                }
            }
            Self::Constrain { max_bandwidth_kbps } => {
                match max_bandwidth_kbps {
                    Some(kbps) => w.param("LS_requested_max_bandwidth", &kbps.to_string()),
                    None => w.param("LS_requested_max_bandwidth", "unlimited"),
                };
            }
            Self::ForceRebind { session_id } => {
                w.param("LS_session", session_id);
            }
            Self::Destroy { session_id, cause } => {
                w.param("LS_session", session_id)
                    .opt_param("LS_cause", cause.as_deref());
            }
            Self::Heartbeat => {}
        }
        w.finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_create_session() {
        let req = SessionRequest::Create {
            adapter_set: Some("DEMO".into()),
            user: Some("user".into()),
            password: None,
            old_session: None,
        };
        assert_eq!(
            req.encode(),
            "LS_op=create_session&LS_adapter_set=DEMO&LS_user=user"
        );
    }

    #[test]
    fn test_encode_bind_with_inactivity() {
        let req = SessionRequest::Bind {
            session_id: "S1".into(),
            inactivity_ms: Some(5000),
        };
        assert_eq!(
            req.encode(),
            "LS_op=bind_session&LS_session=S1&LS_inactivity_millis=5000"
        );
    }

    #[test]
    fn test_encode_recovery() {
        let req = SessionRequest::Recover {
            session_id: "S1".into(),
            recovery_from: 42,
        };
        assert_eq!(
            req.encode(),
            "LS_op=recovery&LS_session=S1&LS_recovery_from=42"
        );
    }

    #[test]
    fn test_encode_subscribe() {
        let req = ControlRequest::Subscribe {
            subscription: SubscriptionId::new(1),
            data_adapter: None,
            group: "item1 item2".into(),
            schema: "bid ask".into(),
            mode: SubscriptionMode::Merge,
            snapshot: true,
        };
        assert_eq!(
            req.encode(RequestId::new(3)),
            "LS_reqId=3&LS_op=add&LS_subId=1&LS_group=item1%20item2\
             &LS_schema=bid%20ask&LS_mode=MERGE&LS_snapshot=true"
        );
    }

    #[test]
    fn test_encode_message_without_ack() {
        let req = ControlRequest::Message {
            sequence: "seq1".into(),
            prog: 7,
            payload: "a=b&c".into(),
            needs_ack: false,
        };
        let body = req.encode(RequestId::new(9));
        assert!(body.starts_with("LS_reqId=9&LS_op=msg&LS_sequence=seq1&LS_msg_prog=7"));
        // payload must be percent-encoded so it cannot break the grammar
        assert!(body.contains("LS_message=a%3Db%26c"));
        assert!(body.ends_with("LS_outcome=false"));
    }

    #[test]
    fn test_encode_heartbeat() {
        assert_eq!(
            ControlRequest::Heartbeat.encode(RequestId::new(1)),
            "LS_reqId=1&LS_op=heartbeat"
        );
    }

    #[test]
    fn test_encode_constrain_unlimited() {
        let req = ControlRequest::Constrain {
            max_bandwidth_kbps: None,
        };
        assert_eq!(
            req.encode(RequestId::new(2)),
            "LS_reqId=2&LS_op=constrain&LS_requested_max_bandwidth=unlimited"
        );
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(
            ControlRequest::Unsubscribe { subscription: SubscriptionId::new(1) }.operation(),
            "delete"
        );
        assert_eq!(
            ControlRequest::ForceRebind { session_id: "S1".into() }.operation(),
            "force_rebind"
        );
        assert_eq!(
            SessionRequest::Recover { session_id: "S1".into(), recovery_from: 0 }.operation(),
            "recovery"
        );
    }
}
