//! Control-request correlation and retry driving.
//!
//! The [`RequestCorrelator`] tracks outstanding control requests, matches
//! asynchronous `REQOK`/`REQERR`/`ERROR` responses to the right pending
//! request, and consults each request's tutor on timeout or transport
//! failure. Resolution is exactly-once: a request that has completed ignores
//! any further transport callbacks.
//!
//! Two response paths exist and converge here:
//!
//! - in-stream responses routed by the session engine ([`RequestCorrelator::resolve`]);
//! - per-request transport bodies accumulated through
//!   `on_open`/`on_message`/`on_closed`/`on_broken`.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `pending` | Pending-request bookkeeping and kind tags |
//! | `tutor` | Retry/backoff policies |

// ============================================================================
// Submodules
// ============================================================================

/// Pending control-request bookkeeping.
pub mod pending;

/// Per-request retry policies.
pub mod tutor;

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;
use crate::protocol::{ControlRequest, Message, codec};

pub use pending::{PendingKind, PendingPhase, PendingRequest};
pub use tutor::{BackoffTutor, FireAndForgetTutor, Tutor};

// ============================================================================
// Constants
// ============================================================================

/// Maximum pending requests before rejecting new ones.
const MAX_PENDING_REQUESTS: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// Result of submitting a request: what to hand to the transport, plus the
/// timeout after which the tutor should be consulted for a retransmission.
#[derive(Debug)]
pub struct Submission {
    /// Correlation id assigned to the request.
    pub request_id: RequestId,
    /// Encoded request body.
    pub body: String,
    /// Physical attempt this submission belongs to.
    pub attempt: u32,
    /// Tutor-provided timeout before the attempt is considered lost.
    pub timeout: Duration,
}

/// Parsed outcome of a control response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// `REQOK`.
    Ok,
    /// `REQERR` or `ERROR`.
    Error {
        /// Protocol error code.
        code: i32,
        /// Server-supplied description.
        message: String,
    },
}

/// Terminal or retry decision produced by a transport callback.
#[derive(Debug)]
pub enum Resolution {
    /// The request reached a terminal response.
    Completed {
        /// Purpose tag of the resolved request.
        kind: PendingKind,
        /// Parsed outcome.
        outcome: ControlOutcome,
    },
    /// The attempt failed and the tutor approved a retransmission after
    /// `delay`; the caller schedules [`RequestCorrelator::prepare_resend`].
    Retry {
        /// Request to retransmit.
        request_id: RequestId,
        /// Attempt that failed; guards against stale timers.
        attempt: u32,
        /// Backoff delay before retransmission.
        delay: Duration,
    },
    /// The tutor refused further attempts; the request was dropped.
    Exhausted {
        /// The abandoned request.
        request_id: RequestId,
        /// Purpose tag.
        kind: PendingKind,
        /// Attempts performed.
        attempts: u32,
    },
    /// The response body was not a recognizable control response.
    Illegal {
        /// The offending body text.
        text: String,
    },
}

/// Decision produced when a retry timer fires.
#[derive(Debug)]
pub enum Resend {
    /// Retransmit with this submission.
    Send(Submission),
    /// The tutor refused further attempts; the request was dropped.
    GiveUp {
        /// Purpose tag.
        kind: PendingKind,
        /// Attempts performed.
        attempts: u32,
    },
    /// The timer refers to a superseded attempt or a resolved request.
    Stale,
}

// ============================================================================
// RequestCorrelator
// ============================================================================

/// Tracks outstanding control requests and drives their retry policy.
///
/// # Thread Safety
///
/// Submit/resolve operations are mutually exclusive per request id (one
/// table lock); the flow-control limit is an independent atomic gate.
pub struct RequestCorrelator {
    pending: Mutex<FxHashMap<RequestId, PendingRequest>>,
    next_id: AtomicU64,
    /// Server-mandated maximum request body length in bytes; 0 = unlimited.
    request_limit: AtomicU64,
}

impl RequestCorrelator {
    /// Creates an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            request_limit: AtomicU64::new(0),
        }
    }

    /// Installs the request length limit reported by `CONOK`.
    pub fn set_request_limit(&self, limit: u64) {
        self.request_limit.store(limit, Ordering::Relaxed);
        debug!(limit, "request limit installed");
    }

    /// Returns the number of pending requests.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Registers a request and returns what to hand to the transport.
    ///
    /// # Errors
    ///
    /// - [`Error::TooManyPending`] if the pending table is full
    /// - [`Error::RequestTooLong`] if the encoded body exceeds the
    ///   server-mandated limit
    pub fn submit(
        &self,
        request: ControlRequest,
        kind: PendingKind,
        tutor: Box<dyn Tutor>,
    ) -> Result<Submission> {
        let mut pending = self.pending.lock();
        if pending.len() >= MAX_PENDING_REQUESTS {
            warn!(
                pending = pending.len(),
                max = MAX_PENDING_REQUESTS,
                "too many pending requests"
            );
            return Err(Error::TooManyPending {
                pending: pending.len(),
                limit: MAX_PENDING_REQUESTS,
            });
        }

        let request_id = RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let body = request.encode(request_id);

        let limit = self.request_limit.load(Ordering::Relaxed);
        if limit > 0 && body.len() as u64 > limit {
            return Err(Error::RequestTooLong {
                request_id,
                length: body.len(),
                limit,
            });
        }

        let entry = PendingRequest::new(request, kind, tutor);
        let timeout = entry.tutor.retry_delay();
        pending.insert(request_id, entry);
        trace!(%request_id, op = ?body.split('&').nth(1), "control request submitted");

        Ok(Submission {
            request_id,
            body,
            attempt: 1,
            timeout,
        })
    }

    /// Transport confirmed the request left the client.
    pub fn on_open(&self, request_id: RequestId) {
        if let Some(entry) = self.pending.lock().get_mut(&request_id)
            && entry.phase == PendingPhase::Sent
        {
            entry.phase = PendingPhase::Opened;
            entry.tutor.notify_sender(false);
        }
    }

    /// Accumulates a response body fragment (control responses may be
    /// chunked).
    pub fn on_message(&self, request_id: RequestId, chunk: &str) {
        if let Some(entry) = self.pending.lock().get_mut(&request_id) {
            entry.body.push_str(chunk);
        }
    }

    /// Transport closed the request's stream.
    ///
    /// Returns `None` when the request is already resolved, is awaiting an
    /// approved retry, or yielded no information (empty body after an opened
    /// attempt: the request stays pending for its tutor timeout).
    pub fn on_closed(&self, request_id: RequestId) -> Option<Resolution> {
        let mut pending = self.pending.lock();
        let entry = pending.get_mut(&request_id)?;

        match entry.phase {
            PendingPhase::AwaitingRetry => None,
            PendingPhase::Sent => {
                // never opened: transport-level failure
                entry.tutor.notify_sender(true);
                Self::retry_or_exhaust(&mut pending, request_id)
            }
            PendingPhase::Opened => {
                if entry.body.trim().is_empty() {
                    // The server probably closed the socket without
                    // answering; wait for the tutor timeout instead of
                    // guessing success or failure.
                    trace!(%request_id, "empty control response, request stays pending");
                    return None;
                }
                let body = std::mem::take(&mut entry.body);
                let outcome = match Self::parse_response(&body) {
                    Ok(outcome) => outcome,
                    Err(text) => {
                        pending.remove(&request_id);
                        return Some(Resolution::Illegal { text });
                    }
                };
                let entry = pending.remove(&request_id)?;
                Some(Resolution::Completed {
                    kind: entry.kind,
                    outcome,
                })
            }
        }
    }

    /// Transport broke the request's stream before completion.
    ///
    /// Same as the early-failure branch of [`Self::on_closed`], but fires
    /// even when bytes were already read: a broken body is never parsed.
    pub fn on_broken(&self, request_id: RequestId) -> Option<Resolution> {
        let mut pending = self.pending.lock();
        let entry = pending.get_mut(&request_id)?;
        match entry.phase {
            PendingPhase::AwaitingRetry => None,
            PendingPhase::Sent | PendingPhase::Opened => {
                entry.tutor.notify_sender(true);
                Self::retry_or_exhaust(&mut pending, request_id)
            }
        }
    }

    /// Resolves an in-stream `REQOK`/`REQERR` routed by the session engine.
    pub fn resolve(
        &self,
        request_id: RequestId,
        outcome: ControlOutcome,
    ) -> Option<(PendingKind, ControlOutcome)> {
        let entry = self.pending.lock().remove(&request_id);
        match entry {
            Some(entry) => Some((entry.kind, outcome)),
            None => {
                warn!(%request_id, "response for unknown or resolved request");
                None
            }
        }
    }

    /// A retry timer fired for the given attempt.
    ///
    /// Covers both tutor-approved retransmissions after a failure and plain
    /// timeouts of attempts that never resolved.
    pub fn prepare_resend(&self, request_id: RequestId, attempt: u32) -> Resend {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&request_id) else {
            return Resend::Stale;
        };
        if entry.attempt != attempt {
            return Resend::Stale;
        }

        let approved = entry.phase == PendingPhase::AwaitingRetry;
        if !approved && !entry.tutor.should_retry() {
            let Some(entry) = pending.remove(&request_id) else {
                return Resend::Stale;
            };
            debug!(%request_id, attempts = entry.tutor.attempts(), "request retries exhausted");
            return Resend::GiveUp {
                kind: entry.kind,
                attempts: entry.tutor.attempts(),
            };
        }

        entry.begin_attempt();
        let body = entry.request.encode(request_id);
        let timeout = entry.tutor.retry_delay();
        trace!(%request_id, attempt = entry.attempt, "control request retransmission");
        Resend::Send(Submission {
            request_id,
            body,
            attempt: entry.attempt,
            timeout,
        })
    }

    /// Discards a single pending request without resolving it.
    pub fn discard(&self, request_id: RequestId) {
        if let Some(mut entry) = self.pending.lock().remove(&request_id) {
            entry.tutor.discard();
        }
    }

    /// Fails every pending request, returning their tags so the caller can
    /// report the loss to whoever still awaits an outcome. Used when the
    /// session is torn down.
    pub fn fail_all(&self) -> Vec<(RequestId, PendingKind)> {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "failed pending requests on teardown");
        }
        drained
            .into_iter()
            .map(|(id, entry)| (id, entry.kind))
            .collect()
    }

    /// Applies the tutor decision after a failed attempt. The entry must
    /// exist and have just been notified.
    fn retry_or_exhaust(
        pending: &mut FxHashMap<RequestId, PendingRequest>,
        request_id: RequestId,
    ) -> Option<Resolution> {
        let entry = pending.get_mut(&request_id)?;
        if entry.tutor.should_retry() {
            entry.phase = PendingPhase::AwaitingRetry;
            Some(Resolution::Retry {
                request_id,
                attempt: entry.attempt,
                delay: entry.tutor.retry_delay(),
            })
        } else {
            let entry = pending.remove(&request_id)?;
            Some(Resolution::Exhausted {
                request_id,
                kind: entry.kind,
                attempts: entry.tutor.attempts(),
            })
        }
    }

    /// Parses an accumulated control response body.
    fn parse_response(body: &str) -> std::result::Result<ControlOutcome, String> {
        let line = body.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        match codec::decode(line.trim_end_matches('\r')) {
            Ok(Message::Reqok { .. }) => Ok(ControlOutcome::Ok),
            Ok(Message::Reqerr { code, message, .. }) | Ok(Message::Error { code, message }) => {
                Ok(ControlOutcome::Error { code, message })
            }
            _ => Err(body.to_string()),
        }
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
