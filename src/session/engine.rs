//! Session orchestration.
//!
//! The [`SessionEngine`] owns every other component and runs as one tokio
//! task draining an unbounded ingress channel, so all session state is
//! touched from a single serialized context. Transport callbacks and
//! application commands both enter through an [`EngineHandle`]; events leave
//! through an unbounded [`SessionEvent`] channel.
//!
//! ```text
//! application ──EngineCommand──┐
//! transport ────Ingress────────┼──► mpsc ──► SessionEngine::run ──► SessionEvent
//! retry timers ─RetryTimeout───┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::correlator::{
    BackoffTutor, ControlOutcome, FireAndForgetTutor, PendingKind, Resend, RequestCorrelator,
    Resolution, Tutor,
};
use crate::error::{Error, ILLEGAL_MESSAGE_CODE, Result};
use crate::heartbeat::ReverseHeartbeatTimer;
use crate::identifiers::{RequestId, StreamEpoch, SubscriptionId};
use crate::protocol::{ControlRequest, Message, SessionRequest, SubscriptionMode, codec};
use crate::session::event::SessionEvent;
use crate::stream::{Routed, StreamPhase, StreamStateMachine};

// ============================================================================
// Constants
// ============================================================================

/// Consecutive failed stream attempts tolerated before giving up on the
/// session.
const MAX_STREAM_ATTEMPTS: u32 = 3;

// ============================================================================
// StreamTransport
// ============================================================================

/// Transport consumed by the engine.
///
/// Implementations own sockets, TLS, and reconnection mechanics; the engine
/// only asks for streams and control sends, and receives everything back
/// through the [`EngineHandle`] ingress methods, tagged with the epoch or
/// request id the transport was given here.
pub trait StreamTransport: Send + 'static {
    /// Opens a new physical stream carrying the given session request body.
    fn open_stream(&self, epoch: StreamEpoch, body: String);

    /// Sends a control request on the session's control channel.
    fn send_control(&self, request_id: RequestId, body: String);

    /// Closes the stream identified by `epoch`, if still open.
    fn close_stream(&self, epoch: StreamEpoch);
}

// ============================================================================
// Ingress
// ============================================================================

/// One event entering the engine's serialized context.
#[derive(Debug)]
pub enum Ingress {
    /// A protocol line arrived on a stream.
    Line {
        /// Stream the line arrived on.
        epoch: StreamEpoch,
        /// The raw line, without terminator.
        line: String,
    },
    /// A stream reached its regular end.
    StreamClosed {
        /// The ended stream.
        epoch: StreamEpoch,
    },
    /// A stream failed.
    StreamBroken {
        /// The failed stream.
        epoch: StreamEpoch,
        /// Transport-supplied description.
        reason: String,
    },
    /// A control request left the client.
    ControlOpened {
        /// The request.
        request_id: RequestId,
    },
    /// A chunk of a control response body arrived.
    ControlBody {
        /// The request.
        request_id: RequestId,
        /// Body fragment.
        chunk: String,
    },
    /// A control request's channel closed normally.
    ControlClosed {
        /// The request.
        request_id: RequestId,
    },
    /// A control request's channel failed.
    ControlBroken {
        /// The request.
        request_id: RequestId,
    },
    /// A retry/timeout timer fired for a control request attempt.
    RetryTimeout {
        /// The request.
        request_id: RequestId,
        /// The attempt the timer was armed for.
        attempt: u32,
    },
    /// An application command.
    Command(EngineCommand),
}

// ============================================================================
// EngineCommand
// ============================================================================

/// Application-issued operations.
#[derive(Debug)]
pub enum EngineCommand {
    /// Open a new session.
    Connect,
    /// Activate a subscription table.
    Subscribe {
        /// Table number chosen by the application.
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
    /// Deliver a user message.
    SendMessage {
        /// Sequence the message belongs to.
        sequence: String,
        /// Progressive number within the sequence.
        prog: u32,
        /// Message payload.
        payload: String,
        /// Whether the application expects an outcome notification.
        needs_ack: bool,
    },
    /// Constrain session bandwidth.
    Constrain {
        /// Requested max bandwidth in kbps; `None` means unlimited.
        max_bandwidth_kbps: Option<f64>,
    },
    /// Ask the server to close the stream so the client rebinds.
    ForceRebind,
    /// Tear the session down and stop the engine.
    Disconnect,
}

// ============================================================================
// SessionConfig
// ============================================================================

/// Static configuration for the sessions an engine opens.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Adapter set to attach to.
    pub adapter_set: Option<String>,
    /// User credential.
    pub user: Option<String>,
    /// Password credential.
    pub password: Option<String>,
    /// Reverse-heartbeat interval in milliseconds; 0 disables.
    pub heartbeat_ms: u64,
}

// ============================================================================
// StreamSession
// ============================================================================

/// The one currently established logical session.
#[derive(Debug)]
struct StreamSession {
    session_id: String,
    control_link: Option<String>,
    /// Count of countable data notifications delivered to the application.
    data_prog: u64,
    /// Replay position during recovery; armed by `PROG`, compared against
    /// `data_prog` to suppress duplicates.
    recovery_prog: Option<u64>,
}

impl StreamSession {
    fn new(session_id: String, control_link: Option<String>) -> Self {
        Self {
            session_id,
            control_link,
            data_prog: 0,
            recovery_prog: None,
        }
    }
}

// ============================================================================
// EngineHandle
// ============================================================================

/// Cloneable handle feeding the engine's ingress channel.
///
/// Used by both the application (commands) and the transport (callbacks).
/// Every method fails with [`Error::EngineClosed`] once the engine task has
/// terminated.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Ingress>,
}

impl EngineHandle {
    fn send(&self, ingress: Ingress) -> Result<()> {
        self.tx.send(ingress).map_err(|_| Error::EngineClosed)
    }

    /// Opens a new session.
    pub fn connect(&self) -> Result<()> {
        self.send(Ingress::Command(EngineCommand::Connect))
    }

    /// Activates a subscription table.
    pub fn subscribe(
        &self,
        subscription: SubscriptionId,
        data_adapter: Option<String>,
        group: impl Into<String>,
        schema: impl Into<String>,
        mode: SubscriptionMode,
        snapshot: bool,
    ) -> Result<()> {
        self.send(Ingress::Command(EngineCommand::Subscribe {
            subscription,
            data_adapter,
            group: group.into(),
            schema: schema.into(),
            mode,
            snapshot,
        }))
    }

    /// Removes a subscription table.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> Result<()> {
        self.send(Ingress::Command(EngineCommand::Unsubscribe { subscription }))
    }

    /// Changes a subscription's requested max frequency.
    pub fn reconfigure(
        &self,
        subscription: SubscriptionId,
        max_frequency: impl Into<String>,
    ) -> Result<()> {
        self.send(Ingress::Command(EngineCommand::Reconf {
            subscription,
            max_frequency: max_frequency.into(),
        }))
    }

    /// Delivers a user message.
    pub fn send_message(
        &self,
        sequence: impl Into<String>,
        prog: u32,
        payload: impl Into<String>,
        needs_ack: bool,
    ) -> Result<()> {
        self.send(Ingress::Command(EngineCommand::SendMessage {
            sequence: sequence.into(),
            prog,
            payload: payload.into(),
            needs_ack,
        }))
    }

    /// Constrains session bandwidth.
    pub fn constrain(&self, max_bandwidth_kbps: Option<f64>) -> Result<()> {
        self.send(Ingress::Command(EngineCommand::Constrain { max_bandwidth_kbps }))
    }

    /// Asks the server to close the stream so the client rebinds.
    pub fn force_rebind(&self) -> Result<()> {
        self.send(Ingress::Command(EngineCommand::ForceRebind))
    }

    /// Tears the session down and stops the engine.
    pub fn disconnect(&self) -> Result<()> {
        self.send(Ingress::Command(EngineCommand::Disconnect))
    }

    // ------------------------------------------------------------------
    // Transport ingress
    // ------------------------------------------------------------------

    /// A protocol line arrived on the stream tagged `epoch`.
    pub fn on_line(&self, epoch: StreamEpoch, line: impl Into<String>) -> Result<()> {
        self.send(Ingress::Line {
            epoch,
            line: line.into(),
        })
    }

    /// The stream tagged `epoch` ended normally.
    pub fn on_stream_closed(&self, epoch: StreamEpoch) -> Result<()> {
        self.send(Ingress::StreamClosed { epoch })
    }

    /// The stream tagged `epoch` failed.
    pub fn on_stream_broken(&self, epoch: StreamEpoch, reason: impl Into<String>) -> Result<()> {
        self.send(Ingress::StreamBroken {
            epoch,
            reason: reason.into(),
        })
    }

    /// The control request left the client.
    pub fn on_control_opened(&self, request_id: RequestId) -> Result<()> {
        self.send(Ingress::ControlOpened { request_id })
    }

    /// A control response body fragment arrived.
    pub fn on_control_body(&self, request_id: RequestId, chunk: impl Into<String>) -> Result<()> {
        self.send(Ingress::ControlBody {
            request_id,
            chunk: chunk.into(),
        })
    }

    /// The control request's channel closed normally.
    pub fn on_control_closed(&self, request_id: RequestId) -> Result<()> {
        self.send(Ingress::ControlClosed { request_id })
    }

    /// The control request's channel failed.
    pub fn on_control_broken(&self, request_id: RequestId) -> Result<()> {
        self.send(Ingress::ControlBroken { request_id })
    }
}

// ============================================================================
// SessionEngine
// ============================================================================

/// Top-level session orchestrator.
///
/// Construct with [`SessionEngine::new`], then drive with
/// [`SessionEngine::run`] (usually via [`SessionEngine::spawn`]).
pub struct SessionEngine<T: StreamTransport> {
    transport: T,
    config: SessionConfig,
    machine: StreamStateMachine,
    correlator: RequestCorrelator,
    heartbeat: ReverseHeartbeatTimer,
    session: Option<StreamSession>,
    /// Session id of the previous session, reported on re-creation so the
    /// server can release its resources.
    old_session: Option<String>,
    /// Last stream-opening request, retried after a transport interruption.
    last_open: Option<SessionRequest>,
    /// Consecutive failed stream attempts since the last `CONOK`.
    stream_attempts: u32,
    rx: mpsc::UnboundedReceiver<Ingress>,
    ingress: mpsc::UnboundedSender<Ingress>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<T: StreamTransport> SessionEngine<T> {
    /// Creates an engine plus its handle and event stream.
    #[must_use]
    pub fn new(
        transport: T,
        config: SessionConfig,
    ) -> (Self, EngineHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (ingress, rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let heartbeat = ReverseHeartbeatTimer::new(config.heartbeat_ms);
        let engine = Self {
            transport,
            config,
            machine: StreamStateMachine::new(),
            correlator: RequestCorrelator::new(),
            heartbeat,
            session: None,
            old_session: None,
            last_open: None,
            stream_attempts: 0,
            rx,
            ingress: ingress.clone(),
            events,
        };
        (engine, EngineHandle { tx: ingress }, event_rx)
    }

    /// Spawns the engine on the current tokio runtime.
    #[must_use]
    pub fn spawn(
        transport: T,
        config: SessionConfig,
    ) -> (
        EngineHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
        tokio::task::JoinHandle<()>,
    ) {
        let (engine, handle, events) = Self::new(transport, config);
        let task = tokio::spawn(engine.run());
        (handle, events, task)
    }

    /// Runs the engine until disconnected or all handles are dropped.
    pub async fn run(mut self) {
        info!("session engine started");
        loop {
            let deadline = self.heartbeat.deadline();
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(ingress) => {
                        if !self.handle_ingress(ingress) {
                            break;
                        }
                    }
                    None => break,
                },
                () = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => self.on_heartbeat_deadline(),
            }
        }
        for (request_id, kind) in self.correlator.fail_all() {
            self.fail_pending(request_id, kind);
        }
        info!("session engine stopped");
    }

    // ------------------------------------------------------------------
    // Ingress dispatch
    // ------------------------------------------------------------------

    /// Handles one ingress event; returns `false` to stop the engine.
    fn handle_ingress(&mut self, ingress: Ingress) -> bool {
        match ingress {
            Ingress::Line { epoch, line } => self.on_line(epoch, &line),
            Ingress::StreamClosed { epoch } => {
                if self.machine.on_disconnect(epoch) {
                    self.on_interruption();
                }
            }
            Ingress::StreamBroken { epoch, reason } => {
                if self.machine.on_disconnect(epoch) {
                    warn!(%epoch, reason, "stream broken");
                    self.on_interruption();
                }
            }
            Ingress::ControlOpened { request_id } => self.correlator.on_open(request_id),
            Ingress::ControlBody { request_id, chunk } => {
                self.correlator.on_message(request_id, &chunk);
            }
            Ingress::ControlClosed { request_id } => {
                if let Some(resolution) = self.correlator.on_closed(request_id) {
                    self.apply_resolution(resolution);
                }
            }
            Ingress::ControlBroken { request_id } => {
                if let Some(resolution) = self.correlator.on_broken(request_id) {
                    self.apply_resolution(resolution);
                }
            }
            Ingress::RetryTimeout { request_id, attempt } => {
                self.on_retry_timeout(request_id, attempt);
            }
            Ingress::Command(command) => return self.handle_command(command),
        }
        true
    }

    fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Connect => {
                let old_session = self.old_session.take();
                self.open_session(SessionRequest::Create {
                    adapter_set: self.config.adapter_set.clone(),
                    user: self.config.user.clone(),
                    password: self.config.password.clone(),
                    old_session,
                });
            }
            EngineCommand::Subscribe {
                subscription,
                data_adapter,
                group,
                schema,
                mode,
                snapshot,
            } => self.submit_control(
                ControlRequest::Subscribe {
                    subscription,
                    data_adapter,
                    group,
                    schema,
                    mode,
                    snapshot,
                },
                PendingKind::Subscribe { subscription },
                Box::new(BackoffTutor::default()),
            ),
            EngineCommand::Unsubscribe { subscription } => self.submit_control(
                ControlRequest::Unsubscribe { subscription },
                PendingKind::Unsubscribe { subscription },
                Box::new(BackoffTutor::default()),
            ),
            EngineCommand::Reconf {
                subscription,
                max_frequency,
            } => self.submit_control(
                ControlRequest::Reconf {
                    subscription,
                    max_frequency,
                },
                PendingKind::Reconf { subscription },
                Box::new(BackoffTutor::default()),
            ),
            EngineCommand::SendMessage {
                sequence,
                prog,
                payload,
                needs_ack,
            } => self.submit_control(
                ControlRequest::Message {
                    sequence: sequence.clone(),
                    prog,
                    payload,
                    needs_ack,
                },
                PendingKind::Message {
                    sequence,
                    prog,
                    needs_ack,
                },
                Box::new(BackoffTutor::default()),
            ),
            EngineCommand::Constrain { max_bandwidth_kbps } => self.submit_control(
                ControlRequest::Constrain { max_bandwidth_kbps },
                PendingKind::Constrain,
                Box::new(BackoffTutor::default()),
            ),
            EngineCommand::ForceRebind => {
                let Some(session_id) = self.session.as_ref().map(|s| s.session_id.clone()) else {
                    warn!("force_rebind without a session ignored");
                    return true;
                };
                self.submit_control(
                    ControlRequest::ForceRebind { session_id },
                    PendingKind::ForceRebind,
                    Box::new(FireAndForgetTutor::default()),
                );
            }
            EngineCommand::Disconnect => {
                self.disconnect();
                return false;
            }
        };
        true
    }

    // ------------------------------------------------------------------
    // Stream lifecycle
    // ------------------------------------------------------------------

    fn open_session(&mut self, request: SessionRequest) {
        let body = request.encode();
        self.last_open = Some(request);
        let epoch = self.machine.begin_attempt();
        debug!(%epoch, "opening stream");
        self.transport.open_stream(epoch, body);
        self.heartbeat.on_traffic(Instant::now());
    }

    /// A live stream of the current epoch was lost.
    fn on_interruption(&mut self) {
        self.stream_attempts += 1;
        if self.stream_attempts > MAX_STREAM_ATTEMPTS {
            error!(
                attempts = self.stream_attempts,
                "giving up on session after repeated stream failures"
            );
            self.emit(SessionEvent::ConnectionError {
                error: Error::ConnectionClosed,
            });
            self.close_session(Some(Error::ConnectionClosed));
            return;
        }
        match &self.session {
            Some(session) => {
                debug!(
                    session_id = session.session_id,
                    recovery_from = session.data_prog,
                    "stream lost, attempting recovery"
                );
                self.open_session(SessionRequest::Recover {
                    session_id: session.session_id.clone(),
                    recovery_from: session.data_prog,
                });
            }
            None => match self.last_open.take() {
                Some(request) => {
                    debug!("stream lost before session establishment, retrying");
                    self.open_session(request);
                }
                None => {
                    self.emit(SessionEvent::ConnectionError {
                        error: Error::ConnectionClosed,
                    });
                }
            },
        }
    }

    /// Closes everything and reports the terminal cause once.
    fn close_session(&mut self, cause: Option<Error>) {
        self.machine.close();
        self.transport.close_stream(self.machine.epoch());
        for (request_id, kind) in self.correlator.fail_all() {
            self.fail_pending(request_id, kind);
        }
        if let Some(session) = self.session.take() {
            self.old_session = Some(session.session_id);
        }
        self.stream_attempts = 0;
        self.last_open = None;
        self.emit(SessionEvent::Closed { cause });
    }

    /// Reports a request dropped with its session: user messages whose
    /// outcome the application still awaits become discarded; the rest only
    /// ever mattered while the session was alive.
    fn fail_pending(&mut self, request_id: RequestId, kind: PendingKind) {
        match kind {
            PendingKind::Message {
                sequence,
                prog,
                needs_ack: true,
            } => self.emit(SessionEvent::MessageDiscarded { sequence, prog }),
            other => {
                debug!(%request_id, kind = ?other, "pending request dropped with session");
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(session) = &self.session {
            // best-effort destroy; the response is not awaited
            self.submit_control(
                ControlRequest::Destroy {
                    session_id: session.session_id.clone(),
                    cause: None,
                },
                PendingKind::Destroy,
                Box::new(FireAndForgetTutor::default()),
            );
        }
        info!("disconnect requested");
        self.close_session(None);
    }

    // ------------------------------------------------------------------
    // Inbound line handling
    // ------------------------------------------------------------------

    fn on_line(&mut self, epoch: StreamEpoch, line: &str) {
        let message = match codec::decode(line) {
            Ok(message) => message,
            Err(err) => {
                error!(line, %err, "undecodable protocol line");
                self.fatal(ILLEGAL_MESSAGE_CODE, line.to_string());
                return;
            }
        };
        match self.machine.route(epoch, message) {
            Routed::Dispatch(batch) => {
                for message in batch {
                    self.dispatch_message(message);
                }
            }
            Routed::Deferred | Routed::Discarded => {}
        }
    }

    fn dispatch_message(&mut self, message: Message) {
        if message.is_countable() && !self.accept_countable() {
            trace!(?message, "replayed notification suppressed");
            return;
        }
        match message {
            Message::Conok {
                session_id,
                request_limit,
                keepalive_ms,
                control_link,
            } => self.on_conok(session_id, request_limit, keepalive_ms, control_link),
            Message::Conerr { code, message } => self.on_session_refused(code, message),
            Message::End { code, message } => {
                self.machine.close();
                self.on_session_refused(code, message);
            }
            Message::Loop { expected_delay_ms } => {
                debug!(expected_delay_ms, "rebind requested by server");
                let Some(session) = &self.session else {
                    self.fatal(ILLEGAL_MESSAGE_CODE, "LOOP without session".to_string());
                    return;
                };
                let session_id = session.session_id.clone();
                self.machine.close();
                self.open_session(SessionRequest::Bind {
                    session_id,
                    inactivity_ms: (self.config.heartbeat_ms > 0)
                        .then_some(self.config.heartbeat_ms),
                });
            }
            Message::Reqok { request_id } => {
                if let Some(id) = request_id
                    && let Some((kind, outcome)) =
                        self.correlator.resolve(RequestId::new(id), ControlOutcome::Ok)
                {
                    self.complete_request(kind, outcome);
                }
            }
            Message::Reqerr {
                request_id,
                code,
                message,
            } => self.on_control_error(Some(RequestId::new(request_id)), code, message),
            Message::Error { code, message } => self.on_control_error(None, code, message),
            Message::Subok {
                table,
                items,
                fields,
            } => self.emit(SessionEvent::Subscribed {
                subscription: SubscriptionId::new(table),
                items,
                fields,
                command_positions: None,
            }),
            Message::Subcmd {
                table,
                items,
                fields,
                key_position,
                command_position,
            } => self.emit(SessionEvent::Subscribed {
                subscription: SubscriptionId::new(table),
                items,
                fields,
                command_positions: Some((key_position, command_position)),
            }),
            Message::Unsub { table } => self.emit(SessionEvent::Unsubscribed {
                subscription: SubscriptionId::new(table),
            }),
            Message::Update { table, item, fields } => self.emit(SessionEvent::Update {
                subscription: SubscriptionId::new(table),
                item,
                fields,
            }),
            Message::ClearSnapshot { table, item } => self.emit(SessionEvent::ClearSnapshot {
                subscription: SubscriptionId::new(table),
                item,
            }),
            Message::EndOfSnapshot { table, item } => self.emit(SessionEvent::EndOfSnapshot {
                subscription: SubscriptionId::new(table),
                item,
            }),
            Message::Overflow { table, item, lost } => self.emit(SessionEvent::LostUpdates {
                subscription: SubscriptionId::new(table),
                item,
                lost,
            }),
            Message::Conf {
                table,
                frequency,
                filtered,
            } => self.emit(SessionEvent::SubscriptionConf {
                subscription: SubscriptionId::new(table),
                frequency,
                filtered,
            }),
            Message::Constrain { bandwidth } => self.emit(SessionEvent::Bandwidth(bandwidth)),
            Message::MsgDone { sequence, prog } => {
                self.emit(SessionEvent::MessageOk { sequence, prog });
            }
            Message::MsgFail {
                sequence,
                prog,
                code,
                message,
            } => self.on_msg_fail(sequence, prog, code, message),
            Message::Prog { prog } => self.on_prog(prog),
            Message::Sync { seconds } => trace!(seconds, "server clock sync"),
            Message::Probe | Message::Noop => {}
            Message::ServerName(name) => self.emit(SessionEvent::ServerName(name)),
            Message::ClientIp(ip) => self.emit(SessionEvent::ClientIp(ip)),
        }
    }

    // ------------------------------------------------------------------
    // Session establishment and refusal
    // ------------------------------------------------------------------

    fn on_conok(
        &mut self,
        session_id: String,
        request_limit: u64,
        keepalive_ms: u64,
        control_link: Option<String>,
    ) {
        self.correlator.set_request_limit(request_limit);
        self.heartbeat.on_change_interval(keepalive_ms);
        self.stream_attempts = 0;
        self.last_open = None;

        let fresh = self
            .session
            .as_ref()
            .is_none_or(|s| s.session_id != session_id);
        if fresh {
            info!(session_id, ?control_link, "session established");
            self.session = Some(StreamSession::new(session_id.clone(), control_link.clone()));
            self.emit(SessionEvent::Connected {
                session_id,
                control_link,
            });
        } else {
            // rebind or recovery of the same session: counters survive
            debug!(session_id, "session rebound");
        }
    }

    /// `CONERR` and `END` share one cause-code classification.
    fn on_session_refused(&mut self, code: i32, message: String) {
        match code {
            // session taken over by another stream: recover on a new one
            41 | 40 => {
                debug!(code, message, "session takeover, recovering");
                match &self.session {
                    Some(session) => self.open_session(SessionRequest::Recover {
                        session_id: session.session_id.clone(),
                        recovery_from: session.data_prog,
                    }),
                    None => self.fatal(code, message),
                }
            }
            // session expired or unrecoverable: start a fresh one
            48 | 20 | 4 => {
                debug!(code, message, "session unrecoverable, creating a new one");
                let old_session = self.session.take().map(|s| s.session_id);
                self.open_session(SessionRequest::Create {
                    adapter_set: self.config.adapter_set.clone(),
                    user: self.config.user.clone(),
                    password: self.config.password.clone(),
                    old_session,
                });
            }
            _ => self.fatal(code, message),
        }
    }

    /// Terminal server-side failure: notify once, drop everything else.
    fn fatal(&mut self, code: i32, message: String) {
        error!(code, message, "fatal session error");
        self.emit(SessionEvent::ServerError {
            code,
            message: message.clone(),
        });
        self.close_session(Some(Error::server(code, message)));
    }

    // ------------------------------------------------------------------
    // Control responses
    // ------------------------------------------------------------------

    /// Applies the frozen control-error precedence: 20 closes the stream and
    /// recreates the session, 11 is a server error surfaced as 21, 65 is
    /// fatal regardless of any per-request handling, anything else goes to
    /// the pending request's kind-specific handler.
    fn on_control_error(&mut self, request_id: Option<RequestId>, code: i32, message: String) {
        match code {
            20 => {
                if let Some(id) = request_id {
                    self.correlator.discard(id);
                }
                warn!(message, "sync error on control request, recreating session");
                self.machine.close();
                self.transport.close_stream(self.machine.epoch());
                self.on_session_refused(20, message);
            }
            11 => {
                if let Some(id) = request_id {
                    self.correlator.discard(id);
                }
                self.fatal(21, message);
            }
            65 => {
                if let Some(id) = request_id {
                    self.correlator.discard(id);
                }
                self.fatal(65, message);
            }
            _ => {
                let resolved = request_id.and_then(|id| {
                    self.correlator.resolve(
                        id,
                        ControlOutcome::Error {
                            code,
                            message: message.clone(),
                        },
                    )
                });
                match resolved {
                    Some((kind, outcome)) => self.complete_request(kind, outcome),
                    None => self.fatal(code, message),
                }
            }
        }
    }

    fn apply_resolution(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Completed { kind, outcome } => match &outcome {
                ControlOutcome::Ok => self.complete_request(kind, outcome),
                ControlOutcome::Error { code, message } => {
                    // re-enter the precedence table; the entry is already
                    // removed so only the kind-specific branch differs
                    match code {
                        20 | 11 | 65 => self.on_control_error(None, *code, message.clone()),
                        _ => self.complete_request(kind, outcome),
                    }
                }
            },
            Resolution::Retry {
                request_id,
                attempt,
                delay,
            } => self.schedule_retry(request_id, attempt, delay),
            Resolution::Exhausted {
                request_id,
                kind,
                attempts,
            } => self.on_exhausted(request_id, kind, attempts),
            Resolution::Illegal { text } => {
                error!(text, "unparseable control response");
                self.fatal(ILLEGAL_MESSAGE_CODE, text);
            }
        }
    }

    /// Kind-specific terminal handling of a resolved control request.
    fn complete_request(&mut self, kind: PendingKind, outcome: ControlOutcome) {
        let ControlOutcome::Error { code, message } = outcome else {
            trace!(?kind, "control request acknowledged");
            return;
        };
        match kind {
            PendingKind::Subscribe { subscription } => self.emit(SessionEvent::SubscriptionError {
                subscription,
                code,
                message,
            }),
            PendingKind::Unsubscribe { subscription } | PendingKind::Reconf { subscription } => {
                warn!(%subscription, code, message, "subscription management request failed");
            }
            PendingKind::Message {
                sequence,
                prog,
                needs_ack,
            } => {
                if needs_ack {
                    self.emit(SessionEvent::MessageError {
                        sequence,
                        prog,
                        code,
                        message,
                    });
                }
            }
            PendingKind::Constrain => {
                warn!(code, message, "bandwidth constrain refused");
            }
            PendingKind::ForceRebind | PendingKind::Destroy | PendingKind::Heartbeat => {
                trace!(?kind, code, "response error ignored");
            }
        }
    }

    fn on_exhausted(&mut self, request_id: RequestId, kind: PendingKind, attempts: u32) {
        if matches!(kind, PendingKind::Heartbeat) {
            // the next scheduled heartbeat replaces a lost one
            trace!(%request_id, "heartbeat not delivered");
            return;
        }
        warn!(%request_id, ?kind, attempts, "control request abandoned");
        self.emit(SessionEvent::ConnectionError {
            error: Error::RetriesExhausted {
                request_id,
                attempts,
            },
        });
    }

    // ------------------------------------------------------------------
    // Control submission and retries
    // ------------------------------------------------------------------

    fn submit_control(&mut self, request: ControlRequest, kind: PendingKind, tutor: Box<dyn Tutor>) {
        if self.session.is_none() {
            warn!(op = request.operation(), "control request without a session");
            self.emit(SessionEvent::ConnectionError {
                error: Error::ConnectionClosed,
            });
            return;
        }
        match self.correlator.submit(request, kind, tutor) {
            Ok(submission) => {
                self.transport
                    .send_control(submission.request_id, submission.body);
                self.heartbeat.on_traffic(Instant::now());
                self.schedule_retry(submission.request_id, submission.attempt, submission.timeout);
            }
            Err(err) => {
                warn!(%err, "control request rejected");
                self.emit(SessionEvent::ConnectionError { error: err });
            }
        }
    }

    fn schedule_retry(&self, request_id: RequestId, attempt: u32, delay: std::time::Duration) {
        let ingress = self.ingress.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = ingress.send(Ingress::RetryTimeout { request_id, attempt });
        });
    }

    fn on_retry_timeout(&mut self, request_id: RequestId, attempt: u32) {
        match self.correlator.prepare_resend(request_id, attempt) {
            Resend::Send(submission) => {
                debug!(%request_id, attempt = submission.attempt, "retransmitting control request");
                self.transport
                    .send_control(submission.request_id, submission.body);
                self.heartbeat.on_traffic(Instant::now());
                self.schedule_retry(submission.request_id, submission.attempt, submission.timeout);
            }
            Resend::GiveUp { kind, attempts } => self.on_exhausted(request_id, kind, attempts),
            Resend::Stale => {}
        }
    }

    fn on_heartbeat_deadline(&mut self) {
        if !self.heartbeat.on_fire(Instant::now()) {
            return;
        }
        if self.session.is_some() && self.machine.phase() == StreamPhase::ReadingStream {
            trace!("sending reverse heartbeat");
            self.submit_control(
                ControlRequest::Heartbeat,
                PendingKind::Heartbeat,
                Box::new(FireAndForgetTutor::default()),
            );
        }
    }

    // ------------------------------------------------------------------
    // Progressive-counter duplicate suppression
    // ------------------------------------------------------------------

    /// Counts one countable notification; returns `false` when it replays a
    /// notification already delivered before a recovery.
    fn accept_countable(&mut self) -> bool {
        let Some(session) = &mut self.session else {
            // deferred data released by CONOK always follows on_conok, so a
            // countable without a session means a server bug; drop it
            warn!("countable notification without a session dropped");
            return false;
        };
        if let Some(replay) = &mut session.recovery_prog {
            *replay += 1;
            if *replay <= session.data_prog {
                return false;
            }
        }
        session.data_prog += 1;
        true
    }

    /// `PROG` arms the replay counter at the start of a recovered stream.
    fn on_prog(&mut self, prog: u64) {
        let Some(session) = &mut self.session else {
            self.fatal(ILLEGAL_MESSAGE_CODE, format!("PROG,{prog} without session"));
            return;
        };
        if prog > session.data_prog {
            // the server claims to have sent more than we ever delivered
            let line = format!("PROG,{prog}");
            error!(
                prog,
                delivered = session.data_prog,
                "recovery counter ahead of delivered count"
            );
            self.fatal(ILLEGAL_MESSAGE_CODE, line);
            return;
        }
        debug!(prog, delivered = session.data_prog, "recovery counter armed");
        session.recovery_prog = Some(prog);
    }

    // ------------------------------------------------------------------
    // User-message outcomes
    // ------------------------------------------------------------------

    /// Classifies `MSGFAIL`: 39 discards a whole run of messages
    /// retroactively, 38 discards one, non-positive codes are adapter
    /// denials, everything else is a generic failure.
    fn on_msg_fail(&mut self, sequence: String, prog: u32, code: i32, message: String) {
        match code {
            39 => {
                // the message field carries the length of the discarded run
                let count: u32 = match message.trim().parse() {
                    Ok(n) if n >= 1 => n,
                    _ => {
                        self.fatal(
                            ILLEGAL_MESSAGE_CODE,
                            format!("MSGFAIL,{sequence},{prog},39,{message}"),
                        );
                        return;
                    }
                };
                let first = prog.saturating_sub(count - 1);
                debug!(sequence, first, last = prog, "messages discarded retroactively");
                for p in first..=prog {
                    self.emit(SessionEvent::MessageDiscarded {
                        sequence: sequence.clone(),
                        prog: p,
                    });
                }
            }
            38 => self.emit(SessionEvent::MessageDiscarded { sequence, prog }),
            c if c <= 0 => self.emit(SessionEvent::MessageDenied {
                sequence,
                prog,
                code,
                message,
            }),
            _ => self.emit(SessionEvent::MessageError {
                sequence,
                prog,
                code,
                message,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Event emission
    // ------------------------------------------------------------------

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
