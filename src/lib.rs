//! Client-side session engine for a text-line publish/subscribe streaming
//! protocol.
//!
//! The engine multiplexes many real-time data subscriptions over one logical
//! session, carried by one physical stream at a time, and keeps the session
//! alive across transport failures, server-directed rebinds, and takeovers —
//! while delivering every data notification to the application exactly once
//! and in order.
//!
//! # Architecture
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`protocol`] | Wire codec: line decoding, field quoting, request encoding |
//! | [`stream`] | Physical stream lifecycle and epoch-based supersession |
//! | [`correlator`] | Pending control requests, response matching, retries |
//! | [`heartbeat`] | Reverse-heartbeat scheduling |
//! | [`session`] | The orchestrating engine task and application events |
//!
//! The engine runs as a single tokio task; transports and applications talk
//! to it through an [`EngineHandle`] and receive [`SessionEvent`]s back over
//! an unbounded channel. Socket handling itself is out of scope: a
//! [`StreamTransport`] implementation supplies it.
//!
//! # Example
//!
//! ```no_run
//! use streamcore::{SessionConfig, SessionEngine, SubscriptionId, SubscriptionMode};
//! # use streamcore::{StreamTransport, StreamEpoch, RequestId};
//! # struct MyTransport;
//! # impl StreamTransport for MyTransport {
//! #     fn open_stream(&self, _: StreamEpoch, _: String) {}
//! #     fn send_control(&self, _: RequestId, _: String) {}
//! #     fn close_stream(&self, _: StreamEpoch) {}
//! # }
//!
//! # async fn run() -> streamcore::Result<()> {
//! let config = SessionConfig {
//!     adapter_set: Some("DEMO".into()),
//!     ..SessionConfig::default()
//! };
//! let (handle, mut events, _task) = SessionEngine::spawn(MyTransport, config);
//! handle.connect()?;
//! handle.subscribe(
//!     SubscriptionId::new(1),
//!     None,
//!     "item1 item2",
//!     "bid ask",
//!     SubscriptionMode::Merge,
//!     true,
//! )?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod correlator;
pub mod error;
pub mod heartbeat;
pub mod identifiers;
pub mod protocol;
pub mod session;
pub mod stream;

// ============================================================================
// Re-exports
// ============================================================================

pub use correlator::{BackoffTutor, FireAndForgetTutor, RequestCorrelator, Tutor};
pub use error::{Error, Result};
pub use heartbeat::ReverseHeartbeatTimer;
pub use identifiers::{RequestId, StreamEpoch, SubscriptionId};
pub use protocol::{ControlRequest, FieldValue, Message, SessionRequest, SubscriptionMode};
pub use session::{
    EngineHandle, SessionConfig, SessionEngine, SessionEvent, StreamTransport,
};
pub use stream::{StreamPhase, StreamStateMachine};
