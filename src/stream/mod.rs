//! Physical stream lifecycle.
//!
//! A *stream* is one physical transport attempt (HTTP long poll or WebSocket
//! connection) binding to a logical session. The state machine here owns the
//! phase of the current attempt and routes inbound messages accordingly.

// ============================================================================
// Submodules
// ============================================================================

/// Stream phases, epoch supersession, and message routing.
pub mod machine;

// ============================================================================
// Re-exports
// ============================================================================

pub use machine::{Routed, StreamPhase, StreamStateMachine};
