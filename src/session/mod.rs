//! Session orchestration and application events.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `engine` | The session engine task, its handle, and the transport trait |
//! | `event` | Application-facing event enum |

// ============================================================================
// Submodules
// ============================================================================

/// The session engine and its surrounding plumbing.
pub mod engine;

/// Application-facing session events.
pub mod event;

// ============================================================================
// Re-exports
// ============================================================================

pub use engine::{
    EngineCommand, EngineHandle, Ingress, SessionConfig, SessionEngine, StreamTransport,
};
pub use event::SessionEvent;
