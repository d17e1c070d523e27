//! Wire-protocol message types and codec.
//!
//! One protocol message is one line of text. This module owns both
//! directions:
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | Decoded inbound messages and field values |
//! | `codec` | Line decoder, quoting, pattern catalog |
//! | `request` | Outbound session/control request encoding |

// ============================================================================
// Submodules
// ============================================================================

/// Decoded protocol message types.
pub mod message;

/// Text-line decoder and quoting routines.
pub mod codec;

/// Outbound request encoding.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use codec::{decode, quote, unquote};
pub use message::{FieldValue, Message, UNORDERED_MESSAGES};
pub use request::{ControlRequest, SessionRequest, SubscriptionMode};
