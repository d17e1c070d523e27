//! Type-safe identifiers for protocol entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time:
//! a [`RequestId`] correlates a control request with its response, a
//! [`SubscriptionId`] names a subscription table, and a [`StreamEpoch`]
//! tags one physical stream attempt so that callbacks from a superseded
//! stream can be recognized and discarded.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

// ============================================================================
// RequestId
// ============================================================================

/// Identifier of one outbound control request.
///
/// Assigned sequentially by the request correlator and echoed back by the
/// server in `REQOK`/`REQERR` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Creates a request ID from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// SubscriptionId
// ============================================================================

/// Identifier of a subscription table within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u32);

impl SubscriptionId {
    /// Creates a subscription ID from a raw table number.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw table number.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// StreamEpoch
// ============================================================================

/// Generation counter attached to each physical stream attempt.
///
/// Every create/bind/recovery attempt bumps the epoch. Transport callbacks
/// carry the epoch of the stream that produced them; events whose epoch does
/// not match the current one come from a superseded stream and are ignored.
/// This replaces per-listener "disabled" flags with a single comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamEpoch(u64);

impl StreamEpoch {
    /// The epoch before any stream attempt was made.
    pub const INITIAL: Self = Self(0);

    /// Creates an epoch from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the next epoch.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_roundtrip() {
        let id = RequestId::new(42);
        assert_eq!(id.value(), 42);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_epoch_next() {
        let epoch = StreamEpoch::INITIAL;
        assert_eq!(epoch.value(), 0);
        assert_eq!(epoch.next().value(), 1);
        assert_ne!(epoch, epoch.next());
    }

    #[test]
    fn test_subscription_id_ordering() {
        assert!(SubscriptionId::new(1) < SubscriptionId::new(2));
    }
}
