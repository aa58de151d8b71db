//! Core configuration.

use std::time::Duration;

use luckyones_crypto::SessionLimits;

/// Lifetimes and memory bounds shared by the router and the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreConfig {
    /// Lifetime of public and private threads
    pub thread_ttl: Duration,
    /// Lifetime of an attachment, independent of its thread
    pub attachment_ttl: Duration,
    /// Per-session skip window and cache size
    pub session_limits: SessionLimits,
    /// Message references kept per thread (oldest dropped first)
    pub max_thread_messages: usize,
}

impl CoreConfig {
    /// Twelve hours.
    pub const DEFAULT_THREAD_TTL: Duration = Duration::from_secs(12 * 60 * 60);

    /// Thirty minutes.
    pub const DEFAULT_ATTACHMENT_TTL: Duration = Duration::from_secs(30 * 60);
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            thread_ttl: Self::DEFAULT_THREAD_TTL,
            attachment_ttl: Self::DEFAULT_ATTACHMENT_TTL,
            session_limits: SessionLimits::default(),
            max_thread_messages: 500,
        }
    }
}
