//! Cooperative cancellation
//!
//! Lock-free abort signalling between the thread running generation and any
//! thread that wants to stop it. The generation loop polls once per decode
//! step; nothing ever blocks on it.
//!
//! Every request takes a [`Ticket`] when it is issued. An abort cancels all
//! tickets issued so far, whether their request is running or still queued,
//! and leaves later tickets untouched. A stale abort therefore never reaches a
//! request issued after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies one generation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

#[derive(Debug, Default)]
struct Counters {
    /// Last ticket handed out
    issued: AtomicU64,
    /// Tickets up to and including this one are cancelled
    aborted_through: AtomicU64,
}

/// Shared abort signal for in-flight and queued generation.
///
/// Cloning yields another handle to the same signal.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<Counters>,
}

impl CancellationToken {
    /// Creates a token with nothing issued and nothing aborted
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that every request issued so far stop at its next iteration
    /// boundary.
    ///
    /// Safe to call from any thread at any time. With nothing in flight it
    /// has no effect on later requests.
    pub fn request_abort(&self) {
        let issued = self.state.issued.load(Ordering::Acquire);
        self.state.aborted_through.fetch_max(issued, Ordering::AcqRel);
    }

    /// Returns true if an abort was requested after `ticket` was issued
    pub fn is_cancelled(&self, ticket: Ticket) -> bool {
        self.state.aborted_through.load(Ordering::Acquire) >= ticket.0
    }

    /// Hands out the ticket for a new request
    pub(crate) fn issue(&self) -> Ticket {
        Ticket(self.state.issued.fetch_add(1, Ordering::AcqRel) + 1)
    }
}
