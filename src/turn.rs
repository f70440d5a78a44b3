//! Turn tokens: supersession-as-filtering instead of hard cancellation.
//!
//! Every outbound turn is tagged with a strictly increasing token. Starting
//! a new turn supersedes the previous one; in-flight requests are left to
//! finish on their own, and every consumer checks [`TurnCounter::is_current`]
//! before applying any observable effect. Late events from a superseded turn
//! become no-ops rather than racing an abort.

use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier for one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnToken(u64);

/// Issues turn tokens and tracks which one is current.
///
/// Shared across the engine behind an `Arc`; all methods are lock-free.
#[derive(Debug, Default)]
pub struct TurnCounter {
    current: AtomicU64,
}

impl TurnCounter {
    /// Create a counter with no turn started yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new token and atomically make it current.
    pub fn begin_turn(&self) -> TurnToken {
        let id = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        TurnToken(id)
    }

    /// Whether `token` is still the current turn.
    pub fn is_current(&self, token: TurnToken) -> bool {
        self.current.load(Ordering::Acquire) == token.0
    }

    /// The most recently minted token.
    pub fn current(&self) -> TurnToken {
        TurnToken(self.current.load(Ordering::Acquire))
    }
}
