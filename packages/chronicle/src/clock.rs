//! Hybrid logical clock for causal ordering.
//!
//! The clock combines a physical time source with a logical counter so that
//! every issued [`HybridTimestamp`] is strictly greater than the previous
//! one, even when the physical source stalls or jumps backward.
//!
//! # Reservations
//!
//! The pipeline timestamps a command before its events exist. To keep every
//! event of command A between A and the next command B, the timestamp stage
//! calls [`HybridClock::reserve`] with the maximum number of events a command
//! may produce. The clock then skips that many logical slots, and event `i`
//! of A is stamped `A.offset(i)`.
//!
//! ```text
//! A = 1700.0   events 1700.1 .. 1700.N   B >= 1700.(N+1)
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

// =============================================================================
// Hybrid Timestamp
// =============================================================================

/// A physical-time + logical-counter pair, totally ordered.
///
/// Ordering is lexicographic: physical milliseconds first, then the logical
/// counter. Timestamps from other processes compare the same way, which is
/// what [`HybridClock::observe`] relies on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct HybridTimestamp {
    /// Milliseconds since the Unix epoch.
    pub physical: u64,
    /// Tie-breaking counter within one physical millisecond.
    pub logical: u64,
}

impl HybridTimestamp {
    /// The smallest possible timestamp.
    pub const ZERO: HybridTimestamp = HybridTimestamp {
        physical: 0,
        logical: 0,
    };

    /// Create a timestamp from its parts.
    pub fn new(physical: u64, logical: u64) -> Self {
        Self { physical, logical }
    }

    /// The timestamp `n` logical ticks after this one.
    ///
    /// Overflow of the logical counter carries into the physical component,
    /// so the result is always `>= self` (and `> self` for `n > 0`).
    pub fn offset(self, n: u64) -> Self {
        match self.logical.checked_add(n) {
            Some(logical) => Self::new(self.physical, logical),
            None => Self::new(
                self.physical.saturating_add(1),
                n - (u64::MAX - self.logical) - 1,
            ),
        }
    }
}

impl fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical, self.logical)
    }
}

// =============================================================================
// Physical Time Source
// =============================================================================

/// Source of physical time in milliseconds since the Unix epoch.
///
/// Implementations may be coarse, stall, or jump backward; the hybrid clock
/// tolerates all of it.
pub trait PhysicalClock: Send + Sync + 'static {
    /// Current physical time in milliseconds.
    fn now(&self) -> u64;
}

/// Wall clock backed by `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl PhysicalClock for SystemClock {
    fn now(&self) -> u64 {
        // Pre-epoch clocks clamp to zero; the logical counter keeps order.
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

// =============================================================================
// Hybrid Clock
// =============================================================================

/// Hybrid logical clock shared by every pipeline of a repository.
///
/// Guarantees:
/// - Each issued timestamp is strictly greater than any previously issued
///   timestamp, and than the end of any previous reservation
/// - Monotonic even if the physical source goes backward
/// - After [`observe`](HybridClock::observe), the next timestamp exceeds the
///   observed one
pub struct HybridClock {
    source: Arc<dyn PhysicalClock>,
    /// Highest timestamp issued or reserved so far.
    last: Mutex<HybridTimestamp>,
}

impl HybridClock {
    /// Create a clock reading the system wall clock.
    pub fn new() -> Self {
        Self::with_source(Arc::new(SystemClock))
    }

    /// Create a clock over a custom physical time source.
    pub fn with_source(source: Arc<dyn PhysicalClock>) -> Self {
        Self {
            source,
            last: Mutex::new(HybridTimestamp::ZERO),
        }
    }

    /// Issue the next timestamp.
    pub fn advance(&self) -> HybridTimestamp {
        self.reserve(0)
    }

    /// Issue the next timestamp `t` and reserve `span` logical slots after it.
    ///
    /// `t.offset(1) ..= t.offset(span)` will never be issued by this clock,
    /// and every later timestamp is greater than `t.offset(span)`.
    pub fn reserve(&self, span: u64) -> HybridTimestamp {
        let now = self.source.now();
        let mut last = self.lock_last();

        let next = if now > last.physical {
            // Physical time advanced past everything issued - reset counter
            HybridTimestamp::new(now, 0)
        } else {
            // Same millisecond, stalled, or went backward - logical tick
            last.offset(1)
        };

        *last = next.offset(span);
        next
    }

    /// Merge a timestamp observed from elsewhere (another process, a replayed
    /// journal).
    ///
    /// The clock never moves backward: an older `remote` is a no-op.
    pub fn observe(&self, remote: HybridTimestamp) {
        let mut last = self.lock_last();
        if remote > *last {
            *last = remote;
        }
    }

    /// Highest timestamp issued or reserved so far.
    pub fn last(&self) -> HybridTimestamp {
        *self.lock_last()
    }

    fn lock_last(&self) -> std::sync::MutexGuard<'_, HybridTimestamp> {
        match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("clock mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridClock")
            .field("last", &self.last())
            .finish_non_exhaustive()
    }
}
