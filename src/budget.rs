use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// A shared, monotonically decreasing time budget for one logical connect.
///
/// One `ConnectBudget` is created per connect call and threaded through every
/// blocking step of it: DNS resolution, each candidate connect attempt,
/// named-pipe busy polling, and the TLS handshake. Call [`check`] before each
/// blocking step; once the remaining time reaches zero every further check
/// fails with [`Error::ConnectTimeout`] and no further blocking call should
/// be attempted.
///
/// [`check`]: ConnectBudget::check
#[derive(Debug)]
pub struct ConnectBudget {
    total: Option<Duration>,
    remaining: Duration,
    last_check: Instant,
}

impl ConnectBudget {
    /// Create a budget of `total` time; `None` means unlimited.
    pub fn new(total: Option<Duration>) -> Self {
        ConnectBudget {
            total,
            remaining: total.unwrap_or(Duration::ZERO),
            last_check: Instant::now(),
        }
    }

    /// A budget that never expires.
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Whether any timeout is configured at all.
    pub fn is_limited(&self) -> bool {
        self.total.is_some()
    }

    /// Deduct the wall time elapsed since the previous checkpoint.
    ///
    /// Fails with [`Error::ConnectTimeout`] when the budget is exhausted.
    pub fn check(&mut self) -> Result<()> {
        let now = Instant::now();
        let elapsed = now - self.last_check;
        self.last_check = now;

        if self.total.is_none() {
            return Ok(());
        }

        self.remaining = self.remaining.saturating_sub(elapsed);

        if self.remaining.is_zero() {
            return Err(Error::ConnectTimeout);
        }

        Ok(())
    }

    /// Time left, as of the last checkpoint. `None` means unlimited.
    pub fn remaining(&self) -> Option<Duration> {
        self.total.map(|_| self.remaining)
    }

    /// Bound a single step: the smaller of an explicit per-step timeout and
    /// the remaining budget. `None` only if neither bound applies.
    pub fn bound(&self, explicit: Option<Duration>) -> Option<Duration> {
        match (explicit, self.remaining()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }
}
