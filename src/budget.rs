use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Single wall-clock cutoff shared by every network call of one request.
///
/// Cheap to clone; all clones observe the same instant and the same
/// cancellation token, so cancelling one cancels them all.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    token: CancellationToken,
}

/// Returned by [`Deadline::run`] when the cutoff fires before the future completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired;

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            token: CancellationToken::new(),
        }
    }

    pub fn remaining(&self) -> Duration {
        if self.token.is_cancelled() {
            return Duration::ZERO;
        }
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Per-call timeout: the smaller of `ceiling` and what is left of the budget.
    pub fn clamp(&self, ceiling: Duration) -> Duration {
        ceiling.min(self.remaining())
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Drive `fut` until it completes, the deadline passes, or the token is cancelled.
    /// On expiry the future is dropped, which aborts any in-flight request it owns.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Expired> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Expired),
            _ = tokio::time::sleep_until(self.at) => Err(Expired),
            out = fut => Ok(out),
        }
    }
}
