use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff with jitter for lock polling.
///
/// Delays start at `min`, double on every call and stop growing at `max`.
/// Each delay gets up to a quarter of itself added as random jitter so that
/// processes contending for the same key spread their polls out.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    next: Duration,
    max: Duration,
}

impl PollBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            next: min.min(max),
            max,
        }
    }

    /// Delay before the next poll.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.advance();
        base + jitter(base)
    }

    fn advance(&mut self) -> Duration {
        let base = self.next;
        self.next = base.saturating_mul(2).min(self.max);
        base
    }
}

fn jitter(base: Duration) -> Duration {
    let cap = base.as_millis() as u64 / 4;
    if cap == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
}
