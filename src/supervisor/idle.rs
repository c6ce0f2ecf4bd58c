//! Idle budget arithmetic.
//!
//! The supervisor re-derives the wait budget from absolute timestamps on
//! every iteration, so the cutoff means "no output for `idle_budget`
//! consecutive time" regardless of how many loop turns happened in between.

use std::time::Duration;
use tokio::time::Instant;

/// Time left before the idle cutoff fires.
///
/// Returns `max(0, idle_budget - (now - last_activity_at))`. A `now` earlier
/// than `last_activity_at` counts as zero elapsed time.
pub fn remaining(now: Instant, last_activity_at: Instant, idle_budget: Duration) -> Duration {
    let elapsed = now.saturating_duration_since(last_activity_at);
    idle_budget.saturating_sub(elapsed)
}
