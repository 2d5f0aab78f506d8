//! Fault injection hooks shared by the downstream services.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Faults a service applies to incoming commands. Cloning shares the plan.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    inner: Arc<FaultState>,
}

#[derive(Debug, Default)]
struct FaultState {
    outage: AtomicBool,
    fail_next: AtomicU32,
    drop_next_replies: AtomicU32,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every command fail as unavailable until cleared.
    pub fn set_outage(&self, down: bool) {
        self.inner.outage.store(down, Ordering::SeqCst);
    }

    /// Makes the next `count` commands fail as unavailable.
    pub fn fail_next(&self, count: u32) {
        self.inner.fail_next.store(count, Ordering::SeqCst);
    }

    /// Processes the next `count` commands but never sends their replies.
    pub fn drop_next_replies(&self, count: u32) {
        self.inner.drop_next_replies.store(count, Ordering::SeqCst);
    }

    /// Returns true if the current command must fail. Consumes one
    /// fail-next credit.
    pub fn should_fail(&self) -> bool {
        self.inner.outage.load(Ordering::SeqCst) || take_one(&self.inner.fail_next)
    }

    /// Returns true if the current reply must be dropped. Consumes one
    /// credit.
    pub fn should_drop_reply(&self) -> bool {
        take_one(&self.inner.drop_next_replies)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
