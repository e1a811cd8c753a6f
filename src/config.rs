//! Scheduler configuration.

/// What happens to a rejection nobody is listening to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionPolicy {
    /// Leave the deferred rejected and say nothing.
    #[default]
    Ignore,
    /// Send it to the uncaught channel once the microtask drain in which it
    /// was rejected finishes without a rejection handler attached.
    Report,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub unhandled_rejections: RejectionPolicy,
    /// Upper bound on microtasks run by one drain. Guards against chains
    /// that keep queueing work forever.
    pub microtask_budget: usize,
}

impl SchedulerConfig {
    pub const DEFAULT_MICROTASK_BUDGET: usize = 100_000;

    pub fn with_unhandled_rejections(mut self, policy: RejectionPolicy) -> Self {
        self.unhandled_rejections = policy;
        self
    }

    pub fn with_microtask_budget(mut self, budget: usize) -> Self {
        self.microtask_budget = budget;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            unhandled_rejections: RejectionPolicy::default(),
            microtask_budget: Self::DEFAULT_MICROTASK_BUDGET,
        }
    }
}
