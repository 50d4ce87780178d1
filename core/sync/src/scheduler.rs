//! Debounced scheduling of triggered sync passes.

use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Deadline used when a delay does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// What a triggered pass is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTrigger {
    /// `"Interval"` for periodic passes, `"Activity"` for triggered ones.
    pub reason: String,
    /// Reason tags accumulated before the pass was dispatched.
    pub sources: Vec<String>,
}

impl SyncTrigger {
    pub const INTERVAL: &'static str = "Interval";
    pub const ACTIVITY: &'static str = "Activity";

    /// Periodic pass.
    pub fn interval() -> Self {
        Self {
            reason: Self::INTERVAL.to_string(),
            sources: Vec::new(),
        }
    }

    /// Pass dispatched after coalescing the given sources.
    pub fn activity(sources: Vec<String>) -> Self {
        Self {
            reason: Self::ACTIVITY.to_string(),
            sources,
        }
    }
}

/// Coalesces bursts of triggers into a single dispatch.
///
/// Each call to [`TriggerScheduler::schedule`] restarts the timer while the
/// reason tags keep accumulating until [`TriggerScheduler::take`] drains
/// them.
#[derive(Debug)]
pub struct TriggerScheduler {
    pending: Vec<String>,
    deadline: Option<Instant>,
    max_pending: usize,
}

impl TriggerScheduler {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: Vec::new(),
            deadline: None,
            max_pending: max_pending.max(1),
        }
    }

    /// Add sources and (re)arm the dispatch `delay` from now.
    ///
    /// Tags are kept once, in first-seen order.
    pub fn schedule<I, S>(&mut self, sources: I, delay: Duration)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for source in sources {
            let source = source.into();
            if self.pending.contains(&source) {
                continue;
            }
            if self.pending.len() >= self.max_pending {
                warn!("Dropping sync trigger source {}: too many pending", source);
                continue;
            }
            self.pending.push(source);
        }
        let now = Instant::now();
        self.deadline = Some(now.checked_add(delay).unwrap_or(now + FAR_FUTURE));
    }

    /// When the pending dispatch fires, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_scheduled(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    /// Disarm the pending dispatch. Accumulated sources are kept for the
    /// next dispatch.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Disarm and drain the accumulated sources.
    pub fn take(&mut self) -> Vec<String> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }
}
