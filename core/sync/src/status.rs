//! Auto-sync permission evaluation.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;

/// Why auto-sync is enabled but not running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspendReason {
    /// No account or credential is available.
    NoAccount,
    /// The remote store asked not to be contacted before `until`.
    RateLimited { until: DateTime<Utc> },
}

/// Whether the coordinator is allowed to run passes right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoSyncStatus {
    Disabled,
    Suspended(SuspendReason),
    Running,
}

impl AutoSyncStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, AutoSyncStatus::Running)
    }
}

impl fmt::Display for AutoSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutoSyncStatus::Disabled => write!(f, "Auto Sync: Disabled."),
            AutoSyncStatus::Suspended(SuspendReason::NoAccount) => {
                write!(f, "Auto Sync: Suspended until auth token is available.")
            }
            AutoSyncStatus::Suspended(SuspendReason::RateLimited { until }) => write!(
                f,
                "Auto Sync: Suspended until {} because server is not accepting requests until then.",
                until.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            AutoSyncStatus::Running => write!(f, "Auto Sync: Running."),
        }
    }
}

/// Snapshot of the external signals permission depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoSyncInputs {
    pub enabled: bool,
    pub has_account: bool,
    pub donot_make_requests_until: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl AutoSyncInputs {
    /// Decide the status. Checks apply in order: enablement, account,
    /// rate-limit window.
    pub fn evaluate(&self) -> AutoSyncStatus {
        if !self.enabled {
            return AutoSyncStatus::Disabled;
        }
        if !self.has_account {
            return AutoSyncStatus::Suspended(SuspendReason::NoAccount);
        }
        if let Some(until) = self.donot_make_requests_until {
            if self.now < until {
                return AutoSyncStatus::Suspended(SuspendReason::RateLimited { until });
            }
        }
        AutoSyncStatus::Running
    }
}
