use chrono::{DateTime, Utc};
use napper_protocol::AppSummary;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::errors::{NapperError, Result};

/// Transition records kept in memory per host
pub const HISTORY_LIMIT: usize = 50;

/// Lifecycle state of a managed application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Stopped,
    Starting,
    Running,
    Idle,
    Stopping,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Stopped => "stopped",
            AppStatus::Starting => "starting",
            AppStatus::Running => "running",
            AppStatus::Idle => "idle",
            AppStatus::Stopping => "stopping",
        }
    }

    /// Serving traffic (or presumed to be)
    pub fn is_active(&self) -> bool {
        matches!(self, AppStatus::Running | AppStatus::Idle)
    }

    pub fn is_inactive(&self) -> bool {
        matches!(self, AppStatus::Stopped | AppStatus::Stopping)
    }

    pub fn is_stable(&self) -> bool {
        matches!(self, AppStatus::Stopped | AppStatus::Running | AppStatus::Idle)
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self, AppStatus::Starting | AppStatus::Stopping)
    }

    /// Guarded-transition table. Same-state moves are handled as no-ops
    /// before this is consulted.
    fn can_transition_to(self, to: AppStatus) -> bool {
        use AppStatus::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Idle)
                | (Running, Stopping)
                | (Idle, Starting)
                | (Idle, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in an application's transition history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: AppStatus,
    pub to: AppStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub forced: bool,
}

/// Tracked state of one managed application.
///
/// Fields are private so the invariants hold by construction:
/// `startup_started_at` is set exactly while the state is Starting, and
/// history only ever appends (trimming discards the oldest entries).
#[derive(Debug, Clone)]
pub struct AppState {
    hostname: String,
    status: AppStatus,
    state_changed_at: DateTime<Utc>,
    startup_started_at: Option<DateTime<Utc>>,
    history: VecDeque<TransitionRecord>,
}

impl AppState {
    /// Fresh entry, starts Stopped.
    pub fn new(hostname: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            hostname: hostname.into(),
            status: AppStatus::Stopped,
            state_changed_at: now,
            startup_started_at: None,
            history: VecDeque::new(),
        }
    }

    /// Rebuild an entry from a persisted snapshot. The restore itself is a
    /// forced transition so it shows up in history; timestamps are then
    /// restored verbatim.
    pub fn restore(
        hostname: impl Into<String>,
        status: AppStatus,
        state_changed_at: DateTime<Utc>,
        startup_started_at: Option<DateTime<Utc>>,
        history: Vec<TransitionRecord>,
    ) -> Self {
        let mut app = Self::new(hostname, state_changed_at);
        app.history = history.into_iter().collect();
        app.force_transition_to(status, "restored_from_disk", state_changed_at);
        app.state_changed_at = state_changed_at;
        if status == AppStatus::Starting {
            app.startup_started_at = startup_started_at.or(Some(state_changed_at));
        }
        app
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn status(&self) -> AppStatus {
        self.status
    }

    pub fn state_changed_at(&self) -> DateTime<Utc> {
        self.state_changed_at
    }

    pub fn startup_started_at(&self) -> Option<DateTime<Utc>> {
        self.startup_started_at
    }

    pub fn history(&self) -> impl DoubleEndedIterator<Item = &TransitionRecord> + ExactSizeIterator {
        self.history.iter()
    }

    /// Guarded transition. A move to the current state is a no-op; a move
    /// outside the allowed table is an error.
    pub fn transition_to(&mut self, to: AppStatus, now: DateTime<Utc>) -> Result<()> {
        if to == self.status {
            return Ok(());
        }
        if !self.status.can_transition_to(to) {
            return Err(NapperError::InvalidTransition {
                hostname: self.hostname.clone(),
                from: self.status,
                to,
            });
        }
        self.apply(to, now, None, false);
        Ok(())
    }

    /// Transition that bypasses the guard table. Used for timeouts, sync
    /// corrections, and recovery; always recorded with `forced = true`.
    pub fn force_transition_to(&mut self, to: AppStatus, reason: &str, now: DateTime<Utc>) {
        self.apply(to, now, Some(reason.to_string()), true);
    }

    /// Force back to Stopped, wiping timers.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.force_transition_to(AppStatus::Stopped, "reset", now);
    }

    fn apply(&mut self, to: AppStatus, now: DateTime<Utc>, reason: Option<String>, forced: bool) {
        self.history.push_back(TransitionRecord {
            from: self.status,
            to,
            at: now,
            reason,
            forced,
        });
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }

        self.status = to;
        self.state_changed_at = now;
        self.startup_started_at = if to == AppStatus::Starting {
            Some(now)
        } else {
            None
        };
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_inactive(&self) -> bool {
        self.status.is_inactive()
    }

    pub fn is_stable(&self) -> bool {
        self.status.is_stable()
    }

    pub fn is_transitioning(&self) -> bool {
        self.status.is_transitioning()
    }

    /// Deep-copied summary for status snapshots.
    pub fn summary(&self, now: DateTime<Utc>) -> AppSummary {
        AppSummary {
            state: self.status.as_str().to_string(),
            state_changed_at: self.state_changed_at,
            startup_started_at: self.startup_started_at,
            seconds_in_state: (now - self.state_changed_at).num_seconds().max(0) as u64,
            last_transition_reason: self.history.back().and_then(|r| r.reason.clone()),
        }
    }
}
