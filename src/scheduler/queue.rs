//! Account scheduling
//!
//! Accounts wait in a single queue keyed by their next-run time. Workers
//! claim one due account at a time; a claimed account is invisible to other
//! workers until its cycle completes, which is what guarantees at most one
//! browser per account. Completion reschedules the account: success uses
//! the base interval plus jitter, failures climb an exponential backoff
//! ladder, and resource failures take a flat pause without burning the
//! account's failure budget.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::classify::{classify, ErrorClass};
use crate::cycle::CycleOutcome;
use crate::scheduler::window::ActiveWindow;
use crate::Account;

/// Lifecycle of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountState {
    Idle,
    Authenticating,
    Authenticated,
    Reconciling,
    /// Disabled after too many consecutive failures; needs manual reset.
    Failed,
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AccountState::Idle => "idle",
            AccountState::Authenticating => "authenticating",
            AccountState::Authenticated => "authenticated",
            AccountState::Reconciling => "reconciling",
            AccountState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleSettings {
    pub base_interval_secs: u64,
    /// Random spread added to every successful reschedule. Kept well under
    /// the base interval so the backoff ladder stays monotonic.
    pub jitter_secs: u64,
    pub backoff_factor: f64,
    pub max_backoff_secs: u64,
    pub max_consecutive_failures: u32,
    pub resource_pause_secs: u64,
    pub window: ActiveWindow,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            base_interval_secs: 600,
            jitter_secs: 120,
            backoff_factor: 2.0,
            max_backoff_secs: 3600,
            max_consecutive_failures: 5,
            resource_pause_secs: 900,
            window: ActiveWindow::default(),
        }
    }
}

impl ScheduleSettings {
    fn jitter(&self) -> i64 {
        if self.jitter_secs == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..self.jitter_secs) as i64
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    /// The configured ceiling bounds the total delay, jitter included.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exp = self.backoff_factor.powi(failures.min(20) as i32);
        let secs = (self.base_interval_secs as f64 * exp) as i64 + self.jitter();
        Duration::seconds(secs.min(self.max_backoff_secs as i64))
    }

    fn success_delay(&self) -> Duration {
        Duration::seconds(self.base_interval_secs as i64 + self.jitter())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    account: Account,
    state: AccountState,
    consecutive_failures: u32,
    last_class: Option<ErrorClass>,
    last_success: Option<DateTime<Utc>>,
    next_run_at: DateTime<Utc>,
    claimed: bool,
}

/// A claimed account. Hold it for the duration of the cycle and hand it
/// back through `Scheduler::complete`.
#[derive(Debug, Clone)]
pub struct AccountLease {
    pub account: Account,
}

/// Point-in-time view of one account for status logging.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    pub email: String,
    pub state: AccountState,
    pub consecutive_failures: u32,
    pub last_class: Option<ErrorClass>,
    pub last_success: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
}

pub struct Scheduler {
    settings: ScheduleSettings,
    entries: Mutex<Vec<Entry>>,
}

impl Scheduler {
    pub fn new(settings: ScheduleSettings, accounts: Vec<Account>) -> Self {
        let now = Utc::now();
        let entries = accounts
            .into_iter()
            .map(|account| Entry {
                account,
                state: AccountState::Idle,
                consecutive_failures: 0,
                last_class: None,
                last_success: None,
                next_run_at: now,
                claimed: false,
            })
            .collect();
        Self {
            settings,
            entries: Mutex::new(entries),
        }
    }

    pub fn window(&self) -> &ActiveWindow {
        &self.settings.window
    }

    /// Claim the most overdue account, if any is due and the window is
    /// open. The claim is exclusive until `complete` is called.
    pub async fn claim_due(&self) -> Option<AccountLease> {
        if !self.settings.window.is_open() {
            return None;
        }
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .filter(|e| !e.claimed && e.state != AccountState::Failed && e.next_run_at <= now)
            .min_by_key(|e| e.next_run_at)?;
        entry.claimed = true;
        Some(AccountLease {
            account: entry.account.clone(),
        })
    }

    pub async fn set_state(&self, email: &str, state: AccountState) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.account.email == email) {
            entry.state = state;
        }
    }

    /// Release a lease and reschedule the account based on how its cycle
    /// went.
    pub async fn complete(&self, lease: &AccountLease, outcome: &CycleOutcome) {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.account.email == lease.account.email)
        else {
            return;
        };
        entry.claimed = false;

        match outcome {
            CycleOutcome::Verified { .. } => {
                entry.consecutive_failures = 0;
                entry.last_class = None;
                entry.last_success = Some(now);
                entry.state = AccountState::Idle;
                entry.next_run_at = now + self.settings.success_delay();
                info!(
                    email = %entry.account.email,
                    next_run = %entry.next_run_at,
                    "cycle verified, account rescheduled"
                );
            }
            CycleOutcome::Cancelled => {
                entry.state = AccountState::Idle;
                entry.next_run_at = now + self.settings.success_delay();
            }
            CycleOutcome::Failed(err) => {
                let class = classify(err);
                entry.last_class = Some(class);
                if class == ErrorClass::Resource {
                    // Environment problem, not the account's fault.
                    entry.state = AccountState::Idle;
                    entry.next_run_at =
                        now + Duration::seconds(self.settings.resource_pause_secs as i64);
                    warn!(
                        email = %entry.account.email,
                        error = %err,
                        "resource failure, pausing account"
                    );
                } else {
                    entry.consecutive_failures += 1;
                    if entry.consecutive_failures >= self.settings.max_consecutive_failures {
                        entry.state = AccountState::Failed;
                        error!(
                            email = %entry.account.email,
                            failures = entry.consecutive_failures,
                            error = %err,
                            "account disabled after repeated failures"
                        );
                    } else {
                        entry.state = AccountState::Idle;
                        entry.next_run_at =
                            now + self.settings.backoff_delay(entry.consecutive_failures);
                        warn!(
                            email = %entry.account.email,
                            class = %class,
                            failures = entry.consecutive_failures,
                            next_run = %entry.next_run_at,
                            error = %err,
                            "cycle failed, backing off"
                        );
                    }
                }
            }
        }
    }

    /// Re-enable a failed account and make it due immediately.
    pub async fn reset_account(&self, email: &str) -> bool {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.account.email == email) {
            entry.state = AccountState::Idle;
            entry.consecutive_failures = 0;
            entry.last_class = None;
            entry.next_run_at = Utc::now();
            true
        } else {
            false
        }
    }

    /// True when every account that could still run is blocked on a
    /// resource failure. The process cannot make progress in that state.
    pub async fn all_resource_blocked(&self) -> bool {
        let entries = self.entries.lock().await;
        let mut schedulable = 0;
        for entry in entries.iter() {
            if entry.state == AccountState::Failed {
                continue;
            }
            schedulable += 1;
            if entry.last_class != Some(ErrorClass::Resource) {
                return false;
            }
        }
        schedulable > 0
    }

    pub async fn statuses(&self) -> Vec<AccountStatus> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(|e| AccountStatus {
                email: e.account.email.clone(),
                state: e.state,
                consecutive_failures: e.consecutive_failures,
                last_class: e.last_class,
                last_success: e.last_success,
                next_run_at: e.next_run_at,
            })
            .collect()
    }
}
