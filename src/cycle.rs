//! Account cycle orchestration
//!
//! One cycle takes a claimed account from cold to verified: acquire a
//! driver, restore or perform a login, hold the availability toggle for the
//! session, then release the driver. The driver is released on every exit
//! path, including cancellation, so an account can never accumulate
//! browser processes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::automation::login::LoginMachine;
use crate::automation::toggle::{ToggleKeeper, ToggleReport};
use crate::automation::{LoginError, StepTrace, ToggleError};
use crate::browser::driver::{DriverHandle, DriverService};
use crate::classify::{classify, ErrorClass};
use crate::diagnostics;
use crate::scheduler::{AccountLease, AccountState, Scheduler};
use crate::session::SessionStore;
use crate::stats::GlobalStats;
use crate::CancelFlag;

#[derive(Error, Debug)]
pub enum CycleError {
    #[error("No driver available: {0}")]
    DriverUnavailable(String),

    #[error("Login failed: {0}")]
    Login(#[from] LoginError),

    #[error("Toggle reconciliation failed: {0}")]
    Toggle(#[from] ToggleError),
}

/// How one cycle ended. Feeds the scheduler's rescheduling decision.
#[derive(Debug)]
pub enum CycleOutcome {
    Verified {
        snapshot_restored: bool,
        toggle: ToggleReport,
    },
    Failed(CycleError),
    Cancelled,
}

/// Shared services wired once at startup.
pub struct CycleDeps {
    pub drivers: Arc<DriverService>,
    pub sessions: Arc<SessionStore>,
    pub login: Arc<LoginMachine>,
    pub toggles: Arc<ToggleKeeper>,
    pub scheduler: Arc<Scheduler>,
    pub stats: Arc<GlobalStats>,
    pub capture_dir: PathBuf,
}

/// Run one full cycle for a leased account.
pub async fn run_cycle(
    deps: &CycleDeps,
    lease: &AccountLease,
    cancel: &CancelFlag,
) -> CycleOutcome {
    let email = &lease.account.email;
    deps.stats.cycle_started();

    let handle = match deps.drivers.acquire(email).await {
        Ok(handle) => handle,
        Err(e) => {
            let err = CycleError::DriverUnavailable(e.to_string());
            deps.stats.failure(classify(&err));
            return CycleOutcome::Failed(err);
        }
    };

    let outcome = drive(deps, lease, cancel, &handle).await;
    handle.release().await;
    outcome
}

async fn drive(
    deps: &CycleDeps,
    lease: &AccountLease,
    cancel: &CancelFlag,
    handle: &DriverHandle,
) -> CycleOutcome {
    let email = &lease.account.email;
    let page = handle.page.as_ref();
    deps.scheduler
        .set_state(email, AccountState::Authenticating)
        .await;

    let mut restored = false;
    if let Some(snapshot) = deps.sessions.restore(email).await {
        let applied = deps.sessions.apply(&snapshot, page).await;
        match applied {
            Ok(()) if deps.login.verify_restored(page).await => {
                restored = true;
                deps.sessions.mark_used(email).await;
                deps.stats.snapshot_restore();
                info!(email = %email, "session snapshot restored, login skipped");
            }
            Ok(()) => {
                debug!(email = %email, "restored session no longer authenticated");
                deps.sessions.invalidate(email).await;
            }
            Err(e) => {
                warn!(email = %email, error = %e, "session snapshot could not be applied");
                deps.sessions.invalidate(email).await;
            }
        }
    }

    if !restored {
        let mut trace = StepTrace::default();
        match deps.login.run(page, &lease.account, cancel, &mut trace).await {
            Ok(()) => {
                deps.stats.full_login();
                debug!(email = %email, steps = %trace.summary(), "full login completed");
            }
            Err(LoginError::Cancelled) => {
                deps.stats.cycle_cancelled();
                return CycleOutcome::Cancelled;
            }
            Err(e) => {
                diagnostics::capture_failure(&deps.capture_dir, "login", email, page, Some(&trace))
                    .await;
                return fail(deps, email, CycleError::Login(e)).await;
            }
        }
    }

    deps.scheduler
        .set_state(email, AccountState::Authenticated)
        .await;
    if !restored {
        // A snapshot write failure costs us a future restore, not this cycle.
        if let Err(e) = deps.sessions.persist(email, page).await {
            warn!(email = %email, error = %e, "session snapshot persist failed");
        }
    }

    deps.scheduler
        .set_state(email, AccountState::Reconciling)
        .await;
    match deps.toggles.run(page, cancel).await {
        Ok(report) => {
            deps.stats.toggle_corrections(report.corrections as u64);
            deps.stats.cycle_verified();
            CycleOutcome::Verified {
                snapshot_restored: restored,
                toggle: report,
            }
        }
        Err(e) => {
            diagnostics::capture_failure(&deps.capture_dir, "toggle", email, page, None).await;
            // The session itself may still be good; keep the snapshot
            // unless the toggle loss came from an auth bounce, which the
            // next restore attempt will discover on its own.
            fail(deps, email, CycleError::Toggle(e)).await
        }
    }
}

async fn fail(deps: &CycleDeps, email: &str, error: CycleError) -> CycleOutcome {
    let class = classify(&error);
    deps.stats.failure(class);
    match class {
        ErrorClass::Structural => {
            // Missing or unresponsive elements can mean the current launch
            // flavor is being served a degraded page; try the other one
            // next.
            deps.drivers.flip_hint(email);
        }
        ErrorClass::Authentication => {
            // The site rejected the login, so any stored session for the
            // account is dead weight.
            deps.sessions.delete(email).await;
        }
        _ => {}
    }
    CycleOutcome::Failed(error)
}

/// Spawn the worker pool. Each worker claims due accounts until cancelled.
pub fn run_workers(
    deps: Arc<CycleDeps>,
    workers: usize,
    cancel: CancelFlag,
    idle_tick: Duration,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker| {
            let deps = deps.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                debug!(worker, "worker started");
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match deps.scheduler.claim_due().await {
                        Some(lease) => {
                            let outcome = run_cycle(&deps, &lease, &cancel).await;
                            deps.scheduler.complete(&lease, &outcome).await;
                        }
                        None => tokio::time::sleep(idle_tick).await,
                    }
                }
                debug!(worker, "worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::driver::DriverStrategy;
    use crate::session::SessionStore;
    use crate::testutil::{cycle_deps, cycle_deps_with_sessions, temp_dir, FakeLauncher, FakePage, TOGGLE_SEL};

    fn lease() -> AccountLease {
        AccountLease {
            account: crate::Account {
                email: "user@example.com".to_string(),
                password: "hunter2".to_string(),
            },
        }
    }

    fn working_page() -> FakePage {
        let page = FakePage::new();
        page.set_url("https://site.example/login");
        page.add_element("#email");
        page.add_element("#password");
        page.add_element("button[name='login']");
        page.on_click_set_url("button[name='login']", "https://site.example/members");
        page.set_checkbox(TOGGLE_SEL, true);
        page
    }

    #[tokio::test]
    async fn fresh_account_logs_in_and_verifies() {
        let _gauge = crate::testutil::handle_gauge_lock();
        let before = DriverHandle::open_handles();
        let launcher = Arc::new(FakeLauncher::with_pages(working_page));
        let deps = cycle_deps(launcher, vec![lease().account]);

        let outcome = run_cycle(&deps, &lease(), &CancelFlag::new()).await;
        match outcome {
            CycleOutcome::Verified {
                snapshot_restored,
                toggle,
            } => {
                assert!(!snapshot_restored);
                assert!(toggle.checks >= 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let snap = deps.stats.snapshot();
        assert_eq!(snap.full_logins, 1);
        assert_eq!(snap.cycles_verified, 1);
        assert_eq!(DriverHandle::open_handles(), before);
        // The verified login left a snapshot behind for the next cycle.
        assert!(deps.sessions.restore("user@example.com").await.is_some());
    }

    #[tokio::test]
    async fn persisted_session_skips_the_login_form() {
        let launcher = Arc::new(FakeLauncher::with_pages(|| {
            // Site recognizes the restored cookies and serves the members
            // page straight away.
            let page = working_page();
            page.pin_url("https://site.example/members");
            page
        }));
        let deps = cycle_deps(launcher, vec![lease().account]);
        let seed = FakePage::new();
        deps.sessions
            .persist("user@example.com", &seed)
            .await
            .unwrap();

        let outcome = run_cycle(&deps, &lease(), &CancelFlag::new()).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Verified {
                snapshot_restored: true,
                ..
            }
        ));
        let snap = deps.stats.snapshot();
        assert_eq!(snap.snapshot_restores, 1);
        assert_eq!(snap.full_logins, 0);
    }

    #[tokio::test]
    async fn dead_snapshot_falls_back_to_full_login() {
        let launcher = Arc::new(FakeLauncher::with_pages(working_page));
        let deps = cycle_deps(launcher, vec![lease().account]);
        let seed = FakePage::new();
        deps.sessions
            .persist("user@example.com", &seed)
            .await
            .unwrap();

        // The unpinned page lands back on the login URL, so the restore
        // check fails and the machine runs the form.
        let outcome = run_cycle(&deps, &lease(), &CancelFlag::new()).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Verified {
                snapshot_restored: false,
                ..
            }
        ));
        assert_eq!(deps.stats.snapshot().full_logins, 1);
    }

    #[tokio::test]
    async fn rejected_login_discards_the_stored_session() {
        // The server keeps every request on the login URL: the restored
        // session bounces, and the fresh login never verifies.
        let launcher = Arc::new(FakeLauncher::with_pages(|| {
            let page = working_page();
            page.pin_url("https://site.example/login");
            page
        }));
        let dir = temp_dir();
        let sessions = Arc::new(SessionStore::new(
            dir.clone(),
            chrono::Duration::hours(12),
            3,
        ));
        let deps = cycle_deps_with_sessions(launcher, vec![lease().account], sessions);
        deps.sessions
            .persist("user@example.com", &FakePage::new())
            .await
            .unwrap();

        let outcome = run_cycle(&deps, &lease(), &CancelFlag::new()).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(CycleError::Login(LoginError::VerificationTimeout { .. }))
        ));
        assert_eq!(deps.stats.snapshot().failures_authentication, 1);
        // The snapshot file is gone, not merely marked invalid.
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn login_failure_releases_the_driver() {
        let _gauge = crate::testutil::handle_gauge_lock();
        let before = DriverHandle::open_handles();
        let launcher = Arc::new(FakeLauncher::with_pages(|| {
            let page = FakePage::new();
            page.set_url("https://site.example/login");
            page
        }));
        let deps = cycle_deps(launcher, vec![lease().account]);

        let outcome = run_cycle(&deps, &lease(), &CancelFlag::new()).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(CycleError::Login(_))
        ));
        assert_eq!(DriverHandle::open_handles(), before);
        assert_eq!(deps.stats.snapshot().failures_structural, 1);
        // Structural failures point the next acquisition at the other flavor.
        assert_eq!(
            deps.drivers.preferred_strategy("user@example.com"),
            DriverStrategy::Stealth
        );
    }

    #[tokio::test]
    async fn cancellation_during_login_releases_and_reports() {
        let _gauge = crate::testutil::handle_gauge_lock();
        let before = DriverHandle::open_handles();
        let launcher = Arc::new(FakeLauncher::with_pages(working_page));
        let deps = cycle_deps(launcher, vec![lease().account]);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let outcome = run_cycle(&deps, &lease(), &cancel).await;
        assert!(matches!(outcome, CycleOutcome::Cancelled));
        assert_eq!(DriverHandle::open_handles(), before);
        assert_eq!(deps.stats.snapshot().cycles_cancelled, 1);
    }

    #[tokio::test]
    async fn driver_unavailable_counts_as_resource_failure() {
        let launcher = Arc::new(FakeLauncher::failing_all());
        let deps = cycle_deps(launcher, vec![lease().account]);

        let outcome = run_cycle(&deps, &lease(), &CancelFlag::new()).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(CycleError::DriverUnavailable(_))
        ));
        assert_eq!(deps.stats.snapshot().failures_resource, 1);
    }

    #[tokio::test]
    async fn workers_drain_due_accounts_and_stop_on_cancel() {
        let launcher = Arc::new(FakeLauncher::with_pages(working_page));
        let accounts = vec![
            crate::Account {
                email: "a@example.com".to_string(),
                password: "pw".to_string(),
            },
            crate::Account {
                email: "b@example.com".to_string(),
                password: "pw".to_string(),
            },
        ];
        let deps = Arc::new(cycle_deps(launcher.clone(), accounts));
        let cancel = CancelFlag::new();

        let tasks = run_workers(deps.clone(), 2, cancel.clone(), Duration::from_millis(2));
        for _ in 0..200 {
            if deps.stats.snapshot().cycles_verified >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(deps.stats.snapshot().cycles_verified >= 2);
        assert!(launcher.launches(DriverStrategy::Standard) >= 2);
    }
}
