use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use availkeeper::automation::login::LoginMachine;
use availkeeper::automation::popups::PopupEngine;
use availkeeper::automation::toggle::ToggleKeeper;
use availkeeper::automation::AttemptPolicy;
use availkeeper::browser::driver::{CdpLauncher, DriverService};
use availkeeper::cycle::{run_workers, CycleDeps};
use availkeeper::scheduler::Scheduler;
use availkeeper::session::SessionStore;
use availkeeper::stats::GlobalStats;
use availkeeper::{capture_dir, init_logging, session_dir, AppConfig, CancelFlag};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_logging();

    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load_from(std::path::Path::new(&path))?,
        None => AppConfig::load(),
    };
    config.validate()?;

    // Constrained hosts get headless Chrome and half the worker pool.
    let workers = if config.driver.low_resources {
        (config.workers / 2).max(1)
    } else {
        config.workers
    };

    info!(
        accounts = config.accounts.len(),
        workers,
        headless = config.driver.effective_headless(),
        "starting availability keeper"
    );

    let selectors = config.selectors.clone();
    let deps = Arc::new(CycleDeps {
        drivers: Arc::new(DriverService::new(
            Arc::new(CdpLauncher),
            config.driver.clone(),
            config.default_strategy,
        )),
        sessions: Arc::new(SessionStore::new(
            session_dir(),
            chrono::Duration::hours(config.session_max_age_hours),
            config.session_max_restore_failures,
        )),
        login: Arc::new(LoginMachine::new(
            config.login_url.clone(),
            selectors.clone(),
            config.login.timeouts(),
            AttemptPolicy::default(),
            PopupEngine::new(selectors.popups.clone(), config.login.popup_budget()),
        )),
        toggles: Arc::new(ToggleKeeper::new(
            selectors.toggle.clone(),
            selectors.toggle_confirm.clone(),
            config.toggle.settings(),
        )),
        scheduler: Arc::new(Scheduler::new(
            config.schedule.clone(),
            config.accounts.clone(),
        )),
        stats: Arc::new(GlobalStats::default()),
        capture_dir: capture_dir(),
    });

    let cancel = CancelFlag::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested, finishing in-flight cycles");
                cancel.cancel();
            }
        });
    }

    let workers = run_workers(deps.clone(), workers, cancel.clone(), Duration::from_secs(5));

    // Status heartbeat and resource watchdog.
    let mut blocked = false;
    while !cancel.is_cancelled() {
        tokio::time::sleep(Duration::from_secs(60)).await;
        if cancel.is_cancelled() {
            break;
        }
        let snap = deps.stats.snapshot();
        info!(
            verified = snap.cycles_verified,
            logins = snap.full_logins,
            restores = snap.snapshot_restores,
            corrections = snap.toggle_corrections,
            "status"
        );
        if let Some(secs) = deps.scheduler.window().seconds_until_close() {
            info!(closes_in_secs = secs, "active window");
        }
        for status in deps.scheduler.statuses().await {
            info!(
                email = %status.email,
                state = %status.state,
                failures = status.consecutive_failures,
                next_run = %status.next_run_at,
                "account status"
            );
        }
        if deps.scheduler.all_resource_blocked().await {
            error!("every account is blocked on browser launch failures, shutting down");
            blocked = true;
            cancel.cancel();
        }
    }

    for worker in workers {
        if let Err(e) = worker.await {
            error!("worker task panicked: {}", e);
        }
    }

    let snap = deps.stats.snapshot();
    info!(
        started = snap.cycles_started,
        verified = snap.cycles_verified,
        cancelled = snap.cycles_cancelled,
        "shutdown complete"
    );

    if blocked {
        anyhow::bail!("no usable browser environment");
    }
    Ok(())
}
