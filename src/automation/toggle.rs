//! Toggle reconciliation
//!
//! After login the keeper repeatedly reads the availability checkbox and
//! corrects it when it has drifted from the desired state. A correction is
//! a programmatic click, an optional confirmation dialog, and a re-read to
//! confirm the flip stuck. Reads that cannot find the toggle at all count
//! as misses; too many consecutive misses means the page is gone.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::automation::selectors::{Locator, SelectorSpec};
use crate::automation::ToggleError;
use crate::browser::control::{lookup_expr, PageControl};
use crate::browser::errors::BrowserError;
use crate::CancelFlag;

/// Outcome of one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToggleReport {
    pub checks: u32,
    pub corrections: u32,
    pub misses: u32,
}

#[derive(Debug, Clone)]
pub struct ToggleSettings {
    /// The state the toggle must hold.
    pub desired: bool,
    pub interval: Duration,
    /// Checks performed even when cancellation is already requested.
    pub min_checks: u32,
    /// Checks per driver session before handing the account back.
    pub session_checks: u32,
    pub max_consecutive_misses: u32,
    pub max_failed_corrections: u32,
    /// Pause after clicks so the site can react.
    pub settle: Duration,
}

impl Default for ToggleSettings {
    fn default() -> Self {
        Self {
            desired: true,
            interval: Duration::from_secs(3),
            min_checks: 3,
            session_checks: 20,
            max_consecutive_misses: 3,
            max_failed_corrections: 2,
            settle: Duration::from_millis(300),
        }
    }
}

pub struct ToggleKeeper {
    toggle: SelectorSpec,
    confirm: SelectorSpec,
    settings: ToggleSettings,
}

impl ToggleKeeper {
    pub fn new(toggle: SelectorSpec, confirm: SelectorSpec, settings: ToggleSettings) -> Self {
        Self {
            toggle,
            confirm,
            settings,
        }
    }

    /// Watch the toggle for one session, correcting drift as it appears.
    pub async fn run(
        &self,
        page: &dyn PageControl,
        cancel: &CancelFlag,
    ) -> Result<ToggleReport, ToggleError> {
        let mut report = ToggleReport::default();
        let mut consecutive_misses = 0u32;
        let mut failed_corrections = 0u32;

        for round in 0..self.settings.session_checks {
            if cancel.is_cancelled() && report.checks >= self.settings.min_checks {
                debug!(checks = report.checks, "toggle watch cancelled");
                break;
            }
            if round > 0 {
                tokio::time::sleep(self.settings.interval).await;
            }

            let state = match self.read_state(page).await? {
                Some(state) => state,
                None => {
                    consecutive_misses += 1;
                    report.misses += 1;
                    warn!(consecutive_misses, "toggle element not found");
                    if consecutive_misses >= self.settings.max_consecutive_misses {
                        return Err(ToggleError::Lost {
                            misses: consecutive_misses,
                        });
                    }
                    continue;
                }
            };
            consecutive_misses = 0;
            report.checks += 1;

            if state == self.settings.desired {
                continue;
            }

            info!(
                desired = self.settings.desired,
                actual = state,
                "toggle drifted, correcting"
            );
            self.correct(page).await?;
            match self.read_state(page).await? {
                Some(state) if state == self.settings.desired => {
                    report.corrections += 1;
                }
                _ => {
                    failed_corrections += 1;
                    warn!(failed_corrections, "toggle correction did not stick");
                    if failed_corrections >= self.settings.max_failed_corrections {
                        return Err(ToggleError::CorrectionFailed);
                    }
                }
            }
        }

        info!(
            checks = report.checks,
            corrections = report.corrections,
            misses = report.misses,
            "toggle watch finished"
        );
        Ok(report)
    }

    /// Read the checked state through the first locator that resolves. A
    /// dead browser connection aborts the watch instead of counting as a
    /// miss.
    async fn read_state(&self, page: &dyn PageControl) -> Result<Option<bool>, BrowserError> {
        for locator in &self.toggle.locators {
            let script = format!(
                "(function() {{ const el = {}; if (!el) return null; return !!el.checked; }})()",
                lookup_expr(locator)
            );
            match page.execute(&script).await {
                Ok(serde_json::Value::Bool(state)) => return Ok(Some(state)),
                Ok(_) => continue,
                Err(e) if e.is_connection_level() => return Err(e),
                Err(e) => {
                    debug!(error = %e, "toggle state read failed");
                    continue;
                }
            }
        }
        Ok(None)
    }

    async fn correct(&self, page: &dyn PageControl) -> Result<(), ToggleError> {
        let locator = self.first_present(page).await.ok_or(ToggleError::Lost {
            misses: 1,
        })?;
        page.click_js(&locator).await?;
        tokio::time::sleep(self.settings.settle).await;

        // The site sometimes asks for confirmation after a flip.
        for confirm in &self.confirm.locators {
            if let Ok(probe) = page.query(confirm).await {
                if probe.interactable() {
                    if let Err(e) = page.click_js(confirm).await {
                        debug!(error = %e, "confirm click failed");
                    }
                    tokio::time::sleep(self.settings.settle).await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn first_present(&self, page: &dyn PageControl) -> Option<Locator> {
        for locator in &self.toggle.locators {
            if let Ok(probe) = page.query(locator).await {
                if probe.found {
                    return Some(locator.clone());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::selectors::Locator;
    use crate::testutil::FakePage;

    const TOGGLE: &str = "input[name='checkbox-toggle']";

    fn keeper(session_checks: u32) -> ToggleKeeper {
        ToggleKeeper::new(
            SelectorSpec::new("toggle", vec![Locator::css(TOGGLE)]),
            SelectorSpec::new("confirm", vec![Locator::css("button.ok")]),
            ToggleSettings {
                desired: true,
                interval: Duration::from_millis(1),
                min_checks: 3,
                session_checks,
                max_consecutive_misses: 3,
                max_failed_corrections: 2,
                settle: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn asserted_toggle_needs_no_correction() {
        let page = FakePage::new();
        page.set_checkbox(TOGGLE, true);

        let report = keeper(5).run(&page, &CancelFlag::new()).await.unwrap();
        assert_eq!(report.checks, 5);
        assert_eq!(report.corrections, 0);
        assert!(page.clicks().is_empty());
    }

    #[tokio::test]
    async fn drifted_toggle_is_clicked_back_and_confirmed() {
        let page = FakePage::new();
        page.set_checkbox(TOGGLE, false);
        page.add_element("button.ok");

        let report = keeper(3).run(&page, &CancelFlag::new()).await.unwrap();
        assert_eq!(report.corrections, 1);
        assert!(page.checkbox_state(TOGGLE).unwrap());
        assert!(page.clicks().contains(&"button.ok".to_string()));
    }

    #[tokio::test]
    async fn missing_toggle_is_lost_after_consecutive_misses() {
        let page = FakePage::new();

        let err = keeper(10).run(&page, &CancelFlag::new()).await.unwrap_err();
        assert!(matches!(err, ToggleError::Lost { misses: 3 }));
    }

    #[tokio::test]
    async fn stuck_toggle_fails_after_repeated_corrections() {
        let page = FakePage::new();
        page.set_checkbox(TOGGLE, false);
        page.freeze_checkbox(TOGGLE);

        let err = keeper(10).run(&page, &CancelFlag::new()).await.unwrap_err();
        assert!(matches!(err, ToggleError::CorrectionFailed));
    }

    #[tokio::test]
    async fn dead_connection_aborts_instead_of_counting_misses() {
        let page = FakePage::new();
        page.set_checkbox(TOGGLE, true);
        page.drop_connection();

        let err = keeper(10).run(&page, &CancelFlag::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ToggleError::Browser(BrowserError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_still_performs_minimum_checks() {
        let page = FakePage::new();
        page.set_checkbox(TOGGLE, true);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let report = keeper(20).run(&page, &cancel).await.unwrap();
        assert_eq!(report.checks, 3);
    }
}
