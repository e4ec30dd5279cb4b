//! Popup dismissal
//!
//! Sweeps the known popup selectors in priority order within a fixed time
//! budget. High-tier popups are blocking modals, so the first one dismissed
//! ends the scan; lower tiers are cleared best-effort. Only programmatic
//! clicks are used here since popup close buttons are frequently covered by
//! their own overlays.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::automation::selectors::{PopupSelector, Tier};
use crate::browser::control::PageControl;

/// Outcome of one dismissal sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopupReport {
    pub dismissed: u32,
    pub budget_exhausted: bool,
}

pub struct PopupEngine {
    selectors: Vec<PopupSelector>,
    budget: Duration,
    /// Pause after each successful click so the DOM can settle.
    settle: Duration,
}

impl PopupEngine {
    pub fn new(selectors: Vec<PopupSelector>, budget: Duration) -> Self {
        Self {
            selectors,
            budget,
            settle: Duration::from_millis(500),
        }
    }

    #[cfg(test)]
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Dismiss visible popups, highest priority first.
    pub async fn dismiss_all(&self, page: &dyn PageControl) -> PopupReport {
        let deadline = Instant::now() + self.budget;
        let mut report = PopupReport::default();

        for tier in Tier::ALL {
            for popup in self.selectors.iter().filter(|p| p.tier == tier) {
                if Instant::now() >= deadline {
                    report.budget_exhausted = true;
                    debug!(dismissed = report.dismissed, "popup budget exhausted");
                    return report;
                }
                if self.try_dismiss(page, popup).await {
                    report.dismissed += 1;
                    tokio::time::sleep(self.settle).await;
                    if tier == Tier::High {
                        // A blocking modal was cleared; anything else found
                        // now is likely stale, rescan next cycle instead.
                        info!(popup = %popup.spec.name, "blocking popup dismissed");
                        return report;
                    }
                }
            }
        }

        if report.dismissed > 0 {
            info!(dismissed = report.dismissed, "popups dismissed");
        }
        report
    }

    async fn try_dismiss(&self, page: &dyn PageControl, popup: &PopupSelector) -> bool {
        for locator in &popup.spec.locators {
            let probe = match page.query(locator).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(popup = %popup.spec.name, error = %e, "popup probe failed");
                    continue;
                }
            };
            if !probe.interactable() {
                continue;
            }
            match page.click_js(locator).await {
                Ok(()) => return true,
                Err(e) => {
                    debug!(popup = %popup.spec.name, error = %e, "popup click failed");
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::selectors::{Locator, SelectorSpec};
    use crate::testutil::FakePage;

    fn popup(tier: Tier, name: &str, css: &str) -> PopupSelector {
        PopupSelector {
            tier,
            spec: SelectorSpec::new(name, vec![Locator::css(css)]),
        }
    }

    fn engine(selectors: Vec<PopupSelector>) -> PopupEngine {
        PopupEngine::new(selectors, Duration::from_secs(10)).with_settle(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn high_tier_dismissal_short_circuits() {
        let page = FakePage::new();
        page.add_element(".modal-close");
        page.add_element(".banner-close");

        let engine = engine(vec![
            popup(Tier::High, "modal", ".modal-close"),
            popup(Tier::Low, "banner", ".banner-close"),
        ]);
        let report = engine.dismiss_all(&page).await;

        assert_eq!(report.dismissed, 1);
        assert_eq!(page.clicks(), vec![".modal-close".to_string()]);
    }

    #[tokio::test]
    async fn lower_tiers_are_swept_without_short_circuit() {
        let page = FakePage::new();
        page.add_element(".banner-close");
        page.add_element(".cookie-accept");

        let engine = engine(vec![
            popup(Tier::High, "modal", ".modal-close"),
            popup(Tier::Medium, "banner", ".banner-close"),
            popup(Tier::Low, "cookie", ".cookie-accept"),
        ]);
        let report = engine.dismiss_all(&page).await;

        assert_eq!(report.dismissed, 2);
        assert!(!report.budget_exhausted);
    }

    #[tokio::test]
    async fn failed_click_does_not_count_as_dismissed() {
        let page = FakePage::new();
        page.add_element(".stubborn");
        page.fail_clicks_on(".stubborn");

        let engine = engine(vec![popup(Tier::High, "stubborn", ".stubborn")]);
        let report = engine.dismiss_all(&page).await;

        assert_eq!(report.dismissed, 0);
    }

    #[tokio::test]
    async fn zero_budget_stops_before_any_probe() {
        let page = FakePage::new();
        page.add_element(".modal-close");

        let engine = PopupEngine::new(
            vec![popup(Tier::High, "modal", ".modal-close")],
            Duration::ZERO,
        );
        let report = engine.dismiss_all(&page).await;

        assert_eq!(report.dismissed, 0);
        assert!(report.budget_exhausted);
    }
}
