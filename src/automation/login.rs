//! Login flow
//!
//! A linear state machine: Navigating, PopupsCleared, FormLocated,
//! CredentialsEntered, Submitted, Verified. Each transition is bounded by
//! its own timeout and checked against the cancellation flag, and every
//! completed step is recorded in a `StepTrace` for diagnostics.
//!
//! Verification is deliberately conservative: success is declared only when
//! the URL moves away from the login/auth path within the polling window.
//! An unchanged URL, however long we wait, is a failure.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::automation::popups::PopupEngine;
use crate::automation::selectors::{Locator, SelectorConfig, SelectorSpec};
use crate::automation::{AttemptPolicy, LoginError, StepTrace};
use crate::browser::control::PageControl;
use crate::{Account, CancelFlag};

/// Per-transition time bounds.
#[derive(Debug, Clone)]
pub struct LoginTimeouts {
    pub page_load: Duration,
    /// The email field gets the longest wait; it is the first element to
    /// render and its absence means the page never loaded.
    pub email_field: Duration,
    pub other_field: Duration,
    pub poll: Duration,
    pub verify_ticks: u32,
    pub verify_tick: Duration,
}

impl Default for LoginTimeouts {
    fn default() -> Self {
        Self {
            page_load: Duration::from_secs(20),
            email_field: Duration::from_secs(8),
            other_field: Duration::from_secs(3),
            poll: Duration::from_millis(250),
            verify_ticks: 10,
            verify_tick: Duration::from_secs(1),
        }
    }
}

/// True when the URL no longer looks like a login or auth page.
fn left_login_path(url: &str) -> bool {
    let lower = url.to_lowercase();
    !lower.contains("login") && !lower.contains("auth")
}

pub struct LoginMachine {
    login_url: String,
    selectors: SelectorConfig,
    timeouts: LoginTimeouts,
    policy: AttemptPolicy,
    popups: PopupEngine,
}

impl LoginMachine {
    pub fn new(
        login_url: String,
        selectors: SelectorConfig,
        timeouts: LoginTimeouts,
        policy: AttemptPolicy,
        popups: PopupEngine,
    ) -> Self {
        Self {
            login_url,
            selectors,
            timeouts,
            policy,
            popups,
        }
    }

    /// Run the full login flow for one account. Steps completed before a
    /// failure stay recorded in `trace`, so the caller can attach the
    /// partial trace to its diagnostics.
    pub async fn run(
        &self,
        page: &dyn PageControl,
        account: &Account,
        cancel: &CancelFlag,
        trace: &mut StepTrace,
    ) -> Result<(), LoginError> {
        let started = Instant::now();
        let mut mark = started;
        let step = |trace: &mut StepTrace, name: &'static str, mark: &mut Instant| {
            trace.record(name, mark.elapsed());
            *mark = Instant::now();
        };

        cancel.bail(LoginError::Cancelled)?;
        page.goto(&self.login_url, self.timeouts.page_load)
            .await
            .map_err(LoginError::Navigation)?;
        step(trace, "navigating", &mut mark);

        cancel.bail(LoginError::Cancelled)?;
        self.popups.dismiss_all(page).await;
        step(trace, "popups_cleared", &mut mark);

        cancel.bail(LoginError::Cancelled)?;
        let email_loc = self
            .wait_for(page, &self.selectors.email_field, self.timeouts.email_field)
            .await?;
        let password_loc = self
            .wait_for(page, &self.selectors.password_field, self.timeouts.other_field)
            .await?;
        let submit_loc = self
            .wait_for(page, &self.selectors.submit, self.timeouts.other_field)
            .await?;
        step(trace, "form_located", &mut mark);

        cancel.bail(LoginError::Cancelled)?;
        page.clear_and_type(&email_loc, &account.email)
            .await
            .map_err(|source| LoginError::Typing {
                name: self.selectors.email_field.name.clone(),
                source,
            })?;
        page.clear_and_type(&password_loc, &account.password)
            .await
            .map_err(|source| LoginError::Typing {
                name: self.selectors.password_field.name.clone(),
                source,
            })?;
        step(trace, "credentials_entered", &mut mark);

        cancel.bail(LoginError::Cancelled)?;
        let initial_url = page
            .current_url()
            .await
            .map_err(LoginError::Navigation)?;
        self.submit(page, &submit_loc).await?;
        step(trace, "submitted", &mut mark);

        cancel.bail(LoginError::Cancelled)?;
        self.verify(page, &initial_url).await?;
        step(trace, "verified", &mut mark);

        info!(
            email = %account.email,
            total_ms = started.elapsed().as_millis(),
            steps = %trace.summary(),
            "login verified"
        );
        Ok(())
    }

    /// Check whether a restored session is still authenticated: navigate to
    /// the site, clear popups, and confirm we were not bounced to login.
    pub async fn verify_restored(&self, page: &dyn PageControl) -> bool {
        if let Err(e) = page.goto(&self.login_url, self.timeouts.page_load).await {
            debug!(error = %e, "restored session navigation failed");
            return false;
        }
        self.popups.dismiss_all(page).await;
        match page.current_url().await {
            Ok(url) => {
                let ok = left_login_path(&url);
                if !ok {
                    debug!(url = %url, "restored session bounced to login");
                }
                ok
            }
            Err(e) => {
                debug!(error = %e, "restored session URL check failed");
                false
            }
        }
    }

    /// Poll a selector's alternatives until one is present.
    async fn wait_for(
        &self,
        page: &dyn PageControl,
        spec: &SelectorSpec,
        timeout: Duration,
    ) -> Result<Locator, LoginError> {
        let deadline = Instant::now() + timeout;
        loop {
            for locator in &spec.locators {
                if let Ok(probe) = page.query(locator).await {
                    if probe.found {
                        return Ok(locator.clone());
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(LoginError::FormNotFound {
                    name: spec.name.clone(),
                });
            }
            tokio::time::sleep(self.timeouts.poll).await;
        }
    }

    /// Try submission techniques in escalating order of realism.
    async fn submit(
        &self,
        page: &dyn PageControl,
        submit: &Locator,
    ) -> Result<(), LoginError> {
        let techniques: [(&str, _); 3] = [
            ("js", Technique::Js),
            ("native", Technique::Native),
            ("pointer", Technique::Pointer),
        ];
        let mut last_err = None;
        for (attempt, (name, technique)) in techniques
            .iter()
            .take(self.policy.max_attempts as usize)
            .enumerate()
        {
            if attempt > 0 {
                tokio::time::sleep(self.policy.pause).await;
            }
            let result = match technique {
                Technique::Js => page.click_js(submit).await,
                Technique::Native => page.click_native(submit).await,
                Technique::Pointer => page.click_pointer(submit).await,
            };
            match result {
                Ok(()) => {
                    debug!(technique = name, "submit click succeeded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(technique = name, error = %e, "submit click failed");
                    last_err = Some(e);
                }
            }
        }
        Err(LoginError::Submission(last_err.unwrap_or_else(|| {
            crate::browser::errors::BrowserError::ElementNotFound(submit.value.clone())
        })))
    }

    /// Poll for the URL to change away from the login path.
    async fn verify(&self, page: &dyn PageControl, initial_url: &str) -> Result<(), LoginError> {
        // Post-submit popups can land before the redirect settles.
        self.popups.dismiss_all(page).await;

        let mut last_url = initial_url.to_string();
        for _ in 0..self.timeouts.verify_ticks {
            tokio::time::sleep(self.timeouts.verify_tick).await;
            match page.current_url().await {
                Ok(url) => {
                    if url != initial_url && left_login_path(&url) {
                        return Ok(());
                    }
                    last_url = url;
                }
                Err(e) => debug!(error = %e, "URL poll failed during verification"),
            }
        }
        Err(LoginError::VerificationTimeout { url: last_url })
    }
}

enum Technique {
    Js,
    Native,
    Pointer,
}
