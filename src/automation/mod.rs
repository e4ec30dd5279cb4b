//! Site automation: popup handling, login, and toggle reconciliation.

pub mod login;
pub mod popups;
pub mod selectors;
pub mod toggle;

use std::time::Duration;

use thiserror::Error;

use crate::browser::errors::BrowserError;

/// Login flow failures, tagged by the stage that produced them.
#[derive(Error, Debug)]
pub enum LoginError {
    #[error("Navigation to login page failed: {0}")]
    Navigation(BrowserError),

    #[error("Login form element '{name}' not found")]
    FormNotFound { name: String },

    #[error("Typing into '{name}' failed: {source}")]
    Typing {
        name: String,
        source: BrowserError,
    },

    #[error("All submission techniques failed: {0}")]
    Submission(BrowserError),

    #[error("Login not confirmed, still on {url}")]
    VerificationTimeout { url: String },

    #[error("Login cancelled")]
    Cancelled,
}

/// Toggle reconciliation failures.
#[derive(Error, Debug)]
pub enum ToggleError {
    #[error("Toggle element lost after {misses} consecutive misses")]
    Lost { misses: u32 },

    #[error("Toggle correction did not stick")]
    CorrectionFailed,

    #[error("Toggle check failed: {0}")]
    Browser(#[from] BrowserError),
}

/// Ordered record of completed flow steps with their durations, logged on
/// success and attached to failure diagnostics.
#[derive(Debug, Default, Clone)]
pub struct StepTrace {
    steps: Vec<(&'static str, Duration)>,
}

impl StepTrace {
    pub fn record(&mut self, step: &'static str, elapsed: Duration) {
        self.steps.push((step, elapsed));
    }

    pub fn steps(&self) -> &[(&'static str, Duration)] {
        &self.steps
    }

    pub fn last_step(&self) -> Option<&'static str> {
        self.steps.last().map(|(name, _)| *name)
    }

    pub fn summary(&self) -> String {
        self.steps
            .iter()
            .map(|(name, d)| format!("{name}={}ms", d.as_millis()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Bounded retry policy shared by the interaction steps that try several
/// techniques in sequence.
#[derive(Debug, Clone, Copy)]
pub struct AttemptPolicy {
    pub max_attempts: u32,
    pub pause: Duration,
}

impl Default for AttemptPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            pause: Duration::from_millis(300),
        }
    }
}
