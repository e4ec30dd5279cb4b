//! Failure classification
//!
//! Every cycle failure is reduced to one of four classes that drive the
//! scheduler's reaction: transient problems back off normally, structural
//! ones indicate site markup drift, authentication ones count against the
//! account, and resource ones pause work because the host cannot launch
//! browsers at all.

use serde::{Deserialize, Serialize};

use crate::automation::{LoginError, ToggleError};
use crate::browser::errors::BrowserError;
use crate::cycle::CycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    /// Network hiccups, slow pages, lost CDP connections.
    Transient,
    /// Expected elements are missing or unresponsive.
    Structural,
    /// The site refused or revoked the login.
    Authentication,
    /// The environment cannot produce a working browser.
    Resource,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Structural => write!(f, "structural"),
            ErrorClass::Authentication => write!(f, "authentication"),
            ErrorClass::Resource => write!(f, "resource"),
        }
    }
}

pub fn classify(error: &CycleError) -> ErrorClass {
    match error {
        CycleError::DriverUnavailable(_) => ErrorClass::Resource,
        CycleError::Login(login) => classify_login(login),
        CycleError::Toggle(toggle) => classify_toggle(toggle),
    }
}

fn classify_login(error: &LoginError) -> ErrorClass {
    match error {
        LoginError::Navigation(_) => ErrorClass::Transient,
        LoginError::FormNotFound { .. } => ErrorClass::Structural,
        LoginError::Typing { .. } => ErrorClass::Structural,
        LoginError::Submission(_) => ErrorClass::Structural,
        // The form worked but the site kept us on the login path: the
        // credentials or the account itself are the problem.
        LoginError::VerificationTimeout { .. } => ErrorClass::Authentication,
        LoginError::Cancelled => ErrorClass::Transient,
    }
}

fn classify_toggle(error: &ToggleError) -> ErrorClass {
    match error {
        // Repeated misses after a verified login mean the toggle markup
        // moved, not that the page is slow.
        ToggleError::Lost { .. } => ErrorClass::Structural,
        ToggleError::CorrectionFailed => ErrorClass::Structural,
        ToggleError::Browser(browser) => classify_browser(browser),
    }
}

fn classify_browser(error: &BrowserError) -> ErrorClass {
    match error {
        BrowserError::ScriptError(_) | BrowserError::ElementNotFound(_) => ErrorClass::Structural,
        BrowserError::LaunchFailed(_) => ErrorClass::Resource,
        _ => ErrorClass::Transient,
    }
}
