//! Browser error types

use thiserror::Error;

/// Low-level browser transport and DOM failures.
#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("JavaScript execution failed: {0}")]
    ScriptError(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Browser connection lost: {0}")]
    ConnectionLost(String),

    #[error("State restore failed: {0}")]
    StateRestoreFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrowserError {
    /// True when the failure suggests the browser process or its CDP
    /// connection is gone rather than a page-level problem.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            BrowserError::ConnectionLost(_) | BrowserError::LaunchFailed(_)
        )
    }
}
