//! Failure diagnostics
//!
//! Captures a screenshot and context log line when a cycle fails, so site
//! changes can be diagnosed without re-running the flow by hand.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::automation::StepTrace;
use crate::browser::control::PageControl;

/// Screenshot a failed page into `dir`, returning the file path. Capture
/// problems are logged and swallowed; diagnostics must never turn a cycle
/// failure into a second failure.
pub async fn capture_failure(
    dir: &Path,
    stage: &str,
    email: &str,
    page: &dyn PageControl,
    trace: Option<&StepTrace>,
) -> Option<PathBuf> {
    if let Some(trace) = trace {
        warn!(email, stage, steps = %trace.summary(), "failure step trace");
    }

    let png = match page.screenshot().await {
        Ok(png) => png,
        Err(e) => {
            debug!(email, stage, error = %e, "failure screenshot unavailable");
            return None;
        }
    };

    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        debug!(error = %e, "could not create capture directory");
        return None;
    }
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("failure_{stage}_{timestamp}.png"));
    match tokio::fs::write(&path, png).await {
        Ok(()) => {
            warn!(email, stage, path = %path.display(), "failure screenshot written");
            Some(path)
        }
        Err(e) => {
            debug!(error = %e, "could not write failure screenshot");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakePage;

    #[tokio::test]
    async fn capture_writes_a_png_named_after_the_stage() {
        let dir = std::env::temp_dir()
            .join("availkeeper-tests")
            .join(uuid::Uuid::new_v4().to_string());
        let page = FakePage::new();

        let path = capture_failure(&dir, "login", "a@x.com", &page, None)
            .await
            .unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("failure_login_"));
        assert!(name.ends_with(".png"));
        assert!(tokio::fs::metadata(&path).await.is_ok());
    }

    #[tokio::test]
    async fn screenshot_errors_are_swallowed() {
        let dir = std::env::temp_dir().join("availkeeper-tests-none");
        let page = FakePage::new();
        page.fail_screenshots();

        assert!(capture_failure(&dir, "toggle", "a@x.com", &page, None)
            .await
            .is_none());
    }
}
