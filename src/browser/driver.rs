//! Driver acquisition
//!
//! Launches Chrome sessions behind a `Launcher` seam so the acquisition
//! policy (strategy preference, single fallback, per-account hints) can be
//! tested without a real browser. Every successful acquisition yields
//! exactly one `DriverHandle`; release is idempotent and force-kills the
//! process when a graceful close stalls.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::browser::control::{CdpPage, PageControl};
use crate::browser::errors::BrowserError;

/// Live handles that have not been released yet, across the process.
static OPEN_HANDLES: AtomicUsize = AtomicUsize::new(0);

/// Browser launch flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DriverStrategy {
    /// Plain Chrome launch.
    Standard,
    /// Launch with automation-detection countermeasures.
    Stealth,
}

impl DriverStrategy {
    /// The strategy tried when this one fails to produce a driver.
    pub fn fallback(self) -> DriverStrategy {
        match self {
            DriverStrategy::Standard => DriverStrategy::Stealth,
            DriverStrategy::Stealth => DriverStrategy::Standard,
        }
    }
}

impl std::fmt::Display for DriverStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverStrategy::Standard => write!(f, "standard"),
            DriverStrategy::Stealth => write!(f, "stealth"),
        }
    }
}

/// Environment constraints applied to every launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverConstraints {
    pub headless: bool,
    /// Forces headless and trims memory-hungry flags.
    pub low_resources: bool,
    pub chrome_path: Option<String>,
    pub window_width: u32,
    pub window_height: u32,
    pub create_timeout_secs: u64,
    pub user_data_root: Option<String>,
}

impl Default for DriverConstraints {
    fn default() -> Self {
        Self {
            headless: true,
            low_resources: false,
            chrome_path: None,
            window_width: 1280,
            window_height: 900,
            create_timeout_secs: 45,
            user_data_root: None,
        }
    }
}

impl DriverConstraints {
    pub fn effective_headless(&self) -> bool {
        self.headless || self.low_resources
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}

/// Find a Chrome/Chromium executable on the system.
fn find_chrome() -> Option<PathBuf> {
    let candidates: Vec<PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(PathBuf::from(format!(
                r"{}\Google\Chrome\Application\chrome.exe",
                local
            )));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![PathBuf::from(
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        )]
    } else {
        vec![
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/usr/bin/chromium-browser"),
        ]
    };

    candidates.into_iter().find(|p| p.exists())
}

/// An acquired browser with its page and process lifetime.
pub struct DriverHandle {
    pub page: Box<dyn PageControl>,
    pub strategy: DriverStrategy,
    pub created_at: DateTime<Utc>,
    account: String,
    browser: tokio::sync::Mutex<Option<Browser>>,
    handler_task: Option<JoinHandle<()>>,
    released: AtomicBool,
}

impl DriverHandle {
    fn new(
        account: &str,
        strategy: DriverStrategy,
        page: Box<dyn PageControl>,
        browser: Option<Browser>,
        handler_task: Option<JoinHandle<()>>,
    ) -> Self {
        OPEN_HANDLES.fetch_add(1, Ordering::SeqCst);
        Self {
            page,
            strategy,
            created_at: Utc::now(),
            account: account.to_string(),
            browser: tokio::sync::Mutex::new(browser),
            handler_task,
            released: AtomicBool::new(false),
        }
    }

    /// Handle over a page whose process lifetime is managed elsewhere.
    pub fn detached(account: &str, strategy: DriverStrategy, page: Box<dyn PageControl>) -> Self {
        Self::new(account, strategy, page, None, None)
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Handles currently open process-wide.
    pub fn open_handles() -> usize {
        OPEN_HANDLES.load(Ordering::SeqCst)
    }

    /// Tear down the browser. Safe to call more than once; only the first
    /// call does work.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let browser = self.browser.lock().await.take();
        if let Some(mut browser) = browser {
            if let Err(e) = browser.close().await {
                debug!(account = %self.account, error = %e, "graceful browser close failed");
            }
            // Short grace period, then force kill whatever is left.
            let waited = tokio::time::timeout(Duration::from_millis(500), browser.wait()).await;
            if waited.is_err() {
                if let Some(Err(e)) = browser.kill().await {
                    debug!(account = %self.account, error = %e, "browser kill reported error");
                }
            }
        }
        if let Some(task) = &self.handler_task {
            task.abort();
        }
        OPEN_HANDLES.fetch_sub(1, Ordering::SeqCst);
        info!(account = %self.account, strategy = %self.strategy, "driver released");
    }
}

impl std::fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle")
            .field("account", &self.account)
            .field("strategy", &self.strategy)
            .field("created_at", &self.created_at)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            // Dropped without release: keep the counter honest, the process
            // is cleaned up by the OS or the next zombie sweep.
            OPEN_HANDLES.fetch_sub(1, Ordering::SeqCst);
            warn!(account = %self.account, "driver handle dropped without release");
            if let Some(task) = &self.handler_task {
                task.abort();
            }
        }
    }
}

/// Produces browser sessions for a given strategy.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        account: &str,
        strategy: DriverStrategy,
        constraints: &DriverConstraints,
    ) -> Result<DriverHandle, BrowserError>;
}

/// Launches real Chrome processes over CDP.
pub struct CdpLauncher;

impl CdpLauncher {
    fn build_config(
        account: &str,
        strategy: DriverStrategy,
        constraints: &DriverConstraints,
    ) -> Result<BrowserConfig, BrowserError> {
        let mut builder = BrowserConfig::builder()
            .window_size(constraints.window_width, constraints.window_height)
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-notifications")
            .arg("--disable-session-crashed-bubble")
            .arg("--no-sandbox");

        if !constraints.effective_headless() {
            builder = builder.with_head();
        }

        if let Some(ref path) = constraints.chrome_path {
            builder = builder.chrome_executable(path);
        } else if let Some(path) = find_chrome() {
            debug!(path = %path.display(), "auto-detected Chrome");
            builder = builder.chrome_executable(path);
        } else {
            return Err(BrowserError::LaunchFailed(
                "Chrome/Chromium executable not found".to_string(),
            ));
        }

        if let Some(ref root) = constraints.user_data_root {
            // Fresh profile dir per launch: a leftover SingletonLock from a
            // killed Chrome must not block the next launch.
            let dir = PathBuf::from(root).join(format!(
                "{}-{}",
                sanitize_component(account),
                uuid::Uuid::new_v4()
            ));
            std::fs::create_dir_all(&dir)?;
            builder = builder.user_data_dir(dir);
        }

        if constraints.low_resources {
            builder = builder
                .arg("--disable-dev-shm-usage")
                .arg("--disable-gpu")
                .arg("--renderer-process-limit=2");
        }

        if strategy == DriverStrategy::Stealth {
            builder = builder
                .arg("--disable-blink-features=AutomationControlled")
                .arg("--exclude-switches=enable-automation")
                .arg("--disable-infobars")
                .arg("--disable-automation");
        }

        builder.build().map_err(BrowserError::LaunchFailed)
    }
}

/// Script removing the most common automation tells, installed on every new
/// document for stealth launches.
const STEALTH_INIT: &str = "Object.defineProperty(navigator, 'webdriver', {get: () => undefined}); \
     window.chrome = window.chrome || {runtime: {}};";

#[async_trait]
impl Launcher for CdpLauncher {
    async fn launch(
        &self,
        account: &str,
        strategy: DriverStrategy,
        constraints: &DriverConstraints,
    ) -> Result<DriverHandle, BrowserError> {
        let config = Self::build_config(account, strategy, constraints)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        // Drain CDP events until the browser goes away.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("initial page: {e}")))?;

        if strategy == DriverStrategy::Stealth {
            match AddScriptToEvaluateOnNewDocumentParams::builder()
                .source(STEALTH_INIT)
                .build()
            {
                Ok(params) => {
                    if let Err(e) = page.execute(params).await {
                        debug!(error = %e, "stealth init script install failed");
                    }
                }
                Err(e) => debug!(error = %e, "stealth init script rejected"),
            }
        }

        info!(account, strategy = %strategy, "browser launched");
        Ok(DriverHandle::new(
            account,
            strategy,
            Box::new(CdpPage::new(page)),
            Some(browser),
            Some(handler_task),
        ))
    }
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
            c
        } else {
            '_'
        })
        .collect()
}

/// Acquires drivers with a preferred strategy, one fallback attempt, and a
/// per-account memory of which strategy last worked.
pub struct DriverService {
    launcher: Arc<dyn Launcher>,
    constraints: DriverConstraints,
    default_strategy: DriverStrategy,
    hints: DashMap<String, DriverStrategy>,
}

impl DriverService {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        constraints: DriverConstraints,
        default_strategy: DriverStrategy,
    ) -> Self {
        Self {
            launcher,
            constraints,
            default_strategy,
            hints: DashMap::new(),
        }
    }

    /// Strategy to try first for this account.
    pub fn preferred_strategy(&self, account: &str) -> DriverStrategy {
        self.hints
            .get(account)
            .map(|h| *h)
            .unwrap_or(self.default_strategy)
    }

    /// Point the account's hint at the other strategy. Called when a cycle
    /// fails in a way that suggests the current flavor is being detected.
    pub fn flip_hint(&self, account: &str) {
        let flipped = self.preferred_strategy(account).fallback();
        self.hints.insert(account.to_string(), flipped);
    }

    /// Launch a driver, trying the preferred strategy then exactly one
    /// fallback. The winning strategy is remembered for the account.
    pub async fn acquire(&self, account: &str) -> Result<DriverHandle, BrowserError> {
        let preferred = self.preferred_strategy(account);
        let timeout = self.constraints.create_timeout();

        match self.try_launch(account, preferred, timeout).await {
            Ok(handle) => {
                self.hints.insert(account.to_string(), preferred);
                Ok(handle)
            }
            Err(first) => {
                let fallback = preferred.fallback();
                warn!(
                    account,
                    strategy = %preferred,
                    error = %first,
                    "driver launch failed, trying fallback strategy"
                );
                match self.try_launch(account, fallback, timeout).await {
                    Ok(handle) => {
                        self.hints.insert(account.to_string(), fallback);
                        Ok(handle)
                    }
                    Err(second) => Err(BrowserError::LaunchFailed(format!(
                        "{preferred}: {first}; {fallback}: {second}"
                    ))),
                }
            }
        }
    }

    async fn try_launch(
        &self,
        account: &str,
        strategy: DriverStrategy,
        timeout: Duration,
    ) -> Result<DriverHandle, BrowserError> {
        tokio::time::timeout(
            timeout,
            self.launcher.launch(account, strategy, &self.constraints),
        )
        .await
        .map_err(|_| BrowserError::Timeout(format!("driver launch ({strategy})")))?
    }
}
