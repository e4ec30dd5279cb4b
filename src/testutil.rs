//! Shared test doubles for the browser boundary.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{json, Value};

use crate::automation::login::{LoginMachine, LoginTimeouts};
use crate::automation::popups::PopupEngine;
use crate::automation::selectors::SelectorConfig;
use crate::automation::toggle::{ToggleKeeper, ToggleSettings};
use crate::automation::AttemptPolicy;
use crate::browser::control::{ElementProbe, PageControl, PageState};
use crate::browser::driver::{
    DriverConstraints, DriverHandle, DriverService, DriverStrategy, Launcher,
};
use crate::browser::errors::BrowserError;
use crate::cycle::CycleDeps;
use crate::scheduler::{ScheduleSettings, Scheduler};
use crate::session::SessionStore;
use crate::stats::GlobalStats;
use crate::Account;

/// First locator of the default toggle selector.
pub const TOGGLE_SEL: &str = "div.available-now.smart-form input[name='checkbox-toggle']";

static HANDLE_GAUGE: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serializes tests that assert on the global open-handle counter.
pub fn handle_gauge_lock() -> MutexGuard<'static, ()> {
    HANDLE_GAUGE.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn temp_dir() -> PathBuf {
    std::env::temp_dir()
        .join("availkeeper-tests")
        .join(uuid::Uuid::new_v4().to_string())
}

/// Scripted in-memory page.
#[derive(Default)]
pub struct FakePage {
    current_url: Mutex<String>,
    pinned_url: Mutex<Option<String>>,
    elements: Mutex<HashSet<String>>,
    checkboxes: Mutex<HashMap<String, bool>>,
    frozen: Mutex<HashSet<String>>,
    clicks: Mutex<Vec<String>>,
    typed: Mutex<Vec<(String, String)>>,
    fail_js: Mutex<HashSet<String>>,
    fail_native: Mutex<HashSet<String>>,
    fail_pointer: Mutex<HashSet<String>>,
    click_redirects: Mutex<HashMap<String, String>>,
    state: Mutex<Option<PageState>>,
    fail_screenshot: AtomicBool,
    connection_dropped: AtomicBool,
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_url(&self, url: &str) {
        *self.current_url.lock().unwrap() = url.to_string();
    }

    /// Pin the URL so neither navigation nor click redirects can change it,
    /// emulating a server-side redirect to this location.
    pub fn pin_url(&self, url: &str) {
        self.set_url(url);
        *self.pinned_url.lock().unwrap() = Some(url.to_string());
    }

    pub fn add_element(&self, selector: &str) {
        self.elements.lock().unwrap().insert(selector.to_string());
    }

    pub fn set_checkbox(&self, selector: &str, checked: bool) {
        self.checkboxes
            .lock()
            .unwrap()
            .insert(selector.to_string(), checked);
    }

    pub fn checkbox_state(&self, selector: &str) -> Option<bool> {
        self.checkboxes.lock().unwrap().get(selector).copied()
    }

    /// Make clicks on this checkbox have no effect.
    pub fn freeze_checkbox(&self, selector: &str) {
        self.frozen.lock().unwrap().insert(selector.to_string());
    }

    pub fn on_click_set_url(&self, selector: &str, url: &str) {
        self.click_redirects
            .lock()
            .unwrap()
            .insert(selector.to_string(), url.to_string());
    }

    pub fn fail_js_clicks_on(&self, selector: &str) {
        self.fail_js.lock().unwrap().insert(selector.to_string());
    }

    pub fn fail_native_clicks_on(&self, selector: &str) {
        self.fail_native.lock().unwrap().insert(selector.to_string());
    }

    pub fn fail_pointer_clicks_on(&self, selector: &str) {
        self.fail_pointer.lock().unwrap().insert(selector.to_string());
    }

    pub fn fail_clicks_on(&self, selector: &str) {
        self.fail_js_clicks_on(selector);
        self.fail_native_clicks_on(selector);
        self.fail_pointer_clicks_on(selector);
    }

    pub fn fail_screenshots(&self) {
        self.fail_screenshot.store(true, Ordering::SeqCst);
    }

    /// Make scripts fail as if the browser process died.
    pub fn drop_connection(&self) {
        self.connection_dropped.store(true, Ordering::SeqCst);
    }

    pub fn clicks(&self) -> Vec<String> {
        self.clicks.lock().unwrap().clone()
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        self.typed.lock().unwrap().clone()
    }

    fn exists(&self, selector: &str) -> bool {
        self.elements.lock().unwrap().contains(selector)
            || self.checkboxes.lock().unwrap().contains_key(selector)
    }

    fn apply_click(&self, selector: &str) {
        self.clicks.lock().unwrap().push(selector.to_string());
        if !self.frozen.lock().unwrap().contains(selector) {
            if let Some(state) = self.checkboxes.lock().unwrap().get_mut(selector) {
                *state = !*state;
            }
        }
        if self.pinned_url.lock().unwrap().is_none() {
            if let Some(url) = self.click_redirects.lock().unwrap().get(selector) {
                *self.current_url.lock().unwrap() = url.clone();
            }
        }
    }

    fn click(&self, selector: &str, failures: &Mutex<HashSet<String>>) -> Result<(), BrowserError> {
        if failures.lock().unwrap().contains(selector) {
            return Err(BrowserError::ScriptError(format!(
                "scripted click failure on {selector}"
            )));
        }
        if !self.exists(selector) {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        self.apply_click(selector);
        Ok(())
    }
}

#[async_trait]
impl PageControl for FakePage {
    async fn goto(&self, url: &str, _timeout: Duration) -> Result<(), BrowserError> {
        if self.pinned_url.lock().unwrap().is_none() {
            self.set_url(url);
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.current_url.lock().unwrap().clone())
    }

    async fn execute(&self, script: &str) -> Result<Value, BrowserError> {
        if self.connection_dropped.load(Ordering::SeqCst) {
            return Err(BrowserError::ConnectionLost(
                "scripted connection loss".to_string(),
            ));
        }
        let checkboxes = self.checkboxes.lock().unwrap();
        for (selector, state) in checkboxes.iter() {
            if script.contains(selector.as_str()) {
                return Ok(Value::Bool(*state));
            }
        }
        Ok(Value::Null)
    }

    async fn query(&self, locator: &crate::automation::selectors::Locator) -> Result<ElementProbe, BrowserError> {
        let found = self.exists(&locator.value);
        Ok(ElementProbe {
            found,
            visible: found,
        })
    }

    async fn click_js(&self, locator: &crate::automation::selectors::Locator) -> Result<(), BrowserError> {
        self.click(&locator.value, &self.fail_js)
    }

    async fn click_native(&self, locator: &crate::automation::selectors::Locator) -> Result<(), BrowserError> {
        self.click(&locator.value, &self.fail_native)
    }

    async fn click_pointer(&self, locator: &crate::automation::selectors::Locator) -> Result<(), BrowserError> {
        self.click(&locator.value, &self.fail_pointer)
    }

    async fn clear_and_type(
        &self,
        locator: &crate::automation::selectors::Locator,
        text: &str,
    ) -> Result<(), BrowserError> {
        if !self.exists(&locator.value) {
            return Err(BrowserError::ElementNotFound(locator.value.clone()));
        }
        self.typed
            .lock()
            .unwrap()
            .push((locator.value.clone(), text.to_string()));
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        if self.fail_screenshot.load(Ordering::SeqCst) {
            return Err(BrowserError::ScriptError(
                "scripted screenshot failure".to_string(),
            ));
        }
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn snapshot_state(&self) -> Result<PageState, BrowserError> {
        if let Some(state) = self.state.lock().unwrap().clone() {
            return Ok(state);
        }
        Ok(PageState {
            cookies: json!([{"name": "sid", "value": "abc123"}]),
            local_storage: json!({}),
        })
    }

    async fn restore_state(&self, state: &PageState) -> Result<(), BrowserError> {
        *self.state.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

type PageFactory = Box<dyn Fn() -> FakePage + Send + Sync>;

/// Launcher handing out scripted pages, with per-strategy failure control.
pub struct FakeLauncher {
    factory: PageFactory,
    fail: HashSet<DriverStrategy>,
    counts: Mutex<HashMap<DriverStrategy, u32>>,
}

impl FakeLauncher {
    pub fn with_pages(factory: impl Fn() -> FakePage + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            fail: HashSet::new(),
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn failing_for(strategy: DriverStrategy) -> Self {
        let mut launcher = Self::with_pages(FakePage::new);
        launcher.fail.insert(strategy);
        launcher
    }

    pub fn failing_all() -> Self {
        let mut launcher = Self::with_pages(FakePage::new);
        launcher.fail.insert(DriverStrategy::Standard);
        launcher.fail.insert(DriverStrategy::Stealth);
        launcher
    }

    pub fn launches(&self, strategy: DriverStrategy) -> u32 {
        self.counts
            .lock()
            .unwrap()
            .get(&strategy)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(
        &self,
        account: &str,
        strategy: DriverStrategy,
        _constraints: &DriverConstraints,
    ) -> Result<DriverHandle, BrowserError> {
        *self.counts.lock().unwrap().entry(strategy).or_insert(0) += 1;
        if self.fail.contains(&strategy) {
            return Err(BrowserError::LaunchFailed(format!(
                "scripted launch failure ({strategy})"
            )));
        }
        Ok(DriverHandle::detached(
            account,
            strategy,
            Box::new((self.factory)()),
        ))
    }
}

/// Login machine over the default selectors with millisecond timeouts.
pub fn login_machine() -> LoginMachine {
    let selectors = SelectorConfig::default();
    LoginMachine::new(
        "https://site.example/login".to_string(),
        selectors.clone(),
        LoginTimeouts {
            page_load: Duration::from_secs(1),
            email_field: Duration::from_millis(100),
            other_field: Duration::from_millis(100),
            poll: Duration::from_millis(5),
            verify_ticks: 3,
            verify_tick: Duration::from_millis(5),
        },
        AttemptPolicy {
            max_attempts: 3,
            pause: Duration::from_millis(1),
        },
        PopupEngine::new(selectors.popups, Duration::from_secs(1)),
    )
}

fn toggle_keeper() -> ToggleKeeper {
    let selectors = SelectorConfig::default();
    ToggleKeeper::new(
        selectors.toggle,
        selectors.toggle_confirm,
        ToggleSettings {
            desired: true,
            interval: Duration::from_millis(1),
            min_checks: 3,
            session_checks: 3,
            max_consecutive_misses: 3,
            max_failed_corrections: 2,
            settle: Duration::from_millis(1),
        },
    )
}

/// Fully wired cycle dependencies over fakes and a throwaway directory.
pub fn cycle_deps(launcher: Arc<FakeLauncher>, accounts: Vec<Account>) -> CycleDeps {
    let sessions = Arc::new(SessionStore::new(temp_dir(), chrono::Duration::hours(12), 3));
    cycle_deps_with_sessions(launcher, accounts, sessions)
}

/// Like `cycle_deps`, but over a caller-provided session store so tests can
/// inspect its directory.
pub fn cycle_deps_with_sessions(
    launcher: Arc<FakeLauncher>,
    accounts: Vec<Account>,
    sessions: Arc<SessionStore>,
) -> CycleDeps {
    CycleDeps {
        drivers: Arc::new(DriverService::new(
            launcher,
            DriverConstraints::default(),
            DriverStrategy::Standard,
        )),
        sessions,
        login: Arc::new(login_machine()),
        toggles: Arc::new(toggle_keeper()),
        scheduler: Arc::new(Scheduler::new(ScheduleSettings::default(), accounts)),
        stats: Arc::new(GlobalStats::default()),
        capture_dir: temp_dir(),
    }
}
