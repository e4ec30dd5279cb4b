//! Availability keeper
//!
//! Logs configured accounts into the target members site with headless
//! Chrome and keeps each account's availability toggle asserted, restoring
//! saved sessions where possible and backing off on failures.

pub mod automation;
pub mod browser;
pub mod classify;
pub mod cycle;
pub mod diagnostics;
pub mod scheduler;
pub mod session;
pub mod stats;
#[cfg(test)]
pub mod testutil;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::automation::login::LoginTimeouts;
use crate::automation::selectors::SelectorConfig;
use crate::browser::driver::{DriverConstraints, DriverStrategy};
use crate::scheduler::ScheduleSettings;

/// Credentials for one managed account.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Cooperative shutdown flag checked at flow boundaries.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Return `err` when cancellation has been requested.
    pub fn bail<E>(&self, err: E) -> Result<(), E> {
        if self.is_cancelled() {
            Err(err)
        } else {
            Ok(())
        }
    }
}

/// Login timing knobs, in config-friendly integer form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginConfig {
    pub page_load_timeout_secs: u64,
    pub email_field_timeout_secs: u64,
    pub field_timeout_secs: u64,
    pub verify_ticks: u32,
    pub popup_budget_secs: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            page_load_timeout_secs: 20,
            email_field_timeout_secs: 8,
            field_timeout_secs: 3,
            verify_ticks: 10,
            popup_budget_secs: 10,
        }
    }
}

impl LoginConfig {
    pub fn timeouts(&self) -> LoginTimeouts {
        LoginTimeouts {
            page_load: std::time::Duration::from_secs(self.page_load_timeout_secs),
            email_field: std::time::Duration::from_secs(self.email_field_timeout_secs),
            other_field: std::time::Duration::from_secs(self.field_timeout_secs),
            verify_ticks: self.verify_ticks,
            ..LoginTimeouts::default()
        }
    }

    pub fn popup_budget(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.popup_budget_secs)
    }
}

/// Toggle watch knobs, in config-friendly integer form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToggleConfig {
    pub desired: bool,
    pub check_interval_secs: u64,
    pub min_checks: u32,
    pub session_checks: u32,
}

impl Default for ToggleConfig {
    fn default() -> Self {
        Self {
            desired: true,
            check_interval_secs: 3,
            min_checks: 3,
            session_checks: 20,
        }
    }
}

impl ToggleConfig {
    pub fn settings(&self) -> crate::automation::toggle::ToggleSettings {
        crate::automation::toggle::ToggleSettings {
            desired: self.desired,
            interval: std::time::Duration::from_secs(self.check_interval_secs),
            min_checks: self.min_checks,
            session_checks: self.session_checks,
            ..crate::automation::toggle::ToggleSettings::default()
        }
    }
}

/// Application configuration, persisted as JSON in the user config dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// URL of the site's login page.
    pub login_url: String,
    pub accounts: Vec<Account>,
    pub workers: usize,
    pub session_max_age_hours: i64,
    pub session_max_restore_failures: u32,
    pub default_strategy: DriverStrategy,
    pub driver: DriverConstraints,
    pub login: LoginConfig,
    pub toggle: ToggleConfig,
    pub schedule: ScheduleSettings,
    pub selectors: SelectorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            login_url: String::new(),
            accounts: Vec::new(),
            workers: 2,
            session_max_age_hours: 12,
            session_max_restore_failures: 2,
            default_strategy: DriverStrategy::Standard,
            driver: DriverConstraints::default(),
            login: LoginConfig::default(),
            toggle: ToggleConfig::default(),
            schedule: ScheduleSettings::default(),
            selectors: SelectorConfig::default(),
        }
    }
}

impl AppConfig {
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("availkeeper").join("config.json"))
    }

    /// Load config from file, falling back to defaults.
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            error!("Failed to parse config file: {}", e);
                        }
                    },
                    Err(e) => {
                        error!("Failed to read config file: {}", e);
                    }
                }
            }
        }
        info!("Using default config");
        Self::default()
    }

    /// Load from an explicit path instead of the user config dir.
    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save config to file.
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }
            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to write config file: {}", e);
                    } else {
                        info!("Saved config to {:?}", path);
                    }
                }
                Err(e) => error!("Failed to serialize config: {}", e),
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.login_url.is_empty() {
            anyhow::bail!("loginUrl is not set");
        }
        url::Url::parse(&self.login_url)
            .map_err(|e| anyhow::anyhow!("loginUrl is not a valid URL: {e}"))?;
        if self.accounts.is_empty() {
            anyhow::bail!("no accounts configured");
        }
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        Ok(())
    }
}

/// Directory for log files.
pub fn log_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("availkeeper").join("logs"))
}

/// Directory for failure screenshots.
pub fn capture_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("availkeeper").join("captures"))
        .unwrap_or_else(|| PathBuf::from("captures"))
}

/// Directory for persisted session snapshots.
pub fn session_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("availkeeper").join("sessions"))
        .unwrap_or_else(|| PathBuf::from("sessions"))
}

/// Initialize logging to console and a daily-rolling file. The returned
/// guard must be held for the life of the process.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            warn!("Failed to create log directory: {}", e);
        }
        let file_appender = tracing_appender::rolling::daily(&log_dir, "availkeeper.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        None
    }
}
