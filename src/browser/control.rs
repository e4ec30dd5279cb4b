//! Page control boundary
//!
//! `PageControl` is the only surface the automation layers talk to. The
//! production implementation wraps a CDP page; tests substitute a scripted
//! fake. Locator resolution happens in page JavaScript so CSS and XPath
//! alternatives go through one code path.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::automation::selectors::{Locator, LocatorStrategy};
use crate::browser::errors::BrowserError;

/// Presence and visibility of an element at one point in time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ElementProbe {
    pub found: bool,
    pub visible: bool,
}

impl ElementProbe {
    pub fn interactable(&self) -> bool {
        self.found && self.visible
    }
}

/// Cookies and local storage captured from a live page.
///
/// Stored as raw JSON so the on-disk format survives protocol type changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageState {
    pub cookies: serde_json::Value,
    pub local_storage: serde_json::Value,
}

/// Everything the login, popup, and toggle layers need from a browser page.
#[async_trait]
pub trait PageControl: Send + Sync {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    /// Evaluate a script and return its JSON result.
    async fn execute(&self, script: &str) -> Result<serde_json::Value, BrowserError>;

    async fn query(&self, locator: &Locator) -> Result<ElementProbe, BrowserError>;

    /// Programmatic `el.click()`.
    async fn click_js(&self, locator: &Locator) -> Result<(), BrowserError>;

    /// Click through the element handle or a synthesized mouse event chain.
    async fn click_native(&self, locator: &Locator) -> Result<(), BrowserError>;

    /// Click with raw pointer input at the element center.
    async fn click_pointer(&self, locator: &Locator) -> Result<(), BrowserError>;

    /// Clear the field then type `text` into it.
    async fn clear_and_type(&self, locator: &Locator, text: &str) -> Result<(), BrowserError>;

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError>;

    async fn snapshot_state(&self) -> Result<PageState, BrowserError>;

    async fn restore_state(&self, state: &PageState) -> Result<(), BrowserError>;
}

/// JavaScript expression resolving a locator to an element or null.
pub(crate) fn lookup_expr(locator: &Locator) -> String {
    let quoted = serde_json::Value::String(locator.value.clone()).to_string();
    match locator.strategy {
        LocatorStrategy::Css => format!("document.querySelector({quoted})"),
        LocatorStrategy::XPath => format!(
            "document.evaluate({quoted}, document, null, \
             XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue"
        ),
    }
}

fn cdp_err(e: CdpError, fallback: fn(String) -> BrowserError) -> BrowserError {
    match e {
        CdpError::Timeout => BrowserError::Timeout("CDP request timed out".to_string()),
        CdpError::JavascriptException(details) => BrowserError::ScriptError(details.text),
        other => {
            let text = other.to_string();
            if text.contains("channel") || text.contains("connection") || text.contains("closed") {
                BrowserError::ConnectionLost(text)
            } else {
                fallback(text)
            }
        }
    }
}

/// `PageControl` over a live CDP page.
pub struct CdpPage {
    page: Page,
}

impl CdpPage {
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    async fn eval(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| cdp_err(e, BrowserError::ScriptError))?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    /// Runs a lookup-based script that returns `false` when the element is
    /// missing and `true` once the action completed.
    async fn eval_on_element(
        &self,
        locator: &Locator,
        body: &str,
    ) -> Result<(), BrowserError> {
        let script = format!(
            "(function() {{ const el = {}; if (!el) return false; {} return true; }})()",
            lookup_expr(locator),
            body
        );
        match self.eval(&script).await? {
            serde_json::Value::Bool(true) => Ok(()),
            _ => Err(BrowserError::ElementNotFound(locator.value.clone())),
        }
    }

    async fn element_center(&self, locator: &Locator) -> Result<(f64, f64), BrowserError> {
        let script = format!(
            "(function() {{ const el = {}; if (!el) return null; \
             el.scrollIntoView({{block: 'center'}}); \
             const r = el.getBoundingClientRect(); \
             return {{x: r.left + r.width / 2, y: r.top + r.height / 2}}; }})()",
            lookup_expr(locator)
        );
        let value = self.eval(&script).await?;
        let x = value.get("x").and_then(|v| v.as_f64());
        let y = value.get("y").and_then(|v| v.as_f64());
        match (x, y) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err(BrowserError::ElementNotFound(locator.value.clone())),
        }
    }

    async fn dispatch_mouse(
        &self,
        kind: DispatchMouseEventType,
        x: f64,
        y: f64,
    ) -> Result<(), BrowserError> {
        let params = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(BrowserError::ScriptError)?;
        self.page
            .execute(params)
            .await
            .map_err(|e| cdp_err(e, BrowserError::ScriptError))?;
        Ok(())
    }
}

#[async_trait]
impl PageControl for CdpPage {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        tokio::time::timeout(timeout, self.page.goto(url))
            .await
            .map_err(|_| BrowserError::Timeout(format!("navigation to {url}")))?
            .map_err(|e| cdp_err(e, BrowserError::NavigationFailed))?;
        // Settle on the load lifecycle event when it arrives in time.
        if let Ok(Err(e)) = tokio::time::timeout(timeout, self.page.wait_for_navigation()).await {
            debug!(error = %e, "navigation settle wait failed");
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| cdp_err(e, BrowserError::NavigationFailed))?;
        url.ok_or_else(|| BrowserError::NavigationFailed("page has no URL".to_string()))
    }

    async fn execute(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        self.eval(script).await
    }

    async fn query(&self, locator: &Locator) -> Result<ElementProbe, BrowserError> {
        let script = format!(
            "(function() {{ const el = {}; \
             if (!el) return {{found: false, visible: false}}; \
             const visible = el.offsetParent !== null || el.getClientRects().length > 0; \
             return {{found: true, visible: visible}}; }})()",
            lookup_expr(locator)
        );
        let value = self.eval(&script).await?;
        serde_json::from_value(value)
            .map_err(|e| BrowserError::ScriptError(format!("probe result: {e}")))
    }

    async fn click_js(&self, locator: &Locator) -> Result<(), BrowserError> {
        self.eval_on_element(locator, "el.click();").await
    }

    async fn click_native(&self, locator: &Locator) -> Result<(), BrowserError> {
        if let LocatorStrategy::Css = locator.strategy {
            let element = self
                .page
                .find_element(locator.value.as_str())
                .await
                .map_err(|_| BrowserError::ElementNotFound(locator.value.clone()))?;
            element
                .click()
                .await
                .map_err(|e| cdp_err(e, BrowserError::ScriptError))?;
            return Ok(());
        }
        // XPath targets get a full synthesized mouse event chain instead.
        self.eval_on_element(
            locator,
            "const r = el.getBoundingClientRect(); \
             const opts = {bubbles: true, cancelable: true, view: window, \
             clientX: r.left + r.width / 2, clientY: r.top + r.height / 2}; \
             for (const t of ['mousedown', 'mouseup', 'click']) \
             el.dispatchEvent(new MouseEvent(t, opts));",
        )
        .await
    }

    async fn click_pointer(&self, locator: &Locator) -> Result<(), BrowserError> {
        let (x, y) = self.element_center(locator).await?;
        self.dispatch_mouse(DispatchMouseEventType::MousePressed, x, y)
            .await?;
        tokio::time::sleep(Duration::from_millis(40)).await;
        self.dispatch_mouse(DispatchMouseEventType::MouseReleased, x, y)
            .await
    }

    async fn clear_and_type(&self, locator: &Locator, text: &str) -> Result<(), BrowserError> {
        self.eval_on_element(
            locator,
            "el.focus(); el.value = ''; \
             el.dispatchEvent(new Event('input', {bubbles: true}));",
        )
        .await?;
        self.page
            .execute(InsertTextParams::new(text))
            .await
            .map_err(|e| cdp_err(e, BrowserError::ScriptError))?;
        self.eval_on_element(
            locator,
            "el.dispatchEvent(new Event('input', {bubbles: true})); \
             el.dispatchEvent(new Event('change', {bubbles: true}));",
        )
        .await
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        self.page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(true)
                    .build(),
            )
            .await
            .map_err(|e| cdp_err(e, BrowserError::ScriptError))
    }

    async fn snapshot_state(&self) -> Result<PageState, BrowserError> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .map_err(|e| cdp_err(e, BrowserError::ConnectionLost))?;
        let cookies = serde_json::to_value(cookies)
            .map_err(|e| BrowserError::ScriptError(format!("cookie encode: {e}")))?;
        let local_storage = self
            .eval(
                "(function() { const out = {}; \
                 try { for (let i = 0; i < localStorage.length; i++) { \
                 const k = localStorage.key(i); out[k] = localStorage.getItem(k); } } \
                 catch (e) {} return out; })()",
            )
            .await?;
        Ok(PageState {
            cookies,
            local_storage,
        })
    }

    async fn restore_state(&self, state: &PageState) -> Result<(), BrowserError> {
        let params: Vec<CookieParam> = serde_json::from_value(state.cookies.clone())
            .map_err(|e| BrowserError::StateRestoreFailed(format!("cookie decode: {e}")))?;
        if !params.is_empty() {
            self.page
                .set_cookies(params)
                .await
                .map_err(|e| cdp_err(e, BrowserError::StateRestoreFailed))?;
        }
        if state.local_storage.as_object().map_or(false, |m| !m.is_empty()) {
            // Injected on every new document so the storage is present the
            // first time the origin loads.
            let script = format!(
                "(function() {{ const data = {}; \
                 try {{ for (const k in data) localStorage.setItem(k, data[k]); }} \
                 catch (e) {{}} }})();",
                state.local_storage
            );
            let params = AddScriptToEvaluateOnNewDocumentParams::builder()
                .source(script)
                .build()
                .map_err(BrowserError::StateRestoreFailed)?;
            self.page
                .execute(params)
                .await
                .map_err(|e| cdp_err(e, BrowserError::StateRestoreFailed))?;
        }
        Ok(())
    }
}
