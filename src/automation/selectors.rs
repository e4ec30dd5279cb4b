//! Selector specifications
//!
//! Every semantic UI target (email field, toggle, popup close button) is
//! described by an ordered list of alternative locators. The list is plain
//! data so tests can enumerate and mutate it directly instead of poking at
//! try/except-style fallback chains.

use serde::{Deserialize, Serialize};

/// How a locator value should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LocatorStrategy {
    Css,
    XPath,
}

/// A single way to find an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Locator {
    pub strategy: LocatorStrategy,
    pub value: String,
}

impl Locator {
    pub fn css(value: &str) -> Self {
        Self {
            strategy: LocatorStrategy::Css,
            value: value.to_string(),
        }
    }

    pub fn xpath(value: &str) -> Self {
        Self {
            strategy: LocatorStrategy::XPath,
            value: value.to_string(),
        }
    }
}

/// Alternative locators for one semantic element, tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorSpec {
    /// Stable name used in logs and error messages.
    pub name: String,
    pub locators: Vec<Locator>,
}

impl SelectorSpec {
    pub fn new(name: &str, locators: Vec<Locator>) -> Self {
        Self {
            name: name.to_string(),
            locators,
        }
    }
}

/// Priority tier for popup selectors.
///
/// High matches are blocking modals: the first successful high click stops
/// the whole scan. Medium and low are non-blocking overlays swept
/// best-effort within the time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Tier {
    High,
    Medium,
    Low,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::High, Tier::Medium, Tier::Low];
}

/// One popup dismissal target with its priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PopupSelector {
    pub tier: Tier,
    #[serde(flatten)]
    pub spec: SelectorSpec,
}

/// All selectors the automation needs, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectorConfig {
    pub email_field: SelectorSpec,
    pub password_field: SelectorSpec,
    pub submit: SelectorSpec,
    pub toggle: SelectorSpec,
    /// Confirmation button that may appear after flipping the toggle.
    pub toggle_confirm: SelectorSpec,
    pub popups: Vec<PopupSelector>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            email_field: SelectorSpec::new(
                "email_field",
                vec![
                    Locator::css("#email"),
                    Locator::css("input[name='email']"),
                ],
            ),
            password_field: SelectorSpec::new(
                "password_field",
                vec![
                    Locator::css("#password"),
                    Locator::css("input[name='password']"),
                ],
            ),
            submit: SelectorSpec::new(
                "submit",
                vec![
                    Locator::css("button[name='login']"),
                    Locator::css("input[name='login']"),
                ],
            ),
            toggle: SelectorSpec::new(
                "toggle",
                vec![
                    Locator::css("div.available-now.smart-form input[name='checkbox-toggle']"),
                    Locator::css("#available-now input[type='checkbox']"),
                ],
            ),
            toggle_confirm: SelectorSpec::new(
                "toggle_confirm",
                vec![Locator::xpath("//button[text()=\"OK\"]")],
            ),
            popups: default_popups(),
        }
    }
}

fn popup(tier: Tier, name: &str, locators: Vec<Locator>) -> PopupSelector {
    PopupSelector {
        tier,
        spec: SelectorSpec::new(name, locators),
    }
}

/// Popup selector table observed on the target site, highest priority first.
fn default_popups() -> Vec<PopupSelector> {
    vec![
        popup(
            Tier::High,
            "close_button",
            vec![Locator::xpath("//button[text()=\"Close\"]")],
        ),
        popup(
            Tier::High,
            "ok_button",
            vec![Locator::xpath("//button[text()=\"OK\"]")],
        ),
        popup(
            Tier::High,
            "terms_enter_link",
            vec![Locator::css(".terms-and-conditions__enter-link")],
        ),
        popup(Tier::High, "modal_close", vec![Locator::css(".modal-close")]),
        popup(Tier::High, "popup_close", vec![Locator::css(".popup-close")]),
        popup(Tier::Medium, "close_btn", vec![Locator::css(".close-btn")]),
        popup(
            Tier::Medium,
            "dismiss_modal",
            vec![Locator::css("[data-dismiss='modal']")],
        ),
        popup(Tier::Medium, "generic_close", vec![Locator::css(".close")]),
        popup(Tier::Medium, "dismiss", vec![Locator::css(".dismiss")]),
        popup(
            Tier::Low,
            "modal_header_close",
            vec![
                Locator::css(".modal .close"),
                Locator::css(".modal-header .close"),
            ],
        ),
        popup(
            Tier::Low,
            "popup_inner_close",
            vec![Locator::css(".popup .close"), Locator::css("button.close")],
        ),
        popup(
            Tier::Low,
            "dialog_titlebar_close",
            vec![
                Locator::css(".ui-dialog-titlebar-close"),
                Locator::css(".closeButton"),
            ],
        ),
        popup(
            Tier::Low,
            "cookie_banner",
            vec![
                Locator::css("div.cookie-modal button"),
                Locator::css(".cookie-banner button"),
                Locator::css(".cookie-notice button"),
                Locator::css("button.accept-cookies"),
            ],
        ),
        popup(
            Tier::Low,
            "aria_close",
            vec![
                Locator::css("button[aria-label='Close']"),
                Locator::css("div[role='dialog'] button"),
            ],
        ),
    ]
}
