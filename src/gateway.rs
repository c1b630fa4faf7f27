use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::types::{BBox, WaitUntil};

/// Raw facts about one interactive element as the scan script saw it,
/// before cataloguing. `handle` is the engine-level address (a selector
/// for the attribute the scan stamped onto the element) and is only valid
/// until the next scan.
#[derive(Debug, Clone, Deserialize)]
pub struct RawElement {
    pub handle: String,
    pub tag: String,
    #[serde(default)]
    pub role_attr: Option<String>,
    #[serde(default)]
    pub aria_label: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image_alt: Option<String>,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
    pub bbox: BBox,
    pub visible: bool,
}

/// Page scroll state used by the auto-scroll gate.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScrollGeometry {
    pub scroll_y: f64,
    pub scroll_height: f64,
    pub viewport_height: f64,
}

impl ScrollGeometry {
    pub fn at_document_bottom(&self) -> bool {
        self.scroll_y + self.viewport_height >= self.scroll_height - 5.0
    }

    pub fn unscrollable(&self) -> bool {
        self.scroll_y == 0.0 && (self.scroll_height - self.viewport_height).abs() < 10.0
    }
}

/// Snapshot of url/title/text taken around an action to detect change.
#[derive(Debug, Clone, Default)]
pub struct PageProbe {
    pub url: String,
    pub title: String,
    pub text: String,
}

/// Low-level, engine-agnostic browser surface. One implementor wraps a
/// real CDP session; tests provide a scripted mock. The engine is a
/// blocking client, so the trait is synchronous; all async in the core
/// lives on the LLM side.
pub trait BrowserGateway: Send + Sync {
    fn navigate(&self, url: &str) -> Result<()>;

    /// Run the interactive-element scan, stamping `scan_token` into each
    /// element's handle attribute so handles from older scans cannot
    /// resolve.
    fn scan(&self, scan_token: &str) -> Result<Vec<RawElement>>;

    fn current_url(&self) -> String;
    fn page_title(&self) -> Result<String>;
    /// Visible body text, truncated to `max_chars`.
    fn page_text(&self, max_chars: usize) -> Result<String>;

    fn scroll_geometry(&self) -> Result<ScrollGeometry>;
    /// `window.scrollBy(0, dy)`, used by the auto-scroll gate.
    fn scroll_by(&self, dy: i64) -> Result<()>;
    /// Wheel event at the current cursor position, used by the `SCROLL`
    /// action.
    fn scroll_wheel(&self, dy: i64) -> Result<()>;

    /// Human-like click: scroll into view, jittered midpoint, interpolated
    /// mouse travel, hover pause, press-hold-release.
    fn cursor_click(&self, handle: &str) -> Result<()>;
    /// Human-like fill: cursor click, platform Select-All + Backspace,
    /// then per-character typing.
    fn cursor_fill(&self, handle: &str, value: &str) -> Result<()>;

    /// Direct DOM click without cursor physics.
    fn click(&self, handle: &str) -> Result<()>;
    /// Direct DOM fill without cursor physics.
    fn fill(&self, handle: &str, value: &str) -> Result<()>;

    /// Key press, focused on `handle` when given, page-level otherwise.
    fn press_key(&self, key: &str, handle: Option<&str>) -> Result<()>;

    /// Wait for the page to settle after an action. Swallows every
    /// failure: the contract is "wait up to `timeout`, then return".
    fn wait_for_stability(&self, timeout: Duration);

    /// Block until the given load state, best effort within `timeout`.
    fn wait_for_load(&self, until: WaitUntil, timeout: Duration);

    /// Convenience probe used around ACT and by VERIFY.
    fn probe(&self, max_chars: usize) -> PageProbe {
        PageProbe {
            url: self.current_url(),
            title: self.page_title().unwrap_or_default(),
            text: self.page_text(max_chars).unwrap_or_default(),
        }
    }
}
