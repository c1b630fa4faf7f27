use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use headless_chrome::browser::tab::point::Point;
use headless_chrome::browser::tab::ModifierKey;
use headless_chrome::protocol::cdp::Input;
use headless_chrome::{Browser, Element, LaunchOptions, Tab};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::errors::AgentError;
use crate::gateway::{BrowserGateway, RawElement, ScrollGeometry};
use crate::types::WaitUntil;

/// Broad interactive selector: the scan script mirrors this element set.
const INTERACTIVE_SELECTOR: &str = "button, [role=button], [role=link], [role=checkbox], \
     [role=radio], a[href], input:not([type=hidden]), textarea, select";

/// Mouse travel is interpolated over this many move events.
const CURSOR_MOVE_STEPS: u32 = 10;
const HOVER_PAUSE: Duration = Duration::from_millis(100);
const PRESS_HOLD: Duration = Duration::from_millis(70);
const PRE_TYPE_PAUSE: Duration = Duration::from_millis(50);
const PER_CHAR_DELAY: Duration = Duration::from_millis(50);
const POST_NAVIGATE_SETTLE: Duration = Duration::from_millis(300);

/// Injected scan script. Walks the interactive selector in document
/// order, stamps `data-pp-id="<token>-<n>"` onto each element so the
/// handle survives until the next scan invalidates it, and returns the
/// raw element facts as a JSON string.
const SCAN_JS: &str = r#"
(() => {
  const SELECTOR = '__SELECTOR__';
  const TOKEN = '__TOKEN__';

  function isVisible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  const out = [];
  document.querySelectorAll(SELECTOR).forEach((el, i) => {
    el.setAttribute('data-pp-id', TOKEN + '-' + i);
    const r = el.getBoundingClientRect();
    const img = el.querySelector('img');
    out.push({
      handle: '[data-pp-id="' + TOKEN + '-' + i + '"]',
      tag: el.tagName.toLowerCase(),
      role_attr: el.getAttribute('role') || null,
      aria_label: el.getAttribute('aria-label') || null,
      name: el.getAttribute('name') || null,
      placeholder: el.getAttribute('placeholder') || null,
      text: (el.textContent || '').trim().slice(0, 200) || null,
      image_alt: img ? (img.getAttribute('alt') || '') : null,
      input_type: el.tagName === 'INPUT' ? (el.type || 'text') : null,
      href: el.tagName === 'A' ? (el.getAttribute('href') || null) : null,
      bbox: { x: r.x, y: r.y, w: r.width, h: r.height },
      visible: isVisible(el),
    });
  });
  return JSON.stringify(out);
})()
"#;

const GEOMETRY_JS: &str = r#"
JSON.stringify({
  scroll_y: window.scrollY,
  scroll_height: document.documentElement.scrollHeight,
  viewport_height: window.innerHeight,
})
"#;

/// Real-browser gateway over a CDP session. Created once per session and
/// shared behind an `Arc`; the underlying client is blocking, so callers
/// treat every method as a blocking suspension point.
pub struct ChromeGateway {
    _browser: Browser,
    tab: Arc<Tab>,
    cursor: Mutex<(f64, f64)>,
}

impl ChromeGateway {
    /// Attach to an already-running Chrome on 9222 if one is there,
    /// otherwise launch a fresh instance. Slow; call from a blocking
    /// task.
    pub fn launch(config: &BrowserConfig) -> Result<Self> {
        if let Ok(browser) = Browser::connect("http://127.0.0.1:9222".to_string()) {
            info!("attached to existing Chrome on port 9222");
            // Take the first tab if one exists; the lock must drop before
            // new_tab touches the same list.
            let existing = {
                let tabs_lock = browser.get_tabs();
                let tabs = tabs_lock.lock().unwrap();
                tabs.first().cloned()
            };
            let tab = match existing {
                Some(tab) => tab,
                None => browser.new_tab()?,
            };
            return Self::finish(browser, tab, config);
        }

        info!(headless = config.headless, "launching Chrome");
        let options = LaunchOptions {
            headless: config.headless,
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
                std::ffi::OsStr::new("--disable-infobars"),
                std::ffi::OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        let browser = Browser::new(options).context("browser launch failed")?;
        let tab = browser.new_tab()?;
        Self::finish(browser, tab, config)
    }

    fn finish(browser: Browser, tab: Arc<Tab>, config: &BrowserConfig) -> Result<Self> {
        let gateway = Self {
            _browser: browser,
            tab,
            cursor: Mutex::new((0.0, 0.0)),
        };
        if config.start_url != "about:blank" {
            gateway.navigate(&config.start_url)?;
        }
        Ok(gateway)
    }

    fn eval_string(&self, js: &str) -> Result<String> {
        let result = self
            .tab
            .evaluate(js, false)
            .map_err(|e| anyhow!(AgentError::Browser(e.to_string())))?;
        result
            .value
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| anyhow!(AgentError::Browser("script returned no string".into())))
    }

    fn find(&self, handle: &str) -> Result<Element<'_>> {
        self.tab
            .find_element(handle)
            .map_err(|_| anyhow!(AgentError::StaleElement(handle.to_string())))
    }

    /// Single raw mouse transition. Mirrors how the engine's own
    /// click helper composes press and release, split so a hold can sit
    /// between them.
    fn mouse_button_event(
        &self,
        event_type: Input::DispatchMouseEventTypeOption,
        x: f64,
        y: f64,
    ) -> Result<()> {
        self.tab.call_method(Input::DispatchMouseEvent {
            Type: event_type,
            x,
            y,
            modifiers: None,
            timestamp: None,
            button: Some(Input::MouseButton::Left),
            buttons: None,
            click_count: Some(1),
            force: None,
            tangential_pressure: None,
            tilt_x: None,
            tilt_y: None,
            twist: None,
            delta_x: None,
            delta_y: None,
            pointer_Type: None,
        })?;
        Ok(())
    }

    /// Interpolated travel from the last cursor position to the target,
    /// then hover, press, hold, release.
    fn physical_click_at(&self, target: Point) -> Result<()> {
        let start = *self.cursor.lock().unwrap();
        for step in 1..=CURSOR_MOVE_STEPS {
            let t = f64::from(step) / f64::from(CURSOR_MOVE_STEPS);
            let point = Point {
                x: start.0 + (target.x - start.0) * t,
                y: start.1 + (target.y - start.1) * t,
            };
            self.tab.move_mouse_to_point(point)?;
        }
        *self.cursor.lock().unwrap() = (target.x, target.y);

        std::thread::sleep(HOVER_PAUSE);
        self.mouse_button_event(
            Input::DispatchMouseEventTypeOption::MousePressed,
            target.x,
            target.y,
        )?;
        std::thread::sleep(PRESS_HOLD);
        self.mouse_button_event(
            Input::DispatchMouseEventTypeOption::MouseReleased,
            target.x,
            target.y,
        )?;
        Ok(())
    }

    /// Click point: element midpoint plus up to one pixel of jitter on
    /// each axis.
    fn jittered_midpoint(&self, element: &Element<'_>, handle: &str) -> Result<Point> {
        let midpoint = element
            .get_midpoint()
            .map_err(|_| anyhow!(AgentError::NotVisible(handle.to_string())))?;
        let mut rng = rand::thread_rng();
        Ok(Point {
            x: midpoint.x + rng.gen_range(-1.0..=1.0),
            y: midpoint.y + rng.gen_range(-1.0..=1.0),
        })
    }

    fn select_all_modifier() -> ModifierKey {
        if cfg!(target_os = "macos") {
            ModifierKey::Meta
        } else {
            ModifierKey::Ctrl
        }
    }
}

impl BrowserGateway for ChromeGateway {
    fn navigate(&self, url: &str) -> Result<()> {
        self.tab
            .navigate_to(url)
            .with_context(|| format!("failed to open {url}"))?;
        if let Err(e) = self.tab.wait_until_navigated() {
            warn!(error = %e, "navigation wait failed, continuing");
        }
        std::thread::sleep(POST_NAVIGATE_SETTLE);
        Ok(())
    }

    fn scan(&self, scan_token: &str) -> Result<Vec<RawElement>> {
        let js = SCAN_JS
            .replace("__SELECTOR__", INTERACTIVE_SELECTOR)
            .replace("__TOKEN__", scan_token);
        let raw = self.eval_string(&js)?;
        let elements: Vec<RawElement> =
            serde_json::from_str(&raw).context("scan script returned malformed JSON")?;
        debug!(token = scan_token, count = elements.len(), "scanned page");
        Ok(elements)
    }

    fn current_url(&self) -> String {
        self.tab.get_url()
    }

    fn page_title(&self) -> Result<String> {
        self.tab
            .get_title()
            .map_err(|e| anyhow!(AgentError::Browser(e.to_string())))
    }

    fn page_text(&self, max_chars: usize) -> Result<String> {
        let js = format!(
            "(document.body ? document.body.innerText : '').slice(0, {max_chars})"
        );
        self.eval_string(&js)
    }

    fn scroll_geometry(&self) -> Result<ScrollGeometry> {
        let raw = self.eval_string(GEOMETRY_JS)?;
        serde_json::from_str(&raw).context("geometry script returned malformed JSON")
    }

    fn scroll_by(&self, dy: i64) -> Result<()> {
        self.tab
            .evaluate(&format!("window.scrollBy(0, {dy})"), false)
            .map_err(|e| anyhow!(AgentError::Browser(e.to_string())))?;
        Ok(())
    }

    fn scroll_wheel(&self, dy: i64) -> Result<()> {
        let (x, y) = *self.cursor.lock().unwrap();
        self.tab.call_method(Input::DispatchMouseEvent {
            Type: Input::DispatchMouseEventTypeOption::MouseWheel,
            x,
            y,
            modifiers: None,
            timestamp: None,
            button: None,
            buttons: None,
            click_count: None,
            force: None,
            tangential_pressure: None,
            tilt_x: None,
            tilt_y: None,
            twist: None,
            delta_x: Some(0.0),
            delta_y: Some(dy as f64),
            pointer_Type: None,
        })?;
        Ok(())
    }

    fn cursor_click(&self, handle: &str) -> Result<()> {
        let element = self.find(handle)?;
        let _ = element.scroll_into_view();
        let target = self.jittered_midpoint(&element, handle)?;
        self.physical_click_at(target)
    }

    fn cursor_fill(&self, handle: &str, value: &str) -> Result<()> {
        self.cursor_click(handle)?;

        self.tab
            .press_key_with_modifiers("a", Some(&[Self::select_all_modifier()]))?;
        self.tab.press_key("Backspace")?;
        std::thread::sleep(PRE_TYPE_PAUSE);

        for ch in value.chars() {
            self.tab.type_str(&ch.to_string())?;
            std::thread::sleep(PER_CHAR_DELAY);
        }
        Ok(())
    }

    fn click(&self, handle: &str) -> Result<()> {
        self.find(handle)?.click()?;
        Ok(())
    }

    fn fill(&self, handle: &str, value: &str) -> Result<()> {
        let element = self.find(handle)?;
        let _ = element.call_js_fn(
            "function () { if ('value' in this) { this.value = ''; } }",
            vec![],
            false,
        );
        element.type_into(value)?;
        Ok(())
    }

    fn press_key(&self, key: &str, handle: Option<&str>) -> Result<()> {
        if let Some(handle) = handle {
            self.find(handle)?.focus()?;
        }
        self.tab.press_key(key)?;
        Ok(())
    }

    fn wait_for_stability(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut settled = false;
        while Instant::now() < deadline {
            match self.tab.evaluate("document.readyState", false) {
                Ok(obj) => {
                    let state = obj.value.and_then(|v| v.as_str().map(String::from));
                    if state.as_deref() == Some("complete") {
                        settled = true;
                        break;
                    }
                }
                // Evaluation fails while a navigation is tearing the
                // context down; keep polling until the deadline.
                Err(_) => {}
            }
            std::thread::sleep(Duration::from_millis(150));
        }
        if !settled {
            debug!("stability wait hit its budget");
        }
        std::thread::sleep(POST_NAVIGATE_SETTLE);
    }

    fn wait_for_load(&self, until: WaitUntil, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        match until {
            WaitUntil::Load | WaitUntil::DomContentLoaded => {
                let accept_interactive = matches!(until, WaitUntil::DomContentLoaded);
                while Instant::now() < deadline {
                    if let Ok(obj) = self.tab.evaluate("document.readyState", false) {
                        let state = obj.value.and_then(|v| v.as_str().map(String::from));
                        match state.as_deref() {
                            Some("complete") => return,
                            Some("interactive") if accept_interactive => return,
                            _ => {}
                        }
                    }
                    std::thread::sleep(Duration::from_millis(150));
                }
            }
            WaitUntil::NetworkIdle => {
                let _ = self.tab.wait_until_navigated();
                self.wait_for_stability(timeout);
            }
        }
    }
}
