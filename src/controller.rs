use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use crate::brain::{current_step_objective, DecisionContext, DecisionOracle, ScrollStatus};
use crate::dom::Catalogue;
use crate::errors::AgentError;
use crate::gateway::{BrowserGateway, PageProbe};
use crate::guardrails::Guardrails;
use crate::memory::{HistoryRow, SessionMemory};
use crate::types::{
    Action, ActionOutcome, Feedback, Region, RegionDiff, ScrollDirection, HISTORY_WINDOW,
    MAX_AUTO_SCROLLS, PAGE_EXCERPT_CHARS, REGION_DIFF_CAP, SCROLL_STEP_PX, STATE_PROBE_CHARS,
};
use crate::verifier::Verifier;

const STABILITY_TIMEOUT: Duration = Duration::from_secs(5);
const SCROLL_ACTION_PAUSE: Duration = Duration::from_millis(400);
const DEFAULT_WAIT: Duration = Duration::from_millis(1000);
const LOAD_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Loop phases surfaced through the step callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Observe,
    Decide,
    Act,
    Verify,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observe => "OBSERVE",
            Self::Decide => "DECIDE",
            Self::Act => "ACT",
            Self::Verify => "VERIFY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseKind {
    Confirm,
    AskUser,
}

/// Terminal state of one `run_loop` call. A pause preserves enough for
/// the host to resume via [`AgentController::execute_action`] after human
/// input.
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub completed: bool,
    pub reason: String,
    pub pending_action: Option<Action>,
    pub pause_kind: Option<PauseKind>,
    pub step_completion_check: bool,
}

impl LoopResult {
    fn completed(reason: impl Into<String>) -> Self {
        Self {
            completed: true,
            reason: reason.into(),
            pending_action: None,
            pause_kind: None,
            step_completion_check: false,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            completed: false,
            reason: reason.into(),
            pending_action: None,
            pause_kind: None,
            step_completion_check: false,
        }
    }

    fn paused(kind: PauseKind, reason: impl Into<String>, pending: Option<Action>) -> Self {
        Self {
            completed: false,
            reason: reason.into(),
            pending_action: pending,
            pause_kind: Some(kind),
            step_completion_check: false,
        }
    }
}

/// Options for one `run_loop` call. `reset_step_count` defaults to true:
/// a fresh call gets a fresh budget, and the host passes `false` when
/// resuming after a pause.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub reset_step_count: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            reset_step_count: true,
        }
    }
}

/// Cooperative cancellation handle. Cancelling between DECIDE and ACT
/// guarantees the decided action is not executed.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct ScrollTracker {
    scroll_count: usize,
    content_visible: bool,
    bottom_reached: bool,
    last_scroll_y: Option<f64>,
    last_scroll_height: Option<f64>,
}

impl ScrollTracker {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn status(&self) -> ScrollStatus {
        ScrollStatus {
            scroll_count: self.scroll_count,
            content_visible: self.content_visible,
            bottom_reached: self.bottom_reached,
        }
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    step_count: usize,
    last_action: Option<Action>,
    last_outcome: Option<ActionOutcome>,
    previous_labels: Vec<String>,
    last_action_key: Option<String>,
    repeated_action_count: u32,
    scroll: ScrollTracker,
    last_url: Option<String>,
    consecutive_failures: u32,
}

/// The control loop: OBSERVE, auto-scroll, DECIDE, guardrails, ACT,
/// VERIFY. One instance owns one session.
pub struct AgentController {
    gateway: Arc<dyn BrowserGateway>,
    catalogue: Catalogue,
    oracle: Box<dyn DecisionOracle>,
    guardrails: Guardrails,
    verifier: Box<dyn Verifier>,
    memory: SessionMemory,
    max_steps: usize,
    cancel: CancelFlag,
    state: ControllerState,
}

impl AgentController {
    pub fn new(
        gateway: Arc<dyn BrowserGateway>,
        oracle: Box<dyn DecisionOracle>,
        guardrails: Guardrails,
        verifier: Box<dyn Verifier>,
        memory: SessionMemory,
        max_steps: usize,
    ) -> Self {
        Self {
            gateway,
            catalogue: Catalogue::new(),
            oracle,
            guardrails,
            verifier,
            memory,
            max_steps,
            cancel: CancelFlag::default(),
            state: ControllerState::default(),
        }
    }

    /// Handle the host can use to cancel the loop between iterations.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn session_id(&self) -> &str {
        self.memory.session_id()
    }

    /// Drive the task until it completes, pauses, or runs out of budget.
    pub async fn run_loop<F>(&mut self, task: &str, opts: RunOptions, on_step: &mut F) -> LoopResult
    where
        F: FnMut(Phase, &str, Option<&Action>),
    {
        if opts.reset_step_count {
            self.state.step_count = 0;
        }
        info!(session = self.memory.session_id(), %task, "starting loop");

        loop {
            if self.cancel.is_cancelled() {
                return LoopResult::failed("cancelled by host");
            }
            if self.state.step_count >= self.max_steps {
                return LoopResult::failed("Max steps reached");
            }
            self.state.step_count += 1;

            // OBSERVE: rebuild the catalogue; one retry after a stability
            // wait covers scans that race a navigation.
            on_step(Phase::Observe, "scanning page", None);
            let regions = match self.scan_with_retry() {
                Ok(regions) => regions,
                Err(err) => return LoopResult::failed(format!("page scan failed: {err}")),
            };
            let labels: Vec<String> = regions.iter().map(|r| r.label.clone()).collect();
            let region_diff = diff_labels(&self.state.previous_labels, &labels);
            self.state.previous_labels = labels.clone();

            // URL change invalidates scroll tracking and the failure
            // streak before any scroll logic runs.
            let url = self.gateway.current_url();
            if self.state.last_url.as_deref() != Some(url.as_str()) {
                debug!(%url, "url changed, resetting scroll tracking");
                self.state.scroll.reset();
                self.state.consecutive_failures = 0;
                self.state.last_url = Some(url.clone());
            }

            // Pre-decision auto-scroll gate.
            if !self.state.scroll.content_visible
                && !self.state.scroll.bottom_reached
                && self.state.scroll.scroll_count < MAX_AUTO_SCROLLS
            {
                let objective = current_step_objective(task);
                let excerpt = self
                    .gateway
                    .page_text(PAGE_EXCERPT_CHARS)
                    .unwrap_or_default();
                if self
                    .oracle
                    .content_relevant(objective, &excerpt, &labels)
                    .await
                {
                    self.state.scroll.content_visible = true;
                } else if self.auto_scroll_step(&url, on_step) {
                    continue;
                }
            }

            // DECIDE
            on_step(Phase::Decide, "consulting decision oracle", None);
            let feedback = Feedback {
                last_action: self.state.last_action.clone(),
                last_outcome: self.state.last_outcome.clone(),
                region_diff: (!region_diff.is_empty()).then(|| region_diff.clone()),
            };
            let excerpt = self
                .gateway
                .page_text(PAGE_EXCERPT_CHARS)
                .unwrap_or_default();
            let ctx = DecisionContext {
                task,
                step_number: self.state.step_count,
                url: &url,
                page_excerpt: &excerpt,
                regions: &regions,
                feedback: &feedback,
                history: self.memory.recent(HISTORY_WINDOW),
                scroll: self.state.scroll.status(),
                consecutive_failures: self.state.consecutive_failures,
            };
            let Some(decision) = self.oracle.decide(&ctx).await else {
                return LoopResult::failed("decision oracle produced no usable decision");
            };
            if let Err(msg) = decision.validate() {
                return LoopResult::failed(format!("decision failed validation: {msg}"));
            }
            let action = decision.action.clone();
            on_step(Phase::Decide, &decision.reasoning, Some(&action));

            match &action {
                Action::Done { reason } => {
                    let reason = reason.clone().unwrap_or_else(|| "task complete".into());
                    self.remember(&action, &reason, None);
                    return LoopResult::completed(reason);
                }
                Action::Confirm { message, .. } => {
                    return LoopResult::paused(PauseKind::Confirm, message.clone(), None);
                }
                Action::AskUser { message, .. } => {
                    return LoopResult::paused(PauseKind::AskUser, message.clone(), None);
                }
                _ => {}
            }

            // Oscillation detection keys on the action type plus the
            // resolved label, never the volatile region id.
            let resolved = action
                .region_id()
                .and_then(|id| regions.iter().find(|r| r.id == id))
                .map(|r| r.label.as_str())
                .unwrap_or("");
            let action_key = format!("{}:{resolved}", action.kind());
            if self.state.last_action_key.as_deref() == Some(action_key.as_str()) {
                self.state.repeated_action_count += 1;
            } else {
                self.state.last_action_key = Some(action_key);
                self.state.repeated_action_count = 0;
            }
            if self.state.repeated_action_count >= 2 {
                let attempts = self.state.repeated_action_count + 1;
                let message = format!(
                    "The agent has proposed {} on '{resolved}' {attempts} times in a row \
                     without visible progress. Is this step already complete?",
                    action.kind()
                );
                warn!(action = action.kind(), attempts, "oscillation detected");
                let mut result =
                    LoopResult::paused(PauseKind::Confirm, message, Some(action.clone()));
                result.step_completion_check = true;
                return result;
            }

            // Guardrails
            let verdict = self.guardrails.evaluate(&action, &regions);
            if !verdict.allowed {
                let reason = verdict.reason.unwrap_or_else(|| "policy violation".into());
                if verdict.requires_confirmation {
                    return LoopResult::paused(PauseKind::Confirm, reason, Some(action));
                }
                warn!(%reason, "Action skipped due to guardrail");
                on_step(Phase::Act, "Action skipped due to guardrail", Some(&action));
                let probe = self.gateway.probe(STATE_PROBE_CHARS);
                self.state.last_outcome = Some(unchanged_outcome(&probe));
                self.state.last_action = Some(action.clone());
                self.remember(&action, &format!("skipped: {reason}"), None);
                continue;
            }

            // A cancellation landing between DECIDE and ACT must not
            // execute the decided action.
            if self.cancel.is_cancelled() {
                return LoopResult::failed("cancelled before dispatch");
            }

            // ACT
            let description = action.kind().to_string();
            on_step(Phase::Act, &description, Some(&action));
            let before = self.gateway.probe(STATE_PROBE_CHARS);
            let dispatched = self.dispatch(&action, &regions).await;

            // VERIFY. Probe reads swallow navigation-destroyed contexts
            // field by field, so a mid-navigation page still yields its
            // reachable state.
            match dispatched {
                Ok(()) => {
                    let after = self.gateway.probe(STATE_PROBE_CHARS);
                    let outcome = build_outcome(&before, &after);
                    let report = self.verifier.report(&action, &before, &after);
                    on_step(Phase::Verify, &report, None);

                    if outcome.state_changed {
                        self.state.consecutive_failures = 0;
                    } else {
                        self.state.consecutive_failures += 1;
                    }
                    self.remember(&action, &report, Some(outcome.state_changed));
                    self.state.last_action = Some(action);
                    self.state.last_outcome = Some(outcome);
                }
                Err(err) => {
                    warn!(error = %err, action = action.kind(), "action dispatch failed");
                    on_step(Phase::Verify, &format!("action failed: {err}"), None);
                    let probe = self.gateway.probe(STATE_PROBE_CHARS);
                    self.state.consecutive_failures += 1;
                    self.remember(&action, &format!("failed: {err}"), Some(false));
                    self.state.last_outcome = Some(unchanged_outcome(&probe));
                    self.state.last_action = Some(action);
                }
            }
        }
    }

    /// One-shot dispatch outside the loop, used by the host to resume
    /// after the user approved a paused action. The approval also clears
    /// the oscillation counter.
    pub async fn execute_action(&mut self, action: &Action) -> Result<ActionOutcome> {
        let before = self.gateway.probe(STATE_PROBE_CHARS);
        let regions: Vec<Region> = Vec::new();
        self.dispatch(action, &regions).await?;
        let after = self.gateway.probe(STATE_PROBE_CHARS);
        let outcome = build_outcome(&before, &after);

        self.state.repeated_action_count = 0;
        self.state.last_action_key = None;
        self.remember(action, "executed on user approval", Some(outcome.state_changed));
        self.state.last_action = Some(action.clone());
        self.state.last_outcome = Some(outcome.clone());
        Ok(outcome)
    }

    fn scan_with_retry(&mut self) -> Result<Vec<Region>> {
        match self.catalogue.detect_regions(self.gateway.as_ref()) {
            Ok(regions) => Ok(regions),
            Err(first) => {
                debug!(error = %first, "scan failed, waiting for stability and retrying");
                self.gateway.wait_for_stability(STABILITY_TIMEOUT);
                self.catalogue.detect_regions(self.gateway.as_ref())
            }
        }
    }

    /// One auto-scroll movement, or a `bottom_reached` declaration when
    /// the geometry shows scrolling cannot reveal more. Returns true when
    /// the outer loop should re-observe.
    fn auto_scroll_step<F>(&mut self, url: &str, on_step: &mut F) -> bool
    where
        F: FnMut(Phase, &str, Option<&Action>),
    {
        let geo = match self.gateway.scroll_geometry() {
            Ok(geo) => geo,
            Err(err) => {
                debug!(error = %err, "scroll geometry unavailable, closing the gate");
                self.state.scroll.bottom_reached = true;
                return false;
            }
        };

        let tracker = &self.state.scroll;
        let scroll_y_stuck = tracker.last_scroll_y == Some(geo.scroll_y);
        let height_stuck = tracker.last_scroll_height == Some(geo.scroll_height);
        let unscrollable = geo.unscrollable();
        let scrolled_before = tracker.scroll_count > 0;

        let bottom = (scrolled_before
            && !unscrollable
            && ((scroll_y_stuck && height_stuck) || (geo.at_document_bottom() && height_stuck)))
            || (unscrollable && tracker.scroll_count >= MAX_AUTO_SCROLLS);

        if bottom {
            debug!(scrolls = tracker.scroll_count, "document bottom reached");
            self.state.scroll.bottom_reached = true;
            return false;
        }

        on_step(Phase::Observe, "scrolling for relevant content", None);
        // Record the pre-scroll geometry: "stuck" on the next pass means
        // this scroll failed to move the page at all.
        self.state.scroll.last_scroll_y = Some(geo.scroll_y);
        self.state.scroll.last_scroll_height = Some(geo.scroll_height);
        if let Err(err) = self.gateway.scroll_by(SCROLL_STEP_PX) {
            warn!(error = %err, "auto-scroll failed, closing the gate");
            self.state.scroll.bottom_reached = true;
            return false;
        }
        self.gateway.wait_for_stability(STABILITY_TIMEOUT);
        self.state.scroll.scroll_count += 1;

        // The synthesized scroll feeds the next decision as feedback.
        let action = Action::Scroll {
            direction: ScrollDirection::Down,
            amount: Some(SCROLL_STEP_PX),
            description: Some("auto-scroll toward relevant content".into()),
        };
        self.state.last_outcome = Some(ActionOutcome {
            state_changed: true,
            url_before: url.to_string(),
            url_after: url.to_string(),
            title_before: String::new(),
            title_after: String::new(),
            text_before: String::new(),
            text_after: String::new(),
        });
        self.state.last_action = Some(action);
        true
    }

    /// Map an action onto gateway capabilities. Terminal variants are
    /// controller-owned and must never reach this point.
    async fn dispatch(&mut self, action: &Action, regions: &[Region]) -> Result<()> {
        match action {
            Action::VisionClick { region_id, .. } => {
                let handle = self.catalogue.resolve(region_id)?.handle.clone();
                self.gateway.cursor_click(&handle)?;
                self.gateway.wait_for_stability(STABILITY_TIMEOUT);
            }
            Action::VisionFill {
                region_id, value, ..
            } => {
                let handle = self.catalogue.resolve(region_id)?.handle.clone();
                self.gateway.cursor_fill(&handle, value)?;
            }
            Action::DomClick {
                region_id,
                selector,
                role,
                name,
                ..
            } => {
                let handle = self.resolve_dom_target(region_id, selector, role, name, regions)?;
                self.gateway.click(&handle)?;
                self.gateway.wait_for_stability(STABILITY_TIMEOUT);
            }
            Action::DomFill {
                region_id,
                selector,
                role,
                name,
                value,
                ..
            } => {
                let handle = self.resolve_dom_target(region_id, selector, role, name, regions)?;
                self.gateway.fill(&handle, value)?;
            }
            Action::KeyPress { key, region_id, .. } => {
                let handle = match region_id {
                    Some(id) => Some(self.catalogue.resolve(id)?.handle.clone()),
                    None => None,
                };
                self.gateway.press_key(key, handle.as_deref())?;
                self.gateway.wait_for_stability(STABILITY_TIMEOUT);
            }
            Action::Scroll {
                direction, amount, ..
            } => {
                let magnitude = amount.unwrap_or(SCROLL_STEP_PX);
                let dy = match direction {
                    ScrollDirection::Down => magnitude,
                    ScrollDirection::Up => -magnitude,
                };
                self.gateway.scroll_wheel(dy)?;
                tokio::time::sleep(SCROLL_ACTION_PAUSE).await;
            }
            Action::Wait {
                duration, until, ..
            } => {
                if let Some(ms) = duration {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                } else if let Some(until) = until {
                    self.gateway.wait_for_load(*until, LOAD_WAIT_TIMEOUT);
                } else {
                    tokio::time::sleep(DEFAULT_WAIT).await;
                }
            }
            Action::Done { .. } | Action::AskUser { .. } | Action::Confirm { .. } => {
                return Err(anyhow!(AgentError::Schema(format!(
                    "{} is controller-owned and cannot be dispatched",
                    action.kind()
                ))));
            }
        }
        Ok(())
    }

    /// DOM targets resolve by region id first, then role+name against the
    /// current regions, then as a raw CSS selector.
    fn resolve_dom_target(
        &self,
        region_id: &Option<String>,
        selector: &Option<String>,
        role: &Option<String>,
        name: &Option<String>,
        regions: &[Region],
    ) -> Result<String> {
        if let Some(id) = region_id {
            return Ok(self.catalogue.resolve(id)?.handle.clone());
        }
        if role.is_some() || name.is_some() {
            let wanted_name = name.as_deref().unwrap_or("").to_lowercase();
            let matched = regions
                .iter()
                .find(|r| {
                    role.as_deref().map_or(true, |role| r.role.as_str() == role)
                        && (wanted_name.is_empty()
                            || r.label.to_lowercase().contains(&wanted_name))
                })
                .ok_or_else(|| {
                    anyhow!(AgentError::NotVisible(format!(
                        "no element with role {:?} and name {:?}",
                        role, name
                    )))
                })?;
            return Ok(self.catalogue.resolve(&matched.id)?.handle.clone());
        }
        if let Some(selector) = selector {
            return Ok(selector.clone());
        }
        Err(anyhow!(AgentError::Schema(
            "DOM action carries no target specification".into()
        )))
    }

    fn remember(&mut self, action: &Action, summary: &str, state_changed: Option<bool>) {
        self.memory.append(HistoryRow {
            step: self.state.step_count,
            action: action.kind().to_string(),
            summary: summary.to_string(),
            outcome: state_changed.map(|changed| {
                if changed {
                    "state changed".to_string()
                } else {
                    "no state change".to_string()
                }
            }),
        });
    }
}

fn unchanged_outcome(probe: &PageProbe) -> ActionOutcome {
    ActionOutcome {
        state_changed: false,
        url_before: probe.url.clone(),
        url_after: probe.url.clone(),
        title_before: probe.title.clone(),
        title_after: probe.title.clone(),
        text_before: probe.text.clone(),
        text_after: probe.text.clone(),
    }
}

fn build_outcome(before: &PageProbe, after: &PageProbe) -> ActionOutcome {
    let state_changed = before.url != after.url
        || before.title != after.title
        || normalize_probe(&before.text) != normalize_probe(&after.text);
    ActionOutcome {
        state_changed,
        url_before: before.url.clone(),
        url_after: after.url.clone(),
        title_before: before.title.clone(),
        title_after: after.title.clone(),
        text_before: before.text.clone(),
        text_after: after.text.clone(),
    }
}

/// Whitespace-normalised text probe, capped for comparison.
fn normalize_probe(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(STATE_PROBE_CHARS)
        .collect()
}

fn diff_labels(previous: &[String], current: &[String]) -> RegionDiff {
    let prev: HashSet<&str> = previous.iter().map(String::as_str).collect();
    let curr: HashSet<&str> = current.iter().map(String::as_str).collect();

    RegionDiff {
        appeared: current
            .iter()
            .filter(|l| !prev.contains(l.as_str()))
            .take(REGION_DIFF_CAP)
            .cloned()
            .collect(),
        disappeared: previous
            .iter()
            .filter(|l| !curr.contains(l.as_str()))
            .take(REGION_DIFF_CAP)
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_labels_caps_both_sides() {
        let previous: Vec<String> = (0..40).map(|i| format!("old-{i}")).collect();
        let current: Vec<String> = (0..40).map(|i| format!("new-{i}")).collect();
        let diff = diff_labels(&previous, &current);
        assert_eq!(diff.appeared.len(), REGION_DIFF_CAP);
        assert_eq!(diff.disappeared.len(), REGION_DIFF_CAP);
    }

    #[test]
    fn diff_labels_ignores_stable_labels() {
        let previous = vec!["Search".to_string(), "Docs".to_string()];
        let current = vec!["Search".to_string(), "Results".to_string()];
        let diff = diff_labels(&previous, &current);
        assert_eq!(diff.appeared, vec!["Results"]);
        assert_eq!(diff.disappeared, vec!["Docs"]);
    }

    #[test]
    fn normalize_probe_collapses_whitespace_and_caps() {
        let long = format!("a   b\n\nc {}", "x".repeat(1000));
        let normalized = normalize_probe(&long);
        assert!(normalized.starts_with("a b c"));
        assert_eq!(normalized.chars().count(), STATE_PROBE_CHARS);
    }

    #[test]
    fn probe_comparison_detects_text_change_only() {
        let before = PageProbe {
            url: "https://a.example".into(),
            title: "A".into(),
            text: "hello world".into(),
        };
        let mut after = before.clone();
        assert!(!build_outcome(&before, &after).state_changed);

        after.text = "hello there".into();
        assert!(build_outcome(&before, &after).state_changed);
    }
}
