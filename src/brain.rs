use async_trait::async_trait;
use tracing::{debug, warn};

use crate::llm::{extract_json, ChatMessage, LlmClient, LlmError, DECISION_TIMEOUT, SEMANTIC_TIMEOUT};
use crate::memory::HistoryRow;
use crate::types::{
    Action, Decision, Feedback, Region, RegionRole, ScrollDirection, HISTORY_WINDOW,
    REGION_PROMPT_CAP,
};

const DECISION_SYSTEM_PROMPT: &str = r##"You are a browser automation agent. You control a real browser one action at a time and respond with a single JSON object, no markdown, no commentary.

Response shape:
{"action": {...}, "reasoning": "why this action", "confidence": 0.0-1.0}

Allowed actions:
- {"type":"VISION_CLICK","regionId":"element-..."}
- {"type":"VISION_FILL","regionId":"element-...","value":"text"}
- {"type":"DOM_CLICK","regionId":"element-..."} or {"type":"DOM_CLICK","selector":"#css"} or {"type":"DOM_CLICK","role":"button","name":"Submit"}
- {"type":"DOM_FILL","regionId":"element-...","value":"text"} (exactly one of regionId/selector/role+name)
- {"type":"KEY_PRESS","key":"Enter","regionId":"element-..."} (regionId optional)
- {"type":"SCROLL","direction":"up"|"down","amount":600}
- {"type":"WAIT","duration":2000} or {"type":"WAIT","until":"load"|"domcontentloaded"|"networkidle"}
- {"type":"ASK_USER","message":"what you need from the user"}
- {"type":"CONFIRM","message":"what you are about to do"}
- {"type":"DONE","reason":"how the task was satisfied"}

Rules:
1. Region ids are only valid for the current page snapshot. Never reuse an id from an earlier step.
2. Every value you fill must come from the task text. Never invent emails, names, or payment data.
3. Passwords, payment details, and MFA codes are the user's job: respond with ASK_USER instead of filling them.
4. If the content diff lists newly appeared elements, your previous action worked. Do not repeat it.
5. If the last action changed nothing (stateChanged false, empty content diff), try a different approach.
6. Declare DONE as soon as the current step objective is satisfied."##;

const SEMANTIC_SYSTEM_PROMPT: &str = "You judge whether visible page content is relevant to an objective. Answer with exactly YES or NO.";

/// Scroll-gate status surfaced to the decision prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScrollStatus {
    pub scroll_count: usize,
    pub content_visible: bool,
    pub bottom_reached: bool,
}

/// Everything the oracle sees for one decision.
pub struct DecisionContext<'a> {
    pub task: &'a str,
    pub step_number: usize,
    pub url: &'a str,
    pub page_excerpt: &'a str,
    pub regions: &'a [Region],
    pub feedback: &'a Feedback,
    pub history: &'a [HistoryRow],
    pub scroll: ScrollStatus,
    pub consecutive_failures: u32,
}

/// Produces a validated [`Decision`] for the current state, or `None` when
/// no usable decision exists. Also hosts the cheap semantic-visibility
/// check the auto-scroll gate runs before burning a full decision.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(&self, ctx: &DecisionContext<'_>) -> Option<Decision>;

    /// Is the visible content semantically relevant to the objective?
    /// Implementations degrade to `true` (gate open) on any failure.
    async fn content_relevant(&self, objective: &str, excerpt: &str, labels: &[String]) -> bool;
}

/// LLM-backed oracle with a layered heuristic fallback.
pub struct Brain {
    client: Option<LlmClient>,
}

impl Brain {
    pub fn new(client: Option<LlmClient>) -> Self {
        Self { client }
    }

    async fn llm_decision(&self, ctx: &DecisionContext<'_>) -> Result<Option<Decision>, LlmError> {
        let Some(client) = &self.client else {
            return Ok(None);
        };

        let messages = [
            ChatMessage::system(DECISION_SYSTEM_PROMPT),
            ChatMessage::user(build_decision_prompt(ctx)),
        ];
        let raw = client.chat(&messages, 0.2, DECISION_TIMEOUT).await?;
        Ok(parse_decision(&raw))
    }
}

#[async_trait]
impl DecisionOracle for Brain {
    async fn decide(&self, ctx: &DecisionContext<'_>) -> Option<Decision> {
        match self.llm_decision(ctx).await {
            Ok(Some(decision)) => return Some(decision),
            Ok(None) => {
                debug!("LLM path yielded no valid decision, using heuristics");
            }
            Err(err) => {
                // Surface configuration problems on the very first step
                // instead of silently degrading to heuristics.
                if ctx.step_number == 1 {
                    if let Some(status) = err.http_status() {
                        return Some(Decision::new(
                            Action::AskUser {
                                message: format!(
                                    "The language model endpoint rejected the first request \
                                     (HTTP {status}). Check the API key and endpoint \
                                     configuration, then resume."
                                ),
                                action_id: None,
                            },
                            "LLM call failed on the first step",
                            1.0,
                        ));
                    }
                }
                warn!(error = %err, "LLM decision call failed, using heuristics");
            }
        }

        heuristic_decision(ctx)
    }

    async fn content_relevant(&self, objective: &str, excerpt: &str, labels: &[String]) -> bool {
        let Some(client) = &self.client else {
            // No key: the gate cannot judge, so it opens.
            return true;
        };

        let prompt = format!(
            "OBJECTIVE: {objective}\n\nVISIBLE TEXT:\n{excerpt}\n\nINTERACTIVE ELEMENTS:\n{}\n\n\
             Is this content relevant to the objective? Answer YES or NO.",
            labels.join(", ")
        );
        let messages = [
            ChatMessage::system(SEMANTIC_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ];

        match client.chat(&messages, 0.0, SEMANTIC_TIMEOUT).await {
            Ok(answer) => answer.trim().to_uppercase().starts_with("YES"),
            Err(err) => {
                warn!(error = %err, "semantic visibility check failed, skipping gate");
                true
            }
        }
    }
}

/// The objective of the current plan step: the text after the
/// `CURRENT STEP:` marker when present, otherwise the task's first 200
/// characters.
pub fn current_step_objective(task: &str) -> &str {
    if let Some(idx) = task.find("CURRENT STEP:") {
        let after = task[idx + "CURRENT STEP:".len()..].trim_start();
        let end = after.find('\n').unwrap_or(after.len());
        return after[..end].trim();
    }
    let end = task
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(task.len());
    task[..end].trim()
}

/// Regions offered to the prompt, prioritised: inputs first, then content
/// links, then the rest, capped at [`REGION_PROMPT_CAP`].
fn prioritise_regions(regions: &[Region]) -> Vec<&Region> {
    let inputs = regions.iter().filter(|r| r.role.is_input());
    let links = regions
        .iter()
        .filter(|r| !r.role.is_input() && r.role == RegionRole::Link && r.href.is_some());
    let rest = regions
        .iter()
        .filter(|r| !r.role.is_input() && !(r.role == RegionRole::Link && r.href.is_some()));

    inputs.chain(links).chain(rest).take(REGION_PROMPT_CAP).collect()
}

fn build_decision_prompt(ctx: &DecisionContext<'_>) -> String {
    let mut prompt = format!(
        "TASK: {}\nSTEP: {}\nURL: {}\n",
        ctx.task, ctx.step_number, ctx.url
    );

    let history = &ctx.history[ctx.history.len().saturating_sub(HISTORY_WINDOW)..];
    if !history.is_empty() {
        prompt.push_str("\nRECENT ACTIONS:\n");
        for row in history {
            prompt.push_str(&format!(
                "- step {}: {}: {}{}\n",
                row.step,
                row.action,
                row.summary,
                row.outcome
                    .as_deref()
                    .map(|o| format!(" ({o})"))
                    .unwrap_or_default()
            ));
        }
    }

    prompt.push_str(&format!("\nVISIBLE TEXT:\n{}\n", ctx.page_excerpt));

    if let Some(outcome) = &ctx.feedback.last_outcome {
        prompt.push_str(&format!(
            "\nLAST ACTION OUTCOME: stateChanged={} (url {} -> {})\n",
            outcome.state_changed, outcome.url_before, outcome.url_after
        ));
    }
    if let Some(diff) = &ctx.feedback.region_diff {
        if !diff.is_empty() {
            prompt.push_str(&format!(
                "\nCONTENT DIFF: appeared={:?} disappeared={:?}\n",
                diff.appeared, diff.disappeared
            ));
        }
    }

    prompt.push_str(&format!(
        "\nSCROLL STATUS: {} auto-scrolls, content_visible={}, bottom_reached={}\n",
        ctx.scroll.scroll_count, ctx.scroll.content_visible, ctx.scroll.bottom_reached
    ));

    prompt.push_str("\nINTERACTIVE ELEMENTS:\n");
    for region in prioritise_regions(ctx.regions) {
        let href = region
            .href
            .as_deref()
            .map(|h| format!(" href={h}"))
            .unwrap_or_default();
        prompt.push_str(&format!(
            "- {} [{}] \"{}\"{}\n",
            region.id,
            region.role.as_str(),
            region.label,
            href
        ));
    }

    prompt.push_str("\nRespond with the single JSON decision object.");
    prompt
}

/// Parse an untrusted model response into a validated decision. Missing
/// JSON, an unknown action type, or a shape violation all yield `None`.
pub fn parse_decision(raw: &str) -> Option<Decision> {
    let json = extract_json(raw)?;
    let decision: Decision = match serde_json::from_str(json) {
        Ok(d) => d,
        Err(err) => {
            debug!(error = %err, "decision JSON rejected");
            return None;
        }
    };
    if let Err(err) = decision.validate() {
        debug!(%err, "decision failed validation");
        return None;
    }
    Some(decision)
}

/// Keyword fallback used when no LLM decision is available.
pub fn heuristic_decision(ctx: &DecisionContext<'_>) -> Option<Decision> {
    let task = ctx.task.to_lowercase();

    let clickables: Vec<&Region> = ctx
        .regions
        .iter()
        .filter(|r| matches!(r.role, RegionRole::Button | RegionRole::Link | RegionRole::Other))
        .collect();

    if task.contains("click") {
        if task.contains("first link") {
            if let Some(link) = ctx.regions.iter().find(|r| r.role == RegionRole::Link) {
                return Some(Decision::new(
                    Action::VisionClick {
                        region_id: link.id.clone(),
                        description: Some(link.label.clone()),
                    },
                    "task asks for the first link",
                    0.8,
                ));
            }
        }

        if let Some(matched) = clickables
            .iter()
            .find(|r| task.contains(&r.label.to_lowercase()) && !r.label.is_empty())
        {
            return Some(Decision::new(
                Action::VisionClick {
                    region_id: matched.id.clone(),
                    description: Some(matched.label.clone()),
                },
                "task text names this element",
                0.7,
            ));
        }

        if let Some(first) = clickables.first() {
            return Some(Decision::new(
                Action::VisionClick {
                    region_id: first.id.clone(),
                    description: Some(first.label.clone()),
                },
                "no label matched, trying the first clickable",
                0.5,
            ));
        }
    }

    if url_satisfies_objective(&task, ctx.url) {
        return Some(Decision::new(
            Action::Done {
                reason: Some("the current URL already satisfies the step objective".into()),
            },
            "URL pattern matches the objective",
            0.6,
        ));
    }

    // Graduated retry ladder: scroll, then wait, then give up.
    let decision = match ctx.consecutive_failures {
        0 => Decision::new(
            Action::Scroll {
                direction: ScrollDirection::Down,
                amount: None,
                description: Some("look further down the page".into()),
            },
            "nothing matched, scrolling for more content",
            0.4,
        ),
        1 => Decision::new(
            Action::Wait {
                duration: Some(2000),
                until: None,
                description: Some("give the page time to settle".into()),
            },
            "still nothing, waiting for late content",
            0.4,
        ),
        _ => Decision::new(
            Action::Done {
                reason: Some("no further heuristic action available".into()),
            },
            "retry ladder exhausted",
            0.3,
        ),
    };
    Some(decision)
}

/// Loose, non-authoritative "already done" URL patterns. The LLM path is
/// expected to override these.
fn url_satisfies_objective(task: &str, url: &str) -> bool {
    let url = url.to_lowercase();

    if let Some(idx) = task.find("navigate to ") {
        let target = task[idx + "navigate to ".len()..]
            .split_whitespace()
            .next()
            .unwrap_or("");
        let target = target.trim_matches(|c: char| !c.is_alphanumeric());
        if !target.is_empty() && url.contains(target) {
            return true;
        }
    }

    if task.contains("search")
        && ["search", "results", "?q=", "query="]
            .iter()
            .any(|p| url.contains(p))
    {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionOutcome, BBox};

    fn region(id: &str, label: &str, role: RegionRole, href: Option<&str>) -> Region {
        Region {
            id: id.into(),
            label: label.into(),
            role,
            bbox: BBox {
                x: 0.0,
                y: 0.0,
                w: 100.0,
                h: 30.0,
            },
            href: href.map(str::to_string),
            confidence: 0.9,
        }
    }

    fn ctx<'a>(
        task: &'a str,
        url: &'a str,
        regions: &'a [Region],
        feedback: &'a Feedback,
        failures: u32,
    ) -> DecisionContext<'a> {
        DecisionContext {
            task,
            step_number: 1,
            url,
            page_excerpt: "",
            regions,
            feedback,
            history: &[],
            scroll: ScrollStatus::default(),
            consecutive_failures: failures,
        }
    }

    #[test]
    fn parse_decision_tolerates_fences_and_patches_defaults() {
        let raw = "```json\n{\"action\":{\"type\":\"DONE\",\"reason\":\"ok\"}}\n```";
        let d = parse_decision(raw).unwrap();
        assert_eq!(d.action.kind(), "DONE");
        assert_eq!(d.confidence, 0.5);
        assert_eq!(d.reasoning, "(no reasoning provided)");
    }

    #[test]
    fn parse_decision_rejects_unknown_action() {
        let raw = r#"{"action":{"type":"TELEPORT"},"reasoning":"zap","confidence":0.9}"#;
        assert!(parse_decision(raw).is_none());
    }

    #[test]
    fn parse_decision_rejects_shape_violations() {
        let raw = r#"{"action":{"type":"DOM_FILL","value":""},"confidence":0.9}"#;
        assert!(parse_decision(raw).is_none());
    }

    #[test]
    fn heuristic_clicks_first_link() {
        let regions = vec![
            region("element-aaaaaaaa", "Docs", RegionRole::Link, Some("/docs")),
            region("element-bbbbbbbb", "Blog", RegionRole::Link, Some("/blog")),
        ];
        let fb = Feedback::default();
        let d = heuristic_decision(&ctx(
            "Click the first link.",
            "https://example.com",
            &regions,
            &fb,
            0,
        ))
        .unwrap();
        assert_eq!(
            d.action,
            Action::VisionClick {
                region_id: "element-aaaaaaaa".into(),
                description: Some("Docs".into()),
            }
        );
        assert_eq!(d.confidence, 0.8);
    }

    #[test]
    fn heuristic_matches_label_substring() {
        let regions = vec![
            region("element-aaaaaaaa", "About", RegionRole::Button, None),
            region("element-bbbbbbbb", "Pricing", RegionRole::Button, None),
        ];
        let fb = Feedback::default();
        let d = heuristic_decision(&ctx(
            "click pricing",
            "https://example.com",
            &regions,
            &fb,
            0,
        ))
        .unwrap();
        assert_eq!(d.action.region_id(), Some("element-bbbbbbbb"));
        assert_eq!(d.confidence, 0.7);
    }

    #[test]
    fn heuristic_done_when_url_satisfies_navigation() {
        let fb = Feedback::default();
        let d = heuristic_decision(&ctx(
            "navigate to google",
            "https://www.google.com/",
            &[],
            &fb,
            0,
        ))
        .unwrap();
        assert_eq!(d.action.kind(), "DONE");
        assert_eq!(d.confidence, 0.6);
    }

    #[test]
    fn heuristic_done_when_url_looks_like_results() {
        let fb = Feedback::default();
        let d = heuristic_decision(&ctx(
            "search for dining hall hours",
            "https://example.com/results?q=dining",
            &[],
            &fb,
            0,
        ))
        .unwrap();
        assert_eq!(d.action.kind(), "DONE");
    }

    #[test]
    fn heuristic_ladder_scroll_wait_done() {
        let fb = Feedback::default();
        let step0 =
            heuristic_decision(&ctx("read the page", "https://example.com", &[], &fb, 0)).unwrap();
        assert_eq!(step0.action.kind(), "SCROLL");

        let step1 =
            heuristic_decision(&ctx("read the page", "https://example.com", &[], &fb, 1)).unwrap();
        assert_eq!(step1.action.kind(), "WAIT");

        let step2 =
            heuristic_decision(&ctx("read the page", "https://example.com", &[], &fb, 2)).unwrap();
        assert_eq!(step2.action.kind(), "DONE");
    }

    #[test]
    fn objective_extraction_uses_marker() {
        let task = "TASK: find hours\nCURRENT STEP: Open the dining page - click Dining\nextra";
        assert_eq!(
            current_step_objective(task),
            "Open the dining page - click Dining"
        );

        let plain = "just do the thing";
        assert_eq!(current_step_objective(plain), plain);
    }

    #[test]
    fn regions_are_prioritised_inputs_links_rest() {
        let regions = vec![
            region("element-00000001", "Logo", RegionRole::Other, None),
            region("element-00000002", "Docs", RegionRole::Link, Some("/docs")),
            region("element-00000003", "Search", RegionRole::Textbox, None),
        ];
        let ordered = prioritise_regions(&regions);
        assert_eq!(ordered[0].id, "element-00000003");
        assert_eq!(ordered[1].id, "element-00000002");
        assert_eq!(ordered[2].id, "element-00000001");
    }

    #[test]
    fn prompt_carries_feedback_and_scroll_state() {
        let regions = vec![region(
            "element-00000001",
            "Search",
            RegionRole::Textbox,
            None,
        )];
        let fb = Feedback {
            last_action: None,
            last_outcome: Some(ActionOutcome {
                state_changed: false,
                url_before: "https://a.example".into(),
                url_after: "https://a.example".into(),
                title_before: String::new(),
                title_after: String::new(),
                text_before: String::new(),
                text_after: String::new(),
            }),
            region_diff: None,
        };
        let c = ctx("find docs", "https://a.example", &regions, &fb, 0);
        let prompt = build_decision_prompt(&c);
        assert!(prompt.contains("stateChanged=false"));
        assert!(prompt.contains("SCROLL STATUS"));
        assert!(prompt.contains("element-00000001"));
    }
}
