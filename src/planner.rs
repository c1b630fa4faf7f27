use tracing::{debug, warn};

use crate::llm::{extract_json, ChatMessage, LlmClient, PLANNER_TIMEOUT};
use crate::types::{Plan, PlanStep, TaskKind};

const PLANNER_SYSTEM_PROMPT: &str = r#"You decompose a browser automation task into an ordered plan. Work in three passes:
1. Classify the task as exactly one of: "Simple Action", "Deep Research", "Transactional".
2. Mentally simulate the target site: what pages exist, what must be clicked or typed, where logins block progress.
3. Emit between 1 and 10 atomic steps. Each step is one screenful of work.

Respond with a single JSON object, no markdown:
{
  "strategy": "one sentence describing the approach",
  "kind": "Simple Action" | "Deep Research" | "Transactional",
  "steps": [
    {"id": "step-1", "title": "short title", "description": "what to do and how to tell it worked", "needsAuth": false}
  ]
}

Mark needsAuth true on any step that requires logging in, MFA, or another
human-only credential; the controller pauses there for the user."#;

/// Words that flag a fallback step as requiring a human at the keyboard.
const AUTH_MARKERS: &[&str] = &["login", "sign in", "password"];

/// Decomposes a free-form task into an ordered plan. LLM-backed with an
/// offline splitting fallback.
pub struct Planner {
    client: Option<LlmClient>,
}

impl Planner {
    pub fn new(client: Option<LlmClient>) -> Self {
        Self { client }
    }

    pub async fn plan(&self, task: &str) -> Plan {
        if let Some(client) = &self.client {
            let messages = [
                ChatMessage::system(PLANNER_SYSTEM_PROMPT),
                ChatMessage::user(format!("TASK: {task}")),
            ];
            match client.chat(&messages, 0.2, PLANNER_TIMEOUT).await {
                Ok(raw) => {
                    if let Some(plan) = parse_plan(&raw) {
                        return plan;
                    }
                    warn!("planner response failed validation, using fallback plan");
                }
                Err(err) => {
                    warn!(error = %err, "planner call failed, using fallback plan");
                }
            }
        }
        fallback_plan(task)
    }
}

fn parse_plan(raw: &str) -> Option<Plan> {
    let json = extract_json(raw)?;
    let plan: Plan = match serde_json::from_str(json) {
        Ok(p) => p,
        Err(err) => {
            debug!(error = %err, "plan JSON rejected");
            return None;
        }
    };
    if let Err(err) = plan.validate() {
        debug!(%err, "plan failed validation");
        return None;
    }
    Some(plan)
}

/// Offline decomposition: split the task text on its natural seams, keep
/// at most 10 parts, and flag auth-looking steps.
pub fn fallback_plan(task: &str) -> Plan {
    let parts: Vec<&str> = split_task(task);
    let steps: Vec<PlanStep> = parts
        .iter()
        .take(10)
        .enumerate()
        .map(|(i, part)| {
            let lowered = part.to_lowercase();
            PlanStep {
                id: format!("step-{}", i + 1),
                title: title_of(part),
                description: part.to_string(),
                needs_auth: AUTH_MARKERS.iter().any(|m| lowered.contains(m)),
            }
        })
        .collect();

    Plan {
        strategy: format!("System Offline: executing the task as {} literal steps", steps.len()),
        kind: classify_offline(task),
        steps,
    }
}

fn split_task(task: &str) -> Vec<&str> {
    task.split(" then ")
        .flat_map(|part| part.split(['\n', ';', ',', '.']))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

fn title_of(part: &str) -> String {
    let mut words: Vec<&str> = part.split_whitespace().take(6).collect();
    if words.is_empty() {
        words.push("step");
    }
    words.join(" ")
}

fn classify_offline(task: &str) -> TaskKind {
    let lowered = task.to_lowercase();
    if ["buy", "purchase", "checkout", "order", "book a", "pay"]
        .iter()
        .any(|m| lowered.contains(m))
    {
        TaskKind::Transactional
    } else if ["research", "compare", "find all", "summarize", "investigate"]
        .iter()
        .any(|m| lowered.contains(m))
    {
        TaskKind::DeepResearch
    } else {
        TaskKind::SimpleAction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plan_accepts_fenced_json() {
        let raw = r#"```json
{"strategy":"search and read","kind":"Simple Action","steps":[
  {"id":"step-1","title":"Search","description":"Type the query","needsAuth":false}
]}
```"#;
        let plan = parse_plan(raw).unwrap();
        assert_eq!(plan.kind, TaskKind::SimpleAction);
        assert_eq!(plan.steps.len(), 1);
        assert!(!plan.steps[0].needs_auth);
    }

    #[test]
    fn parse_plan_rejects_empty_and_oversized() {
        let empty = r#"{"strategy":"s","kind":"Simple Action","steps":[]}"#;
        assert!(parse_plan(empty).is_none());

        let steps: Vec<String> = (0..11)
            .map(|i| {
                format!(r#"{{"id":"step-{i}","title":"t","description":"d","needsAuth":false}}"#)
            })
            .collect();
        let oversized = format!(
            r#"{{"strategy":"s","kind":"Simple Action","steps":[{}]}}"#,
            steps.join(",")
        );
        assert!(parse_plan(&oversized).is_none());
    }

    #[test]
    fn fallback_splits_on_then_and_commas() {
        let plan = fallback_plan("Open the docs, then search for traits, then read the first result");
        assert!(plan.strategy.starts_with("System Offline"));
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].id, "step-1");
    }

    #[test]
    fn fallback_caps_at_ten_steps() {
        let task = (0..20).map(|i| format!("part {i}")).collect::<Vec<_>>().join(", ");
        assert_eq!(fallback_plan(&task).steps.len(), 10);
    }

    #[test]
    fn fallback_marks_auth_steps() {
        let plan = fallback_plan("sign in to the portal, then download the report");
        assert!(plan.steps[0].needs_auth);
        assert!(!plan.steps[1].needs_auth);
    }

    #[test]
    fn offline_classification() {
        assert_eq!(
            fallback_plan("buy a usb cable").kind,
            TaskKind::Transactional
        );
        assert_eq!(
            fallback_plan("research rust web frameworks and compare them").kind,
            TaskKind::DeepResearch
        );
        assert_eq!(
            fallback_plan("open the weather page").kind,
            TaskKind::SimpleAction
        );
    }
}
