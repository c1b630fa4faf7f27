use serde::{Deserialize, Serialize};

/// Hard ceiling on loop iterations per `run_loop` call.
pub const MAX_STEPS: usize = 50;
/// Ceiling on pre-decision auto-scrolls per page.
pub const MAX_AUTO_SCROLLS: usize = 5;
/// Pixels scrolled by one auto-scroll step.
pub const SCROLL_STEP_PX: i64 = 600;
/// Region labels are trimmed to this many characters.
pub const LABEL_MAX_CHARS: usize = 100;
/// Regions offered to the decision prompt are capped at this count.
pub const REGION_PROMPT_CAP: usize = 60;
/// Appeared/disappeared lists in a region diff are capped at this count.
pub const REGION_DIFF_CAP: usize = 15;
/// Visible-text excerpt included in the decision prompt.
pub const PAGE_EXCERPT_CHARS: usize = 2000;
/// Normalised text probe compared before/after an action to detect change.
pub const STATE_PROBE_CHARS: usize = 400;
/// History rows fed back into the decision prompt.
pub const HISTORY_WINDOW: usize = 5;
/// Minimum width/height for a region to be catalogued.
pub const MIN_REGION_DIM: f64 = 5.0;

/// Viewport-relative bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// Role of an interactive element, inferred from tag and `role` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionRole {
    Button,
    Link,
    Textbox,
    Checkbox,
    Radio,
    Textarea,
    Select,
    Other,
}

impl RegionRole {
    pub fn is_input(self) -> bool {
        matches!(self, Self::Textbox | Self::Textarea | Self::Select)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Button => "button",
            Self::Link => "link",
            Self::Textbox => "textbox",
            Self::Checkbox => "checkbox",
            Self::Radio => "radio",
            Self::Textarea => "textarea",
            Self::Select => "select",
            Self::Other => "other",
        }
    }
}

/// Snapshot of one interactive element. Valid only within the scan that
/// produced it; the next scan invalidates every prior id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub label: String,
    pub role: RegionRole,
    pub bbox: BBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    pub confidence: f64,
}

/// Scroll direction for the `SCROLL` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// Load states the `WAIT` action can block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    Load,
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    #[serde(rename = "networkidle")]
    NetworkIdle,
}

/// One step the agent can perform against the browser, plus the three
/// controller-owned terminal variants (`DONE`, `ASK_USER`, `CONFIRM`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    #[serde(rename = "VISION_CLICK", rename_all = "camelCase")]
    VisionClick {
        region_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    #[serde(rename = "VISION_FILL", rename_all = "camelCase")]
    VisionFill {
        region_id: String,
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    #[serde(rename = "DOM_CLICK", rename_all = "camelCase")]
    DomClick {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    #[serde(rename = "DOM_FILL", rename_all = "camelCase")]
    DomFill {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    #[serde(rename = "KEY_PRESS", rename_all = "camelCase")]
    KeyPress {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    #[serde(rename = "SCROLL", rename_all = "camelCase")]
    Scroll {
        direction: ScrollDirection,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        amount: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    #[serde(rename = "WAIT", rename_all = "camelCase")]
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<WaitUntil>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    #[serde(rename = "ASK_USER", rename_all = "camelCase")]
    AskUser {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action_id: Option<String>,
    },
    #[serde(rename = "CONFIRM", rename_all = "camelCase")]
    Confirm {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action_id: Option<String>,
    },
    #[serde(rename = "DONE", rename_all = "camelCase")]
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Action {
    /// Wire-level tag of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VisionClick { .. } => "VISION_CLICK",
            Self::VisionFill { .. } => "VISION_FILL",
            Self::DomClick { .. } => "DOM_CLICK",
            Self::DomFill { .. } => "DOM_FILL",
            Self::KeyPress { .. } => "KEY_PRESS",
            Self::Scroll { .. } => "SCROLL",
            Self::Wait { .. } => "WAIT",
            Self::AskUser { .. } => "ASK_USER",
            Self::Confirm { .. } => "CONFIRM",
            Self::Done { .. } => "DONE",
        }
    }

    /// True for the variants the controller must never dispatch to the
    /// browser: they terminate or pause the loop instead.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done { .. } | Self::AskUser { .. } | Self::Confirm { .. }
        )
    }

    pub fn is_fill(&self) -> bool {
        matches!(self, Self::VisionFill { .. } | Self::DomFill { .. })
    }

    pub fn is_click(&self) -> bool {
        matches!(self, Self::VisionClick { .. } | Self::DomClick { .. })
    }

    /// The region id this action targets, if any.
    pub fn region_id(&self) -> Option<&str> {
        match self {
            Self::VisionClick { region_id, .. } | Self::VisionFill { region_id, .. } => {
                Some(region_id.as_str())
            }
            Self::DomClick { region_id, .. }
            | Self::DomFill { region_id, .. }
            | Self::KeyPress { region_id, .. } => region_id.as_deref(),
            _ => None,
        }
    }

    /// Shape constraints that parsing alone cannot express: fill actions
    /// take exactly one target and a non-empty value, click actions take
    /// at least one target.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::VisionFill { value, .. } if value.is_empty() => {
                Err("VISION_FILL requires a non-empty value".into())
            }
            Self::DomFill {
                region_id,
                selector,
                role,
                name,
                value,
                ..
            } => {
                if value.is_empty() {
                    return Err("DOM_FILL requires a non-empty value".into());
                }
                let targets = count_targets(region_id, selector, role, name);
                if targets != 1 {
                    return Err(format!(
                        "DOM_FILL requires exactly one target specification, got {targets}"
                    ));
                }
                Ok(())
            }
            Self::DomClick {
                region_id,
                selector,
                role,
                name,
                ..
            } => {
                if count_targets(region_id, selector, role, name) == 0 {
                    return Err("DOM_CLICK requires at least one target specification".into());
                }
                Ok(())
            }
            Self::KeyPress { key, .. } if key.is_empty() => {
                Err("KEY_PRESS requires a non-empty key".into())
            }
            _ => Ok(()),
        }
    }
}

/// A target counts once whether addressed by region id, selector, or the
/// role+name pair.
fn count_targets(
    region_id: &Option<String>,
    selector: &Option<String>,
    role: &Option<String>,
    name: &Option<String>,
) -> usize {
    let mut n = 0;
    if region_id.is_some() {
        n += 1;
    }
    if selector.is_some() {
        n += 1;
    }
    if role.is_some() || name.is_some() {
        n += 1;
    }
    n
}

fn default_confidence() -> f64 {
    0.5
}

fn default_reasoning() -> String {
    "(no reasoning provided)".to_string()
}

/// A validated decision from the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    #[serde(default = "default_reasoning")]
    pub reasoning: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

impl Decision {
    pub fn new(action: Action, reasoning: impl Into<String>, confidence: f64) -> Self {
        Self {
            action,
            reasoning: reasoning.into(),
            confidence,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} out of [0,1]", self.confidence));
        }
        self.action.validate()
    }
}

/// Task classification produced by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "Simple Action", alias = "simple")]
    SimpleAction,
    #[serde(rename = "Deep Research", alias = "research")]
    DeepResearch,
    #[serde(rename = "Transactional", alias = "transactional")]
    Transactional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub needs_auth: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub strategy: String,
    pub kind: TaskKind,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() || self.steps.len() > 10 {
            return Err(format!(
                "plan must have between 1 and 10 steps, got {}",
                self.steps.len()
            ));
        }
        Ok(())
    }
}

/// What happened when the last action ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub state_changed: bool,
    pub url_before: String,
    pub url_after: String,
    pub title_before: String,
    pub title_after: String,
    pub text_before: String,
    pub text_after: String,
}

/// Region labels that appeared/disappeared between scans, capped at
/// [`REGION_DIFF_CAP`] per side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionDiff {
    pub appeared: Vec<String>,
    pub disappeared: Vec<String>,
}

impl RegionDiff {
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.disappeared.is_empty()
    }
}

/// The controller's synthesised delta fed into the next decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<ActionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_diff: Option<RegionDiff>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(action: Action) {
        let json = serde_json::to_string(&action).unwrap();
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(action, back, "round-trip changed {json}");
    }

    #[test]
    fn action_roundtrips_all_variants() {
        roundtrip(Action::VisionClick {
            region_id: "element-a1b2c3d4".into(),
            description: Some("docs link".into()),
        });
        roundtrip(Action::VisionFill {
            region_id: "element-00ff00ff".into(),
            value: "rust agents".into(),
            description: None,
        });
        roundtrip(Action::DomClick {
            region_id: None,
            selector: Some("#submit".into()),
            role: None,
            name: None,
            description: None,
        });
        roundtrip(Action::DomFill {
            region_id: None,
            selector: None,
            role: Some("textbox".into()),
            name: Some("Search".into()),
            value: "weather".into(),
            description: None,
        });
        roundtrip(Action::KeyPress {
            key: "Enter".into(),
            region_id: Some("element-12345678".into()),
            description: None,
        });
        roundtrip(Action::Scroll {
            direction: ScrollDirection::Down,
            amount: Some(600),
            description: None,
        });
        roundtrip(Action::Wait {
            duration: None,
            until: Some(WaitUntil::NetworkIdle),
            description: None,
        });
        roundtrip(Action::AskUser {
            message: "Need the MFA code".into(),
            action_id: None,
        });
        roundtrip(Action::Confirm {
            message: "About to place the order".into(),
            action_id: Some("a-9".into()),
        });
        roundtrip(Action::Done {
            reason: Some("results visible".into()),
        });
    }

    #[test]
    fn wire_tags_are_screaming_case() {
        let json = serde_json::to_value(Action::VisionClick {
            region_id: "element-a1b2c3d4".into(),
            description: None,
        })
        .unwrap();
        assert_eq!(json["type"], "VISION_CLICK");
        assert_eq!(json["regionId"], "element-a1b2c3d4");
    }

    #[test]
    fn unknown_action_type_fails_to_parse() {
        let err = serde_json::from_str::<Action>(r#"{"type":"TELEPORT"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn dom_fill_target_exclusivity() {
        let both = Action::DomFill {
            region_id: Some("element-a1b2c3d4".into()),
            selector: Some("#q".into()),
            role: None,
            name: None,
            value: "x".into(),
            description: None,
        };
        assert!(both.validate().is_err());

        let none = Action::DomFill {
            region_id: None,
            selector: None,
            role: None,
            name: None,
            value: "x".into(),
            description: None,
        };
        assert!(none.validate().is_err());

        let one = Action::DomFill {
            region_id: None,
            selector: Some("#q".into()),
            role: None,
            name: None,
            value: "x".into(),
            description: None,
        };
        assert!(one.validate().is_ok());
    }

    #[test]
    fn fill_value_must_be_non_empty() {
        let a = Action::VisionFill {
            region_id: "element-a1b2c3d4".into(),
            value: "".into(),
            description: None,
        };
        assert!(a.validate().is_err());
    }

    #[test]
    fn dom_click_needs_some_target() {
        let a = Action::DomClick {
            region_id: None,
            selector: None,
            role: None,
            name: None,
            description: None,
        };
        assert!(a.validate().is_err());

        let by_role = Action::DomClick {
            region_id: None,
            selector: None,
            role: Some("button".into()),
            name: Some("Search".into()),
            description: None,
        };
        assert!(by_role.validate().is_ok());
    }

    #[test]
    fn decision_defaults_patch_missing_fields() {
        let d: Decision = serde_json::from_str(
            r#"{"action":{"type":"DONE"}}"#,
        )
        .unwrap();
        assert_eq!(d.confidence, 0.5);
        assert_eq!(d.reasoning, "(no reasoning provided)");
    }

    #[test]
    fn plan_roundtrip_and_bounds() {
        let plan = Plan {
            strategy: "Search, open the first result, read the hours".into(),
            kind: TaskKind::SimpleAction,
            steps: vec![PlanStep {
                id: "step-1".into(),
                title: "Search".into(),
                description: "Type the query and submit".into(),
                needs_auth: false,
            }],
        };
        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, back);
        assert!(back.validate().is_ok());

        let empty = Plan {
            strategy: "s".into(),
            kind: TaskKind::SimpleAction,
            steps: vec![],
        };
        assert!(empty.validate().is_err());
    }
}
