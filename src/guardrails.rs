use reqwest::Url;

use crate::config::GuardrailConfig;
use crate::types::{Action, Region};

/// Literal markers that must never travel into a page field, regardless of
/// what the target label says. This is the one piece of policy the core
/// hard-codes.
const SECRET_MARKERS: &[&str] = &["SECRET.", "PASSWORD", "API_KEY"];

/// Policy verdict for a proposed action.
///
/// `allowed=false` with `requires_confirmation=true` means "pause and
/// surface the action for explicit approval"; with
/// `requires_confirmation=false` it means "skip and continue".
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: Option<String>,
    pub requires_confirmation: bool,
}

impl Verdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            requires_confirmation: false,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            requires_confirmation: false,
        }
    }

    fn confirm(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            requires_confirmation: true,
        }
    }
}

pub struct Guardrails {
    config: GuardrailConfig,
}

impl Guardrails {
    pub fn new(config: GuardrailConfig) -> Self {
        Self { config }
    }

    /// Evaluate the ordered policy rules against a proposed action.
    pub fn evaluate(&self, action: &Action, regions: &[Region]) -> Verdict {
        if action.is_fill() {
            let label = self.resolve_target_label(action, regions);
            let lowered = label.to_lowercase();
            if let Some(keyword) = self
                .config
                .sensitive_fields
                .iter()
                .find(|kw| lowered.contains(kw.as_str()))
            {
                return Verdict::deny(format!(
                    "fill target '{label}' matches sensitive keyword '{keyword}'; \
                     sensitive fields require the user to type the value themselves"
                ));
            }

            if let Some(value) = fill_value(action) {
                if let Some(marker) = SECRET_MARKERS.iter().find(|m| value.contains(*m)) {
                    return Verdict::deny(format!(
                        "fill value contains the secret marker '{marker}'"
                    ));
                }
            }
        }

        if action.is_click() {
            if let Some(label) = action
                .region_id()
                .and_then(|id| region_label(regions, id))
            {
                let lowered = label.to_lowercase();
                if let Some(keyword) = self
                    .config
                    .require_confirm_for
                    .iter()
                    .find(|kw| lowered.contains(kw.as_str()))
                {
                    return Verdict::confirm(format!(
                        "clicking '{label}' matches the confirm-required keyword '{keyword}'"
                    ));
                }
            }
        }

        Verdict::allow()
    }

    /// Hostname must equal an allowlist entry or be a subdomain of one.
    /// An empty allowlist allows everything.
    pub fn is_domain_allowed(&self, url: &str) -> bool {
        if self.config.allowed_domains.is_empty() {
            return true;
        }
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_lowercase))
        else {
            return false;
        };
        self.config
            .allowed_domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }

    /// Label of the element a fill targets: region lookup when addressed
    /// by id, otherwise the concatenated name + selector text.
    fn resolve_target_label(&self, action: &Action, regions: &[Region]) -> String {
        if let Some(label) = action.region_id().and_then(|id| region_label(regions, id)) {
            return label.to_string();
        }
        if let Action::DomFill {
            selector, name, ..
        } = action
        {
            return [name.as_deref(), selector.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
        }
        String::new()
    }
}

fn region_label<'a>(regions: &'a [Region], id: &str) -> Option<&'a str> {
    regions
        .iter()
        .find(|r| r.id == id)
        .map(|r| r.label.as_str())
}

fn fill_value(action: &Action) -> Option<&str> {
    match action {
        Action::VisionFill { value, .. } | Action::DomFill { value, .. } => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SENSITIVE_FIELDS;
    use crate::types::{BBox, RegionRole};

    fn rails() -> Guardrails {
        Guardrails::new(GuardrailConfig {
            allowed_domains: vec!["example.com".into()],
            require_confirm_for: vec!["delete".into(), "pay".into()],
            sensitive_fields: DEFAULT_SENSITIVE_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        })
    }

    fn region(id: &str, label: &str, role: RegionRole) -> Region {
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
            href: None,
            confidence: 0.9,
        }
    }

    #[test]
    fn sensitive_fill_is_denied_not_confirmed() {
        let regions = vec![region("element-00000001", "Password", RegionRole::Textbox)];
        let action = Action::DomFill {
            region_id: Some("element-00000001".into()),
            selector: None,
            role: None,
            name: None,
            value: "hunter2".into(),
            description: None,
        };
        let verdict = rails().evaluate(&action, &regions);
        assert!(!verdict.allowed);
        assert!(!verdict.requires_confirmation);
        assert!(verdict.reason.unwrap().contains("password"));
    }

    #[test]
    fn sensitive_match_is_case_insensitive_and_reaches_named_targets() {
        let named = Action::DomFill {
            region_id: None,
            selector: None,
            role: None,
            name: Some("CREDIT CARD".into()),
            value: "4111".into(),
            description: None,
        };
        let verdict = rails().evaluate(&named, &[]);
        assert!(!verdict.allowed);
        assert!(!verdict.requires_confirmation);
    }

    #[test]
    fn secret_markers_in_value_are_denied() {
        let regions = vec![region("element-00000002", "Note", RegionRole::Textbox)];
        let action = Action::VisionFill {
            region_id: "element-00000002".into(),
            value: "my API_KEY is abc".into(),
            description: None,
        };
        let verdict = rails().evaluate(&action, &regions);
        assert!(!verdict.allowed);
        assert!(!verdict.requires_confirmation);
    }

    #[test]
    fn risky_click_requires_confirmation() {
        let regions = vec![region(
            "element-00000003",
            "Delete account",
            RegionRole::Button,
        )];
        let action = Action::VisionClick {
            region_id: "element-00000003".into(),
            description: None,
        };
        let verdict = rails().evaluate(&action, &regions);
        assert!(!verdict.allowed);
        assert!(verdict.requires_confirmation);
    }

    #[test]
    fn ordinary_actions_pass() {
        let regions = vec![region("element-00000004", "Search", RegionRole::Textbox)];
        let fill = Action::VisionFill {
            region_id: "element-00000004".into(),
            value: "rust book".into(),
            description: None,
        };
        assert!(rails().evaluate(&fill, &regions).allowed);
    }

    #[test]
    fn domain_suffix_matching() {
        let g = rails();
        assert!(g.is_domain_allowed("https://example.com/page"));
        assert!(g.is_domain_allowed("https://shop.example.com"));
        assert!(!g.is_domain_allowed("https://example.com.evil.io"));
        assert!(!g.is_domain_allowed("https://other.org"));
        assert!(!g.is_domain_allowed("not a url"));
    }

    #[test]
    fn empty_allowlist_allows_everything() {
        let g = Guardrails::new(GuardrailConfig {
            allowed_domains: vec![],
            require_confirm_for: vec![],
            sensitive_fields: vec![],
        });
        assert!(g.is_domain_allowed("https://anything.example"));
    }
}
