use std::env;
use std::path::PathBuf;

use crate::types::MAX_STEPS;

/// Keywords that make a fill target off-limits without explicit user input.
/// Overridable via `PAGEPILOT_SENSITIVE_FIELDS`.
pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "email",
    "username",
    "user name",
    "billing",
    "mfa",
    "otp",
    "password",
    "passcode",
    "credit card",
    "cvc",
    "ccv",
    "ssn",
    "social security",
    "address",
    "phone number",
    "dob",
    "date of birth",
    "api key",
    "secret",
    "debit",
    "bank account",
];

const DEFAULT_CONFIRM_KEYWORDS: &str =
    "delete,pay,purchase,confirm order,place order,submit payment";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Absent key switches the planner and decision oracle to heuristics.
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
}

impl LlmConfig {
    pub fn enabled(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    /// Empty list means every domain is allowed.
    pub allowed_domains: Vec<String>,
    pub require_confirm_for: Vec<String>,
    pub sensitive_fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub start_url: String,
    pub headless: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub guardrails: GuardrailConfig,
    pub browser: BrowserConfig,
    pub max_steps: usize,
    pub memory_file: PathBuf,
}

impl Config {
    /// Read configuration from the environment. `dotenvy::dotenv()` should
    /// run before this so `.env` entries are visible.
    pub fn from_env() -> Self {
        let api_key = env::var("PAGEPILOT_API_KEY")
            .or_else(|_| env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());

        Self {
            llm: LlmConfig {
                api_key,
                api_url: env_or(
                    "PAGEPILOT_API_URL",
                    "https://api.openai.com/v1/chat/completions",
                ),
                model: env_or("PAGEPILOT_MODEL", "gpt-4o-mini"),
            },
            guardrails: GuardrailConfig {
                allowed_domains: comma_list(&env_or("PAGEPILOT_ALLOWED_DOMAINS", "")),
                require_confirm_for: comma_list(&env_or(
                    "PAGEPILOT_CONFIRM_KEYWORDS",
                    DEFAULT_CONFIRM_KEYWORDS,
                )),
                sensitive_fields: match env::var("PAGEPILOT_SENSITIVE_FIELDS") {
                    Ok(raw) if !raw.trim().is_empty() => comma_list(&raw),
                    _ => DEFAULT_SENSITIVE_FIELDS.iter().map(|s| s.to_string()).collect(),
                },
            },
            browser: BrowserConfig {
                start_url: env_or("PAGEPILOT_START_URL", "about:blank"),
                headless: env_bool("PAGEPILOT_HEADLESS", false),
            },
            max_steps: env::var("PAGEPILOT_MAX_STEPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(MAX_STEPS),
            memory_file: PathBuf::from(env_or("PAGEPILOT_MEMORY_FILE", "session_history.json")),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn comma_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_list_trims_and_lowercases() {
        assert_eq!(
            comma_list(" Example.com , ,Shop.Example.COM"),
            vec!["example.com".to_string(), "shop.example.com".to_string()]
        );
        assert!(comma_list("").is_empty());
    }

    #[test]
    fn sensitive_defaults_cover_credential_keywords() {
        for kw in ["password", "credit card", "ssn", "api key", "otp"] {
            assert!(DEFAULT_SENSITIVE_FIELDS.contains(&kw), "missing {kw}");
        }
    }
}
