use thiserror::Error;

/// Failure kinds the control loop distinguishes. Anything else travels as
/// `anyhow::Error` and is treated as a failed action outcome.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The referenced region id belongs to an earlier scan.
    #[error("stale element id '{0}': the page has been re-scanned since it was issued")]
    StaleElement(String),

    /// The element resolved but has no visible bounding box.
    #[error("element '{0}' is not visible (no bounding box)")]
    NotVisible(String),

    /// The page navigated away mid-operation. Expected during link clicks.
    #[error("navigation destroyed the execution context")]
    NavigationContextDestroyed,

    /// Guardrails rejected the action outright.
    #[error("action blocked by guardrail: {0}")]
    GuardrailDenied(String),

    /// Guardrails require explicit user approval before dispatch.
    #[error("action needs confirmation: {0}")]
    GuardrailNeedsConfirm(String),

    /// The oracle output or action shape failed validation.
    #[error("invalid decision: {0}")]
    Schema(String),

    /// The language model endpoint failed or timed out.
    #[error("language model unavailable: {0}")]
    LlmUnavailable(String),

    /// The per-session step budget ran out.
    #[error("step budget exhausted after {0} steps")]
    BudgetExhausted(usize),

    /// Engine-level failure from the browser transport.
    #[error("browser error: {0}")]
    Browser(String),
}

pub type AgentResult<T> = Result<T, AgentError>;
