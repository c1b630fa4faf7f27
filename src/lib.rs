//! PagePilot: an LLM-driven browser automation agent.
//!
//! The core is a perception layer that catalogues interactive elements
//! into opaque per-scan regions, a guarded control loop (observe,
//! auto-scroll, decide, guardrails, act, verify), and a planner that
//! decomposes free-form tasks. The browser engine sits behind the
//! [`gateway::BrowserGateway`] trait and the model behind
//! [`brain::DecisionOracle`], so hosts and tests can swap either.

pub mod brain;
pub mod config;
pub mod controller;
pub mod dom;
pub mod errors;
pub mod face;
pub mod gateway;
pub mod guardrails;
pub mod hands;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod planner;
pub mod types;
pub mod verifier;

pub use brain::{Brain, DecisionOracle};
pub use config::Config;
pub use controller::{AgentController, CancelFlag, LoopResult, PauseKind, Phase, RunOptions};
pub use errors::AgentError;
pub use gateway::BrowserGateway;
pub use guardrails::Guardrails;
pub use hands::ChromeGateway;
pub use memory::SessionMemory;
pub use planner::Planner;
pub use types::{Action, Decision, Feedback, Plan, PlanStep, Region};
pub use verifier::{ReportVerifier, Verifier};
