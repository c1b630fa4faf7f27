use std::sync::Arc;

use anyhow::{anyhow, Result};
use dotenvy::dotenv;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use pagepilot::brain::Brain;
use pagepilot::config::Config;
use pagepilot::controller::{AgentController, LoopResult, PauseKind, RunOptions};
use pagepilot::face::{self, AgentEvent, UiCommand};
use pagepilot::gateway::BrowserGateway;
use pagepilot::guardrails::Guardrails;
use pagepilot::hands::ChromeGateway;
use pagepilot::llm::LlmClient;
use pagepilot::logging;
use pagepilot::memory::SessionMemory;
use pagepilot::planner::Planner;
use pagepilot::types::PlanStep;
use pagepilot::verifier::ReportVerifier;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    logging::init();

    let config = Config::from_env();

    // UI first so the user sees something while Chrome starts.
    let (mut cmd_rx, event_tx) = face::start_server().await;

    info!("launching browser");
    let browser_cfg = config.browser.clone();
    let gateway = tokio::task::spawn_blocking(move || ChromeGateway::launch(&browser_cfg))
        .await
        .map_err(|e| anyhow!("browser launch panicked: {e}"))??;
    let gateway: Arc<dyn BrowserGateway> = Arc::new(gateway);

    let client = LlmClient::from_config(&config.llm);
    if client.is_none() {
        warn!("no API key configured; planning and decisions fall back to heuristics");
    }

    let planner = Planner::new(client.clone());
    let session_id = format!("session-{:08x}", rand::random::<u32>());
    let memory = SessionMemory::with_file(&session_id, config.memory_file.clone());
    let mut controller = AgentController::new(
        gateway,
        Box::new(Brain::new(client)),
        Guardrails::new(config.guardrails.clone()),
        Box::new(ReportVerifier),
        memory,
        config.max_steps,
    );

    info!(session = %session_id, "agent ready, waiting for commands");
    let _ = event_tx.send(AgentEvent::Ready);

    while let Some(command) = cmd_rx.recv().await {
        match command {
            UiCommand::Task(task) => {
                run_task(&mut controller, &planner, &task, &event_tx, &mut cmd_rx).await;
                let _ = event_tx.send(AgentEvent::Ready);
            }
            // A confirmation with no pending pause has nothing to resolve.
            UiCommand::Confirm(_) => {}
        }
    }

    Ok(())
}

/// Plan the task, then drive the loop once per plan step. Pauses surface
/// to the UI and block on a `/confirm` response.
async fn run_task(
    controller: &mut AgentController,
    planner: &Planner,
    task: &str,
    events: &broadcast::Sender<AgentEvent>,
    commands: &mut mpsc::Receiver<UiCommand>,
) {
    let _ = events.send(AgentEvent::Thinking);
    let plan = planner.plan(task).await;
    info!(strategy = %plan.strategy, steps = plan.steps.len(), "plan ready");
    let _ = events.send(AgentEvent::Phase {
        phase: "PLAN",
        message: format!("{} ({} steps)", plan.strategy, plan.steps.len()),
    });

    for step in &plan.steps {
        if step.needs_auth && !wait_for_auth(step, events, commands).await {
            let _ = events.send(AgentEvent::TaskError {
                message: "task stopped at an authentication step".into(),
            });
            return;
        }

        let composite = format!(
            "TASK: {task}\nCURRENT STEP: {} - {}",
            step.title, step.description
        );
        if !drive_step(controller, &composite, events, commands).await {
            return;
        }
    }

    let _ = events.send(AgentEvent::TaskComplete {
        reason: "all plan steps finished".into(),
    });
}

/// Hand the keyboard to the user for an auth step; returns false when
/// they reject.
async fn wait_for_auth(
    step: &PlanStep,
    events: &broadcast::Sender<AgentEvent>,
    commands: &mut mpsc::Receiver<UiCommand>,
) -> bool {
    let _ = events.send(AgentEvent::Paused {
        kind: "ASK_USER".into(),
        message: format!(
            "Step '{}' needs you to log in. Complete it in the browser window, then approve.",
            step.title
        ),
        step_completion_check: false,
    });
    matches!(wait_for_confirm(commands).await, Some(true))
}

/// Run one plan step to a terminal state, resuming across pauses.
/// Returns false when the task should stop.
async fn drive_step(
    controller: &mut AgentController,
    composite_task: &str,
    events: &broadcast::Sender<AgentEvent>,
    commands: &mut mpsc::Receiver<UiCommand>,
) -> bool {
    let mut opts = RunOptions::default();

    loop {
        let events_out = events.clone();
        let mut on_step = move |phase: pagepilot::controller::Phase,
                                message: &str,
                                action: Option<&pagepilot::types::Action>| {
            let _ = events_out.send(AgentEvent::Phase {
                phase: phase.as_str(),
                message: message.to_string(),
            });
            if let Some(action) = action {
                let _ = events_out.send(AgentEvent::ActionProposed {
                    description: serde_json::to_string(action)
                        .unwrap_or_else(|_| action.kind().to_string()),
                });
            }
        };

        let result = controller.run_loop(composite_task, opts, &mut on_step).await;

        match classify(&result) {
            StepEnd::Done => return true,
            StepEnd::Failed => {
                let _ = events.send(AgentEvent::TaskError {
                    message: result.reason,
                });
                return false;
            }
            StepEnd::Paused => {
                let kind = match result.pause_kind {
                    Some(PauseKind::AskUser) => "ASK_USER",
                    _ => "CONFIRM",
                };
                let _ = events.send(AgentEvent::Paused {
                    kind: kind.into(),
                    message: result.reason.clone(),
                    step_completion_check: result.step_completion_check,
                });

                match wait_for_confirm(commands).await {
                    Some(true) => {
                        // The oscillation pause asks "is this step already
                        // complete?", so approval closes the step.
                        if result.step_completion_check {
                            return true;
                        }
                        if let Some(action) = &result.pending_action {
                            if let Err(err) = controller.execute_action(action).await {
                                let _ = events.send(AgentEvent::TaskError {
                                    message: format!("approved action failed: {err}"),
                                });
                                return false;
                            }
                        }
                        // Resume the same step without resetting the budget.
                        opts = RunOptions {
                            reset_step_count: false,
                        };
                    }
                    Some(false) | None => {
                        let _ = events.send(AgentEvent::TaskError {
                            message: "stopped at user request".into(),
                        });
                        return false;
                    }
                }
            }
        }
    }
}

enum StepEnd {
    Done,
    Paused,
    Failed,
}

fn classify(result: &LoopResult) -> StepEnd {
    if result.completed {
        StepEnd::Done
    } else if result.pause_kind.is_some() {
        StepEnd::Paused
    } else {
        StepEnd::Failed
    }
}

async fn wait_for_confirm(commands: &mut mpsc::Receiver<UiCommand>) -> Option<bool> {
    while let Some(command) = commands.recv().await {
        match command {
            UiCommand::Confirm(approve) => return Some(approve),
            // A new task while paused abandons the old one.
            UiCommand::Task(_) => return Some(false),
        }
    }
    None
}
