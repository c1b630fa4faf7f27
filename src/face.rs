use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

/// Events streamed to the browser UI via SSE.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    Phase {
        phase: &'static str,
        message: String,
    },
    ActionProposed {
        description: String,
    },
    Paused {
        kind: String,
        message: String,
        step_completion_check: bool,
    },
    TaskComplete {
        reason: String,
    },
    TaskError {
        message: String,
    },
    Thinking,
    Ready,
}

impl AgentEvent {
    fn to_sse_event(&self) -> Event {
        match self {
            AgentEvent::Phase { phase, message } => Event::default().event("phase").data(
                serde_json::json!({"phase": phase, "message": message}).to_string(),
            ),
            AgentEvent::ActionProposed { description } => Event::default()
                .event("action")
                .data(serde_json::json!({"description": description}).to_string()),
            AgentEvent::Paused {
                kind,
                message,
                step_completion_check,
            } => Event::default().event("paused").data(
                serde_json::json!({
                    "kind": kind,
                    "message": message,
                    "stepCompletionCheck": step_completion_check,
                })
                .to_string(),
            ),
            AgentEvent::TaskComplete { reason } => Event::default()
                .event("task_complete")
                .data(serde_json::json!({"reason": reason}).to_string()),
            AgentEvent::TaskError { message } => Event::default()
                .event("task_error")
                .data(serde_json::json!({"message": message}).to_string()),
            AgentEvent::Thinking => Event::default().event("thinking").data("{}"),
            AgentEvent::Ready => Event::default().event("ready").data("{}"),
        }
    }
}

/// Commands flowing from the UI to the host loop.
#[derive(Debug)]
pub enum UiCommand {
    Task(String),
    Confirm(bool),
}

#[derive(Clone)]
struct AppState {
    cmd_tx: mpsc::Sender<UiCommand>,
    event_tx: broadcast::Sender<AgentEvent>,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

#[derive(Deserialize)]
struct ConfirmPayload {
    approve: bool,
}

/// Start the UI server on the first free port in 3000-3009. Returns the
/// command receiver and the event broadcaster.
pub async fn start_server() -> (mpsc::Receiver<UiCommand>, broadcast::Sender<AgentEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<UiCommand>(4);
    let (event_tx, _) = broadcast::channel::<AgentEvent>(64);

    let state = Arc::new(AppState {
        cmd_tx,
        event_tx: event_tx.clone(),
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/confirm", post(confirm_handler))
        .route("/events", get(sse_handler))
        .route(
            "/favicon.ico",
            get(|| async { axum::http::StatusCode::NO_CONTENT }),
        )
        .with_state(state);

    let mut listener = None;
    let mut port = 3000;
    for p in 3000..3010 {
        match tokio::net::TcpListener::bind(format!("127.0.0.1:{p}")).await {
            Ok(l) => {
                listener = Some(l);
                port = p;
                break;
            }
            Err(_) => continue,
        }
    }
    let listener =
        listener.expect("could not bind any port in 3000-3009; is another agent running?");

    info!(port, "web UI listening");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(%err, "UI server stopped");
        }
    });

    (cmd_rx, event_tx)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> &'static str {
    debug!(command = %payload.command, "task from UI");
    let _ = state.cmd_tx.send(UiCommand::Task(payload.command)).await;
    "ok"
}

async fn confirm_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ConfirmPayload>,
) -> &'static str {
    debug!(approve = payload.approve, "confirmation from UI");
    let _ = state.cmd_tx.send(UiCommand::Confirm(payload.approve)).await;
    "ok"
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<AgentEvent, _>| match result {
            Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
            Err(_) => None,
        });
    Sse::new(stream)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>PagePilot</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body { background: #0b0e14; color: #d7dce2; font-family: system-ui, sans-serif;
         height: 100vh; display: flex; flex-direction: column; }
  header { padding: 20px 28px; border-bottom: 1px solid #1c2230;
           display: flex; align-items: center; gap: 10px; }
  header h1 { font-size: 18px; font-weight: 600; color: #fff; }
  .dot { width: 8px; height: 8px; border-radius: 50%; background: #34d399; }
  .dot.busy { background: #fbbf24; }
  .main { flex: 1; display: flex; flex-direction: column; max-width: 780px;
          width: 100%; margin: 0 auto; padding: 20px 28px; gap: 14px; overflow: hidden; }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 6px; }
  .entry { padding: 8px 12px; border-radius: 6px; font-size: 13px; line-height: 1.5;
           background: #10141d; border-left: 3px solid #2d3648; }
  .entry.user { border-left-color: #818cf8; }
  .entry.phase .tag { color: #60a5fa; font-weight: 600; margin-right: 6px; }
  .entry.action { border-left-color: #38bdf8; font-family: monospace; }
  .entry.error { border-left-color: #f87171; color: #fca5a5; }
  .entry.done { border-left-color: #34d399; color: #a7f3d0; }
  #pause { display: none; padding: 12px 14px; border-radius: 8px;
           background: #1f1608; border: 1px solid #b4530966; }
  #pause.active { display: block; }
  #pause .msg { margin-bottom: 10px; color: #fcd34d; }
  .input-area { display: flex; gap: 8px; }
  #cmd { flex: 1; background: #10141d; border: 1px solid #242c3d; border-radius: 6px;
         padding: 10px 14px; color: #fff; font-size: 15px; outline: none; }
  #cmd:focus { border-color: #818cf8; }
  button { background: #4f46e5; color: #fff; border: none; border-radius: 6px;
           padding: 10px 18px; font-size: 14px; font-weight: 600; cursor: pointer; }
  button.reject { background: #3f3f46; }
</style>
</head>
<body>
  <header><div class="dot" id="dot"></div><h1>PagePilot</h1></header>
  <div class="main">
    <div id="log"></div>
    <div id="pause">
      <div class="msg" id="pause-msg"></div>
      <button onclick="confirmPause(true)">Approve</button>
      <button class="reject" onclick="confirmPause(false)">Reject</button>
    </div>
    <div class="input-area">
      <input type="text" id="cmd" placeholder="Describe a browser task..." autofocus />
      <button id="send" onclick="send()">Run</button>
    </div>
  </div>
<script>
  const log = document.getElementById('log');
  const cmd = document.getElementById('cmd');
  const dot = document.getElementById('dot');
  const pause = document.getElementById('pause');
  const pauseMsg = document.getElementById('pause-msg');

  function add(cls, html) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = html;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
  }
  const esc = s => s.replace(/</g, '&lt;');

  async function send() {
    const text = cmd.value.trim();
    if (!text) return;
    cmd.value = '';
    add('user', '<strong>You:</strong> ' + esc(text));
    dot.className = 'dot busy';
    await fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({command: text}),
    });
  }

  async function confirmPause(approve) {
    pause.className = '';
    await fetch('/confirm', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({approve}),
    });
  }

  cmd.addEventListener('keydown', e => { if (e.key === 'Enter') send(); });

  const es = new EventSource('/events');
  es.addEventListener('phase', e => {
    const d = JSON.parse(e.data);
    add('phase', '<span class="tag">' + d.phase + '</span>' + esc(d.message));
  });
  es.addEventListener('action', e => {
    add('action', esc(JSON.parse(e.data).description));
  });
  es.addEventListener('paused', e => {
    const d = JSON.parse(e.data);
    pauseMsg.textContent = d.message;
    pause.className = 'active';
    dot.className = 'dot';
  });
  es.addEventListener('task_complete', e => {
    add('done', '<strong>Done:</strong> ' + esc(JSON.parse(e.data).reason));
    dot.className = 'dot';
  });
  es.addEventListener('task_error', e => {
    add('error', '<strong>Failed:</strong> ' + esc(JSON.parse(e.data).message));
    dot.className = 'dot';
  });
  es.addEventListener('thinking', () => add('phase', '<span class="tag">…</span>thinking'));
  es.addEventListener('ready', () => { dot.className = 'dot'; });

  add('done', 'Agent ready.');
</script>
</body>
</html>
"##;
