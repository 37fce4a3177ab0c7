use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    serve, Form, Router,
};
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use serde::{Deserialize, Serialize};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::chat::{self, ChatMemory};
use crate::constants::SESSION_COOKIE;
use crate::llm::ChatModel;
use crate::message::Turn;
use crate::session::{SessionId, SessionStore};

pub const EMPTY_PROMPT_ERROR: &str = "Please enter a message.";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub templates_dir: PathBuf,
    pub static_dir: PathBuf,
    pub max_context_messages: usize,
    pub session_idle_ttl: Duration,
    pub max_sessions: usize,
}

// Shared application state
#[derive(Clone)]
pub struct AppState {
    templates: Arc<AutoReloader>,
    sessions: Arc<SessionStore>,
    chat: Arc<dyn ChatModel>,
    memory: Option<ChatMemory>,
    max_context_messages: usize,
}

impl AppState {
    pub fn new(
        templates_dir: impl Into<PathBuf>,
        chat: Arc<dyn ChatModel>,
        memory: Option<ChatMemory>,
        max_context_messages: usize,
    ) -> Self {
        Self {
            templates: Arc::new(create_minijinja_env(templates_dir.into())),
            sessions: Arc::new(SessionStore::new()),
            chat,
            memory,
            // The newest user turn must always reach the model.
            max_context_messages: max_context_messages.max(1),
        }
    }

    /// Replaces the default session store, e.g. to change the idle TTL or the
    /// session cap.
    pub fn with_sessions(mut self, sessions: SessionStore) -> Self {
        self.sessions = Arc::new(sessions);
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }
}

// Minijinja Environment setup
fn create_minijinja_env(templates_dir: PathBuf) -> AutoReloader {
    AutoReloader::new(move |notifier| {
        let mut env = Environment::new();
        env.set_loader(path_loader(&templates_dir));
        notifier.watch_path(&templates_dir, true);
        Ok(env)
    })
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct PromptForm {
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Default)]
struct PageView<'a> {
    turns: &'a [Turn],
    latest_reply: Option<&'a str>,
    error: Option<&'a str>,
}

/// Reads the session cookie, minting a new id when it is missing or invalid.
/// The flag is true when the caller must set the cookie on the response.
fn resolve_session(headers: &HeaderMap) -> (SessionId, bool) {
    let existing = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| Uuid::parse_str(value.trim()).ok());

    match existing {
        Some(id) => (id, false),
        None => (Uuid::new_v4(), true),
    }
}

fn with_session_cookie(mut response: Response, id: SessionId, is_new: bool) -> Response {
    if is_new {
        let cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, id);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

fn render_page(state: &AppState, view: PageView<'_>) -> Response {
    // Acquire env, get template, and render within the same block
    state
        .templates
        .acquire_env()
        .and_then(|env| {
            env.get_template("index.html").and_then(|tmpl| {
                tmpl.render(minijinja::context! {
                    title => "Parley",
                    chat_history => view.turns,
                    latest_reply => view.latest_reply,
                    error => view.error,
                    memory_enabled => state.memory.is_some(),
                })
            })
        })
        .map(|html| Html(html).into_response())
        .unwrap_or_else(|e| {
            error!("Failed to get or render template: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(format!("Internal Server Error: {}", e)),
            )
                .into_response()
        })
}

async fn index_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (session, is_new) = resolve_session(&headers);
    let turns = state.sessions.snapshot(session);
    let page = render_page(&state, PageView { turns: &turns, ..Default::default() });
    with_session_cookie(page, session, is_new)
}

async fn prompt_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<PromptForm>,
) -> Response {
    let (session, is_new) = resolve_session(&headers);
    let prompt = form.prompt.as_deref().map(str::trim).unwrap_or_default().to_string();

    if prompt.is_empty() {
        let turns = state.sessions.snapshot(session);
        let page = render_page(
            &state,
            PageView { turns: &turns, error: Some(EMPTY_PROMPT_ERROR), ..Default::default() },
        );
        return with_session_cookie(page, session, is_new);
    }

    // The user's turn stays in the transcript even if the completion fails.
    let (context, generation) = state.sessions.with_transcript(session, |t| {
        t.push(Turn::user(prompt.clone()));
        (t.context(state.max_context_messages), t.generation())
    });

    let page = match chat::respond(state.chat.as_ref(), state.memory.as_ref(), &prompt, context).await {
        Ok(reply) => {
            // The transcript may have been cleared while the model was answering.
            let kept = state.sessions.push_if_current(session, generation, Turn::assistant(reply.clone()));
            if !kept {
                info!(%session, "Transcript cleared during completion, dropping reply");
            }
            let turns = state.sessions.snapshot(session);
            render_page(
                &state,
                PageView { turns: &turns, latest_reply: kept.then_some(reply.as_str()), ..Default::default() },
            )
        }
        Err(e) => {
            error!("Error fetching completion: {}", e);
            let message = format!("Error fetching response: {}", e);
            let turns = state.sessions.snapshot(session);
            render_page(&state, PageView { turns: &turns, error: Some(&message), ..Default::default() })
        }
    };

    with_session_cookie(page, session, is_new)
}

async fn clear_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (session, is_new) = resolve_session(&headers);
    state.sessions.clear(session);
    info!(%session, "Cleared transcript");
    with_session_cookie(Redirect::to("/").into_response(), session, is_new)
}

/// Builds the application router. Static files are served from `static_dir`
/// under `/static`.
pub fn create_router(state: AppState, static_dir: impl Into<PathBuf>) -> Router {
    let static_files_service = ServeDir::new(static_dir.into()).not_found_service(tower::service_fn(
        |_req: Request| async {
            Ok::<_, Infallible>((StatusCode::NOT_FOUND, "Not Found").into_response())
        },
    ));

    Router::new()
        .route("/", get(index_handler).post(prompt_handler))
        .route("/clear", post(clear_handler))
        .nest_service("/static", static_files_service)
        .with_state(state)
        .layer(TraceLayer::new_for_http()) // Add request logging
}

pub async fn start_web_server(config: ServerConfig, state: AppState) -> Result<()> {
    let app = create_router(state, config.static_dir.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;
    info!("Web server listening on http://{}", addr);

    serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Web server failed")?;

    info!("Web server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received, initiating shutdown...");
}
