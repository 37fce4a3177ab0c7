use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderValue, StatusCode};
use axum_test::TestServer;
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

use parley::chat::ChatMemory;
use parley::llm::{ApiError, ChatMessage, ChatModel, ChatRole, Embedder};
use parley::memory::{MemoryWriter, RelevanceRanker};
use parley::message::{Role, StoredMessage};
use parley::session::SessionStore;
use parley::store::{JsonLinesLog, MessageLog};
use parley::web_server::{create_router, AppState, EMPTY_PROMPT_ERROR};

const TEMPLATES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/templates");
const STATIC: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/static");

/// Echoes the last user message and records what it was sent.
#[derive(Default)]
struct EchoModel {
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl EchoModel {
    fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for EchoModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ApiError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(format!("echo {}", last))
    }
}

struct DownModel;

#[async_trait]
impl ChatModel for DownModel {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, ApiError> {
        Err(ApiError::Status { status: 503, body: "upstream unavailable".to_string() })
    }
}

/// Holds its answer until the test releases it.
#[derive(Default)]
struct GatedModel {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ChatModel for GatedModel {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, ApiError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok("late answer".to_string())
    }
}

struct AxisEmbedder;

#[async_trait]
impl Embedder for AxisEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        if text.contains("pizza") {
            Ok(vec![1.0, 0.0])
        } else {
            Ok(vec![0.0, 1.0])
        }
    }
}

fn server_with(model: Arc<dyn ChatModel>, memory: Option<ChatMemory>, budget: usize) -> (TestServer, AppState) {
    let state = AppState::new(TEMPLATES, model, memory, budget);
    let server = TestServer::new(create_router(state.clone(), STATIC)).unwrap();
    (server, state)
}

fn cookie(id: Uuid) -> HeaderValue {
    HeaderValue::from_str(&format!("parley_session={}", id)).unwrap()
}

#[tokio::test]
async fn test_get_index_renders_empty_transcript_and_sets_cookie() {
    let (server, _) = server_with(Arc::new(EchoModel::default()), None, 20);

    let response = server.get("/").await;
    response.assert_status_ok();
    assert!(response.text().contains("No messages yet"));

    let set_cookie = response.header(header::SET_COOKIE);
    assert!(set_cookie.to_str().unwrap().starts_with("parley_session="));
}

#[tokio::test]
async fn test_prompt_appends_user_and_assistant_turns() {
    let model = Arc::new(EchoModel::default());
    let (server, state) = server_with(model.clone(), None, 20);
    let id = Uuid::new_v4();

    let response = server
        .post("/")
        .add_header(header::COOKIE, cookie(id))
        .form(&[("prompt", "  hello there  ")])
        .await;
    response.assert_status_ok();
    let body = response.text();
    assert!(body.contains("hello there"));
    assert!(body.contains("echo hello there"));

    let turns = state.sessions().snapshot(id);
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].text, "hello there");
    assert_eq!(turns[1].text, "echo hello there");

    // The whole transcript so far is sent, ending with the new turn.
    server
        .post("/")
        .add_header(header::COOKIE, cookie(id))
        .form(&[("prompt", "again")])
        .await
        .assert_status_ok();
    let requests = model.requests();
    let sent = &requests[1];
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2].content, "again");
    assert_eq!(sent[2].role, ChatRole::User);
}

#[tokio::test]
async fn test_empty_prompt_is_rejected_without_upstream_call() {
    let model = Arc::new(EchoModel::default());
    let (server, state) = server_with(model.clone(), None, 20);
    let id = Uuid::new_v4();

    for prompt in ["", "   \n\t "] {
        let response = server
            .post("/")
            .add_header(header::COOKIE, cookie(id))
            .form(&[("prompt", prompt)])
            .await;
        response.assert_status_ok();
        assert!(response.text().contains(EMPTY_PROMPT_ERROR));
    }

    assert!(state.sessions().snapshot(id).is_empty());
    assert!(model.requests().is_empty());
}

#[tokio::test]
async fn test_missing_prompt_field_is_treated_as_empty() {
    let (server, _) = server_with(Arc::new(EchoModel::default()), None, 20);
    let response = server.post("/").form(&[("other", "x")]).await;
    response.assert_status_ok();
    assert!(response.text().contains(EMPTY_PROMPT_ERROR));
}

#[tokio::test]
async fn test_completion_failure_renders_error_and_keeps_user_turn() {
    let (server, state) = server_with(Arc::new(DownModel), None, 20);
    let id = Uuid::new_v4();

    let response = server
        .post("/")
        .add_header(header::COOKIE, cookie(id))
        .form(&[("prompt", "are you there")])
        .await;
    response.assert_status_ok();
    let body = response.text();
    assert!(body.contains("Error fetching response"));
    assert!(body.contains("upstream unavailable"));

    let turns = state.sessions().snapshot(id);
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].text, "are you there");
}

#[tokio::test]
async fn test_clear_redirects_and_empties_transcript() {
    let (server, state) = server_with(Arc::new(EchoModel::default()), None, 20);
    let id = Uuid::new_v4();

    server
        .post("/")
        .add_header(header::COOKIE, cookie(id))
        .form(&[("prompt", "remember this")])
        .await
        .assert_status_ok();
    assert_eq!(state.sessions().snapshot(id).len(), 2);

    let response = server.post("/clear").add_header(header::COOKIE, cookie(id)).await;
    response.assert_status(StatusCode::SEE_OTHER);
    assert_eq!(response.header(header::LOCATION), "/");

    let page = server.get("/").add_header(header::COOKIE, cookie(id)).await;
    assert!(page.text().contains("No messages yet"));
    assert!(!page.text().contains("remember this"));
    assert!(state.sessions().snapshot(id).is_empty());
}

#[tokio::test]
async fn test_clear_during_completion_drops_the_reply() {
    let model = Arc::new(GatedModel::default());
    let (server, state) = server_with(model.clone(), None, 20);
    let id = Uuid::new_v4();

    let ask = async {
        server
            .post("/")
            .add_header(header::COOKIE, cookie(id))
            .form(&[("prompt", "slow question")])
            .await
    };
    let clear_while_waiting = async {
        model.entered.notified().await;
        server
            .post("/clear")
            .add_header(header::COOKIE, cookie(id))
            .await
            .assert_status(StatusCode::SEE_OTHER);
        model.release.notify_one();
    };
    let (response, ()) = tokio::join!(ask, clear_while_waiting);

    response.assert_status_ok();
    let body = response.text();
    assert!(!body.contains("late answer"));
    assert!(!body.contains("slow question"));
    assert!(state.sessions().snapshot(id).is_empty());
}

#[tokio::test]
async fn test_cookieless_requests_do_not_grow_sessions_without_bound() {
    let state = AppState::new(TEMPLATES, Arc::new(EchoModel::default()), None, 20)
        .with_sessions(SessionStore::with_limits(Duration::from_secs(3600), 5));
    let server = TestServer::new(create_router(state.clone(), STATIC)).unwrap();

    for i in 0..20 {
        server
            .post("/")
            .form(&[("prompt", format!("hello {}", i))])
            .await
            .assert_status_ok();
    }
    assert_eq!(state.sessions().session_count(), 5);
}

#[tokio::test]
async fn test_sessions_do_not_share_transcripts() {
    let (server, state) = server_with(Arc::new(EchoModel::default()), None, 20);
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    server
        .post("/")
        .add_header(header::COOKIE, cookie(alice))
        .form(&[("prompt", "alice secret")])
        .await
        .assert_status_ok();

    let bob_page = server.get("/").add_header(header::COOKIE, cookie(bob)).await;
    assert!(!bob_page.text().contains("alice secret"));
    assert!(state.sessions().snapshot(bob).is_empty());
    assert_eq!(state.sessions().snapshot(alice).len(), 2);
}

#[tokio::test]
async fn test_context_budget_limits_upstream_messages() {
    let model = Arc::new(EchoModel::default());
    let (server, state) = server_with(model.clone(), None, 3);
    let id = Uuid::new_v4();

    for prompt in ["one", "two", "three"] {
        server
            .post("/")
            .add_header(header::COOKIE, cookie(id))
            .form(&[("prompt", prompt)])
            .await
            .assert_status_ok();
    }

    let last = model.requests().pop().unwrap();
    assert_eq!(last.len(), 3);
    assert_eq!(last[0].content, "two");
    assert_eq!(last[2].content, "three");
    assert_eq!(state.sessions().snapshot(id).len(), 6);
}

#[tokio::test]
async fn test_memory_recalls_relevant_message_as_system_context() {
    let dir = TempDir::new().unwrap();
    let log: Arc<dyn MessageLog> = Arc::new(JsonLinesLog::new(dir.path().join("memory.jsonl")));
    log.append(&StoredMessage::new(Role::User, "I love pizza").with_embedding(vec![1.0, 0.0]))
        .unwrap();
    log.append(&StoredMessage::new(Role::User, "my car is blue").with_embedding(vec![0.0, 1.0]))
        .unwrap();

    let embedder: Arc<dyn Embedder> = Arc::new(AxisEmbedder);
    let memory = ChatMemory {
        ranker: RelevanceRanker::new(log.clone(), embedder.clone()).with_limit(1),
        writer: MemoryWriter::new(log.clone(), embedder),
    };
    let model = Arc::new(EchoModel::default());
    let (server, _) = server_with(model.clone(), Some(memory), 20);

    server
        .post("/")
        .form(&[("prompt", "what pizza should I order")])
        .await
        .assert_status_ok();

    let requests = model.requests();
    let sent = &requests[0];
    assert_eq!(sent[0].role, ChatRole::System);
    assert!(sent[0].content.contains("user: I love pizza"));
    assert!(!sent[0].content.contains("blue"));

    let stored = log.load();
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[3].text, "echo what pizza should I order");
}

#[tokio::test]
async fn test_static_files_and_not_found() {
    let (server, _) = server_with(Arc::new(EchoModel::default()), None, 20);

    let css = server.get("/static/style.css").await;
    css.assert_status_ok();
    assert!(css.text().contains(".transcript"));

    let missing = server.get("/static/nope.js").await;
    missing.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(missing.text(), "Not Found");
}
