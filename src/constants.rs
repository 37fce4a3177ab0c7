// Defaults loaded from the environment, overridable on the command line.

use std::env;

lazy_static::lazy_static! {
    pub static ref OPENAI_BASE_URL: String = env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    pub static ref CHAT_MODEL: String = env::var("PARLEY_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    pub static ref EMBEDDING_MODEL: String = env::var("PARLEY_EMBEDDING_MODEL").unwrap_or_else(|_| "text-embedding-3-small".to_string());
    // A `.json` extension selects the legacy single-array layout.
    pub static ref MEMORY_FILE: String = env::var("PARLEY_MEMORY_FILE").unwrap_or_else(|_| "conversations.jsonl".to_string());
    pub static ref TEMPLATES_DIR: String = env::var("PARLEY_TEMPLATES_DIR").unwrap_or_else(|_| "templates".to_string());
    pub static ref STATIC_DIR: String = env::var("PARLEY_STATIC_DIR").unwrap_or_else(|_| "static".to_string());
}

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_CONTEXT_MESSAGES: usize = 20;
pub const DEFAULT_RELEVANT_LIMIT: usize = 3;
pub const SESSION_COOKIE: &str = "parley_session";
pub const DEFAULT_SESSION_IDLE_SECS: u64 = 2 * 60 * 60;
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;
