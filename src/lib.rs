pub mod chat;
pub mod constants;
pub mod llm;
pub mod memory;
pub mod message;
pub mod session;
pub mod store;
pub mod web_server;
