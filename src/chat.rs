// Chat exchange logic shared by the web UI and the terminal chat session.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::llm::{ApiError, ChatMessage, ChatModel, ChatRole};
use crate::memory::{MemoryWriter, RelevanceRanker, RelevantContext};
use crate::message::{Role, Turn};
use crate::session::Transcript;

/// Long-term memory consulted and updated on every exchange when enabled.
#[derive(Clone)]
pub struct ChatMemory {
    pub ranker: RelevanceRanker,
    pub writer: MemoryWriter,
}

/// Sends `context` (which must end with the user's `prompt`) to the model and
/// returns the reply.
///
/// With memory enabled, recalled messages are prepended as a system message
/// and the finished exchange is stored. Memory failures are logged and never
/// fail the exchange.
pub async fn respond(
    chat: &dyn ChatModel,
    memory: Option<&ChatMemory>,
    prompt: &str,
    mut context: Vec<ChatMessage>,
) -> Result<String, ApiError> {
    if let Some(memory) = memory {
        match memory.ranker.lookup(prompt).await {
            Ok(RelevantContext::Found(recalled)) => context.insert(
                0,
                ChatMessage::new(
                    ChatRole::System,
                    format!("Relevant earlier conversation:\n{}", recalled),
                ),
            ),
            Ok(RelevantContext::Empty) => {}
            Err(e) => warn!("Continuing without recalled context: {}", e),
        }
    }

    let reply = chat.complete(&context).await?;

    if let Some(memory) = memory {
        for (role, text) in [(Role::User, prompt), (Role::Assistant, reply.as_str())] {
            if let Err(e) = memory.writer.store_with_embedding(role, text).await {
                warn!(%role, "Failed to store message in long-term memory: {}", e);
            }
        }
    }

    Ok(reply)
}

/// Interactive chat on stdin/stdout. `/clear` resets the transcript and
/// `/exit` (or end of input) ends the session.
pub async fn run_terminal_chat(
    chat: Arc<dyn ChatModel>,
    memory: Option<ChatMemory>,
    max_context_messages: usize,
) -> Result<()> {
    info!("Starting terminal chat session...");
    let mut transcript = Transcript::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    stdout
        .write_all(b"Type a message, /clear to start over, /exit to quit.\n")
        .await?;

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await.context("Failed to read from stdin")? else {
            break;
        };
        let prompt = line.trim();
        match prompt {
            "" => {
                stdout.write_all(b"Please enter a message.\n").await?;
                continue;
            }
            "/exit" => break,
            "/clear" => {
                transcript.clear();
                stdout.write_all(b"(transcript cleared)\n").await?;
                continue;
            }
            _ => {}
        }

        transcript.push(Turn::user(prompt));
        let context = transcript.context(max_context_messages.max(1));
        match respond(chat.as_ref(), memory.as_ref(), prompt, context).await {
            Ok(reply) => {
                stdout.write_all(format!("assistant: {}\n", reply).as_bytes()).await?;
                transcript.push(Turn::assistant(reply));
            }
            Err(e) => {
                stdout
                    .write_all(format!("Error fetching response: {}\n", e).as_bytes())
                    .await?;
            }
        }
    }

    info!(turns = transcript.len(), "Terminal chat session finished");
    Ok(())
}
