use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;

use parley::chat::{self, ChatMemory};
use parley::constants;
use parley::llm::{ChatModel, Embedder, OpenAiClient, OpenAiConfig};
use parley::memory::{MemoryWriter, RelevanceRanker, RelevantContext};
use parley::message::Role;
use parley::session::SessionStore;
use parley::store::{self, MessageLog};
use parley::web_server::{self, AppState, ServerConfig};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true, help = "API key for the completion and embedding endpoints.")]
    api_key: Option<String>,

    #[arg(long, global = true, default_value_t = constants::OPENAI_BASE_URL.clone(), help = "Base URL of the OpenAI-compatible API.")]
    base_url: String,

    #[arg(long, global = true, default_value_t = constants::CHAT_MODEL.clone(), help = "Model used for chat completions.")]
    chat_model: String,

    #[arg(long, global = true, default_value_t = constants::EMBEDDING_MODEL.clone(), help = "Model used for embeddings.")]
    embedding_model: String,

    #[arg(long, global = true, default_value_t = constants::MEMORY_FILE.clone(), help = "Message log file (.jsonl for line records, .json for a single array).")]
    memory_file: String,

    #[arg(long, global = true, env = "PARLEY_TIMEOUT_SECS", default_value_t = constants::DEFAULT_TIMEOUT_SECS, help = "Timeout for upstream API requests, in seconds.")]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

// Define the available subcommands
#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the chat web server.
    Serve {
        #[arg(long, env = "PORT", default_value_t = constants::DEFAULT_PORT, help = "Port for the web server.")]
        port: u16,
        #[arg(long, env = "PARLEY_MEMORY", help = "Recall and store messages in the long-term memory log.")]
        memory: bool,
        #[arg(long, default_value_t = constants::DEFAULT_MAX_CONTEXT_MESSAGES, help = "Most recent turns sent to the model per request.")]
        max_context_messages: usize,
        #[arg(long, default_value_t = constants::DEFAULT_SESSION_IDLE_SECS, help = "Seconds of inactivity after which a chat session is forgotten.")]
        session_idle_secs: u64,
        #[arg(long, default_value_t = constants::DEFAULT_MAX_SESSIONS, help = "Maximum number of chat sessions kept in memory.")]
        max_sessions: usize,
        #[arg(long, default_value_t = constants::TEMPLATES_DIR.clone(), help = "Directory containing index.html.")]
        templates: String,
        #[arg(long, default_value_t = constants::STATIC_DIR.clone(), help = "Directory served under /static.")]
        static_dir: String,
    },
    /// Chat in the terminal.
    Chat {
        #[arg(long, env = "PARLEY_MEMORY", help = "Recall and store messages in the long-term memory log.")]
        memory: bool,
        #[arg(long, default_value_t = constants::DEFAULT_MAX_CONTEXT_MESSAGES, help = "Most recent turns sent to the model per request.")]
        max_context_messages: usize,
    },
    /// Embed a message and append it to the memory log.
    Remember {
        #[arg(help = "Either 'user' or 'assistant'.")]
        role: Role,
        text: String,
    },
    /// Print the stored messages most relevant to a prompt.
    Recall {
        prompt: String,
        #[arg(long, default_value_t = constants::DEFAULT_RELEVANT_LIMIT, help = "Maximum number of messages to print.")]
        limit: usize,
    },
    /// List every message in the memory log.
    History,
    /// Rewrite the memory log, dropping unreadable records.
    Compact,
}

impl Cli {
    fn client(&self) -> Result<Arc<OpenAiClient>> {
        let api_key = self
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow!("An API key is required: set OPENAI_API_KEY or pass --api-key"))?;

        let client = OpenAiClient::new(OpenAiConfig {
            api_key,
            base_url: self.base_url.clone(),
            chat_model: self.chat_model.clone(),
            embedding_model: self.embedding_model.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        })
        .context("Failed to build API client")?;
        Ok(Arc::new(client))
    }

    fn log(&self) -> Arc<dyn MessageLog> {
        store::open_log(&self.memory_file)
    }

    fn memory(&self, enabled: bool, embedder: Arc<dyn Embedder>) -> Option<ChatMemory> {
        enabled.then(|| {
            let log = self.log();
            info!(path = %log.path().display(), "Long-term memory enabled");
            ChatMemory {
                ranker: RelevanceRanker::new(log.clone(), embedder.clone()),
                writer: MemoryWriter::new(log, embedder),
            }
        })
    }
}

// The main entry point of the application, using tokio's async runtime
#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for environment variables like API keys)
    dotenvy::dotenv().ok();

    // Reads log level from RUST_LOG, defaulting to info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { port, memory, max_context_messages, session_idle_secs, max_sessions, templates, static_dir } => {
            info!("Starting parley on port {}...", port);
            let client = cli.client()?;
            let config = ServerConfig {
                port: *port,
                templates_dir: PathBuf::from(templates),
                static_dir: PathBuf::from(static_dir),
                max_context_messages: *max_context_messages,
                session_idle_ttl: Duration::from_secs(*session_idle_secs),
                max_sessions: *max_sessions,
            };
            let chat_model: Arc<dyn ChatModel> = client.clone();
            let state = AppState::new(
                config.templates_dir.clone(),
                chat_model,
                cli.memory(*memory, client),
                config.max_context_messages,
            )
            .with_sessions(SessionStore::with_limits(config.session_idle_ttl, config.max_sessions));
            web_server::start_web_server(config, state).await?;
        }
        Commands::Chat { memory, max_context_messages } => {
            let client = cli.client()?;
            let chat_model: Arc<dyn ChatModel> = client.clone();
            chat::run_terminal_chat(chat_model, cli.memory(*memory, client), *max_context_messages)
                .await
                .context("Chat session failed")?;
        }
        Commands::Remember { role, text } => {
            let writer = MemoryWriter::new(cli.log(), cli.client()?);
            let stored = writer
                .store_with_embedding(*role, text)
                .await
                .context("Failed to store message")?;
            println!(
                "Stored {} message ({} dimensions) in {}",
                stored.role,
                stored.embedding.as_ref().map(Vec::len).unwrap_or(0),
                cli.memory_file
            );
        }
        Commands::Recall { prompt, limit } => {
            let ranker = RelevanceRanker::new(cli.log(), cli.client()?).with_limit(*limit);
            match ranker.lookup(prompt).await.context("Relevance lookup failed")? {
                RelevantContext::Found(context) => println!("{}", context),
                RelevantContext::Empty => println!("No relevant messages found."),
            }
        }
        Commands::History => {
            let messages = cli.log().load();
            if messages.is_empty() {
                println!("No stored messages in {}", cli.memory_file);
            }
            for msg in messages {
                let marker = if msg.embedding.is_some() { "*" } else { " " };
                println!("{} {} {}: {}", msg.timestamp, marker, msg.role, msg.text);
            }
        }
        Commands::Compact => {
            let log = cli.log();
            let kept = log
                .compact()
                .with_context(|| format!("Failed to compact {}", log.path().display()))?;
            println!("Compacted {}: {} messages kept", log.path().display(), kept);
        }
    }

    Ok(())
}
