// Long-term memory: embed messages into the log and recall the most similar
// ones for a new prompt.

use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, instrument};

use crate::constants::DEFAULT_RELEVANT_LIMIT;
use crate::llm::{ApiError, Embedder};
use crate::message::{Role, StoredMessage};
use crate::store::{MessageLog, StoreError};

#[derive(Error, Debug)]
pub enum RelevanceError {
    #[error("Failed to embed prompt: {0}")]
    Embedding(#[from] ApiError),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to embed message: {0}")]
    Embedding(#[from] ApiError),

    #[error("Failed to store message: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of a successful relevance lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum RelevantContext {
    /// Nothing comparable is stored.
    Empty,
    /// One `"<role>: <text>"` line per match, most similar first.
    Found(String),
}

impl RelevantContext {
    pub fn into_text(self) -> String {
        match self {
            RelevantContext::Empty => String::new(),
            RelevantContext::Found(text) => text,
        }
    }
}

/// A stored message paired with its similarity to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMessage {
    pub role: Role,
    pub text: String,
    pub score: f32,
}

/// Cosine similarity using the Euclidean norm.
///
/// Returns `None` when the vectors differ in length, are empty, or either has
/// zero norm, since no meaningful direction exists to compare.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;

    if denom == 0.0 || !denom.is_finite() {
        return None;
    }
    Some(dot / denom)
}

/// Scores every embedded message against `query` and returns the best `limit`,
/// most similar first. Equal scores keep their log order.
pub fn rank(query: &[f32], messages: &[StoredMessage], limit: usize) -> Vec<ScoredMessage> {
    let mut scored: Vec<ScoredMessage> = messages
        .iter()
        .filter_map(|msg| {
            let embedding = msg.embedding.as_deref()?;
            match cosine_similarity(query, embedding) {
                Some(score) if score.is_finite() => Some(ScoredMessage {
                    role: msg.role,
                    text: msg.text.clone(),
                    score,
                }),
                _ => {
                    debug!(
                        dimensions = embedding.len(),
                        query_dimensions = query.len(),
                        "Skipping stored embedding that cannot be compared"
                    );
                    None
                }
            }
        })
        .collect();

    // sort_by is stable, so ties stay in log order.
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    scored.truncate(limit);
    scored
}

fn render(scored: &[ScoredMessage]) -> String {
    scored
        .iter()
        .map(|m| format!("{}: {}", m.role, m.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Finds past messages relevant to a new prompt.
#[derive(Clone)]
pub struct RelevanceRanker {
    log: Arc<dyn MessageLog>,
    embedder: Arc<dyn Embedder>,
    limit: usize,
}

impl RelevanceRanker {
    pub fn new(log: Arc<dyn MessageLog>, embedder: Arc<dyn Embedder>) -> Self {
        Self { log, embedder, limit: DEFAULT_RELEVANT_LIMIT }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Looks up context for `prompt`, reporting embedding failures to the
    /// caller. An empty log short-circuits before any embedding request.
    #[instrument(skip(self, prompt), fields(limit = self.limit))]
    pub async fn lookup(&self, prompt: &str) -> Result<RelevantContext, RelevanceError> {
        let messages = self.log.load();
        if messages.is_empty() {
            debug!("Message log is empty, no context to look up");
            return Ok(RelevantContext::Empty);
        }

        let query = self.embedder.embed(prompt).await?;
        let top = rank(&query, &messages, self.limit);
        debug!(stored = messages.len(), matched = top.len(), "Ranked stored messages");

        if top.is_empty() {
            Ok(RelevantContext::Empty)
        } else {
            Ok(RelevantContext::Found(render(&top)))
        }
    }

    /// Like [`lookup`](Self::lookup), but degrades any failure to an empty
    /// string after logging it.
    pub async fn get_relevant_context(&self, prompt: &str) -> String {
        match self.lookup(prompt).await {
            Ok(context) => context.into_text(),
            Err(e) => {
                error!("Error fetching embeddings: {}", e);
                String::new()
            }
        }
    }
}

/// Embeds a message and appends it to the log.
#[derive(Clone)]
pub struct MemoryWriter {
    log: Arc<dyn MessageLog>,
    embedder: Arc<dyn Embedder>,
}

impl MemoryWriter {
    pub fn new(log: Arc<dyn MessageLog>, embedder: Arc<dyn Embedder>) -> Self {
        Self { log, embedder }
    }

    #[instrument(skip(self, text))]
    pub async fn store_with_embedding(&self, role: Role, text: &str) -> Result<StoredMessage, IngestError> {
        let embedding = self.embedder.embed(text).await?;
        let message = StoredMessage::new(role, text).with_embedding(embedding);
        self.log.append(&message)?;
        Ok(message)
    }
}
