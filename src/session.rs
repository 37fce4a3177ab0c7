// Per-browser-session chat transcripts held in memory.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use crate::constants::{DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_IDLE_SECS};
use crate::llm::ChatMessage;
use crate::message::Turn;

pub type SessionId = Uuid;

#[derive(Debug, Default, Clone)]
pub struct Transcript {
    turns: Vec<Turn>,
    generation: u64,
}

impl Transcript {
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Changes whenever the transcript is cleared or recreated. A reply is only
    /// pushed if the generation it was requested under is still current.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The most recent `budget` turns as completion messages. The transcript
    /// itself is left untouched.
    pub fn context(&self, budget: usize) -> Vec<ChatMessage> {
        let start = self.turns.len().saturating_sub(budget);
        self.turns[start..]
            .iter()
            .map(|turn| ChatMessage::new(turn.role.into(), turn.text.clone()))
            .collect()
    }
}

#[derive(Debug)]
struct Entry {
    transcript: Transcript,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct Sessions {
    entries: HashMap<SessionId, Entry>,
    // Store-wide, so a transcript recreated after eviction never reuses a
    // generation an in-flight request captured.
    next_generation: u64,
}

impl Sessions {
    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn evict_idle(&mut self, now: Instant, idle_ttl: Duration) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= idle_ttl);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Evicted idle sessions");
        }
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_seen)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            self.entries.remove(&id);
            debug!(%id, "Session limit reached, evicted least recently used session");
        }
    }
}

/// Transcripts keyed by session id.
///
/// Sessions idle for longer than the TTL are dropped, and the number of live
/// sessions is capped. The lock is only ever held for synchronous
/// bookkeeping, never across an upstream request.
#[derive(Debug)]
pub struct SessionStore {
    sessions: Mutex<Sessions>,
    idle_ttl: Duration,
    max_sessions: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_limits(Duration::from_secs(DEFAULT_SESSION_IDLE_SECS), DEFAULT_MAX_SESSIONS)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(idle_ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(Sessions::default()),
            idle_ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        // A panic while holding the lock cannot leave a transcript half-updated.
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` on the session's transcript, creating an empty one if needed.
    /// Touching a session refreshes its idle timer.
    pub fn with_transcript<R>(&self, id: SessionId, f: impl FnOnce(&mut Transcript) -> R) -> R {
        let now = Instant::now();
        let mut sessions = self.lock();

        let expired = sessions
            .entries
            .get(&id)
            .is_some_and(|entry| now.saturating_duration_since(entry.last_seen) > self.idle_ttl);
        if expired {
            sessions.entries.remove(&id);
        }

        if !sessions.entries.contains_key(&id) {
            sessions.evict_idle(now, self.idle_ttl);
            if sessions.entries.len() >= self.max_sessions {
                sessions.evict_least_recent();
            }
        }

        let Sessions { entries, next_generation } = &mut *sessions;
        let entry = entries.entry(id).or_insert_with(|| {
            *next_generation += 1;
            Entry {
                transcript: Transcript { generation: *next_generation, ..Default::default() },
                last_seen: now,
            }
        });
        entry.last_seen = now;
        f(&mut entry.transcript)
    }

    /// Pushes `turn` only if the transcript is still on `generation`, i.e. it
    /// was not cleared or evicted since the caller read it. Returns whether the
    /// turn was kept.
    pub fn push_if_current(&self, id: SessionId, generation: u64, turn: Turn) -> bool {
        let mut sessions = self.lock();
        match sessions.entries.get_mut(&id) {
            Some(entry) if entry.transcript.generation == generation => {
                entry.last_seen = Instant::now();
                entry.transcript.push(turn);
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self, id: SessionId) -> Vec<Turn> {
        let sessions = self.lock();
        sessions
            .entries
            .get(&id)
            .filter(|entry| entry.last_seen.elapsed() <= self.idle_ttl)
            .map(|entry| entry.transcript.turns().to_vec())
            .unwrap_or_default()
    }

    pub fn clear(&self, id: SessionId) {
        let mut sessions = self.lock();
        let generation = sessions.bump_generation();
        if let Some(entry) = sessions.entries.get_mut(&id) {
            entry.transcript.clear();
            entry.transcript.generation = generation;
            entry.last_seen = Instant::now();
        }
    }

    /// Drops every session idle for longer than the TTL.
    pub fn evict_idle(&self) {
        self.lock().evict_idle(Instant::now(), self.idle_ttl);
    }

    pub fn session_count(&self) -> usize {
        self.lock().entries.len()
    }
}
