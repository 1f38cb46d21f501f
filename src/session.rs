//! Conversation threads and their persisted store
//!
//! Sessions are an ordered, most-recent-first set of independent message
//! logs. The store owns all mutation; the typed-input path and the voice
//! path share it behind an `Arc` and every append is atomic.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Title given to freshly created sessions
pub const DEFAULT_TITLE: &str = "New Chat";

/// Assistant greeting seeded into every new session
pub const WELCOME_TEXT: &str = "Welcome to AI Chat!";

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    /// Accepts the legacy `"bot"` spelling found in older documents
    #[serde(alias = "bot")]
    Assistant,
}

/// One transcript entry, immutable once appended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: Sender,
    pub text: String,
}

impl Message {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::Assistant,
            text: text.into(),
        }
    }
}

/// One independent conversation thread
///
/// Unknown fields in persisted documents are ignored on read, so newer
/// writers can add fields without breaking older readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

struct StoreState {
    /// Most-recent-first
    sessions: Vec<Session>,
    active_id: String,
    /// Last issued creation-time id, for same-millisecond disambiguation
    last_id_ms: i64,
}

impl StoreState {
    fn next_id(&mut self) -> String {
        let now = Utc::now().timestamp_millis();
        self.last_id_ms = if now > self.last_id_ms {
            now
        } else {
            self.last_id_ms + 1
        };
        self.last_id_ms.to_string()
    }

    fn fresh_session(&mut self) -> Session {
        Session {
            id: self.next_id(),
            title: DEFAULT_TITLE.to_string(),
            messages: vec![Message::assistant(WELCOME_TEXT)],
        }
    }
}

/// Owns the session set; persists it as a JSON document after every mutation
pub struct SessionStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl SessionStore {
    /// Load the store from `path`, or start fresh
    ///
    /// An absent, empty, or malformed document falls back to a single new
    /// session; corruption never prevents startup.
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let sessions = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<Session>>(&bytes) {
                Ok(sessions) => sessions,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "session document unreadable, starting fresh");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        let store = Self::from_sessions(Some(path), sessions);
        tracing::debug!(
            count = store.list_sessions().len(),
            "session store loaded"
        );
        store
    }

    /// An unpersisted store (tests, `--ephemeral` runs)
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_sessions(None, Vec::new())
    }

    fn from_sessions(path: Option<PathBuf>, sessions: Vec<Session>) -> Self {
        let last_id_ms = sessions
            .iter()
            .filter_map(|s| s.id.parse::<i64>().ok())
            .max()
            .unwrap_or(0);

        let mut state = StoreState {
            sessions,
            active_id: String::new(),
            last_id_ms,
        };

        if state.sessions.is_empty() {
            let s = state.fresh_session();
            state.active_id = s.id.clone();
            state.sessions.push(s);
        } else {
            state.active_id = state.sessions[0].id.clone();
        }

        let store = Self {
            path,
            state: Mutex::new(state),
        };
        store.persist(&store.state.lock().expect("session store poisoned"));
        store
    }

    /// Create a new session, insert it at the front, and make it active
    pub fn create_session(&self) -> Session {
        let mut state = self.lock();
        let s = state.fresh_session();
        state.active_id = s.id.clone();
        state.sessions.insert(0, s.clone());
        self.persist(&state);
        s
    }

    /// All sessions, most-recent-first
    pub fn list_sessions(&self) -> Vec<Session> {
        self.lock().sessions.clone()
    }

    /// The currently active session
    pub fn active_session(&self) -> Session {
        let state = self.lock();
        state
            .sessions
            .iter()
            .find(|s| s.id == state.active_id)
            .cloned()
            .expect("active session always present")
    }

    /// Id of the currently active session
    pub fn active_id(&self) -> String {
        self.lock().active_id.clone()
    }

    /// Switch the active session; unknown ids are ignored
    pub fn set_active(&self, id: &str) {
        let mut state = self.lock();
        if state.sessions.iter().any(|s| s.id == id) {
            state.active_id = id.to_string();
        } else {
            tracing::debug!(id, "set_active on unknown session ignored");
        }
    }

    /// Append a message to a session's log
    ///
    /// Silently dropped if the session raced with deletion.
    pub fn append_message(&self, session_id: &str, message: Message) {
        let mut state = self.lock();
        match state.sessions.iter_mut().find(|s| s.id == session_id) {
            Some(session) => {
                session.messages.push(message);
                self.persist(&state);
            }
            None => {
                tracing::debug!(session_id, "append to deleted session dropped");
            }
        }
    }

    /// Remove a session
    ///
    /// If it was active, the session at the clamped preceding index
    /// becomes active; if the set empties, a fresh default session is
    /// created and activated.
    pub fn delete_session(&self, id: &str) {
        let mut state = self.lock();
        let Some(idx) = state.sessions.iter().position(|s| s.id == id) else {
            return;
        };
        state.sessions.remove(idx);

        if state.sessions.is_empty() {
            let s = state.fresh_session();
            state.active_id = s.id.clone();
            state.sessions.push(s);
        } else if state.active_id == id {
            let next = idx.saturating_sub(1);
            state.active_id = state.sessions[next].id.clone();
        }
        self.persist(&state);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("session store poisoned")
    }

    /// Write-through persistence; failures are logged, never propagated
    fn persist(&self, state: &StoreState) {
        let Some(path) = &self.path else { return };

        let write = || -> crate::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let doc = serde_json::to_vec_pretty(&state.sessions)?;
            std::fs::write(path, doc)?;
            Ok(())
        };

        if let Err(e) = write() {
            tracing::warn!(path = %path.display(), error = %e, "failed to persist sessions");
        }
    }
}
