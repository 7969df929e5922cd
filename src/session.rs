//! Session and message store.
//!
//! [`SessionStore`] is the in-memory authority the engine mutates directly.
//! Every mutation is saved through an optional [`SessionPersistence`] backend
//! and announced on the bus.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{Message, Role};
use crate::models::ModelRegistry;
use crate::pricing::usage_cost;
use crate::pubsub::{Broker, EventKind, Subscription};

const TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session persistence failed: {0}")]
    Persistence(String),
}

/// Conversation metadata and cumulative accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub message_count: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// USD.
    pub cost: f64,
    /// Cumulative total at the last compaction.
    #[serde(default)]
    pub tokens_at_last_summary: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            message_count: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            tokens_at_last_summary: 0,
            summary_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Tokens accumulated since the last compaction.
    #[must_use]
    pub fn tokens_since_summary(&self) -> u64 {
        self.total_tokens()
            .saturating_sub(self.tokens_at_last_summary)
    }
}

/// A session with its messages, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: Session,
    pub messages: Vec<Message>,
}

/// Narrow load/save contract for durable storage.
pub trait SessionPersistence: Send + Sync {
    fn save(&self, record: &SessionRecord) -> Result<()>;
    fn load(&self, id: &str) -> Result<Option<SessionRecord>>;
    fn list(&self) -> Result<Vec<Session>>;
    fn delete(&self, id: &str) -> Result<()>;
}

/// One JSON file per session under `<data_dir>/sessions`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("sessions"),
        }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!("Invalid session id: {id:?}");
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

impl SessionPersistence for JsonFileStore {
    fn save(&self, record: &SessionRecord) -> Result<()> {
        let path = self.path_for(&record.session.id)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let json = serde_json::to_string_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to replace {}", path.display()))
    }

    fn load(&self, id: &str) -> Result<Option<SessionRecord>> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let record = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(record))
    }

    fn list(&self) -> Result<Vec<Session>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|text| Ok(serde_json::from_str::<SessionRecord>(&text)?))
            {
                Ok(record) => sessions.push(record.session),
                Err(err) => tracing::warn!(path = %path.display(), "skipping unreadable session: {err}"),
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("Failed to delete {}", path.display()))?;
        }
        Ok(())
    }
}

/// In-memory authoritative cache of sessions and their messages.
pub struct SessionStore {
    entries: RwLock<HashMap<String, SessionRecord>>,
    persistence: Option<Arc<dyn SessionPersistence>>,
    broker: Broker<Session>,
}

impl SessionStore {
    #[must_use]
    pub fn new(broker: Broker<Session>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            persistence: None,
            broker,
        }
    }

    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn SessionPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    #[must_use]
    pub fn subscribe(&self) -> Subscription<Session> {
        self.broker.subscribe()
    }

    /// Start an empty session. An empty title is filled from the first user
    /// message.
    pub fn create(&self, title: &str) -> Session {
        let record = SessionRecord {
            session: Session::new(title),
            messages: Vec::new(),
        };
        let session = record.session.clone();
        {
            let mut entries = write(&self.entries);
            self.save(&record);
            entries.insert(session.id.clone(), record);
        }
        self.broker.publish(EventKind::Created, session.clone());
        session
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        read(&self.entries).get(id).map(|record| record.session.clone())
    }

    /// Cached sessions, most recently updated first.
    #[must_use]
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = read(&self.entries)
            .values()
            .map(|record| record.session.clone())
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    pub fn messages(&self, id: &str) -> Result<Vec<Message>, SessionError> {
        read(&self.entries)
            .get(id)
            .map(|record| record.messages.clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Append a message and fold its usage into the session totals.
    pub fn append(&self, id: &str, message: Message) -> Result<Session, SessionError> {
        let session = {
            let mut entries = write(&self.entries);
            let record = entries
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            let session = &mut record.session;

            if let Some(usage) = message.usage {
                // Cached prompt tokens still occupy the context window.
                session.prompt_tokens += usage.prompt_total();
                session.completion_tokens += usage.output_tokens;
                if let Some(model) = message
                    .model
                    .as_deref()
                    .and_then(|model| ModelRegistry::builtin().get(model))
                {
                    session.cost += usage_cost(model, &usage);
                }
            }
            if session.title.is_empty() && message.role == Role::User {
                session.title = derive_title(&message.text());
            }
            record.messages.push(message);
            record.session.message_count = record.messages.len();
            record.session.updated_at = Utc::now();

            self.save(record);
            record.session.clone()
        };
        self.broker.publish(EventKind::Updated, session.clone());
        Ok(session)
    }

    /// Swap the whole message list in one step. Cumulative counters are kept.
    pub fn replace_all(&self, id: &str, messages: Vec<Message>) -> Result<Session, SessionError> {
        let session = {
            let mut entries = write(&self.entries);
            let record = entries
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            record.messages = messages;
            record.session.message_count = record.messages.len();
            record.session.updated_at = Utc::now();
            self.save(record);
            record.session.clone()
        };
        self.broker.publish(EventKind::Updated, session.clone());
        Ok(session)
    }

    /// Compaction: swap in the summary and reset the context baseline.
    pub fn replace_with_summary(&self, id: &str, summary: Message) -> Result<Session, SessionError> {
        let session = {
            let mut entries = write(&self.entries);
            let record = entries
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            let session = &mut record.session;
            if let Some(usage) = summary.usage {
                // The summary call itself is billed like any other response.
                if let Some(model) = summary
                    .model
                    .as_deref()
                    .and_then(|model| ModelRegistry::builtin().get(model))
                {
                    session.cost += usage_cost(model, &usage);
                }
            }
            session.tokens_at_last_summary = session.total_tokens();
            session.summary_message_id = Some(summary.id.clone());
            record.messages = vec![summary];
            record.session.message_count = 1;
            record.session.updated_at = Utc::now();
            self.save(record);
            record.session.clone()
        };
        self.broker.publish(EventKind::Updated, session.clone());
        Ok(session)
    }

    /// Bring a persisted session into the cache.
    pub fn load(&self, id: &str) -> Result<Session, SessionError> {
        if let Some(session) = self.get(id) {
            return Ok(session);
        }
        let Some(persistence) = &self.persistence else {
            return Err(SessionError::NotFound(id.to_string()));
        };
        let record = persistence
            .load(id)
            .map_err(|e| SessionError::Persistence(format!("{e:#}")))?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let session = record.session.clone();
        write(&self.entries)
            .entry(session.id.clone())
            .or_insert(record);
        Ok(session)
    }

    /// Sessions known to the persistence backend, or the cache without one.
    pub fn list_persisted(&self) -> Result<Vec<Session>, SessionError> {
        match &self.persistence {
            Some(persistence) => persistence
                .list()
                .map_err(|e| SessionError::Persistence(format!("{e:#}"))),
            None => Ok(self.list()),
        }
    }

    pub fn delete(&self, id: &str) -> Result<(), SessionError> {
        let record = write(&self.entries)
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if let Some(persistence) = &self.persistence
            && let Err(err) = persistence.delete(id)
        {
            tracing::warn!(session = id, "failed to delete persisted session: {err:#}");
        }
        self.broker.publish(EventKind::Deleted, record.session);
        Ok(())
    }

    fn save(&self, record: &SessionRecord) {
        if let Some(persistence) = &self.persistence
            && let Err(err) = persistence.save(record)
        {
            tracing::warn!(session = %record.session.id, "failed to save session: {err:#}");
        }
    }
}

fn derive_title(text: &str) -> String {
    let first_line = text.lines().find(|line| !line.trim().is_empty()).unwrap_or("");
    let trimmed = first_line.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        return trimmed.to_string();
    }
    let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS - 3).collect();
    title.push_str("...");
    title
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TokenUsage;
    use crate::models::DEEPSEEK_CHAT;
    use pretty_assertions::assert_eq;

    fn assistant(session_id: &str, text: &str, usage: TokenUsage) -> Message {
        let mut message = Message::assistant_text(session_id, text);
        message.finalize(DEEPSEEK_CHAT, usage);
        message
    }

    #[test]
    fn append_accumulates_tokens_cost_and_title() {
        let store = SessionStore::new(Broker::new());
        let session = store.create("");
        store
            .append(&session.id, Message::user(&session.id, "Fix the build\nplease"))
            .expect("append user");
        let updated = store
            .append(
                &session.id,
                assistant(&session.id, "done", TokenUsage::new(1_000_000, 0)),
            )
            .expect("append assistant");

        assert_eq!(updated.title, "Fix the build");
        assert_eq!(updated.message_count, 2);
        assert_eq!(updated.prompt_tokens, 1_000_000);
        assert_eq!(updated.completion_tokens, 0);
        assert!((updated.cost - 0.27).abs() < 1e-9);
        assert_eq!(store.messages(&session.id).expect("messages").len(), 2);
    }

    #[test]
    fn cached_prompt_tokens_count_toward_totals() {
        let store = SessionStore::new(Broker::new());
        let session = store.create("t");
        let usage = TokenUsage {
            input_tokens: 10_000,
            output_tokens: 500,
            cache_read_tokens: 90_000,
            cache_write_tokens: 0,
        };
        let updated = store
            .append(&session.id, assistant(&session.id, "ok", usage))
            .expect("append");

        assert_eq!(updated.prompt_tokens, 100_000);
        assert_eq!(updated.total_tokens(), 100_500);
        // Cache hits are still billed at the cached rate.
        let expected = (10_000.0 * 0.27 + 500.0 * 1.10 + 90_000.0 * 0.07) / 1_000_000.0;
        assert!((updated.cost - expected).abs() < 1e-12);
    }

    #[test]
    fn replace_with_summary_keeps_cumulative_counts() {
        let store = SessionStore::new(Broker::new());
        let session = store.create("t");
        for _ in 0..3 {
            store
                .append(&session.id, assistant(&session.id, "x", TokenUsage::new(10, 5)))
                .expect("append");
        }
        let summary = Message::assistant_text(&session.id, "summary");
        let summary_id = summary.id.clone();
        let updated = store
            .replace_with_summary(&session.id, summary)
            .expect("replace");

        assert_eq!(updated.message_count, 1);
        assert_eq!(updated.total_tokens(), 45);
        assert_eq!(updated.tokens_since_summary(), 0);
        assert_eq!(updated.summary_message_id, Some(summary_id));
        assert_eq!(store.messages(&session.id).expect("messages")[0].text(), "summary");
    }

    #[test]
    fn unknown_session_is_reported() {
        let store = SessionStore::new(Broker::new());
        assert_eq!(
            store.append("missing", Message::user("missing", "hi")),
            Err(SessionError::NotFound("missing".to_string()))
        );
        assert!(store.replace_all("missing", Vec::new()).is_err());
    }

    #[test]
    fn mutations_publish_session_events() {
        let store = SessionStore::new(Broker::new());
        let mut sub = store.subscribe();
        let session = store.create("t");
        store
            .append(&session.id, Message::user(&session.id, "hi"))
            .expect("append");
        store.delete(&session.id).expect("delete");

        let kinds: Vec<EventKind> = std::iter::from_fn(|| sub.try_recv())
            .map(|event| event.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::Created, EventKind::Updated, EventKind::Deleted]
        );
    }

    #[test]
    fn json_store_round_trips_through_a_fresh_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let persistence: Arc<dyn SessionPersistence> = Arc::new(JsonFileStore::new(dir.path()));

        let store = SessionStore::new(Broker::new()).with_persistence(Arc::clone(&persistence));
        let session = store.create("");
        store
            .append(&session.id, Message::user(&session.id, "hello"))
            .expect("append");

        let reopened = SessionStore::new(Broker::new()).with_persistence(Arc::clone(&persistence));
        let loaded = reopened.load(&session.id).expect("load");
        assert_eq!(loaded.title, "hello");
        assert_eq!(reopened.messages(&session.id).expect("messages").len(), 1);
        assert_eq!(reopened.list_persisted().expect("list").len(), 1);

        reopened.delete(&session.id).expect("delete");
        assert!(persistence.load(&session.id).expect("load").is_none());
    }

    #[test]
    fn json_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        assert!(store.load("../etc").is_err());
    }

    #[test]
    fn long_titles_are_truncated() {
        let title = derive_title(&"word ".repeat(40));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn concurrent_appends_are_all_kept() {
        let store = Arc::new(SessionStore::new(Broker::new()));
        let session = store.create("t");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let id = session.id.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        store
                            .append(&id, Message::user(&id, format!("{i}-{j}")))
                            .expect("append");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(store.get(&session.id).expect("session").message_count, 200);
    }
}
