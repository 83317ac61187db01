use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use zima_agent::AgentCatalog;
use zima_core::{CompactionRecord, EventKind, EventSink, Message, Session, ZimaError};

mod summary;

pub use summary::{DigestSummarizer, Summarizer, digest};

const DEFAULT_TITLE: &str = "New session";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    sessions: Vec<Session>,
}

pub struct SessionStore {
    sessions: Mutex<HashMap<Uuid, Session>>,
    agents: Arc<AgentCatalog>,
    summarizer: Arc<dyn Summarizer>,
    sink: Arc<dyn EventSink>,
}

impl SessionStore {
    pub fn new(
        agents: Arc<AgentCatalog>,
        summarizer: Arc<dyn Summarizer>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            agents,
            summarizer,
            sink,
        }
    }

    /// Start a session bound to `agent`, or to the default agent when none
    /// is given or the name is unknown.
    pub fn create(&self, title: Option<&str>, agent: Option<&str>) -> Session {
        let agent = self.agents.resolve(agent);
        let session = Session::new(title.unwrap_or(DEFAULT_TITLE), agent.name);
        self.sessions
            .lock()
            .expect("session store lock")
            .insert(session.id, session.clone());
        self.sink.publish(EventKind::SessionCreatedV1 {
            session_id: session.id,
            agent: session.agent.clone(),
        });
        session
    }

    pub fn get(&self, id: Uuid) -> Option<Session> {
        self.sessions
            .lock()
            .expect("session store lock")
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions
            .lock()
            .expect("session store lock")
            .contains_key(&id)
    }

    /// All sessions, most recently updated first.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .lock()
            .expect("session store lock")
            .values()
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        sessions
    }

    pub fn forks_of(&self, parent_id: Uuid) -> Vec<Session> {
        let mut forks: Vec<Session> = self
            .sessions
            .lock()
            .expect("session store lock")
            .values()
            .filter(|s| s.parent_id == Some(parent_id))
            .cloned()
            .collect();
        forks.sort_by_key(|s| s.created_at);
        forks
    }

    pub fn delete(&self, id: Uuid) -> bool {
        let removed = self
            .sessions
            .lock()
            .expect("session store lock")
            .remove(&id)
            .is_some();
        if removed {
            self.sink
                .publish(EventKind::SessionDeletedV1 { session_id: id });
        }
        removed
    }

    pub fn message_count(&self, id: Uuid) -> Option<usize> {
        self.sessions
            .lock()
            .expect("session store lock")
            .get(&id)
            .map(|s| s.messages.len())
    }

    pub fn rename(&self, id: Uuid, title: &str) -> bool {
        self.update(id, |session| session.title = title.to_string())
    }

    pub fn set_metadata(&self, id: Uuid, key: &str, value: Value) -> bool {
        self.update(id, |session| {
            session.metadata.insert(key.to_string(), value);
        })
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut Session)) -> bool {
        let mut sessions = self.sessions.lock().expect("session store lock");
        match sessions.get_mut(&id) {
            Some(session) => {
                f(session);
                session.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Append a message. Its timestamp is clamped so that messages within a
    /// session never go backwards in time.
    pub fn add_message(&self, id: Uuid, mut message: Message) -> Result<Message, ZimaError> {
        let role = message.role;
        {
            let mut sessions = self.sessions.lock().expect("session store lock");
            let session = sessions
                .get_mut(&id)
                .ok_or(ZimaError::SessionNotFound(id))?;
            let now = Utc::now();
            let floor = session.messages.last().map(|m| m.created_at).unwrap_or(now);
            message.created_at = now.max(floor);
            session.updated_at = message.created_at;
            session.messages.push(message.clone());
        }
        self.sink
            .publish(EventKind::MessageAddedV1 { session_id: id, role });
        Ok(message)
    }

    /// Copy the first `at` messages (all when `None`, clamped to the length)
    /// into a new child session.
    pub fn fork(&self, id: Uuid, at: Option<usize>) -> Option<Session> {
        let fork = {
            let mut sessions = self.sessions.lock().expect("session store lock");
            let parent = sessions.get(&id)?;
            let point = at
                .unwrap_or(parent.messages.len())
                .min(parent.messages.len());
            let mut fork = Session::new(format!("Fork of {}", parent.title), parent.agent.clone());
            fork.parent_id = Some(parent.id);
            fork.fork_point = Some(point);
            fork.messages = parent.messages[..point].to_vec();
            fork.metadata = parent.metadata.clone();
            sessions.insert(fork.id, fork.clone());
            fork
        };
        self.sink.publish(EventKind::SessionForkedV1 {
            session_id: fork.id,
            parent_id: id,
            fork_point: fork.fork_point.unwrap_or_default(),
        });
        Some(fork)
    }

    /// Replace everything but the last `keep_recent` messages with a single
    /// summary message. Returns `None` when there was nothing to compact.
    pub async fn compact(
        &self,
        id: Uuid,
        keep_recent: usize,
    ) -> Result<Option<CompactionRecord>, ZimaError> {
        let prefix: Vec<Message> = {
            let sessions = self.sessions.lock().expect("session store lock");
            let session = sessions.get(&id).ok_or(ZimaError::SessionNotFound(id))?;
            let len = session.messages.len();
            if len <= keep_recent {
                return Ok(None);
            }
            session.messages[..len - keep_recent].to_vec()
        };

        let summary = match self.summarizer.summarize(&prefix).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => digest(&prefix),
            Err(err) => {
                tracing::warn!(session = %id, error = %err, "summarizer failed, using digest");
                digest(&prefix)
            }
        };

        let record = {
            let mut sessions = self.sessions.lock().expect("session store lock");
            let session = sessions
                .get_mut(&id)
                .ok_or(ZimaError::SessionNotFound(id))?;
            let unchanged = session.messages.len() >= prefix.len()
                && session
                    .messages
                    .iter()
                    .zip(&prefix)
                    .all(|(current, seen)| current.id == seen.id);
            if !unchanged {
                tracing::debug!(session = %id, "history changed during compaction, skipping");
                return Ok(None);
            }

            let mut summary_message = Message::compaction_summary(summary.clone());
            if let Some(last) = prefix.last() {
                summary_message.created_at = last.created_at;
            }
            let tail = session.messages.split_off(prefix.len());
            session.messages = std::iter::once(summary_message).chain(tail).collect();
            let record = CompactionRecord {
                id: Uuid::now_v7(),
                messages_replaced: prefix.len(),
                summary,
                created_at: Utc::now(),
            };
            session.compactions.push(record.clone());
            session.updated_at = record.created_at;
            record
        };
        self.sink.publish(EventKind::SessionCompactedV1 {
            session_id: id,
            messages_replaced: record.messages_replaced,
        });
        Ok(Some(record))
    }

    /// Rebind a session to another agent. False if either is unknown.
    pub fn switch_agent(&self, id: Uuid, agent: &str) -> bool {
        if !self.agents.contains(agent) {
            return false;
        }
        let from = {
            let mut sessions = self.sessions.lock().expect("session store lock");
            let Some(session) = sessions.get_mut(&id) else {
                return false;
            };
            let from = std::mem::replace(&mut session.agent, agent.to_string());
            session.updated_at = Utc::now();
            from
        };
        self.sink.publish(EventKind::AgentSwitchedV1 {
            session_id: id,
            from,
            to: agent.to_string(),
        });
        true
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<usize> {
        let mut sessions: Vec<Session> = self
            .sessions
            .lock()
            .expect("session store lock")
            .values()
            .cloned()
            .collect();
        sessions.sort_by_key(|s| (s.created_at, s.id));
        let count = sessions.len();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(&Snapshot { sessions })?)?;
        Ok(count)
    }

    /// Merge sessions from a snapshot, replacing any with the same id.
    pub fn load_snapshot(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let raw = fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&raw)?;
        let count = snapshot.sessions.len();
        let mut sessions = self.sessions.lock().expect("session store lock");
        for session in snapshot.sessions {
            sessions.insert(session.id, session);
        }
        Ok(count)
    }
}
