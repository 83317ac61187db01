use anyhow::Result;
use chrono::Utc;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;
use zima_core::{AppConfig, EventEnvelope, EventKind, EventSink, LogConfig};

const RECENT_CAPACITY: usize = 256;

/// Numbers domain events, mirrors them to `tracing`, and appends them to a
/// JSONL log when one is configured.
pub struct Observer {
    log_path: Option<PathBuf>,
    seq: AtomicU64,
    recent: Mutex<VecDeque<EventEnvelope>>,
}

impl Observer {
    pub fn new(log_path: Option<PathBuf>) -> Result<Self> {
        if let Some(parent) = log_path.as_deref().and_then(Path::parent) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            log_path,
            seq: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        })
    }

    pub fn for_workspace(workspace: &Path, cfg: &AppConfig) -> Result<Self> {
        Self::new(cfg.log_path(workspace))
    }

    pub fn in_memory() -> Self {
        Self {
            log_path: None,
            seq: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        }
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn record(&self, kind: EventKind) -> EventEnvelope {
        let envelope = EventEnvelope {
            seq_no: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            at: Utc::now(),
            kind,
        };
        tracing::debug!(
            target: "zima::event",
            seq_no = envelope.seq_no,
            category = envelope.kind.category(),
            event = ?envelope.kind,
        );
        if let Err(err) = self.append_event(&envelope) {
            tracing::warn!(error = %err, "failed to append event log");
        }
        {
            let mut recent = self.recent.lock().expect("observer lock");
            if recent.len() == RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(envelope.clone());
        }
        envelope
    }

    /// The most recent events, oldest first.
    pub fn recent(&self) -> Vec<EventEnvelope> {
        self.recent
            .lock()
            .expect("observer lock")
            .iter()
            .cloned()
            .collect()
    }

    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    fn append_event(&self, envelope: &EventEnvelope) -> Result<()> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{}", serde_json::to_string(envelope)?)?;
        Ok(())
    }
}

impl EventSink for Observer {
    fn publish(&self, kind: EventKind) {
        self.record(kind);
    }
}

/// Install the global `tracing` subscriber. Output always goes to stderr since
/// stdout carries the stdio transport.
pub fn init_tracing(cfg: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&cfg.level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let installed = if cfg.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
