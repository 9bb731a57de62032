// =============================================================================
// Event Log — append-only NDJSON sink with ring buffer and broadcast
// =============================================================================
//
// Every state change in the service writes one line here. Writes are
// serialized through a single mutex so lines never interleave; a bounded
// in-memory ring backs `get_recent` for the operator surface, and a
// broadcast channel fans each written event out to subscribers (the
// WebSocket push loop) without holding the write lock.
// =============================================================================

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::error;

use crate::types::OperationMode;

/// Cap on the in-memory ring buffer of recent events.
const MAX_RECENT_EVENTS: usize = 500;

/// One execution event. `data` is a free-form map so every well-known event
/// type (see module docs in `main.rs`) can carry its own payload shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub timestamp: chrono::DateTime<Utc>,
    pub event_type: String,
    pub mode: OperationMode,
    pub service_version: &'static str,
    #[serde(default)]
    pub data: Value,
}

impl ExecutionEvent {
    pub fn new(event_type: impl Into<String>, mode: OperationMode, data: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            mode,
            service_version: env!("CARGO_PKG_VERSION"),
            data,
        }
    }
}

struct Inner {
    file: Option<std::fs::File>,
    current_date: String,
    ring: VecDeque<ExecutionEvent>,
}

/// Append-only event sink. One process-wide instance, injected wherever a
/// component needs to emit events (per the "inject singletons explicitly"
/// design note).
pub struct EventLog {
    dir: PathBuf,
    rotate_daily: bool,
    inner: Mutex<Inner>,
    has_write_error: AtomicBool,
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>, rotate_daily: bool) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (tx, _rx) = broadcast::channel(1024);

        let current_date = Utc::now().format("%Y-%m-%d").to_string();
        let file = Self::open_file(&dir, rotate_daily, &current_date)?;

        Ok(Self {
            dir,
            rotate_daily,
            inner: Mutex::new(Inner {
                file: Some(file),
                current_date,
                ring: VecDeque::with_capacity(MAX_RECENT_EVENTS),
            }),
            has_write_error: AtomicBool::new(false),
            tx,
        })
    }

    fn open_file(
        dir: &PathBuf,
        rotate_daily: bool,
        date: &str,
    ) -> anyhow::Result<std::fs::File> {
        let name = if rotate_daily {
            format!("events.{date}.ndjson")
        } else {
            "events.ndjson".to_string()
        };
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(name))?;
        Ok(file)
    }

    /// Append one event, broadcast it to subscribers, and push it onto the
    /// in-memory ring. Never panics on write failure — flips
    /// `has_write_error` instead.
    pub fn append(&self, event: ExecutionEvent) {
        {
            let mut inner = self.inner.lock();

            if self.rotate_daily {
                let today = Utc::now().format("%Y-%m-%d").to_string();
                if today != inner.current_date {
                    match Self::open_file(&self.dir, true, &today) {
                        Ok(file) => {
                            inner.file = Some(file);
                            inner.current_date = today;
                        }
                        Err(e) => {
                            error!(error = %e, "event log: failed to rotate to new day's file");
                        }
                    }
                }
            }

            let line = match serde_json::to_string(&event) {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, "event log: failed to serialise event");
                    self.has_write_error.store(true, Ordering::Relaxed);
                    return;
                }
            };

            let write_result = inner.file.as_mut().map(|f| {
                writeln!(f, "{line}").and_then(|_| f.flush())
            });

            match write_result {
                Some(Ok(())) => {
                    self.has_write_error.store(false, Ordering::Relaxed);
                }
                Some(Err(e)) => {
                    error!(error = %e, "event log: write failed");
                    self.has_write_error.store(true, Ordering::Relaxed);
                }
                None => {
                    self.has_write_error.store(true, Ordering::Relaxed);
                }
            }

            if inner.ring.len() >= MAX_RECENT_EVENTS {
                inner.ring.pop_front();
            }
            inner.ring.push_back(event.clone());
        }

        // Broadcast outside the write lock. A subscriber lagging or absent
        // never blocks or panics the writer.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }

    pub fn get_recent(&self, limit: usize) -> Vec<ExecutionEvent> {
        let inner = self.inner.lock();
        inner
            .ring
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    pub fn has_write_error(&self) -> bool {
        self.has_write_error.load(Ordering::Relaxed)
    }
}
