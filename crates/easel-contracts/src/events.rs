use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::jobs::Provider;

/// Append-only session log at `events.jsonl`, one compact JSON object per
/// line. Every event carries `type`, `session_id`, and `ts`; the typed
/// constructors cover the job lifecycle vocabulary, and [`EventWriter::emit`]
/// remains for anything outside it.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn session_started(&self, session_dir: &Path) -> Result<Value> {
        self.emit(
            "session_started",
            json!({ "session_dir": session_dir.to_string_lossy() }),
        )
    }

    pub fn job_submitted(&self, job_id: &str, provider: Provider, is_edit: bool) -> Result<Value> {
        self.emit(
            "job_submitted",
            json!({
                "job_id": job_id,
                "provider": provider.as_str(),
                "is_edit": is_edit,
            }),
        )
    }

    pub fn job_succeeded(&self, job_id: &str, width: u32, height: u32) -> Result<Value> {
        self.emit(
            "job_succeeded",
            json!({
                "job_id": job_id,
                "width": width,
                "height": height,
            }),
        )
    }

    pub fn job_failed(&self, job_id: &str, error: &str) -> Result<Value> {
        self.emit(
            "job_failed",
            json!({
                "job_id": job_id,
                "error": error,
            }),
        )
    }

    /// Write one event. `fields` must be a JSON object; its entries are laid
    /// down after the defaults.
    pub fn emit(&self, event_type: &str, fields: Value) -> Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        if let Value::Object(extra) = fields {
            event.extend(extra);
        }

        self.append_line(&serde_json::to_string(&event)?)?;
        Ok(Value::Object(event))
    }

    fn append_line(&self, line: &str) -> Result<()> {
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
