//! Append-only JSONL journal of access decisions and probe sessions.

use crate::offload::WorkerTask;
use crate::supervisor::SessionInfo;
use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct AuditLog {
    pub path: Option<PathBuf>,
    run_id: String,
    file: Mutex<Option<File>>,
}

#[derive(Serialize)]
struct Event<'a> {
    ts: DateTime<Utc>,
    run_id: &'a str,
    actor: i64,
    #[serde(rename = "type")]
    event_type: &'a str,
    #[serde(flatten)]
    data: serde_json::Value,
}

impl AuditLog {
    pub fn open(path: &Path, run_id: &str) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: Some(path.to_path_buf()),
            run_id: run_id.to_string(),
            file: Mutex::new(Some(file)),
        })
    }

    /// A journal that drops every event
    pub fn disabled() -> Self {
        Self {
            path: None,
            run_id: String::new(),
            file: Mutex::new(None),
        }
    }

    pub fn log(&self, actor: i64, event_type: &str, data: serde_json::Value) -> Result<()> {
        let mut file = self.file.lock();
        let Some(file) = file.as_mut() else {
            return Ok(());
        };
        let event = Event {
            ts: Utc::now(),
            run_id: &self.run_id,
            actor,
            event_type,
            data,
        };
        let line = serde_json::to_string(&event)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    pub fn access_requested(&self, actor: i64) -> Result<()> {
        self.log(actor, "access_requested", json!({}))
    }

    pub fn access_approved(
        &self,
        actor: i64,
        user_id: i64,
        token: &str,
        expire_at: &DateTime<FixedOffset>,
    ) -> Result<()> {
        self.log(
            actor,
            "access_approved",
            json!({
                "user_id": user_id,
                "token": token,
                "expire_at": expire_at,
            }),
        )
    }

    pub fn access_rejected(&self, actor: i64, user_id: i64) -> Result<()> {
        self.log(actor, "access_rejected", json!({ "user_id": user_id }))
    }

    pub fn access_removed(&self, actor: i64, user_id: i64) -> Result<()> {
        self.log(actor, "access_removed", json!({ "user_id": user_id }))
    }

    pub fn session_started(&self, actor: i64, session: &SessionInfo) -> Result<()> {
        self.log(actor, "session_started", json!({ "session": session }))
    }

    /// Log a stop request; `scope` is "all" or "own"
    pub fn sessions_stopped(&self, actor: i64, scope: &str, count: usize) -> Result<()> {
        self.log(
            actor,
            "sessions_stopped",
            json!({
                "scope": scope,
                "count": count,
            }),
        )
    }

    pub fn task_offloaded(&self, actor: i64, task: &WorkerTask, ok: bool, detail: &str) -> Result<()> {
        self.log(
            actor,
            "task_offloaded",
            json!({
                "task": task,
                "ok": ok,
                "detail": detail,
            }),
        )
    }

    pub fn access_file_fetched(&self, actor: i64) -> Result<()> {
        self.log(actor, "access_file_fetched", json!({}))
    }
}
