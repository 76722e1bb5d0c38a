//! Command router: parses inbound text and drives the access store, the
//! supervisor and the offload client.
//!
//! Every outcome, including every error, becomes a reply string. Nothing a
//! user types can end the dispatch loop.

use crate::audit::AuditLog;
use crate::auth::{AuthStore, RequestOutcome};
use crate::error::RemoteServiceError;
use crate::notify::Notifier;
use crate::offload::{OffloadService, WorkerTask};
use crate::supervisor::{self, SessionMode, StopOutcome, Supervisor};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// A parsed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Auth,
    Approve { user_id: i64, token: String },
    Reject { user_id: i64 },
    Remove { user_id: i64 },
    Mode(SessionMode),
    Offload(bool),
    Start {
        ip: String,
        port: String,
        duration: Option<String>,
    },
    Stop,
    Active,
    AuthFile,
    Workers,
}

fn parse_user_id(raw: Option<&str>, usage: &str) -> Result<i64, String> {
    raw.and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| format!("Usage: {}", usage))
}

impl Command {
    /// Parse one line of input; `Err` carries a usage hint
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let lower = line.to_lowercase();
        match lower.as_str() {
            "stop all" | "/stop" => return Ok(Self::Stop),
            "manual mode" => return Ok(Self::Mode(SessionMode::Manual)),
            "auto mode" => return Ok(Self::Mode(SessionMode::Auto)),
            _ => {}
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&head) = parts.first() else {
            return Err("Empty command. Send /help for usage.".to_string());
        };

        if !head.starts_with('/') {
            return match parts.as_slice() {
                [ip, port] => Ok(Self::Start {
                    ip: ip.to_string(),
                    port: port.to_string(),
                    duration: None,
                }),
                [ip, port, duration] => Ok(Self::Start {
                    ip: ip.to_string(),
                    port: port.to_string(),
                    duration: Some(duration.to_string()),
                }),
                _ => Err(
                    "Expected '<ip> <port> <duration>' (manual) or '<ip> <port>' (auto), e.g. 127.0.0.1 8080 60"
                        .to_string(),
                ),
            };
        }

        match head.to_lowercase().as_str() {
            "/help" | "/start" if parts.len() == 1 => Ok(Self::Help),
            "/auth" => Ok(Self::Auth),
            "/approve" => {
                let usage = "/approve <user_id> <duration>";
                let user_id = parse_user_id(parts.get(1).copied(), usage)?;
                let token = parts
                    .get(2)
                    .ok_or_else(|| format!("Usage: {}", usage))?
                    .to_string();
                Ok(Self::Approve { user_id, token })
            }
            "/reject" => Ok(Self::Reject {
                user_id: parse_user_id(parts.get(1).copied(), "/reject <user_id>")?,
            }),
            "/remove" => Ok(Self::Remove {
                user_id: parse_user_id(parts.get(1).copied(), "/remove <user_id>")?,
            }),
            "/mode" => parts
                .get(1)
                .and_then(|m| SessionMode::from_str(m))
                .map(Self::Mode)
                .ok_or_else(|| "Usage: /mode manual|auto".to_string()),
            "/offload" => match parts.get(1).map(|s| s.to_lowercase()).as_deref() {
                Some("on") => Ok(Self::Offload(true)),
                Some("off") => Ok(Self::Offload(false)),
                _ => Err("Usage: /offload on|off".to_string()),
            },
            "/start" => {
                let rest: Vec<&str> = parts[1..].to_vec();
                Self::parse(&rest.join(" "))
            }
            "/active" => Ok(Self::Active),
            "/authfile" => Ok(Self::AuthFile),
            "/workers" => Ok(Self::Workers),
            other => Err(format!("Unknown command: {}. Send /help for usage.", other)),
        }
    }
}

pub const HELP: &str = "\
Commands:
  /auth                         - request access
  <ip> <port> <duration>        - start a probe session (manual mode)
  <ip> <port>                   - start a probe session (auto mode)
  /mode manual|auto             - choose how durations are picked
  /offload on|off               - run sessions on the worker service instead of locally
  /stop                         - stop your sessions (admins: all sessions)
  /workers                      - list online workers
  /authfile                     - show the access file
Admin:
  /approve <user_id> <Nh|Nd|Nm|permanent>
  /reject <user_id>
  /remove <user_id>
  /active                       - list running sessions";

/// Per-user preferences
#[derive(Debug, Clone, Copy, Default)]
struct UserPrefs {
    mode: SessionMode,
    offload: bool,
}

pub struct Router {
    admins: Vec<i64>,
    store: Arc<AuthStore>,
    supervisor: Arc<Supervisor>,
    offload: Option<Arc<dyn OffloadService>>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<AuditLog>,
    prefs: Mutex<HashMap<i64, UserPrefs>>,
}

impl Router {
    pub fn new(
        admins: Vec<i64>,
        store: Arc<AuthStore>,
        supervisor: Arc<Supervisor>,
        offload: Option<Arc<dyn OffloadService>>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            admins,
            store,
            supervisor,
            offload,
            notifier,
            audit,
            prefs: Mutex::new(HashMap::new()),
        }
    }

    fn is_admin(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }

    fn is_authorized(&self, user_id: i64) -> bool {
        match self.store.is_authorized(user_id) {
            Ok(ok) => ok,
            Err(e) => {
                warn!(user_id, "access check failed: {}", e);
                false
            }
        }
    }

    fn may_use(&self, user_id: i64) -> bool {
        self.is_admin(user_id) || self.is_authorized(user_id)
    }

    fn prefs(&self, user_id: i64) -> UserPrefs {
        self.prefs.lock().get(&user_id).copied().unwrap_or_default()
    }

    fn audited(&self, result: anyhow::Result<()>) {
        if let Err(e) = result {
            warn!("audit write failed: {}", e);
        }
    }

    /// Handle one line from `user_id` and return the reply
    pub fn handle(&self, user_id: i64, line: &str) -> String {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(usage) => return usage,
        };

        match command {
            Command::Help => HELP.to_string(),
            Command::Auth => self.request_access(user_id),
            Command::Approve { .. } | Command::Reject { .. } | Command::Remove { .. }
            | Command::Active
                if !self.is_admin(user_id) =>
            {
                "Only admins can do that.".to_string()
            }
            Command::Approve {
                user_id: target,
                token,
            } => self.approve(user_id, target, &token),
            Command::Reject { user_id: target } => self.reject(user_id, target),
            Command::Remove { user_id: target } => self.remove(user_id, target),
            Command::Active => self.list_active(),
            _ if !self.may_use(user_id) => {
                "You are not authorized. Send /auth to request access.".to_string()
            }
            Command::Mode(mode) => {
                self.prefs.lock().entry(user_id).or_default().mode = mode;
                format!("Mode switched to {}.", mode.as_str())
            }
            Command::Offload(on) => {
                self.prefs.lock().entry(user_id).or_default().offload = on;
                if on {
                    "Offload enabled: sessions will run on the worker service.".to_string()
                } else {
                    "Offload disabled: sessions will run locally.".to_string()
                }
            }
            Command::Start { ip, port, duration } => {
                self.start(user_id, &ip, &port, duration.as_deref())
            }
            Command::Stop => self.stop(user_id),
            Command::AuthFile => self.auth_file(user_id),
            Command::Workers => self.workers(),
        }
    }

    fn request_access(&self, user_id: i64) -> String {
        if self.is_admin(user_id) {
            return "You are an admin; no authorization needed.".to_string();
        }
        match self.store.request(user_id) {
            Ok(RequestOutcome::Requested) => {
                self.audited(self.audit.access_requested(user_id));
                self.notifier.broadcast(
                    &self.admins,
                    &format!(
                        "Access request from user {id}. Reply /approve {id} <duration> or /reject {id}.",
                        id = user_id
                    ),
                );
                format!(
                    "Access requested for user {}. An admin will review it.",
                    user_id
                )
            }
            Ok(RequestOutcome::AlreadyPending) => {
                "Your request is already waiting for review.".to_string()
            }
            Ok(RequestOutcome::AlreadyAuthorized) => "You are already authorized.".to_string(),
            Err(e) => format!("Could not record the request: {}", e),
        }
    }

    fn approve(&self, admin: i64, user_id: i64, token: &str) -> String {
        match self.store.approve(user_id, token) {
            Ok(expire_at) => {
                self.audited(self.audit.access_approved(admin, user_id, token, &expire_at));
                let until = expire_at.format("%Y-%m-%d %H:%M:%S");
                self.notifier.notify(
                    user_id,
                    &format!("You are now authorized until {}.", until),
                );
                format!("User {} authorized for {} (until {}).", user_id, token, until)
            }
            Err(e) => format!("Cannot approve: {}", e),
        }
    }

    fn reject(&self, admin: i64, user_id: i64) -> String {
        match self.store.reject(user_id) {
            Ok(()) => {
                self.audited(self.audit.access_rejected(admin, user_id));
                self.notifier
                    .notify(user_id, "Your access request was declined.");
                format!("User {}'s application was rejected.", user_id)
            }
            Err(e) => format!("Cannot reject: {}", e),
        }
    }

    fn remove(&self, admin: i64, user_id: i64) -> String {
        match self.store.remove(user_id) {
            Ok(_) => {
                self.audited(self.audit.access_removed(admin, user_id));
                self.notifier
                    .notify(user_id, "Your access was removed by an admin.");
                format!("User {} removed from the access list.", user_id)
            }
            Err(e) => format!("Cannot remove: {}", e),
        }
    }

    fn start(&self, user_id: i64, ip: &str, port: &str, duration: Option<&str>) -> String {
        let prefs = self.prefs(user_id);
        let request =
            match supervisor::validate(self.supervisor.config(), ip, port, duration, prefs.mode) {
                Ok(request) => request,
                Err(e) => return format!("Rejected: {}.", e),
            };
        if let Err(e) = self.supervisor.check_target(request.target) {
            return format!("Rejected: {}.", e);
        }

        if prefs.offload {
            let Some(offload) = &self.offload else {
                return format!(
                    "Worker service error: {}. Send /offload off to run locally.",
                    RemoteServiceError::NotConfigured
                );
            };
            let task = WorkerTask {
                ip: request.target.to_string(),
                port: request.port,
                duration: request.duration_secs,
            };
            return match offload.submit(&task) {
                Ok(result) => {
                    self.audited(self.audit.task_offloaded(
                        user_id,
                        &task,
                        true,
                        &result.to_string(),
                    ));
                    format!(
                        "Submitted to the worker service: {}:{} for {} seconds ({}).",
                        task.ip, task.port, task.duration, result
                    )
                }
                Err(e) => {
                    self.audited(self.audit.task_offloaded(user_id, &task, false, &e.to_string()));
                    format!("Worker service error: {}", e)
                }
            };
        }

        match self.supervisor.start(user_id, &request) {
            Ok(session) => {
                self.audited(self.audit.session_started(user_id, &session));
                format!(
                    "Probe session started ({} mode): {}:{} for {} seconds.",
                    prefs.mode.as_str(),
                    session.target,
                    session.port,
                    session.duration_secs
                )
            }
            Err(e) => format!("Could not start: {}.", e),
        }
    }

    fn stop(&self, user_id: i64) -> String {
        let (scope, outcome) = if self.is_admin(user_id) {
            ("all", self.supervisor.stop_all())
        } else {
            ("own", self.supervisor.stop_owned(user_id))
        };
        match outcome {
            StopOutcome::Stopped(count) => {
                self.audited(self.audit.sessions_stopped(user_id, scope, count));
                format!("Stopped {} session(s).", count)
            }
            StopOutcome::NothingToStop => "No active sessions to stop.".to_string(),
        }
    }

    fn list_active(&self) -> String {
        let sessions = self.supervisor.active();
        if sessions.is_empty() {
            return "No active sessions.".to_string();
        }
        let mut out = format!("Active sessions ({}):", sessions.len());
        for s in sessions {
            out.push_str(&format!(
                "\n  pid {} user {} -> {}:{} for {}s (started {})",
                s.pid,
                s.owner,
                s.target,
                s.port,
                s.duration_secs,
                s.started_at.format("%H:%M:%S")
            ));
        }
        out
    }

    fn auth_file(&self, user_id: i64) -> String {
        self.audited(self.audit.access_file_fetched(user_id));
        let content = self.store.render();
        if content.is_empty() {
            return format!("{} is empty.", self.store.path().display());
        }
        format!("{}:\n{}", self.store.path().display(), content.trim_end())
    }

    fn workers(&self) -> String {
        let Some(offload) = &self.offload else {
            return format!("Worker service error: {}", RemoteServiceError::NotConfigured);
        };
        match offload.fetch_status() {
            Ok(workers) if workers.is_empty() => "No workers online.".to_string(),
            Ok(workers) => format!("Online workers: {}", workers.join(", ")),
            Err(e) => format!("Worker service error: {}", e),
        }
    }
}
