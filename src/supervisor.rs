//! Probe session supervisor.
//!
//! Each session is an external probe process with a hard lifetime. The
//! supervisor owns every `Child` in a pid-keyed registry and is the only
//! component that terminates one. A session ends in exactly one of three ways:
//!
//! - its watchdog fires after `duration` seconds,
//! - a stop request removes it,
//! - the probe exits on its own (observed when the watchdog fires).
//!
//! Whichever path removes the registry entry first wins; the others find the
//! entry gone and do nothing.

use crate::config::ProbeConfig;
use crate::error::{ProcessError, ValidationError};
use crate::notify::Notifier;
use anyhow::Result;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// How the session duration is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Caller supplies the duration
    #[default]
    Manual,
    /// Duration drawn uniformly from the configured auto range
    Auto,
}

impl SessionMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "manual" => Some(Self::Manual),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
        }
    }
}

/// A validated session request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRequest {
    pub target: IpAddr,
    pub port: u16,
    pub duration_secs: u64,
}

/// Public view of a running session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub pid: u32,
    pub owner: i64,
    pub target: IpAddr,
    pub port: u16,
    pub duration_secs: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(usize),
    NothingToStop,
}

struct ActiveSession {
    id: u64,
    child: Child,
    info: SessionInfo,
    cancel: Sender<()>,
}

/// Check target, port and duration.
///
/// In auto mode the supplied duration is ignored and a fresh one is drawn,
/// so it is valid by construction.
pub fn validate(
    config: &ProbeConfig,
    ip: &str,
    port: &str,
    duration: Option<&str>,
    mode: SessionMode,
) -> Result<SessionRequest, ValidationError> {
    let target: IpAddr = ip
        .parse()
        .map_err(|_| ValidationError::InvalidIp(ip.to_string()))?;

    let port = port
        .parse::<u32>()
        .ok()
        .filter(|p| (1..=65535).contains(p))
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| ValidationError::InvalidPort(port.to_string()))?;

    let duration_secs = match mode {
        SessionMode::Auto => {
            rand::rng().random_range(config.auto_min_secs..=config.auto_max_secs)
        }
        SessionMode::Manual => {
            let raw = duration.unwrap_or("");
            raw.parse::<u64>()
                .ok()
                .filter(|d| (1..=config.max_duration_secs).contains(d))
                .ok_or_else(|| ValidationError::InvalidDuration {
                    value: raw.to_string(),
                    max: config.max_duration_secs,
                })?
        }
    };

    Ok(SessionRequest {
        target,
        port,
        duration_secs,
    })
}

/// State shared between the supervisor and its watchdog threads
struct Shared {
    registry: Mutex<HashMap<u32, ActiveSession>>,
    notifier: Arc<dyn Notifier>,
    grace: Duration,
}

pub struct Supervisor {
    shared: Arc<Shared>,
    config: ProbeConfig,
    networks: Vec<IpNetwork>,
    next_id: AtomicU64,
}

impl Supervisor {
    pub fn new(config: &ProbeConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let networks = config.networks()?;
        Ok(Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(HashMap::new()),
                notifier,
                grace: config.terminate_grace(),
            }),
            config: config.clone(),
            networks,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Refuse targets outside the allowed networks
    pub fn check_target(&self, target: IpAddr) -> Result<(), ProcessError> {
        if self.networks.iter().any(|n| n.contains(target)) {
            Ok(())
        } else {
            Err(ProcessError::TargetNotPermitted(target.to_string()))
        }
    }

    /// Launch a probe and arm its watchdog
    pub fn start(&self, owner: i64, request: &SessionRequest) -> Result<SessionInfo, ProcessError> {
        self.check_target(request.target)?;

        let mut registry = self.shared.registry.lock();
        let active = registry.values().filter(|s| s.info.owner == owner).count();
        if active >= self.config.max_sessions_per_user {
            return Err(ProcessError::SessionLimit { owner, active });
        }

        let child = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(request.target.to_string())
            .arg(request.port.to_string())
            .arg(request.duration_secs.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(format!("{}: {}", self.config.program, e)))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = SessionInfo {
            pid: child.id(),
            owner,
            target: request.target,
            port: request.port,
            duration_secs: request.duration_secs,
            started_at: Utc::now(),
        };
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        registry.insert(
            info.pid,
            ActiveSession {
                id,
                child,
                info: info.clone(),
                cancel: cancel_tx,
            },
        );
        drop(registry);

        let shared = Arc::clone(&self.shared);
        let pid = info.pid;
        let lifetime = Duration::from_secs(request.duration_secs);
        let spawned = thread::Builder::new()
            .name(format!("watchdog-{}", pid))
            .spawn(move || match cancel_rx.recv_timeout(lifetime) {
                Err(RecvTimeoutError::Timeout) => shared.reap(pid, id),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!(pid, "watchdog cancelled");
                }
            });

        if let Err(e) = spawned {
            // no watchdog means no lifetime bound, so undo the launch
            let session = self.shared.take_if(pid, id);
            if let Some(mut session) = session {
                signal_term(&mut session.child);
                if let Err(err) = finish(&mut session.child, self.shared.grace) {
                    warn!("{}", err);
                }
            }
            return Err(ProcessError::SpawnFailed(format!("watchdog thread: {}", e)));
        }

        info!(
            pid,
            owner,
            target = %info.target,
            port = info.port,
            duration_secs = info.duration_secs,
            "probe session started"
        );
        Ok(info)
    }

    /// Stop every registered session
    pub fn stop_all(&self) -> StopOutcome {
        let sessions: Vec<ActiveSession> = {
            let mut registry = self.shared.registry.lock();
            registry.drain().map(|(_, s)| s).collect()
        };
        self.shared.stop_sessions(sessions)
    }

    /// Stop only the sessions started by `owner`
    pub fn stop_owned(&self, owner: i64) -> StopOutcome {
        let sessions: Vec<ActiveSession> = {
            let mut registry = self.shared.registry.lock();
            let pids: Vec<u32> = registry
                .iter()
                .filter(|(_, s)| s.info.owner == owner)
                .map(|(pid, _)| *pid)
                .collect();
            pids.iter().filter_map(|pid| registry.remove(pid)).collect()
        };
        self.shared.stop_sessions(sessions)
    }

    /// Snapshot of running sessions, oldest first
    pub fn active(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .shared
            .registry
            .lock()
            .values()
            .map(|s| s.info.clone())
            .collect();
        sessions.sort_by_key(|s| (s.started_at, s.pid));
        sessions
    }

    pub fn active_count(&self) -> usize {
        self.shared.registry.lock().len()
    }
}

impl Shared {
    /// Remove the entry only if it still belongs to session `id`
    fn take_if(&self, pid: u32, id: u64) -> Option<ActiveSession> {
        let mut registry = self.registry.lock();
        match registry.get(&pid) {
            Some(session) if session.id == id => registry.remove(&pid),
            _ => None,
        }
    }

    /// Watchdog fire: end the session if it is still registered
    fn reap(&self, pid: u32, id: u64) {
        let Some(mut session) = self.take_if(pid, id) else {
            debug!(pid, "watchdog fired for a session that already ended");
            return;
        };

        match session.child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, ?status, "probe exited before its deadline");
            }
            Ok(None) => {
                signal_term(&mut session.child);
                if let Err(e) = finish(&mut session.child, self.grace) {
                    warn!("{} (registry entry released anyway)", e);
                }
            }
            Err(e) => {
                warn!(pid, "failed to poll probe status: {}", e);
            }
        }

        let info = &session.info;
        info!(pid, owner = info.owner, "probe session completed");
        self.notifier.notify(
            info.owner,
            &format!(
                "Probe session completed: {}:{} for {} seconds",
                info.target, info.port, info.duration_secs
            ),
        );
    }

    /// Cancel watchdogs, signal every child, then wait for each
    fn stop_sessions(&self, mut sessions: Vec<ActiveSession>) -> StopOutcome {
        if sessions.is_empty() {
            return StopOutcome::NothingToStop;
        }

        for session in &mut sessions {
            let _ = session.cancel.send(());
            signal_term(&mut session.child);
        }
        for session in &mut sessions {
            if let Err(e) = finish(&mut session.child, self.grace) {
                warn!("{} (registry entry released anyway)", e);
            }
        }

        info!(count = sessions.len(), "stopped probe sessions");
        StopOutcome::Stopped(sessions.len())
    }
}

/// Ask the child to exit
#[cfg(unix)]
fn signal_term(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(child.id()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        // ESRCH: already gone but not yet reaped
        debug!(pid = raw, "SIGTERM failed: {}", e);
    }
}

#[cfg(not(unix))]
fn signal_term(_child: &mut Child) {}

/// Wait out the grace period, then force-kill and reap
fn finish(child: &mut Child, grace: Duration) -> Result<ExitStatus, ProcessError> {
    let pid = child.id();
    let failed = |reason: String| ProcessError::TerminateFailed { pid, reason };

    match child.wait_timeout(grace) {
        Ok(Some(status)) => return Ok(status),
        Ok(None) => debug!(pid, "probe ignored SIGTERM, escalating"),
        Err(e) => warn!(pid, "wait after SIGTERM failed: {}", e),
    }

    child.kill().map_err(|e| failed(e.to_string()))?;
    match child.wait_timeout(grace) {
        Ok(Some(status)) => Ok(status),
        Ok(None) => Err(failed("still running after SIGKILL".to_string())),
        Err(e) => Err(failed(e.to_string())),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use std::time::Instant;

    fn program_config(script: &str) -> ProbeConfig {
        ProbeConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "probe".to_string()],
            terminate_grace_ms: 200,
            ..ProbeConfig::default()
        }
    }

    fn supervisor(script: &str) -> (Supervisor, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let sup = Supervisor::new(&program_config(script), notifier.clone()).unwrap();
        (sup, notifier)
    }

    fn request(duration_secs: u64) -> SessionRequest {
        SessionRequest {
            target: "127.0.0.1".parse().unwrap(),
            port: 8080,
            duration_secs,
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        done()
    }

    #[test]
    fn test_validate_ip() {
        let cfg = ProbeConfig::default();
        let manual = SessionMode::Manual;
        assert!(validate(&cfg, "0.0.0.0", "80", Some("10"), manual).is_ok());
        assert!(validate(&cfg, "192.168.1.100", "80", Some("10"), manual).is_ok());
        assert!(validate(&cfg, "::1", "80", Some("10"), manual).is_ok());
        for bad in ["999.1.1.1", "1.2.3", "1.2.3.4.5", "example.com", ""] {
            assert_eq!(
                validate(&cfg, bad, "80", Some("10"), manual),
                Err(ValidationError::InvalidIp(bad.to_string()))
            );
        }
    }

    #[test]
    fn test_validate_port_bounds() {
        let cfg = ProbeConfig::default();
        let check = |p: &str| validate(&cfg, "127.0.0.1", p, Some("10"), SessionMode::Manual);
        assert_eq!(check("0"), Err(ValidationError::InvalidPort("0".to_string())));
        assert_eq!(check("1").unwrap().port, 1);
        assert_eq!(check("65535").unwrap().port, 65535);
        assert_eq!(
            check("65536"),
            Err(ValidationError::InvalidPort("65536".to_string()))
        );
        assert!(check("-1").is_err());
        assert!(check("http").is_err());
    }

    #[test]
    fn test_validate_manual_duration_bounds() {
        let cfg = ProbeConfig::default();
        let check = |d: &str| validate(&cfg, "127.0.0.1", "80", Some(d), SessionMode::Manual);
        assert!(matches!(
            check("0"),
            Err(ValidationError::InvalidDuration { max: 600, .. })
        ));
        assert_eq!(check("1").unwrap().duration_secs, 1);
        assert_eq!(check("600").unwrap().duration_secs, 600);
        assert!(check("601").is_err());
        assert!(validate(&cfg, "127.0.0.1", "80", None, SessionMode::Manual).is_err());
    }

    #[test]
    fn test_auto_duration_in_range() {
        let cfg = ProbeConfig::default();
        for _ in 0..500 {
            let req = validate(&cfg, "127.0.0.1", "80", Some("0"), SessionMode::Auto).unwrap();
            assert!((80..=120).contains(&req.duration_secs));
        }
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(SessionMode::from_str("Auto"), Some(SessionMode::Auto));
        assert_eq!(SessionMode::from_str("manual"), Some(SessionMode::Manual));
        assert_eq!(SessionMode::from_str("turbo"), None);
    }

    #[test]
    fn test_watchdog_terminates_at_deadline() {
        let (sup, notifier) = supervisor("sleep 30");
        let started = Instant::now();
        let info = sup.start(1, &request(1)).unwrap();
        assert_eq!(sup.active_count(), 1);
        assert_eq!(sup.active()[0], info);

        assert!(wait_until(|| sup.active_count() == 0));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(wait_until(|| !notifier.sent_to(1).is_empty()));
        assert_eq!(
            notifier.sent_to(1),
            vec!["Probe session completed: 127.0.0.1:8080 for 1 seconds".to_string()]
        );
    }

    #[test]
    fn test_program_receives_arguments() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("args.txt");
        let script = format!("echo \"$@\" > {}", out.display());
        let (sup, _notifier) = supervisor(&script);
        sup.start(1, &request(1)).unwrap();
        assert!(wait_until(|| sup.active_count() == 0));
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "127.0.0.1 8080 1");
    }

    #[test]
    fn test_early_exit_still_reported_once() {
        let (sup, notifier) = supervisor("exit 0");
        sup.start(4, &request(1)).unwrap();
        assert!(wait_until(|| sup.active_count() == 0));
        assert!(wait_until(|| notifier.sent_to(4).len() == 1));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(notifier.sent_to(4).len(), 1);
    }

    #[test]
    fn test_stop_all_is_idempotent() {
        let (sup, notifier) = supervisor("sleep 30");
        sup.start(1, &request(60)).unwrap();
        sup.start(2, &request(60)).unwrap();
        assert_eq!(sup.stop_all(), StopOutcome::Stopped(2));
        assert_eq!(sup.active_count(), 0);
        assert_eq!(sup.stop_all(), StopOutcome::NothingToStop);
        // cancelled watchdogs never report completion
        thread::sleep(Duration::from_millis(100));
        assert!(notifier.sent().is_empty());
    }

    #[test]
    fn test_stop_owned_leaves_others() {
        let (sup, _notifier) = supervisor("sleep 30");
        sup.start(1, &request(60)).unwrap();
        let other = sup.start(2, &request(60)).unwrap();
        assert_eq!(sup.stop_owned(1), StopOutcome::Stopped(1));
        assert_eq!(sup.stop_owned(1), StopOutcome::NothingToStop);
        assert_eq!(sup.active(), vec![other]);
        assert_eq!(sup.stop_all(), StopOutcome::Stopped(1));
    }

    #[test]
    fn test_stop_escalates_when_term_ignored() {
        let (sup, _notifier) = supervisor("trap '' TERM; while :; do sleep 1; done");
        sup.start(1, &request(60)).unwrap();
        // give the shell time to install its trap
        thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        assert_eq!(sup.stop_all(), StopOutcome::Stopped(1));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(sup.active_count(), 0);
    }

    #[test]
    fn test_session_limit_per_user() {
        let (sup, _notifier) = supervisor("sleep 30");
        sup.start(1, &request(60)).unwrap();
        assert_eq!(
            sup.start(1, &request(60)),
            Err(ProcessError::SessionLimit {
                owner: 1,
                active: 1
            })
        );
        assert_eq!(sup.active_count(), 1);
        sup.stop_all();
    }

    #[test]
    fn test_target_outside_allow_list() {
        let (sup, _notifier) = supervisor("sleep 30");
        let mut req = request(10);
        req.target = "8.8.8.8".parse().unwrap();
        assert_eq!(
            sup.start(1, &req),
            Err(ProcessError::TargetNotPermitted("8.8.8.8".to_string()))
        );
        assert_eq!(sup.active_count(), 0);
        assert!(sup.check_target("::1".parse().unwrap()).is_ok());
    }

    #[test]
    fn test_spawn_failure_registers_nothing() {
        let notifier = Arc::new(RecordingNotifier::default());
        let cfg = ProbeConfig {
            program: "/nonexistent/warden-probe".to_string(),
            ..ProbeConfig::default()
        };
        let sup = Supervisor::new(&cfg, notifier).unwrap();
        let err = sup.start(1, &request(10)).unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed(ref m) if m.contains("warden-probe")));
        assert_eq!(sup.active_count(), 0);
    }

    #[test]
    fn test_concurrent_starts_leave_empty_registry() {
        let (sup, notifier) = supervisor("sleep 30");
        let sup = Arc::new(sup);
        let handles: Vec<_> = (0..8)
            .map(|owner| {
                let sup = Arc::clone(&sup);
                thread::spawn(move || sup.start(owner, &request(1)).unwrap())
            })
            .collect();
        let mut pids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap().pid).collect();
        pids.sort_unstable();
        pids.dedup();
        assert_eq!(pids.len(), 8);

        assert!(wait_until(|| sup.active_count() == 0));
        assert!(wait_until(|| notifier.sent().len() == 8));
    }
}
