//! Durable per-user access records with expiry.
//!
//! The store keeps every record in memory behind one lock and rewrites the
//! whole access file on each mutation. The file holds one record per line:
//!
//! ```text
//! <user_id> | <YYYY-MM-DD HH:MM:SS> | <status>
//! ```
//!
//! Timestamps are written in the configured fixed offset. Expiry never
//! deletes a record; it only relabels it `expired`.

use crate::error::{AuthError, PersistenceError, ValidationError};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeDelta, Timelike, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const FIELD_SEPARATOR: &str = " | ";
const PERMANENT_DAYS: i64 = 365 * 100;
const MONTH_DAYS: i64 = 30;

static GRANT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)([hdm])$").expect("grant pattern is valid"));

/// Source of the current time, injectable for tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Lifecycle state of an access record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    Pending,
    Authorized,
    Rejected,
    Expired,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Authorized => "authorized",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "authorized" => Some(Self::Authorized),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// One user's access record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessRecord {
    pub user_id: i64,
    pub expire_at: DateTime<FixedOffset>,
    pub status: AccessStatus,
}

impl AccessRecord {
    fn to_line(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.user_id,
            self.expire_at.format(TIMESTAMP_FORMAT),
            self.status.as_str(),
            sep = FIELD_SEPARATOR
        )
    }

    fn parse_line(line: &str, offset: FixedOffset) -> Result<Self, String> {
        let parts: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        if parts.len() != 3 {
            return Err(format!("expected 3 fields, found {}", parts.len()));
        }

        let user_id = parts[0]
            .trim()
            .parse::<i64>()
            .map_err(|e| format!("bad user id '{}': {}", parts[0], e))?;
        let naive = NaiveDateTime::parse_from_str(parts[1].trim(), TIMESTAMP_FORMAT)
            .map_err(|e| format!("bad timestamp '{}': {}", parts[1], e))?;
        let expire_at = naive
            .and_local_timezone(offset)
            .single()
            .ok_or_else(|| format!("ambiguous timestamp '{}'", parts[1]))?;
        let status = AccessStatus::from_str(parts[2].trim())
            .ok_or_else(|| format!("unknown status '{}'", parts[2]))?;

        Ok(Self {
            user_id,
            expire_at,
            status,
        })
    }
}

/// Result of a user asking for access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new pending application was recorded
    Requested,
    /// An application is already waiting for review
    AlreadyPending,
    AlreadyAuthorized,
}

/// Parse an approval length: `<N>h`, `<N>d`, `<N>m` (30-day months) or `permanent`
pub fn parse_grant(token: &str) -> Result<TimeDelta, ValidationError> {
    let invalid = || ValidationError::InvalidDurationFormat(token.to_string());

    if token == "permanent" {
        return TimeDelta::try_days(PERMANENT_DAYS).ok_or_else(invalid);
    }

    let caps = GRANT_PATTERN.captures(token).ok_or_else(invalid)?;
    let value: i64 = caps[1].parse().map_err(|_| invalid())?;
    if value == 0 {
        return Err(invalid());
    }

    let delta = match &caps[2] {
        "h" => TimeDelta::try_hours(value),
        "d" => TimeDelta::try_days(value),
        "m" => value.checked_mul(MONTH_DAYS).and_then(TimeDelta::try_days),
        _ => None,
    };
    delta.ok_or_else(invalid)
}

/// File-backed access store with single-writer discipline
pub struct AuthStore {
    path: PathBuf,
    offset: FixedOffset,
    clock: Arc<dyn Clock>,
    records: Mutex<BTreeMap<i64, AccessRecord>>,
}

impl AuthStore {
    /// Load the access file, creating it empty if absent.
    ///
    /// Any malformed line fails the whole load; nothing is partially applied.
    pub fn load(
        path: &Path,
        offset: FixedOffset,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PersistenceError> {
        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(path)?;
            info!(path = %path.display(), "created empty access file");
        }

        let content = std::fs::read_to_string(path)?;
        let mut records = BTreeMap::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = AccessRecord::parse_line(line, offset)
                .map_err(|reason| PersistenceError::Malformed {
                    line: idx + 1,
                    reason,
                })?;
            if records.insert(record.user_id, record).is_some() {
                return Err(PersistenceError::Malformed {
                    line: idx + 1,
                    reason: "duplicate user id".to_string(),
                });
            }
        }

        debug!(path = %path.display(), count = records.len(), "loaded access records");

        Ok(Self {
            path: path.to_path_buf(),
            offset,
            clock,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current time in the store's offset, truncated to whole seconds so that
    /// a save/load cycle reproduces it exactly
    fn now(&self) -> DateTime<FixedOffset> {
        let now = self.clock.now().with_timezone(&self.offset);
        now.with_nanosecond(0).unwrap_or(now)
    }

    fn render_records(records: &BTreeMap<i64, AccessRecord>) -> String {
        let mut out = String::new();
        for record in records.values() {
            out.push_str(&record.to_line());
            out.push('\n');
        }
        out
    }

    /// Write-temp-then-rename; caller holds the lock
    fn persist(&self, records: &BTreeMap<i64, AccessRecord>) -> Result<(), PersistenceError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.as_file_mut()
            .write_all(Self::render_records(records).as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| PersistenceError::Io(e.error.to_string()))?;
        Ok(())
    }

    /// Rewrite the access file from the in-memory set
    pub fn save(&self) -> Result<(), PersistenceError> {
        let records = self.records.lock();
        self.persist(&records)
    }

    /// True iff the user holds an unexpired `authorized` record.
    ///
    /// An overdue record is relabelled `expired` and persisted before
    /// returning false.
    pub fn is_authorized(&self, user_id: i64) -> Result<bool, PersistenceError> {
        let now = self.now();
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(&user_id) else {
            return Ok(false);
        };
        if record.status != AccessStatus::Authorized {
            return Ok(false);
        }
        if now < record.expire_at {
            return Ok(true);
        }

        record.status = AccessStatus::Expired;
        info!(user_id, expire_at = %record.expire_at, "access expired on check");
        self.persist(&records)?;
        Ok(false)
    }

    /// Grant access for the given length; returns the new expiry
    pub fn approve(&self, user_id: i64, token: &str) -> Result<DateTime<FixedOffset>, AuthError> {
        let length = parse_grant(token)?;
        let expire_at = self
            .now()
            .checked_add_signed(length)
            .ok_or_else(|| ValidationError::InvalidDurationFormat(token.to_string()))?;

        let mut records = self.records.lock();
        records.insert(
            user_id,
            AccessRecord {
                user_id,
                expire_at,
                status: AccessStatus::Authorized,
            },
        );
        self.persist(&records)?;
        info!(user_id, %expire_at, token, "access approved");
        Ok(expire_at)
    }

    /// Decline a pending application
    pub fn reject(&self, user_id: i64) -> Result<(), AuthError> {
        let mut records = self.records.lock();
        match records.get_mut(&user_id) {
            Some(record) if record.status == AccessStatus::Pending => {
                record.status = AccessStatus::Rejected;
            }
            _ => return Err(AuthError::NoPendingApplication(user_id)),
        }
        self.persist(&records)?;
        info!(user_id, "application rejected");
        Ok(())
    }

    /// Delete a record outright
    pub fn remove(&self, user_id: i64) -> Result<AccessRecord, AuthError> {
        let mut records = self.records.lock();
        let removed = records
            .remove(&user_id)
            .ok_or(AuthError::NotFound(user_id))?;
        self.persist(&records)?;
        info!(user_id, "access record removed");
        Ok(removed)
    }

    /// Record an application for access
    pub fn request(&self, user_id: i64) -> Result<RequestOutcome, AuthError> {
        if self.is_authorized(user_id)? {
            return Ok(RequestOutcome::AlreadyAuthorized);
        }

        let now = self.now();
        let mut records = self.records.lock();
        if records
            .get(&user_id)
            .is_some_and(|r| r.status == AccessStatus::Pending)
        {
            return Ok(RequestOutcome::AlreadyPending);
        }
        records.insert(
            user_id,
            AccessRecord {
                user_id,
                expire_at: now,
                status: AccessStatus::Pending,
            },
        );
        self.persist(&records)?;
        info!(user_id, "access requested");
        Ok(RequestOutcome::Requested)
    }

    /// Relabel every overdue `authorized` record; persists once if anything changed
    pub fn sweep_expired(&self) -> Result<Vec<i64>, PersistenceError> {
        let now = self.now();
        let mut records = self.records.lock();
        let mut expired = Vec::new();
        for record in records.values_mut() {
            if record.status == AccessStatus::Authorized && now >= record.expire_at {
                record.status = AccessStatus::Expired;
                expired.push(record.user_id);
            }
        }
        if !expired.is_empty() {
            self.persist(&records)?;
            info!(count = expired.len(), "expired access records");
        }
        Ok(expired)
    }

    pub fn get(&self, user_id: i64) -> Option<AccessRecord> {
        self.records.lock().get(&user_id).cloned()
    }

    /// Snapshot of all records, ordered by user id
    pub fn records(&self) -> Vec<AccessRecord> {
        self.records.lock().values().cloned().collect()
    }

    /// The access file contents as they are persisted
    pub fn render(&self) -> String {
        Self::render_records(&self.records.lock())
    }
}

/// Clock that only moves when told to
#[cfg(test)]
pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub(crate) fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
