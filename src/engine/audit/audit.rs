//! Chained Audit Log
//!
//! Append-only audit entries in the live store, each sealed with a checksum
//! over its predecessor's checksum.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use super::checksum::{chain_checksum, ChecksumPayload, CHAIN_SEED};
use crate::engine::database::{Database, DatabaseError};

/// Tracing target for audit writes that could not be persisted.
/// Kept apart from the chain so a logging failure never blocks the caller.
pub const AUDIT_ERROR_TARGET: &str = "carelog::audit_errors";

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Metadata serialization error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("Invalid range: {0}")]
    InvalidRange(String),
    #[error("Unknown {field} value: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("Chain broken at entry {first_invalid_id} ({invalid} invalid entries)")]
    ChainBroken { first_invalid_id: String, invalid: usize },
    #[error("Append lock poisoned")]
    Poisoned,
}

/// Audit action types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AuditAction {
    BackupCreate,
    BackupDelete,
    BackupPrune,
    RestoreValidating,
    RestoreSwapping,
    RestoreVerifying,
    RestoreCommitted,
    RestoreRolledBack,
    RestoreRejected,
    RestoreRecovered,
    AuditVerify,
    AuditPrune,
    CronAuthFailed,

    /// Business operations recorded by the host application
    Custom(String),
}

impl AuditAction {
    pub fn as_str(&self) -> &str {
        match self {
            AuditAction::BackupCreate => "BACKUP_CREATE",
            AuditAction::BackupDelete => "BACKUP_DELETE",
            AuditAction::BackupPrune => "BACKUP_PRUNE",
            AuditAction::RestoreValidating => "RESTORE_VALIDATING",
            AuditAction::RestoreSwapping => "RESTORE_SWAPPING",
            AuditAction::RestoreVerifying => "RESTORE_VERIFYING",
            AuditAction::RestoreCommitted => "RESTORE_COMMITTED",
            AuditAction::RestoreRolledBack => "RESTORE_ROLLED_BACK",
            AuditAction::RestoreRejected => "RESTORE_REJECTED",
            AuditAction::RestoreRecovered => "RESTORE_RECOVERED",
            AuditAction::AuditVerify => "AUDIT_VERIFY",
            AuditAction::AuditPrune => "AUDIT_PRUNE",
            AuditAction::CronAuthFailed => "CRON_AUTH_FAILED",
            AuditAction::Custom(name) => name,
        }
    }
}

impl From<String> for AuditAction {
    fn from(value: String) -> Self {
        match value.as_str() {
            "BACKUP_CREATE" => AuditAction::BackupCreate,
            "BACKUP_DELETE" => AuditAction::BackupDelete,
            "BACKUP_PRUNE" => AuditAction::BackupPrune,
            "RESTORE_VALIDATING" => AuditAction::RestoreValidating,
            "RESTORE_SWAPPING" => AuditAction::RestoreSwapping,
            "RESTORE_VERIFYING" => AuditAction::RestoreVerifying,
            "RESTORE_COMMITTED" => AuditAction::RestoreCommitted,
            "RESTORE_ROLLED_BACK" => AuditAction::RestoreRolledBack,
            "RESTORE_REJECTED" => AuditAction::RestoreRejected,
            "RESTORE_RECOVERED" => AuditAction::RestoreRecovered,
            "AUDIT_VERIFY" => AuditAction::AuditVerify,
            "AUDIT_PRUNE" => AuditAction::AuditPrune,
            "CRON_AUTH_FAILED" => AuditAction::CronAuthFailed,
            _ => AuditAction::Custom(value),
        }
    }
}

impl From<AuditAction> for String {
    fn from(action: AuditAction) -> Self {
        action.as_str().to_string()
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    Authentication,
    PatientData,
    Clinical,
    Administration,
    Backup,
    System,
    Security,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Authentication => "AUTHENTICATION",
            AuditCategory::PatientData => "PATIENT_DATA",
            AuditCategory::Clinical => "CLINICAL",
            AuditCategory::Administration => "ADMINISTRATION",
            AuditCategory::Backup => "BACKUP",
            AuditCategory::System => "SYSTEM",
            AuditCategory::Security => "SECURITY",
        }
    }
}

impl FromStr for AuditCategory {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AUTHENTICATION" => Ok(AuditCategory::Authentication),
            "PATIENT_DATA" => Ok(AuditCategory::PatientData),
            "CLINICAL" => Ok(AuditCategory::Clinical),
            "ADMINISTRATION" => Ok(AuditCategory::Administration),
            "BACKUP" => Ok(AuditCategory::Backup),
            "SYSTEM" => Ok(AuditCategory::System),
            "SECURITY" => Ok(AuditCategory::Security),
            other => Err(AuditError::InvalidField {
                field: "category",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl FromStr for Severity {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Ok(Severity::Info),
            "WARNING" => Ok(Severity::Warning),
            "ERROR" => Ok(Severity::Error),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(AuditError::InvalidField {
                field: "severity",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted, sealed audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Insertion sequence; defines chain order
    pub seq: i64,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor_id: Option<String>,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub category: AuditCategory,
    pub severity: Severity,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Value,
    pub checksum: String,
}

/// An entry before it is sealed into the chain
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub actor_id: Option<String>,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub category: AuditCategory,
    pub severity: Severity,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Value,
}

impl NewAuditEntry {
    pub fn new(action: AuditAction, category: AuditCategory, entity_type: &str) -> Self {
        Self {
            actor_id: None,
            action,
            entity_type: entity_type.to_string(),
            entity_id: None,
            category,
            severity: Severity::Info,
            ip_address: None,
            user_agent: None,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_actor(mut self, actor: Option<&str>) -> Self {
        self.actor_id = actor.map(String::from);
        self
    }

    pub fn with_entity_id(mut self, entity_id: &str) -> Self {
        self.entity_id = Some(entity_id.to_string());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_client(mut self, ip_address: Option<&str>, user_agent: Option<&str>) -> Self {
        self.ip_address = ip_address.map(String::from);
        self.user_agent = user_agent.map(String::from);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Row exactly as stored, used for checksum recomputation
#[derive(Debug, Clone)]
pub(crate) struct RawEntry {
    pub seq: i64,
    pub id: String,
    pub timestamp: String,
    pub actor_id: Option<String>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub category: String,
    pub severity: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: String,
    pub checksum: String,
}

impl RawEntry {
    pub fn payload(&self) -> ChecksumPayload<'_> {
        ChecksumPayload {
            id: &self.id,
            timestamp: &self.timestamp,
            actor_id: self.actor_id.as_deref(),
            action: &self.action,
            entity_type: &self.entity_type,
            entity_id: self.entity_id.as_deref(),
            category: &self.category,
            severity: &self.severity,
            ip_address: self.ip_address.as_deref(),
            user_agent: self.user_agent.as_deref(),
            metadata: &self.metadata,
        }
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            timestamp: row.get(2)?,
            actor_id: row.get(3)?,
            action: row.get(4)?,
            entity_type: row.get(5)?,
            entity_id: row.get(6)?,
            category: row.get(7)?,
            severity: row.get(8)?,
            ip_address: row.get(9)?,
            user_agent: row.get(10)?,
            metadata: row.get(11)?,
            checksum: row.get(12)?,
        })
    }

    fn into_entry(self) -> Result<AuditEntry, AuditError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|_| AuditError::InvalidField {
                field: "timestamp",
                value: self.timestamp.clone(),
            })?
            .with_timezone(&Utc);

        Ok(AuditEntry {
            seq: self.seq,
            id: self.id,
            timestamp,
            actor_id: self.actor_id,
            action: AuditAction::from(self.action),
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            category: self.category.parse()?,
            severity: self.severity.parse()?,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            metadata: serde_json::from_str(&self.metadata)?,
            checksum: self.checksum,
        })
    }
}

const SELECT_COLUMNS: &str = "seq, id, timestamp, actor_id, action, entity_type, entity_id, \
     category, severity, ip_address, user_agent, metadata, checksum";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Insertion order, as the verifier reads
    Asc,
    /// Newest first, for browsing
    #[default]
    Desc,
}

/// Filters and pagination for reading the log
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub actor_id: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub action: Option<String>,
    pub category: Option<AuditCategory>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub entries: Vec<AuditEntry>,
}

/// Inclusive sequence bounds for a scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqRange {
    pub from_seq: Option<i64>,
    pub to_seq: Option<i64>,
}

/// The append-only audit log backed by the live store
#[derive(Clone)]
pub struct AuditLog {
    db: Database,
    append_lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Hold off local appends until the guard drops. Taken before
    /// `Database::exclusive` so no append is mid-transaction on a connection
    /// into a store that is about to be swapped out.
    pub fn pause_appends(&self) -> Result<MutexGuard<'_, ()>, AuditError> {
        self.append_lock.lock().map_err(|_| AuditError::Poisoned)
    }

    /// Seal and persist an entry.
    ///
    /// Reading the last checksum and inserting the new row happen inside one
    /// `BEGIN IMMEDIATE` transaction, so appends from other processes are
    /// serialized by SQLite's writer lock. The in-process mutex keeps local
    /// threads from contending on that lock.
    pub fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry, AuditError> {
        let _serial = self.append_lock.lock().map_err(|_| AuditError::Poisoned)?;

        let mut conn = self.db.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let prev = last_checksum(&tx)?;
        let id = Uuid::new_v4().to_string();
        let timestamp = Utc::now().trunc_subsecs(6);
        let timestamp_text = format_timestamp(&timestamp);
        let metadata_text = canonical_json(&entry.metadata)?;

        let checksum = chain_checksum(
            &prev,
            &ChecksumPayload {
                id: &id,
                timestamp: &timestamp_text,
                actor_id: entry.actor_id.as_deref(),
                action: entry.action.as_str(),
                entity_type: &entry.entity_type,
                entity_id: entry.entity_id.as_deref(),
                category: entry.category.as_str(),
                severity: entry.severity.as_str(),
                ip_address: entry.ip_address.as_deref(),
                user_agent: entry.user_agent.as_deref(),
                metadata: &metadata_text,
            },
        );

        tx.execute(
            "INSERT INTO audit_log (id, timestamp, actor_id, action, entity_type, entity_id,
                category, severity, ip_address, user_agent, metadata, prev_checksum, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id,
                timestamp_text,
                entry.actor_id,
                entry.action.as_str(),
                entry.entity_type,
                entry.entity_id,
                entry.category.as_str(),
                entry.severity.as_str(),
                entry.ip_address,
                entry.user_agent,
                metadata_text,
                prev,
                checksum,
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;

        debug!(seq, action = %entry.action, "audit entry appended");

        Ok(AuditEntry {
            seq,
            id,
            timestamp,
            actor_id: entry.actor_id,
            action: entry.action,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            category: entry.category,
            severity: entry.severity,
            ip_address: entry.ip_address,
            user_agent: entry.user_agent,
            metadata: serde_json::from_str(&metadata_text)?,
            checksum,
        })
    }

    /// Best-effort append: failures go to the audit error channel and are
    /// never retried into the chain.
    pub fn record(&self, entry: NewAuditEntry) -> Option<AuditEntry> {
        let action = entry.action.clone();
        match self.append(entry) {
            Ok(stored) => Some(stored),
            Err(e) => {
                error!(target: AUDIT_ERROR_TARGET, action = %action, error = %e, "audit entry dropped");
                None
            }
        }
    }

    pub fn query(&self, query: &AuditQuery) -> Result<AuditPage, AuditError> {
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(AuditError::InvalidRange(format!(
                    "from ({}) is after to ({})",
                    format_timestamp(&from),
                    format_timestamp(&to)
                )));
            }
        }

        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = query.offset.unwrap_or(0);

        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(actor) = &query.actor_id {
            clauses.push("actor_id = ?");
            values.push(Box::new(actor.clone()));
        }
        if let Some(entity_type) = &query.entity_type {
            clauses.push("entity_type = ?");
            values.push(Box::new(entity_type.clone()));
        }
        if let Some(entity_id) = &query.entity_id {
            clauses.push("entity_id = ?");
            values.push(Box::new(entity_id.clone()));
        }
        if let Some(action) = &query.action {
            clauses.push("action = ?");
            values.push(Box::new(action.clone()));
        }
        if let Some(category) = query.category {
            clauses.push("category = ?");
            values.push(Box::new(category.as_str()));
        }
        // Fixed-width RFC 3339 text sorts chronologically
        if let Some(from) = &query.from {
            clauses.push("timestamp >= ?");
            values.push(Box::new(format_timestamp(from)));
        }
        if let Some(to) = &query.to {
            clauses.push("timestamp <= ?");
            values.push(Box::new(format_timestamp(to)));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let order_sql = match query.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };

        let conn = self.db.get_connection()?;
        let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM audit_log{}", where_sql),
            params.as_slice(),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM audit_log{} ORDER BY seq {} LIMIT {} OFFSET {}",
            SELECT_COLUMNS, where_sql, order_sql, limit, offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params.as_slice(), RawEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let entries = raw
            .into_iter()
            .map(RawEntry::into_entry)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AuditPage {
            total: total as usize,
            limit,
            offset,
            entries,
        })
    }

    /// Rows in insertion order within `range`, at most `limit`
    pub(crate) fn scan_raw(&self, range: &SeqRange, limit: Option<usize>) -> Result<Vec<RawEntry>, AuditError> {
        let conn = self.db.get_connection()?;
        let from = range.from_seq.unwrap_or(i64::MIN);
        let to = range.to_seq.unwrap_or(i64::MAX);
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM audit_log WHERE seq >= ?1 AND seq <= ?2 ORDER BY seq ASC LIMIT ?3",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![from, to, limit], RawEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Stored checksum that the entry at `seq` must chain from
    pub(crate) fn checksum_before(&self, seq: i64) -> Result<String, AuditError> {
        let conn = self.db.get_connection()?;
        let prev: Option<String> = conn
            .query_row(
                "SELECT checksum FROM audit_log WHERE seq < ?1 ORDER BY seq DESC LIMIT 1",
                [seq],
                |row| row.get(0),
            )
            .optional()?;
        match prev {
            Some(checksum) => Ok(checksum),
            None => anchor_or_seed(&conn),
        }
    }

    pub fn count(&self) -> Result<usize, AuditError> {
        let conn = self.db.get_connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn last_entry(&self) -> Result<Option<AuditEntry>, AuditError> {
        let conn = self.db.get_connection()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM audit_log ORDER BY seq DESC LIMIT 1", SELECT_COLUMNS),
                [],
                RawEntry::from_row,
            )
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    /// Retention for the log itself: removes entries up to the last one older
    /// than `cutoff`. The checksum of the last removed entry becomes the chain
    /// anchor so the remaining chain still verifies. The prune is itself logged.
    pub fn prune_before(&self, cutoff: DateTime<Utc>, actor: Option<&str>) -> Result<usize, AuditError> {
        let removed = {
            let _serial = self.append_lock.lock().map_err(|_| AuditError::Poisoned)?;
            let mut conn = self.db.get_connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let boundary: Option<(i64, String)> = tx
                .query_row(
                    "SELECT seq, checksum FROM audit_log WHERE timestamp < ?1 ORDER BY seq DESC LIMIT 1",
                    [format_timestamp(&cutoff)],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((boundary_seq, anchor_checksum)) = boundary else {
                return Ok(0);
            };

            tx.execute(
                "INSERT OR REPLACE INTO audit_anchor (id, last_pruned_seq, checksum, pruned_at)
                 VALUES (1, ?1, ?2, ?3)",
                params![boundary_seq, anchor_checksum, format_timestamp(&Utc::now())],
            )?;
            let removed = tx.execute("DELETE FROM audit_log WHERE seq <= ?1", [boundary_seq])?;
            tx.commit()?;
            removed
        };

        self.record(
            NewAuditEntry::new(AuditAction::AuditPrune, AuditCategory::System, "audit_log")
                .with_actor(actor)
                .with_severity(Severity::Warning)
                .with_metadata(serde_json::json!({
                    "cutoff": format_timestamp(&cutoff),
                    "removed": removed,
                })),
        );

        Ok(removed)
    }
}

fn last_checksum(conn: &Connection) -> Result<String, AuditError> {
    let last: Option<String> = conn
        .query_row(
            "SELECT checksum FROM audit_log ORDER BY seq DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match last {
        Some(checksum) => Ok(checksum),
        None => anchor_or_seed(conn),
    }
}

fn anchor_or_seed(conn: &Connection) -> Result<String, AuditError> {
    let anchor: Option<String> = conn
        .query_row("SELECT checksum FROM audit_anchor WHERE id = 1", [], |row| row.get(0))
        .optional()?;
    Ok(anchor.unwrap_or_else(|| CHAIN_SEED.to_string()))
}

/// Timestamp text as hashed and stored: RFC 3339, microseconds, `Z`
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// JSON with object keys sorted at every level and no whitespace
pub fn canonical_json(value: &Value) -> Result<String, AuditError> {
    Ok(serde_json::to_string(&sorted(value))?)
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
