use crate::error::CacheError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Cache key: sha256 over `"{model}::{prompt}"`, lowercase hex
pub fn prompt_hash(model: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b"::");
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One stored generation response.
///
/// After insertion only `hit_count` keeps changing; the reviewer fields
/// (`is_verified`, `corrected_response`, `reviewed_at`) are set exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub prompt_hash: String,
    pub model: String,
    pub prompt_text: String,
    pub original_response: String,
    pub corrected_response: Option<String>,
    pub is_verified: bool,
    pub device_id: Option<String>,
    pub message_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn unverified(model: &str, prompt: &str, response: String) -> Self {
        Self {
            prompt_hash: prompt_hash(model, prompt),
            model: model.to_string(),
            prompt_text: prompt.to_string(),
            original_response: response,
            corrected_response: None,
            is_verified: false,
            device_id: None,
            message_type: None,
            created_at: Utc::now(),
            reviewed_at: None,
            hit_count: 0,
        }
    }

    pub fn with_context(mut self, device_id: Option<String>, message_type: Option<String>) -> Self {
        self.device_id = device_id;
        self.message_type = message_type;
        self
    }

    /// Reviewer's correction when there is one, else the original response
    pub fn response(&self) -> &str {
        self.corrected_response
            .as_deref()
            .unwrap_or(&self.original_response)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total: u64,
    pub verified: u64,
    pub unverified: u64,
    pub total_hits: u64,
}

/// Keyed collection of cache entries, safe to share between callers
pub trait CacheStore: Send + Sync {
    fn get(&self, hash: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Insert unless the key exists. Returns whether this call inserted.
    fn insert_if_absent(&self, entry: &CacheEntry) -> Result<bool, CacheError>;

    /// Bump `hit_count`, returning the new value
    fn record_hit(&self, hash: &str) -> Result<u64, CacheError>;

    /// One-way false → true transition. Fails with `AlreadyVerified` on a
    /// second call and `NotFound` for an unknown hash.
    fn mark_verified(&self, hash: &str, corrected: Option<&str>) -> Result<CacheEntry, CacheError>;

    fn stats(&self) -> Result<CacheStats, CacheError>;

    /// Unverified entries, oldest first
    fn pending_review(&self, limit: usize) -> Result<Vec<CacheEntry>, CacheError>;

    /// Prior entries for few-shot prompting, most used first
    fn find_similar(
        &self,
        device_id: Option<&str>,
        message_type: Option<&str>,
        verified_only: bool,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, CacheError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS llm_cache (
    prompt_hash TEXT PRIMARY KEY,
    model TEXT NOT NULL,
    prompt_text TEXT NOT NULL,
    original_response TEXT NOT NULL,
    corrected_response TEXT,
    is_verified INTEGER NOT NULL DEFAULT 0,
    device_id TEXT,
    message_type TEXT,
    created_at TEXT NOT NULL,
    reviewed_at TEXT,
    hit_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_llm_cache_device_message ON llm_cache(device_id, message_type);
CREATE INDEX IF NOT EXISTS idx_llm_cache_verified ON llm_cache(is_verified);
";

const COLUMNS: &str = "prompt_hash, model, prompt_text, original_response, corrected_response, \
     is_verified, device_id, message_type, created_at, reviewed_at, hit_count";

/// SQLite-backed store. The primary key on `prompt_hash` resolves a
/// concurrent miss-then-insert race to a single row.
pub struct SqliteCacheStore {
    conn: Mutex<Connection>,
}

impl SqliteCacheStore {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CacheError::StoreUnavailable(format!("{}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened generation cache");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn select(conn: &Connection, hash: &str) -> Result<Option<CacheEntry>, CacheError> {
        let sql = format!("SELECT {} FROM llm_cache WHERE prompt_hash = ?1", COLUMNS);
        Ok(conn.query_row(&sql, params![hash], entry_from_row).optional()?)
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<CacheEntry>, CacheError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let entries = stmt
            .query_map(params, entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

/// Fixed-width so text ordering matches time ordering
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    let reviewed_at: Option<String> = row.get(9)?;
    Ok(CacheEntry {
        prompt_hash: row.get(0)?,
        model: row.get(1)?,
        prompt_text: row.get(2)?,
        original_response: row.get(3)?,
        corrected_response: row.get(4)?,
        is_verified: row.get::<_, i64>(5)? != 0,
        device_id: row.get(6)?,
        message_type: row.get(7)?,
        created_at: parse_time(8, row.get(8)?)?,
        reviewed_at: reviewed_at.map(|t| parse_time(9, t)).transpose()?,
        hit_count: row.get::<_, i64>(10)?.max(0) as u64,
    })
}

impl CacheStore for SqliteCacheStore {
    fn get(&self, hash: &str) -> Result<Option<CacheEntry>, CacheError> {
        Self::select(&self.conn(), hash)
    }

    fn insert_if_absent(&self, entry: &CacheEntry) -> Result<bool, CacheError> {
        let sql = format!(
            "INSERT OR IGNORE INTO llm_cache ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            COLUMNS
        );
        let inserted = self.conn().execute(
            &sql,
            params![
                entry.prompt_hash,
                entry.model,
                entry.prompt_text,
                entry.original_response,
                entry.corrected_response,
                entry.is_verified as i64,
                entry.device_id,
                entry.message_type,
                timestamp(&entry.created_at),
                entry.reviewed_at.as_ref().map(timestamp),
                entry.hit_count as i64,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn record_hit(&self, hash: &str) -> Result<u64, CacheError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE llm_cache SET hit_count = hit_count + 1 WHERE prompt_hash = ?1",
            params![hash],
        )?;
        if updated == 0 {
            return Err(CacheError::NotFound(hash.to_string()));
        }
        let count: i64 = conn.query_row(
            "SELECT hit_count FROM llm_cache WHERE prompt_hash = ?1",
            params![hash],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn mark_verified(&self, hash: &str, corrected: Option<&str>) -> Result<CacheEntry, CacheError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE llm_cache SET is_verified = 1, corrected_response = ?1, reviewed_at = ?2 \
             WHERE prompt_hash = ?3 AND is_verified = 0",
            params![corrected, timestamp(&Utc::now()), hash],
        )?;
        if updated == 0 {
            return match Self::select(&conn, hash)? {
                Some(_) => Err(CacheError::AlreadyVerified(hash.to_string())),
                None => Err(CacheError::NotFound(hash.to_string())),
            };
        }
        Self::select(&conn, hash)?.ok_or_else(|| CacheError::NotFound(hash.to_string()))
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        let conn = self.conn();
        let (total, verified, hits): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(is_verified), 0), COALESCE(SUM(hit_count), 0) FROM llm_cache",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(CacheStats {
            total: total as u64,
            verified: verified as u64,
            unverified: (total - verified) as u64,
            total_hits: hits as u64,
        })
    }

    fn pending_review(&self, limit: usize) -> Result<Vec<CacheEntry>, CacheError> {
        let sql = format!(
            "SELECT {} FROM llm_cache WHERE is_verified = 0 ORDER BY created_at ASC LIMIT ?1",
            COLUMNS
        );
        self.query(&sql, &[&(limit as i64)])
    }

    fn find_similar(
        &self,
        device_id: Option<&str>,
        message_type: Option<&str>,
        verified_only: bool,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, CacheError> {
        let sql = format!(
            "SELECT {} FROM llm_cache \
             WHERE (?1 IS NULL OR device_id = ?1) \
               AND (?2 IS NULL OR message_type = ?2) \
               AND (?3 = 0 OR is_verified = 1) \
             ORDER BY hit_count DESC, created_at DESC LIMIT ?4",
            COLUMNS
        );
        self.query(
            &sql,
            &[&device_id, &message_type, &(verified_only as i64), &(limit as i64)],
        )
    }
}

/// Process-local store for tests and offline runs
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, hash: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries().get(hash).cloned())
    }

    fn insert_if_absent(&self, entry: &CacheEntry) -> Result<bool, CacheError> {
        let mut entries = self.entries();
        if entries.contains_key(&entry.prompt_hash) {
            return Ok(false);
        }
        entries.insert(entry.prompt_hash.clone(), entry.clone());
        Ok(true)
    }

    fn record_hit(&self, hash: &str) -> Result<u64, CacheError> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(hash)
            .ok_or_else(|| CacheError::NotFound(hash.to_string()))?;
        entry.hit_count += 1;
        Ok(entry.hit_count)
    }

    fn mark_verified(&self, hash: &str, corrected: Option<&str>) -> Result<CacheEntry, CacheError> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(hash)
            .ok_or_else(|| CacheError::NotFound(hash.to_string()))?;
        if entry.is_verified {
            return Err(CacheError::AlreadyVerified(hash.to_string()));
        }
        entry.is_verified = true;
        entry.corrected_response = corrected.map(str::to_string);
        entry.reviewed_at = Some(Utc::now());
        Ok(entry.clone())
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        let entries = self.entries();
        let verified = entries.values().filter(|e| e.is_verified).count() as u64;
        Ok(CacheStats {
            total: entries.len() as u64,
            verified,
            unverified: entries.len() as u64 - verified,
            total_hits: entries.values().map(|e| e.hit_count).sum(),
        })
    }

    fn pending_review(&self, limit: usize) -> Result<Vec<CacheEntry>, CacheError> {
        let mut pending: Vec<CacheEntry> = self
            .entries()
            .values()
            .filter(|e| !e.is_verified)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.prompt_hash.cmp(&b.prompt_hash)));
        pending.truncate(limit);
        Ok(pending)
    }

    fn find_similar(
        &self,
        device_id: Option<&str>,
        message_type: Option<&str>,
        verified_only: bool,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, CacheError> {
        let mut found: Vec<CacheEntry> = self
            .entries()
            .values()
            .filter(|e| device_id.map_or(true, |d| e.device_id.as_deref() == Some(d)))
            .filter(|e| message_type.map_or(true, |m| e.message_type.as_deref() == Some(m)))
            .filter(|e| !verified_only || e.is_verified)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.hit_count
                .cmp(&a.hit_count)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        found.truncate(limit);
        debug!(count = found.len(), "Similar cache entries");
        Ok(found)
    }
}

/// Stand-in when the configured store cannot be opened. Every call fails
/// with `StoreUnavailable`, leaving the fallback decision to the caller.
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn err<T>(&self) -> Result<T, CacheError> {
        Err(CacheError::StoreUnavailable(self.reason.clone()))
    }
}

impl CacheStore for UnavailableStore {
    fn get(&self, _hash: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.err()
    }

    fn insert_if_absent(&self, _entry: &CacheEntry) -> Result<bool, CacheError> {
        self.err()
    }

    fn record_hit(&self, _hash: &str) -> Result<u64, CacheError> {
        self.err()
    }

    fn mark_verified(&self, _hash: &str, _corrected: Option<&str>) -> Result<CacheEntry, CacheError> {
        self.err()
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        self.err()
    }

    fn pending_review(&self, _limit: usize) -> Result<Vec<CacheEntry>, CacheError> {
        self.err()
    }

    fn find_similar(
        &self,
        _device_id: Option<&str>,
        _message_type: Option<&str>,
        _verified_only: bool,
        _limit: usize,
    ) -> Result<Vec<CacheEntry>, CacheError> {
        self.err()
    }
}
