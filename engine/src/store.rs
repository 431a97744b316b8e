//! Per-shard durable document store.
//!
//! Each shard is one SQLite database holding a `documents` table and a
//! trigram-tokenized FTS5 index keyed on the document rowid, so substring
//! queries work without word segmentation. Writes serialize per shard through
//! an exclusive transaction; reads run on short-lived side connections so
//! queries stay possible while a writer holds the main connection.

use crate::types::{now_secs, Document, EngineError, EngineResult};
use docfind_core::normalize::{fts_clauses, FtsClause, PatternSet};
use docfind_core::truncate_chars;
use rusqlite::{Connection, ErrorCode, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Busy/locked writes retry this many times with exponential back-off.
const MAX_WRITE_RETRIES: u32 = 8;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Stored content is capped well above the extraction cap as a final guard.
const MAX_STORED_CONTENT_CHARS: usize = 2_000_000;

/// How a row was matched, for the planner's query-form bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Phrase,
    Bareword,
    Prefix,
    Like,
}

/// A raw row returned by a shard query, before planner scoring.
#[derive(Debug, Clone)]
pub struct StoreHit {
    pub file_path: String,
    pub file_name: String,
    pub preview: String,
    pub file_type: String,
    /// Negated bm25 rank for FTS rows (higher is better); 0 for LIKE rows.
    pub rank: f64,
    pub pattern_index: usize,
    pub matched_by: MatchKind,
}

/// Per-shard document counts and size, feeding the aggregated statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ShardStats {
    pub shard: usize,
    pub document_count: u64,
    pub by_type: std::collections::BTreeMap<String, u64>,
    pub storage_bytes: u64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct ShardStore {
    index: usize,
    path: PathBuf,
    write_conn: Mutex<Connection>,
}

impl ShardStore {
    /// Open (or create) shard `index` inside `data_dir`. An existing file
    /// that cannot be opened or lacks the schema — e.g. truncated on disk —
    /// is removed and rebuilt empty; other shards are never touched.
    pub fn open(data_dir: &Path, index: usize) -> EngineResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = crate::shard::shard_path(data_dir, index);
        let existed = path.exists();

        let conn = match Self::open_and_prepare(&path) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(shard = index, error = %e, "Shard failed to open, rebuilding empty");
                remove_db_files(&path);
                Self::open_and_prepare(&path)?
            }
        };

        debug!(shard = index, existed, "Shard ready");
        Ok(Self { index, path, write_conn: Mutex::new(conn) })
    }

    fn open_and_prepare(path: &Path) -> EngineResult<Connection> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 file_path TEXT UNIQUE NOT NULL,
                 file_name TEXT NOT NULL,
                 content TEXT NOT NULL,
                 file_type TEXT NOT NULL,
                 size INTEGER,
                 modified_time REAL,
                 indexed_time REAL,
                 hash TEXT
             );
             CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
                 file_path,
                 file_name,
                 content,
                 file_type,
                 tokenize='trigram'
             );
             CREATE INDEX IF NOT EXISTS idx_file_path ON documents(file_path);
             CREATE INDEX IF NOT EXISTS idx_file_type ON documents(file_type);
             CREATE INDEX IF NOT EXISTS idx_modified_time ON documents(modified_time);",
        )?;

        // FTS merge tuning; older SQLite builds may reject some knobs.
        for (knob, value) in
            [("pgsz", "4096"), ("crisismerge", "16"), ("usermerge", "4"), ("automerge", "8")]
        {
            let _ = conn.execute(
                "INSERT INTO documents_fts(documents_fts, rank) VALUES (?1, ?2)",
                (knob, value),
            );
        }

        Ok(conn)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert or replace a document by path. The document row and its FTS row
    /// move in one exclusive transaction; busy shards are retried with
    /// back-off.
    pub fn upsert(&self, doc: &Document) -> EngineResult<()> {
        self.with_write_retries(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
            upsert_in_tx(&tx, doc)?;
            tx.commit()
        })
    }

    /// Transactional batched upsert. One exclusive transaction covers the
    /// whole batch, amortizing the commit cost when the pipeline flushes many
    /// documents into the same shard.
    pub fn bulk_upsert(&self, docs: &[Document]) -> EngineResult<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        let mut written = 0usize;
        self.with_write_retries(|conn| {
            written = 0;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
            for doc in docs {
                upsert_in_tx(&tx, doc)?;
                written += 1;
            }
            tx.commit()
        })?;
        Ok(written)
    }

    fn with_write_retries(
        &self,
        mut op: impl FnMut(&mut Connection) -> rusqlite::Result<()>,
    ) -> EngineResult<()> {
        let mut conn = self.write_conn.lock().expect("shard write lock poisoned");
        let mut attempt = 0u32;
        loop {
            match op(&mut conn) {
                Ok(()) => return Ok(()),
                Err(e) if is_busy(&e) && attempt + 1 < MAX_WRITE_RETRIES => {
                    let backoff = RETRY_BASE_DELAY * 2u32.pow(attempt) + write_jitter();
                    debug!(shard = self.index, attempt, "Shard busy, backing off");
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(e) => {
                    warn!(shard = self.index, error = %e, "Shard write failed");
                    return Err(EngineError::Database(e));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Run the pattern set against this shard. Per pattern (first three), the
    /// full-text clauses are tried in precedence order and the first clause
    /// producing rows wins; short patterns probe with LIKE instead.
    pub fn query(&self, patterns: &PatternSet, limit: usize) -> EngineResult<Vec<StoreHit>> {
        let conn = self.open_read_conn()?;
        let mut hits = Vec::new();

        for (pattern_index, pattern) in patterns.iter().take(3).enumerate() {
            for clause in fts_clauses(pattern) {
                let rows = match &clause {
                    FtsClause::Like(p) => self.query_like(&conn, p, limit, pattern_index),
                    other => self.query_fts(&conn, other, limit, pattern_index),
                };
                match rows {
                    Ok(rows) if !rows.is_empty() => {
                        hits.extend(rows);
                        break;
                    }
                    Ok(_) => continue,
                    // Pattern text that breaks FTS5 syntax falls through to
                    // the next clause rather than failing the shard.
                    Err(e) => {
                        debug!(shard = self.index, error = %e, "Clause rejected");
                        continue;
                    }
                }
            }
        }

        Ok(hits)
    }

    fn open_read_conn(&self) -> EngineResult<Connection> {
        let conn = Connection::open(&self.path)?;
        apply_pragmas(&conn)?;
        Ok(conn)
    }

    fn query_fts(
        &self,
        conn: &Connection,
        clause: &FtsClause,
        limit: usize,
        pattern_index: usize,
    ) -> rusqlite::Result<Vec<StoreHit>> {
        let (match_expr, kind) = match clause {
            FtsClause::Phrase(p) => {
                let quoted = fts_quote(p);
                (format!("content : {quoted} OR file_name : {quoted}"), MatchKind::Phrase)
            }
            FtsClause::Bareword(p) => {
                (format!("content : {p} OR file_name : {p}"), MatchKind::Bareword)
            }
            FtsClause::Prefix(p) => {
                let quoted = fts_quote(p);
                (format!("content : {quoted}* OR file_name : {quoted}*"), MatchKind::Prefix)
            }
            FtsClause::Like(_) => unreachable!("LIKE handled separately"),
        };

        let mut stmt = conn.prepare(
            "SELECT file_path, file_name, substr(content, 1, 500), file_type, rank
             FROM documents_fts
             WHERE documents_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;
        let rows = stmt.query_map((match_expr.as_str(), limit as i64), |row| {
            Ok(StoreHit {
                file_path: row.get(0)?,
                file_name: row.get(1)?,
                preview: row.get(2)?,
                file_type: row.get(3)?,
                // bm25 rank is negative; flip so higher is better
                rank: -row.get::<_, f64>(4)?,
                pattern_index,
                matched_by: kind,
            })
        })?;
        rows.collect()
    }

    fn query_like(
        &self,
        conn: &Connection,
        pattern: &str,
        limit: usize,
        pattern_index: usize,
    ) -> rusqlite::Result<Vec<StoreHit>> {
        let needle = format!("%{}%", like_escape(pattern));
        let mut stmt = conn.prepare(
            "SELECT file_path, file_name, substr(content, 1, 500), file_type
             FROM documents
             WHERE content LIKE ?1 ESCAPE '\\' OR file_name LIKE ?1 ESCAPE '\\'
             ORDER BY file_name
             LIMIT ?2",
        )?;
        let rows = stmt.query_map((needle.as_str(), limit as i64), |row| {
            Ok(StoreHit {
                file_path: row.get(0)?,
                file_name: row.get(1)?,
                preview: row.get(2)?,
                file_type: row.get(3)?,
                rank: 0.0,
                pattern_index,
                matched_by: MatchKind::Like,
            })
        })?;
        rows.collect()
    }

    /// Look up one document row by path (test and repair tooling).
    pub fn get_by_path(&self, path: &str) -> EngineResult<Option<(i64, String, String)>> {
        let conn = self.open_read_conn()?;
        let mut stmt =
            conn.prepare("SELECT id, content, hash FROM documents WHERE file_path = ?1")?;
        let mut rows = stmt.query_map([path], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        Ok(rows.next().transpose()?)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> ShardStats {
        let mut stats = ShardStats { shard: self.index, ..Default::default() };
        stats.storage_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        let Ok(conn) = self.open_read_conn() else { return stats };
        stats.document_count = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as u64;

        if stats.document_count > 0 {
            if let Ok(mut stmt) =
                conn.prepare("SELECT file_type, COUNT(*) FROM documents GROUP BY file_type")
            {
                if let Ok(rows) = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                }) {
                    for row in rows.flatten() {
                        stats.by_type.insert(row.0, row.1 as u64);
                    }
                }
            }
        }
        stats
    }

    /// Merge the FTS segments, vacuum, analyze, and run pragma optimize.
    pub fn optimize(&self) -> EngineResult<()> {
        let conn = self.write_conn.lock().expect("shard write lock poisoned");
        conn.execute_batch(
            "INSERT INTO documents_fts(documents_fts) VALUES('optimize');
             VACUUM;
             ANALYZE;
             PRAGMA optimize;",
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transaction protocol
// ---------------------------------------------------------------------------

/// Upsert one document inside an open transaction: update the row and
/// replace its FTS row in place, or insert both keyed to the new rowid. A
/// constraint violation triggers one repair (delete stale rows by path) and
/// one retry as an insert.
fn upsert_in_tx(tx: &rusqlite::Transaction<'_>, doc: &Document) -> rusqlite::Result<()> {
    let content = sanitize(truncate_chars(&doc.content, MAX_STORED_CONTENT_CHARS));
    let file_name = sanitize(truncate_chars(&doc.file_name, 500));
    let file_type = sanitize(truncate_chars(&doc.file_type, 100));

    use rusqlite::OptionalExtension;
    let existing: Option<i64> = tx
        .query_row("SELECT id FROM documents WHERE file_path = ?1", [&doc.file_path], |row| {
            row.get(0)
        })
        .optional()?;

    let result = match existing {
        Some(id) => {
            tx.execute(
                "UPDATE documents
                 SET content = ?1, file_name = ?2, file_type = ?3, size = ?4,
                     modified_time = ?5, indexed_time = ?6, hash = ?7
                 WHERE file_path = ?8",
                (
                    &content,
                    &file_name,
                    &file_type,
                    doc.size as i64,
                    doc.modified_time,
                    now_secs(),
                    &doc.hash,
                    &doc.file_path,
                ),
            )?;
            tx.execute("DELETE FROM documents_fts WHERE rowid = ?1", [id])?;
            tx.execute(
                "INSERT INTO documents_fts(rowid, file_path, file_name, content, file_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, &doc.file_path, &file_name, &content, &file_type),
            )
            .map(|_| ())
        }
        None => insert_fresh(tx, doc, &content, &file_name, &file_type),
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if is_constraint(&e) => {
            // Stale rows from an interrupted earlier write; repair and retry
            // once as a fresh insert.
            tx.execute(
                "DELETE FROM documents_fts WHERE rowid IN
                     (SELECT id FROM documents WHERE file_path = ?1)",
                [&doc.file_path],
            )?;
            tx.execute("DELETE FROM documents WHERE file_path = ?1", [&doc.file_path])?;
            insert_fresh(tx, doc, &content, &file_name, &file_type)
        }
        Err(e) => Err(e),
    }
}

fn insert_fresh(
    tx: &rusqlite::Transaction<'_>,
    doc: &Document,
    content: &str,
    file_name: &str,
    file_type: &str,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO documents
             (file_path, file_name, content, file_type, size, modified_time, indexed_time, hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        (
            &doc.file_path,
            file_name,
            content,
            file_type,
            doc.size as i64,
            doc.modified_time,
            now_secs(),
            &doc.hash,
        ),
    )?;
    let id = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO documents_fts(rowid, file_path, file_name, content, file_type)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        (id, &doc.file_path, file_name, content, file_type),
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", 20000)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update_and_check(None, "busy_timeout", 120000, |_| Ok(()))?;
    Ok(())
}

fn sanitize(s: &str) -> String {
    if s.contains('\0') {
        s.replace('\0', "")
    } else {
        s.to_string()
    }
}

/// Double-quote a phrase for FTS5, doubling embedded quotes.
fn fts_quote(p: &str) -> String {
    format!("\"{}\"", p.replace('"', "\"\""))
}

fn like_escape(p: &str) -> String {
    p.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _)
        if f.code == ErrorCode::DatabaseBusy || f.code == ErrorCode::DatabaseLocked)
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn write_jitter() -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(u64::from(nanos % 20))
}

fn remove_db_files(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut p = path.as_os_str().to_owned();
        p.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(p));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn doc(path: &str, content: &str) -> Document {
        Document {
            file_path: path.to_string(),
            file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
            content: Arc::from(content),
            file_type: ".txt".to_string(),
            size: content.len() as u64,
            modified_time: 1_700_000_000.0,
            indexed_time: now_secs(),
            hash: format!("{:x}", md5::compute(content.as_bytes())),
        }
    }

    fn temp_store() -> (tempfile::TempDir, ShardStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ShardStore::open(dir.path(), 0).expect("open shard");
        (dir, store)
    }

    #[test]
    fn upsert_then_query_roundtrip() {
        let (_dir, store) = temp_store();
        store.upsert(&doc("/docs/a.txt", "quarterly report with findings")).unwrap();

        let patterns = PatternSet::build("report");
        let hits = store.query(&patterns, 10).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].file_path, "/docs/a.txt");
        assert_eq!(hits[0].matched_by, MatchKind::Phrase);
    }

    #[test]
    fn reupsert_keeps_single_row() {
        let (_dir, store) = temp_store();
        store.upsert(&doc("/docs/a.txt", "first version")).unwrap();
        store.upsert(&doc("/docs/a.txt", "second version")).unwrap();

        let stats = store.stats();
        assert_eq!(stats.document_count, 1);

        let row = store.get_by_path("/docs/a.txt").unwrap().expect("row present");
        assert!(row.1.contains("second"));
    }

    #[test]
    fn reindex_without_change_is_idempotent() {
        let (_dir, store) = temp_store();
        let d = doc("/docs/a.txt", "stable content");
        store.upsert(&d).unwrap();
        let first = store.get_by_path("/docs/a.txt").unwrap().unwrap();
        store.upsert(&d).unwrap();
        let second = store.get_by_path("/docs/a.txt").unwrap().unwrap();
        assert_eq!(first.1, second.1);
        assert_eq!(first.2, second.2);
        assert_eq!(store.stats().document_count, 1);
    }

    #[test]
    fn bulk_upsert_writes_all_documents() {
        let (_dir, store) = temp_store();
        let docs: Vec<Document> =
            (0..60).map(|i| doc(&format!("/docs/f{i}.txt"), &format!("content number {i}"))).collect();
        let written = store.bulk_upsert(&docs).unwrap();
        assert_eq!(written, 60);
        assert_eq!(store.stats().document_count, 60);
    }

    #[test]
    fn japanese_substring_query_hits_trigram_index() {
        let (_dir, store) = temp_store();
        store.upsert(&doc("/docs/jp.txt", "これは検索テストの文書です")).unwrap();

        let hits = store.query(&PatternSet::build("検索テスト"), 10).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].file_path, "/docs/jp.txt");
    }

    #[test]
    fn short_pattern_uses_like_probe() {
        let (_dir, store) = temp_store();
        store.upsert(&doc("/docs/ab.txt", "xyzzy ab plugh")).unwrap();

        let hits = store.query(&PatternSet::build("ab"), 10).unwrap();
        assert!(hits.iter().any(|h| h.matched_by == MatchKind::Like));
    }

    #[test]
    fn truncated_shard_file_rebuilds_empty() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ShardStore::open(dir.path(), 2).unwrap();
            store.upsert(&doc("/docs/a.txt", "will be lost")).unwrap();
        }
        // Corrupt the file outright
        let path = crate::shard::shard_path(dir.path(), 2);
        std::fs::write(&path, b"not a database").unwrap();
        remove_db_files_wal_only(&path);

        let store = ShardStore::open(dir.path(), 2).unwrap();
        assert_eq!(store.stats().document_count, 0);
        store.upsert(&doc("/docs/b.txt", "fresh row")).unwrap();
        assert_eq!(store.stats().document_count, 1);
    }

    fn remove_db_files_wal_only(path: &Path) {
        for suffix in ["-wal", "-shm"] {
            let mut p = path.as_os_str().to_owned();
            p.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(p));
        }
    }

    #[test]
    fn nul_bytes_are_sanitized() {
        let (_dir, store) = temp_store();
        store.upsert(&doc("/docs/nul.txt", "before\0after")).unwrap();
        let row = store.get_by_path("/docs/nul.txt").unwrap().unwrap();
        assert_eq!(row.1, "beforeafter");
    }
}
