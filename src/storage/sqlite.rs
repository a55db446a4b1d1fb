//! SQLite-backed implementation of the analysis store.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::storage::schema::{initialize_schema, is_initialized};
use crate::storage::{ScoredSymbol, StoredEvent, SymbolRecord, EMBEDDING_DIM};

/// SQLite-backed store for the symbol index, explanation cache, event log,
/// and session state.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::storage(e.to_string()))?;
        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::storage(e.to_string()))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {e}")))?;
        f(&conn).map_err(|e| Error::storage(e.to_string()))
    }

    // ==================== Symbol index ====================

    /// Insert one symbol record.
    pub fn insert_symbol(&self, record: &SymbolRecord) -> Result<()> {
        if let Some(embedding) = &record.embedding {
            if embedding.len() != EMBEDDING_DIM {
                return Err(Error::storage(format!(
                    "embedding has {} dims, expected {EMBEDDING_DIM}",
                    embedding.len()
                )));
            }
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO code_index (path, symbol, kind, line_start, line_end, language, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.path,
                    record.symbol,
                    record.kind,
                    record.line_start,
                    record.line_end,
                    record.language,
                    record.embedding.as_ref().map(|e| encode_embedding(e)),
                ],
            )?;
            Ok(())
        })
    }

    /// Insert many symbol records in one transaction.
    pub fn insert_symbols(&self, records: &[SymbolRecord]) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {e}")))?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::storage(e.to_string()))?;
        for record in records {
            tx.execute(
                "INSERT INTO code_index (path, symbol, kind, line_start, line_end, language, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.path,
                    record.symbol,
                    record.kind,
                    record.line_start,
                    record.line_end,
                    record.language,
                    record.embedding.as_ref().map(|e| encode_embedding(e)),
                ],
            )
            .map_err(|e| Error::storage(e.to_string()))?;
        }
        tx.commit().map_err(|e| Error::storage(e.to_string()))
    }

    fn symbol_query(
        &self,
        where_clause: &str,
        binds: &[&dyn rusqlite::ToSql],
        limit: usize,
    ) -> Result<Vec<SymbolRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT path, symbol, kind, line_start, line_end, language, embedding
                 FROM code_index WHERE {where_clause}
                 ORDER BY path, line_start LIMIT {limit}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(binds, row_to_symbol)?;
            rows.collect()
        })
    }

    /// Exact symbol lookup with optional path-prefix scope and kind filter.
    pub fn symbols_exact(
        &self,
        name: &str,
        scope: Option<&str>,
        kind: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SymbolRecord>> {
        let scope_pattern = scope.map(prefix_pattern);
        match (&scope_pattern, kind) {
            (Some(scope), Some(kind)) => self.symbol_query(
                "symbol = ?1 AND path LIKE ?2 ESCAPE '\\' AND kind = ?3",
                &[&name, scope, &kind],
                limit,
            ),
            (Some(scope), None) => self.symbol_query(
                "symbol = ?1 AND path LIKE ?2 ESCAPE '\\'",
                &[&name, scope],
                limit,
            ),
            (None, Some(kind)) => {
                self.symbol_query("symbol = ?1 AND kind = ?2", &[&name, &kind], limit)
            }
            (None, None) => self.symbol_query("symbol = ?1", &[&name], limit),
        }
    }

    /// Prefix symbol lookup with optional path-prefix scope and kind filter.
    pub fn symbols_prefix(
        &self,
        prefix: &str,
        scope: Option<&str>,
        kind: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SymbolRecord>> {
        let name_pattern = prefix_pattern(prefix);
        let scope_pattern = scope.map(prefix_pattern);
        match (&scope_pattern, kind) {
            (Some(scope), Some(kind)) => self.symbol_query(
                "symbol LIKE ?1 ESCAPE '\\' AND path LIKE ?2 ESCAPE '\\' AND kind = ?3",
                &[&name_pattern, scope, &kind],
                limit,
            ),
            (Some(scope), None) => self.symbol_query(
                "symbol LIKE ?1 ESCAPE '\\' AND path LIKE ?2 ESCAPE '\\'",
                &[&name_pattern, scope],
                limit,
            ),
            (None, Some(kind)) => self.symbol_query(
                "symbol LIKE ?1 ESCAPE '\\' AND kind = ?2",
                &[&name_pattern, &kind],
                limit,
            ),
            (None, None) => self.symbol_query(
                "symbol LIKE ?1 ESCAPE '\\'",
                &[&name_pattern],
                limit,
            ),
        }
    }

    /// All symbols defined in a file.
    pub fn file_symbols(&self, path: &str, limit: usize) -> Result<Vec<SymbolRecord>> {
        self.symbol_query("path = ?1", &[&path], limit)
    }

    /// Import records for a file (kind = "import").
    pub fn imports_of(&self, path: &str, limit: usize) -> Result<Vec<SymbolRecord>> {
        self.symbol_query("path = ?1 AND kind = 'import'", &[&path], limit)
    }

    /// Files importing the given module (kind = "import", symbol match).
    pub fn importers_of(&self, module: &str, limit: usize) -> Result<Vec<SymbolRecord>> {
        self.symbol_query("kind = 'import' AND symbol = ?1", &[&module], limit)
    }

    /// Cosine-similarity search over indexed embeddings.
    ///
    /// Scans rows with embeddings, optionally restricted to a path-prefix
    /// scope, and returns the top `k` by score.
    pub fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ScoredSymbol>> {
        if query.len() != EMBEDDING_DIM {
            return Err(Error::storage(format!(
                "query embedding has {} dims, expected {EMBEDDING_DIM}",
                query.len()
            )));
        }
        let scope_pattern = scope.map(prefix_pattern);
        let mut scored: Vec<ScoredSymbol> = self.with_conn(|conn| {
            let (sql, binds): (&str, Vec<&dyn rusqlite::ToSql>) = match &scope_pattern {
                Some(pattern) => (
                    "SELECT path, symbol, kind, line_start, line_end, language, embedding
                     FROM code_index WHERE embedding IS NOT NULL AND path LIKE ?1 ESCAPE '\\'",
                    vec![pattern],
                ),
                None => (
                    "SELECT path, symbol, kind, line_start, line_end, language, embedding
                     FROM code_index WHERE embedding IS NOT NULL",
                    vec![],
                ),
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(binds.as_slice(), row_to_symbol)?;
            let mut scored = Vec::new();
            for row in rows {
                let record = row?;
                if let Some(embedding) = &record.embedding {
                    let score = cosine_similarity(query, embedding);
                    scored.push(ScoredSymbol { record, score });
                }
            }
            Ok(scored)
        })?;

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    // ==================== Explanation cache ====================

    /// Store an explanation under its fingerprint, replacing any prior entry.
    pub fn put_understanding(
        &self,
        fingerprint: &str,
        explanation: &str,
        ttl_seconds: i64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO code_understanding (fingerprint, explanation, created_at, ttl_seconds)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                     explanation = excluded.explanation,
                     created_at = excluded.created_at,
                     ttl_seconds = excluded.ttl_seconds,
                     hit_count = 0",
                params![fingerprint, explanation, Utc::now().to_rfc3339(), ttl_seconds],
            )?;
            Ok(())
        })
    }

    /// Fetch a cached explanation, honouring TTL and counting the hit.
    ///
    /// Expired entries are deleted and reported as absent.
    pub fn get_understanding(&self, fingerprint: &str) -> Result<Option<String>> {
        let row: Option<(String, String, i64)> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT explanation, created_at, ttl_seconds
                 FROM code_understanding WHERE fingerprint = ?1",
                params![fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
        })?;

        let Some((explanation, created_at, ttl_seconds)) = row else {
            return Ok(None);
        };

        let created = chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| Error::storage(format!("bad timestamp in cache: {e}")))?;
        let age = Utc::now().signed_duration_since(created);
        if age.num_seconds() > ttl_seconds {
            self.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM code_understanding WHERE fingerprint = ?1",
                    params![fingerprint],
                )
            })?;
            return Ok(None);
        }

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE code_understanding SET hit_count = hit_count + 1 WHERE fingerprint = ?1",
                params![fingerprint],
            )
        })?;
        Ok(Some(explanation))
    }

    // ==================== Event log ====================

    /// Append one event to the request's trail.
    pub fn append_event(
        &self,
        request_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let payload = serde_json::to_string(payload)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO code_analysis_events (request_id, timestamp, event_type, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                params![request_id, Utc::now().to_rfc3339(), event_type, payload],
            )?;
            Ok(())
        })
    }

    /// All events for a request, in append order.
    pub fn events_for(&self, request_id: &str) -> Result<Vec<StoredEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, timestamp, event_type, payload
                 FROM code_analysis_events WHERE request_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![request_id], |row| {
                let timestamp: String = row.get(1)?;
                let payload: String = row.get(3)?;
                Ok(StoredEvent {
                    request_id: row.get(0)?,
                    timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    event_type: row.get(2)?,
                    payload: serde_json::from_str(&payload)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?;
            rows.collect()
        })
    }

    // ==================== Session state ====================

    /// Persist the serialized working-memory snapshot for a session.
    pub fn save_session(&self, session_id: &str, state: &serde_json::Value) -> Result<()> {
        let state = serde_json::to_string(state)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_state (session_id, state, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET
                     state = excluded.state,
                     updated_at = excluded.updated_at",
                params![session_id, state, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Load the serialized working-memory snapshot for a session.
    pub fn load_session(&self, session_id: &str) -> Result<Option<serde_json::Value>> {
        let state: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT state FROM session_state WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
        })?;
        match state {
            Some(state) => Ok(Some(serde_json::from_str(&state)?)),
            None => Ok(None),
        }
    }
}

fn row_to_symbol(row: &Row<'_>) -> rusqlite::Result<SymbolRecord> {
    let embedding: Option<Vec<u8>> = row.get(6)?;
    Ok(SymbolRecord {
        path: row.get(0)?,
        symbol: row.get(1)?,
        kind: row.get(2)?,
        line_start: row.get(3)?,
        line_end: row.get(4)?,
        language: row.get(5)?,
        embedding: embedding.map(|blob| decode_embedding(&blob)),
    })
}

fn prefix_pattern(prefix: &str) -> String {
    // Escape LIKE wildcards so a literal prefix stays literal
    let escaped = prefix.replace('%', "\\%").replace('_', "\\_");
    format!("{escaped}%")
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
