//! Encrypted SQLite container: a ZIP-packaged in-memory database
//!
//! Small stateful stores (Autocrypt peers, the cron schedule) live in an
//! in-memory SQLite database whose contents are persisted as a SQL dump
//! inside a ZIP file. With encryption keys present the dump is sealed with
//! the AES envelope before it enters the archive (`.sqz`); without keys a
//! plain on-disk database is used instead (`.sq3`).
//!
//! A background saver flushes the in-memory database periodically, rate
//! limited so bursts of writes do not thrash the disk.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::crypto::aes::{NonceFactory, open_any, seal};
use crate::errors::{ApiError, AppResult};

/// Archive member carrying the SQL dump
const MEMBER_NAME: &str = "sqlite.sql";

/// How often the background saver checks for changes
const SAVE_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Minimum spacing between two background saves
const SAVE_MIN_INTERVAL: Duration = Duration::from_secs(60);

/// ZIP-packaged, optionally encrypted SQLite database
pub struct SqliteZip {
    path: PathBuf,
    in_memory: bool,
    conn: Mutex<Connection>,
    keys: Vec<[u8; 32]>,
    nonces: NonceFactory,
    /// Monotonic write counter, compared against `saved_at`
    changes: AtomicU64,
    saved_at: AtomicU64,
    saver_running: AtomicBool,
    closed: AtomicBool,
}

impl SqliteZip {
    /// Open a container; the file extension selects the storage mode
    ///
    /// `.sqz` is an in-memory database loaded from (and saved to) the ZIP
    /// container; `.sq3` is a plain SQLite file for unencrypted setups.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for unknown extensions; `Integrity` when none of
    /// the provided keys decrypt an existing container.
    pub fn open(path: &Path, keys: &[[u8; 32]]) -> AppResult<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let (in_memory, conn) = match ext {
            "sq3" => (
                false,
                Connection::open(path)
                    .map_err(|e| ApiError::internal(format!("sqlite open failed: {e}")))?,
            ),
            "sqz" => {
                let conn = Connection::open_in_memory()
                    .map_err(|e| ApiError::internal(format!("sqlite open failed: {e}")))?;
                if path.exists() {
                    let dump = read_container(path, keys)?;
                    conn.execute_batch(&dump)
                        .map_err(|e| ApiError::Integrity(format!("bad container dump: {e}")))?;
                }
                (true, conn)
            }
            other => {
                return Err(ApiError::invalid(format!(
                    "unknown container extension '{other}'"
                )));
            }
        };

        info!(
            path = %path.display(),
            encrypted = !keys.is_empty(),
            in_memory,
            "opened sqlite container"
        );
        Ok(Self {
            path: path.to_owned(),
            in_memory,
            conn: Mutex::new(conn),
            keys: keys.to_vec(),
            nonces: NonceFactory::new(),
            changes: AtomicU64::new(0),
            saved_at: AtomicU64::new(0),
            saver_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Execute a statement, counting it towards the dirty state
    pub fn execute(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> AppResult<usize> {
        let conn = self.conn.lock();
        let n = conn
            .execute(sql, params)
            .map_err(|e| ApiError::internal(format!("sqlite execute failed: {e}")))?;
        self.changes.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }

    /// Run a query, mapping each row through `f`
    pub fn query<T>(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
        mut f: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> AppResult<Vec<T>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| ApiError::internal(format!("sqlite prepare failed: {e}")))?;
        let rows = stmt
            .query_map(params, |row| f(row))
            .map_err(|e| ApiError::internal(format!("sqlite query failed: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| ApiError::internal(format!("sqlite row failed: {e}")))?);
        }
        Ok(out)
    }

    /// Persist the in-memory database if it changed since the last save
    ///
    /// Returns `true` if a save was written. On-disk (`.sq3`) containers
    /// always return `false`: SQLite already persisted them.
    pub fn save(&self) -> AppResult<bool> {
        if !self.in_memory || self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        let changes = self.changes.load(Ordering::Relaxed);
        if changes == self.saved_at.load(Ordering::Relaxed) {
            return Ok(false);
        }

        let dump = {
            let conn = self.conn.lock();
            dump_sql(&conn)?
        };
        self.saved_at.store(changes, Ordering::Relaxed);

        let body = match self.keys.last() {
            Some(newest) => seal(newest, &self.nonces, dump.as_bytes())?.into_bytes(),
            None => dump.into_bytes(),
        };

        let file = File::create(&self.path)?;
        let mut archive = ZipWriter::new(file);
        archive
            .start_file(
                MEMBER_NAME,
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
            )
            .map_err(|e| ApiError::internal(format!("zip write failed: {e}")))?;
        archive.write_all(&body)?;
        archive
            .finish()
            .map_err(|e| ApiError::internal(format!("zip finish failed: {e}")))?;

        debug!(path = %self.path.display(), "saved sqlite container");
        Ok(true)
    }

    /// Spawn the periodic background saver for this container
    ///
    /// Runs until [`SqliteZip::close`] is called. Only one saver may run
    /// per container; a second call is an error. No-op (returning `false`)
    /// for on-disk containers.
    pub fn start_background_saver(self: &Arc<Self>) -> AppResult<bool> {
        if !self.in_memory {
            return Ok(false);
        }
        if self.saver_running.swap(true, Ordering::AcqRel) {
            return Err(ApiError::internal(format!(
                "container saver already running for {}",
                self.path.display()
            )));
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!(path = %this.path.display(), "started container background saver");
            let mut next_allowed = tokio::time::Instant::now();
            while !this.closed.load(Ordering::Acquire) {
                tokio::time::sleep(SAVE_CHECK_INTERVAL).await;
                if tokio::time::Instant::now() < next_allowed {
                    continue;
                }
                let saver = Arc::clone(&this);
                let saved =
                    tokio::task::spawn_blocking(move || saver.save()).await;
                match saved {
                    Ok(Ok(true)) => {
                        next_allowed = tokio::time::Instant::now() + SAVE_MIN_INTERVAL;
                    }
                    Ok(Ok(false)) => {}
                    Ok(Err(err)) => warn!(error = %err, "container background save failed"),
                    Err(err) => warn!(error = %err, "container saver task failed"),
                }
            }
            this.saver_running.store(false, Ordering::Release);
        });
        Ok(true)
    }

    /// Final save and shutdown; further saves become no-ops
    pub fn close(&self) -> AppResult<bool> {
        let saved = self.save()?;
        self.closed.store(true, Ordering::Release);
        Ok(saved)
    }
}

/// Load and decrypt the SQL dump from an existing container file
fn read_container(path: &Path, keys: &[[u8; 32]]) -> AppResult<String> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| ApiError::Integrity(format!("bad container archive: {e}")))?;
    let mut member = archive
        .by_name(MEMBER_NAME)
        .map_err(|_| ApiError::Integrity("container member missing".to_owned()))?;
    let mut body = String::new();
    member.read_to_string(&mut body)?;

    if keys.is_empty() {
        Ok(body)
    } else {
        let plain = open_any(keys, &body)?;
        String::from_utf8(plain)
            .map_err(|_| ApiError::Integrity("container dump is not UTF-8".to_owned()))
    }
}

/// Dump every user table as executable SQL
///
/// Schema rows come from `sqlite_master`; data rows are rendered as
/// INSERT statements with properly quoted literals. Good enough for the
/// small peer/schedule tables this container exists for.
fn dump_sql(conn: &Connection) -> AppResult<String> {
    let mut out = String::from("BEGIN;\n");

    let mut schema_stmt = conn
        .prepare(
            "SELECT name, sql FROM sqlite_master
              WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .map_err(|e| ApiError::internal(format!("sqlite dump failed: {e}")))?;
    let tables: Vec<(String, String)> = schema_stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(|e| ApiError::internal(format!("sqlite dump failed: {e}")))?
        .collect::<rusqlite::Result<_>>()
        .map_err(|e| ApiError::internal(format!("sqlite dump failed: {e}")))?;

    for (table, create_sql) in tables {
        out.push_str(&create_sql);
        out.push_str(";\n");

        let mut rows_stmt = conn
            .prepare(&format!("SELECT * FROM \"{table}\""))
            .map_err(|e| ApiError::internal(format!("sqlite dump failed: {e}")))?;
        let column_count = rows_stmt.column_count();
        let mut rows = rows_stmt
            .query([])
            .map_err(|e| ApiError::internal(format!("sqlite dump failed: {e}")))?;
        while let Some(row) = rows
            .next()
            .map_err(|e| ApiError::internal(format!("sqlite dump failed: {e}")))?
        {
            let mut literals = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value = row
                    .get_ref(i)
                    .map_err(|e| ApiError::internal(format!("sqlite dump failed: {e}")))?;
                literals.push(sql_literal(value));
            }
            out.push_str(&format!(
                "INSERT INTO \"{table}\" VALUES({});\n",
                literals.join(",")
            ));
        }
    }

    out.push_str("COMMIT;\n");
    Ok(out)
}

fn sql_literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_owned(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => format!(
            "'{}'",
            String::from_utf8_lossy(t).replace('\'', "''")
        ),
        ValueRef::Blob(b) => {
            let mut hex = String::with_capacity(b.len() * 2 + 3);
            hex.push_str("X'");
            for byte in b {
                hex.push_str(&format!("{byte:02x}"));
            }
            hex.push('\'');
            hex
        }
    }
}
