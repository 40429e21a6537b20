//! Crontab storage over the encrypted SQLite container
//!
//! Scheduled actions live in `crontab.sqz` with their five cron spec
//! fields, their action and the persisted `next_run` timestamp. The
//! next-firing-time computation itself is an external collaborator:
//! anything implementing [`SchedulePlanner`] (given the five fields and
//! "now", yield the next firing time) drives rescheduling.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{ApiError, AppResult};
use crate::storage::sqlite_zip::SqliteZip;

/// External contract: compute the next firing time of a cron rule
pub trait SchedulePlanner: Send + Sync {
    /// `fields` are the five crontab fields (minute, hour, day-of-month,
    /// month, weekday); returns the next firing time strictly after `now`,
    /// or `None` for a rule that never fires.
    fn next_run(&self, fields: &[String; 5], now: i64) -> Option<i64>;
}

/// One scheduled action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrontabEntry {
    pub id: String,
    pub next_run: i64,
    /// minute, hour, day-of-month, month, weekday
    pub fields: [String; 5],
    pub action: String,
    pub context: Option<String>,
    /// Where this entry came from (config, RPC, ...)
    pub source: Option<String>,
}

/// The schedule store
pub struct Crontab {
    db: Arc<SqliteZip>,
}

impl Crontab {
    /// Open `crontab.sqz` (encrypted) or `crontab.sq3` (plain) in a
    /// data directory
    pub fn open(data_dir: &Path, keys: &[[u8; 32]]) -> AppResult<Self> {
        let ext = if keys.is_empty() { "sq3" } else { "sqz" };
        let db = SqliteZip::open(&data_dir.join(format!("crontab.{ext}")), keys)?;
        let crontab = Self { db: Arc::new(db) };
        crontab.configure_db()?;
        Ok(crontab)
    }

    /// Container handle, for background saving and shutdown
    pub fn database(&self) -> Arc<SqliteZip> {
        Arc::clone(&self.db)
    }

    fn configure_db(&self) -> AppResult<()> {
        self.db.execute(
            "CREATE TABLE IF NOT EXISTS crontab(
                id           TEXT PRIMARY KEY,
                next_run     INTEGER,
                minutes      TEXT,
                hours        TEXT,
                month_days   TEXT,
                months       TEXT,
                weekdays     TEXT,
                action       TEXT,
                context      TEXT,
                source       TEXT)",
            &[],
        )?;
        Ok(())
    }

    /// Insert or replace an entry, computing its first firing time
    pub fn schedule(
        &self,
        mut entry: CrontabEntry,
        planner: &dyn SchedulePlanner,
        now: i64,
    ) -> AppResult<CrontabEntry> {
        entry.next_run = planner
            .next_run(&entry.fields, now)
            .ok_or_else(|| ApiError::invalid("schedule rule never fires"))?;
        self.db.execute(
            "INSERT OR REPLACE INTO crontab(
                id, next_run, minutes, hours, month_days, months, weekdays,
                action, context, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            &[
                &entry.id,
                &entry.next_run,
                &entry.fields[0],
                &entry.fields[1],
                &entry.fields[2],
                &entry.fields[3],
                &entry.fields[4],
                &entry.action,
                &entry.context,
                &entry.source,
            ],
        )?;
        debug!(id = entry.id, next_run = entry.next_run, "scheduled");
        Ok(entry)
    }

    pub fn remove(&self, id: &str) -> AppResult<bool> {
        Ok(self.db.execute("DELETE FROM crontab WHERE id = ?1", &[&id])? > 0)
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CrontabEntry> {
        Ok(CrontabEntry {
            id: row.get(0)?,
            next_run: row.get(1)?,
            fields: [
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ],
            action: row.get(7)?,
            context: row.get(8)?,
            source: row.get(9)?,
        })
    }

    const COLUMNS: &'static str =
        "id, next_run, minutes, hours, month_days, months, weekdays, action, context, source";

    /// Every entry, soonest first
    pub fn list(&self) -> AppResult<Vec<CrontabEntry>> {
        self.db.query(
            &format!("SELECT {} FROM crontab ORDER BY next_run, id", Self::COLUMNS),
            &[],
            Self::row_to_entry,
        )
    }

    /// Entries due at or before `now`
    pub fn due(&self, now: i64) -> AppResult<Vec<CrontabEntry>> {
        self.db.query(
            &format!(
                "SELECT {} FROM crontab WHERE next_run <= ?1 ORDER BY next_run, id",
                Self::COLUMNS
            ),
            &[&now],
            Self::row_to_entry,
        )
    }

    /// Move a fired entry to its next run time
    ///
    /// Entries whose rule never fires again are removed.
    pub fn reschedule(
        &self,
        id: &str,
        planner: &dyn SchedulePlanner,
        now: i64,
    ) -> AppResult<Option<i64>> {
        let entries = self.db.query(
            &format!("SELECT {} FROM crontab WHERE id = ?1", Self::COLUMNS),
            &[&id],
            Self::row_to_entry,
        )?;
        let Some(entry) = entries.into_iter().next() else {
            return Err(ApiError::NotFound(format!("no schedule entry '{id}'")));
        };
        match planner.next_run(&entry.fields, now) {
            Some(next) => {
                self.db.execute(
                    "UPDATE crontab SET next_run = ?1 WHERE id = ?2",
                    &[&next, &id],
                )?;
                Ok(Some(next))
            }
            None => {
                self.remove(id)?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{Crontab, CrontabEntry, SchedulePlanner};
    use crate::crypto::aes::make_aes_key;

    /// Fixed-interval planner standing in for the external cron parser
    struct EveryHour;

    impl SchedulePlanner for EveryHour {
        fn next_run(&self, _fields: &[String; 5], now: i64) -> Option<i64> {
            Some(now + 3600)
        }
    }

    struct NeverAgain;

    impl SchedulePlanner for NeverAgain {
        fn next_run(&self, _fields: &[String; 5], _now: i64) -> Option<i64> {
            None
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("nestmail-cron-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("temp dir created");
        dir
    }

    fn entry(id: &str) -> CrontabEntry {
        CrontabEntry {
            id: id.to_owned(),
            next_run: 0,
            fields: [
                "0".to_owned(),
                "*".to_owned(),
                "*".to_owned(),
                "*".to_owned(),
                "*".to_owned(),
            ],
            action: "fetch_mail".to_owned(),
            context: Some("Context 0".to_owned()),
            source: None,
        }
    }

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn schedule_due_reschedule_cycle() {
        let dir = temp_dir("cycle");
        let crontab = Crontab::open(&dir, &[]).expect("open succeeds");

        crontab
            .schedule(entry("hourly"), &EveryHour, NOW)
            .expect("schedule succeeds");
        assert!(crontab.due(NOW).expect("query succeeds").is_empty());
        let due = crontab.due(NOW + 3600).expect("query succeeds");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].action, "fetch_mail");

        let next = crontab
            .reschedule("hourly", &EveryHour, NOW + 3600)
            .expect("reschedule succeeds");
        assert_eq!(next, Some(NOW + 7200));
        assert!(crontab.due(NOW + 3600).expect("query succeeds").is_empty());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn dead_rules_are_removed_on_reschedule() {
        let dir = temp_dir("dead");
        let crontab = Crontab::open(&dir, &[]).expect("open succeeds");
        crontab
            .schedule(entry("once"), &EveryHour, NOW)
            .expect("schedule succeeds");
        assert_eq!(
            crontab
                .reschedule("once", &NeverAgain, NOW)
                .expect("reschedule succeeds"),
            None
        );
        assert!(crontab.list().expect("query succeeds").is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn encrypted_schedule_survives_reload() {
        let dir = temp_dir("encrypted");
        let keys = [make_aes_key(b"cron key")];
        {
            let crontab = Crontab::open(&dir, &keys).expect("open succeeds");
            crontab
                .schedule(entry("persisted"), &EveryHour, NOW)
                .expect("schedule succeeds");
            crontab.database().save().expect("save succeeds");
        }
        let crontab = Crontab::open(&dir, &keys).expect("reopen succeeds");
        let entries = crontab.list().expect("query succeeds");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "persisted");
        let _ = std::fs::remove_dir_all(dir);
    }
}
