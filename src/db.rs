use anyhow::{Context, anyhow};
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::models::{
    GenerationRun, NewPosting, Posting, Project, Source, Sponsor, Stage, StageFilter,
};
use crate::settings::AppSettings;

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data dir {}", parent.display()))?;
        }
        Self::open_at(&path)
    }

    /// Open a database at an explicit path. Multiple connections to the same
    /// file are fine; WAL plus a busy timeout lets them serialize on the
    /// store itself rather than on a process-wide lock.
    pub fn open_at(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> PathBuf {
        // XDG data directory, or current directory as a fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "pursuit") {
            proj_dirs.data_dir().join("pursuit.db")
        } else {
            PathBuf::from("pursuit.db")
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS postings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL CHECK (source IN ('search-api', 'manual', 'webhook', 'visa-feed')),
                dedup_key TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                company TEXT,
                description TEXT,
                url TEXT,
                raw_payload TEXT,
                visa_sponsor INTEGER,
                stage TEXT NOT NULL DEFAULT 'discovered' CHECK (stage IN ('discovered', 'ready', 'applied')),
                discovered_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS sponsors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                normalized_name TEXT NOT NULL UNIQUE,
                route TEXT
            );

            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                summary TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                posting_id INTEGER NOT NULL REFERENCES postings(id),
                status TEXT NOT NULL CHECK (status IN ('idle', 'streaming', 'completed', 'stopped', 'failed')),
                generation INTEGER NOT NULL,
                transcript TEXT NOT NULL DEFAULT '',
                error TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_postings_stage ON postings(stage);
            CREATE INDEX IF NOT EXISTS idx_runs_posting ON runs(posting_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> anyhow::Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='postings'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'pursuit init' first."));
        }
        Ok(())
    }

    // --- Posting operations ---

    pub fn insert_posting(&self, posting: &NewPosting) -> Result<i64> {
        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        self.conn.execute(
            "INSERT INTO postings (source, dedup_key, title, company, description, url, raw_payload,
                                   discovered_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                posting.source.as_str(),
                posting.dedup_key,
                posting.title,
                posting.company,
                posting.description,
                posting.url,
                posting.raw_payload,
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_posting(&self, id: i64) -> Result<Option<Posting>> {
        let result = self.conn.query_row(
            "SELECT id, source, dedup_key, title, company, description, url, raw_payload,
                    visa_sponsor, stage, discovered_at, updated_at
             FROM postings WHERE id = ?1",
            [id],
            Self::row_to_posting,
        );
        match result {
            Ok(posting) => Ok(Some(posting)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn find_posting_by_dedup_key(&self, key: &str) -> Result<Option<Posting>> {
        let result = self.conn.query_row(
            "SELECT id, source, dedup_key, title, company, description, url, raw_payload,
                    visa_sponsor, stage, discovered_at, updated_at
             FROM postings WHERE dedup_key = ?1",
            [key],
            Self::row_to_posting,
        );
        match result {
            Ok(posting) => Ok(Some(posting)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_postings(&self, filter: StageFilter) -> Result<Vec<Posting>> {
        let mut sql = String::from(
            "SELECT id, source, dedup_key, title, company, description, url, raw_payload,
                    visa_sponsor, stage, discovered_at, updated_at
             FROM postings",
        );
        if matches!(filter, StageFilter::Only(_)) {
            sql.push_str(" WHERE stage = ?1");
        }
        sql.push_str(" ORDER BY discovered_at DESC, id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = match filter {
            StageFilter::All => stmt.query_map([], Self::row_to_posting)?,
            StageFilter::Only(stage) => stmt.query_map([stage.as_str()], Self::row_to_posting)?,
        };

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// The only stage-mutation path. Returns false (and changes nothing)
    /// when the stored stage no longer matches `expected`.
    pub fn compare_and_set_stage(&self, id: i64, expected: Stage, new: Stage) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE postings SET stage = ?1, updated_at = datetime('now')
             WHERE id = ?2 AND stage = ?3",
            params![new.as_str(), id, expected.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Sponsor cross-reference result. Deliberately separate from the stage
    /// CAS: the flag never races with transitions.
    pub fn set_visa_sponsor(&self, id: i64, sponsored: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE postings SET visa_sponsor = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![sponsored as i64, id],
        )?;
        Ok(())
    }

    fn row_to_posting(row: &rusqlite::Row) -> rusqlite::Result<Posting> {
        let source_s: String = row.get(1)?;
        let source = Source::parse(&source_s).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown source '{}'", source_s).into(),
            )
        })?;
        let stage_s: String = row.get(9)?;
        let stage = Stage::parse(&stage_s).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                9,
                rusqlite::types::Type::Text,
                format!("unknown stage '{}'", stage_s).into(),
            )
        })?;
        let visa: Option<i64> = row.get(8)?;
        Ok(Posting {
            id: row.get(0)?,
            source,
            dedup_key: row.get(2)?,
            title: row.get(3)?,
            company: row.get(4)?,
            description: row.get(5)?,
            url: row.get(6)?,
            raw_payload: row.get(7)?,
            visa_sponsor: visa.map(|v| v != 0),
            stage,
            discovered_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    // --- Settings operations ---

    /// Missing row yields the defaults; settings are created lazily on the
    /// first save.
    pub fn load_settings(&self) -> Result<AppSettings> {
        let result = self
            .conn
            .query_row("SELECT body FROM settings WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            });
        match result {
            Ok(body) => serde_json::from_str(&body)
                .map_err(|e| PipelineError::InvalidSettings(format!("stored settings unreadable: {}", e))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(AppSettings::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// All-or-nothing: the single settings row is replaced inside one
    /// transaction, never partially written.
    pub fn save_settings(&mut self, settings: &AppSettings) -> Result<()> {
        let body = serde_json::to_string(settings)
            .map_err(|e| PipelineError::InvalidSettings(e.to_string()))?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO settings (id, body) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            [body],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- Project operations ---

    pub fn add_project(&self, name: &str, summary: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO projects (name, summary) VALUES (?1, ?2)",
            params![name, summary],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, summary, created_at FROM projects ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(Project {
                id: row.get(0)?,
                name: row.get(1)?,
                summary: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // --- Sponsor operations ---

    /// Replace the whole sponsor register from a fresh feed snapshot.
    pub fn replace_sponsors(&mut self, records: &[(String, String, Option<String>)]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM sponsors", [])?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO sponsors (name, normalized_name, route) VALUES (?1, ?2, ?3)
                 ON CONFLICT(normalized_name) DO NOTHING",
            )?;
            for (name, normalized, route) in records {
                inserted += stmt.execute(params![name, normalized, route])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn list_sponsors(&self) -> Result<Vec<Sponsor>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, normalized_name, route FROM sponsors ORDER BY normalized_name")?;
        let rows = stmt.query_map([], |row| {
            Ok(Sponsor {
                id: row.get(0)?,
                name: row.get(1)?,
                normalized_name: row.get(2)?,
                route: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn sponsor_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM sponsors", [], |row| row.get(0))?)
    }

    // --- Run operations ---

    pub fn create_run(&self, posting_id: i64, generation: u64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO runs (posting_id, status, generation) VALUES (?1, 'streaming', ?2)",
            params![posting_id, generation as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn finish_run(&self, run: &GenerationRun) -> Result<()> {
        self.conn.execute(
            "UPDATE runs SET status = ?1, transcript = ?2, error = ?3, finished_at = datetime('now')
             WHERE id = ?4",
            params![run.status.as_str(), run.transcript(), run.error, run.id],
        )?;
        Ok(())
    }

    pub fn latest_run(&self, posting_id: i64) -> Result<Option<(i64, String, String)>> {
        let result = self.conn.query_row(
            "SELECT id, status, transcript FROM runs
             WHERE posting_id = ?1 ORDER BY id DESC LIMIT 1",
            [posting_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Detect the UNIQUE(dedup_key) backstop firing under a concurrent insert.
pub fn is_unique_violation(err: &PipelineError) -> bool {
    matches!(
        err,
        PipelineError::Storage(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
pub(crate) fn test_posting(source: Source, key: &str, title: &str) -> NewPosting {
    NewPosting {
        source,
        dedup_key: key.to_string(),
        title: title.to_string(),
        company: Some("Acme".to_string()),
        description: None,
        url: None,
        raw_payload: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;

    #[test]
    fn test_insert_and_get_posting() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .insert_posting(&test_posting(Source::Webhook, "example.com/job/1", "Platform Engineer"))
            .unwrap();

        let posting = db.get_posting(id).unwrap().unwrap();
        assert_eq!(posting.title, "Platform Engineer");
        assert_eq!(posting.source, Source::Webhook);
        assert_eq!(posting.stage, Stage::Discovered);
        assert_eq!(posting.visa_sponsor, None);

        assert!(db.get_posting(9999).unwrap().is_none());
    }

    #[test]
    fn test_dedup_key_is_unique() {
        let db = Database::open_in_memory().unwrap();
        db.insert_posting(&test_posting(Source::Webhook, "example.com/job/1", "First"))
            .unwrap();
        let err = db
            .insert_posting(&test_posting(Source::SearchApi, "example.com/job/1", "Second"))
            .unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[test]
    fn test_list_postings_by_stage_and_all() {
        let db = Database::open_in_memory().unwrap();
        let a = db
            .insert_posting(&test_posting(Source::Manual, "k1", "Job A"))
            .unwrap();
        db.insert_posting(&test_posting(Source::Manual, "k2", "Job B"))
            .unwrap();

        assert!(db.compare_and_set_stage(a, Stage::Discovered, Stage::Ready).unwrap());

        let discovered = db.list_postings(StageFilter::Only(Stage::Discovered)).unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].title, "Job B");

        let ready = db.list_postings(StageFilter::Only(Stage::Ready)).unwrap();
        assert_eq!(ready.len(), 1);

        let all = db.list_postings(StageFilter::All).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_compare_and_set_stage_rejects_wrong_expected() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .insert_posting(&test_posting(Source::Manual, "k1", "Job"))
            .unwrap();

        // stored stage is 'discovered'; expecting 'ready' must not mutate
        assert!(!db.compare_and_set_stage(id, Stage::Ready, Stage::Applied).unwrap());
        assert_eq!(db.get_posting(id).unwrap().unwrap().stage, Stage::Discovered);

        assert!(db.compare_and_set_stage(id, Stage::Discovered, Stage::Ready).unwrap());
        assert_eq!(db.get_posting(id).unwrap().unwrap().stage, Stage::Ready);
    }

    #[test]
    fn test_racing_cas_exactly_one_commits() {
        let dir = std::env::temp_dir().join(format!("pursuit-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cas-race.db");
        let _ = std::fs::remove_file(&path);

        let db = Database::open_at(&path).unwrap();
        db.init().unwrap();
        let id = db
            .insert_posting(&test_posting(Source::Manual, "race", "Job"))
            .unwrap();

        let path2 = path.clone();
        let handle = std::thread::spawn(move || {
            let db2 = Database::open_at(&path2).unwrap();
            db2.compare_and_set_stage(id, Stage::Discovered, Stage::Ready).unwrap()
        });
        let local = db.compare_and_set_stage(id, Stage::Discovered, Stage::Ready).unwrap();
        let remote = handle.join().unwrap();

        // one writer wins, the other observes a clean failure
        assert!(local ^ remote, "exactly one CAS may commit");
        assert_eq!(db.get_posting(id).unwrap().unwrap().stage, Stage::Ready);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_settings_roundtrip_and_default() {
        let mut db = Database::open_in_memory().unwrap();
        assert_eq!(db.load_settings().unwrap(), AppSettings::default());

        let mut settings = AppSettings::default();
        settings.adzuna_app_id = Some("abc".to_string());
        settings.locked_project_ids = vec![3];
        db.save_settings(&settings).unwrap();

        assert_eq!(db.load_settings().unwrap(), settings);
    }

    #[test]
    fn test_run_persistence() {
        let db = Database::open_in_memory().unwrap();
        let posting_id = db
            .insert_posting(&test_posting(Source::Manual, "k1", "Job"))
            .unwrap();
        let run_id = db.create_run(posting_id, 0).unwrap();

        let run = GenerationRun {
            id: run_id,
            posting_id,
            status: RunStatus::Completed,
            generation: 0,
            chunks: vec!["Hello ".to_string(), "world".to_string()],
            error: None,
        };
        db.finish_run(&run).unwrap();

        let (id, status, transcript) = db.latest_run(posting_id).unwrap().unwrap();
        assert_eq!(id, run_id);
        assert_eq!(status, "completed");
        assert_eq!(transcript, "Hello world");
    }

    #[test]
    fn test_replace_sponsors_dedupes_normalized_names() {
        let mut db = Database::open_in_memory().unwrap();
        let records = vec![
            ("Acme Ltd".to_string(), "acme".to_string(), Some("Skilled Worker".to_string())),
            ("ACME LIMITED".to_string(), "acme".to_string(), None),
            ("Globex".to_string(), "globex".to_string(), None),
        ];
        let inserted = db.replace_sponsors(&records).unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(db.sponsor_count().unwrap(), 2);
    }
}
