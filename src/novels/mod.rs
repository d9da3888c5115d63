//! DB-backed novel registry: tenant CRUD and status bookkeeping.

use rand::Rng;
use regex::Regex;
use rusqlite::OptionalExtension;
use serde::Serialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::db::{utc_now, Database};
use crate::storage::{NovelPaths, StorageLayout};
use crate::types::{NovelStatus, Result, RuntimeError, Visibility};

fn slug_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"))
}

fn slugify(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    slug_re()
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

fn validate_novel_id(novel_id: &str) -> Result<&str> {
    let novel_id = novel_id.trim();
    if novel_id.is_empty() {
        return Err(RuntimeError::NotFound("novel id is empty".to_string()));
    }
    if novel_id.contains('/') || novel_id.contains('\\') || novel_id.contains("..") {
        return Err(RuntimeError::NotFound(format!("invalid novel id: {novel_id}")));
    }
    Ok(novel_id)
}

fn json_or_empty(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::Object(Default::default()))
}

/// One novel row.
#[derive(Debug, Clone, Serialize)]
pub struct NovelRecord {
    pub novel_id: String,
    pub owner_user_id: String,
    pub title: String,
    pub visibility: Visibility,
    pub status: NovelStatus,
    pub created_at: String,
    pub updated_at: String,
    pub source: Value,
    pub stats: Value,
    pub last_job_id: String,
    pub last_error: String,
}

impl NovelRecord {
    /// The reduced view exposed on public listings.
    pub fn to_public(&self) -> Value {
        serde_json::json!({
            "novel_id": self.novel_id,
            "title": self.title,
            "status": self.status,
            "updated_at": self.updated_at,
        })
    }
}

/// Novel registry over the state database and the storage layout.
#[derive(Clone)]
pub struct NovelsService {
    db: Database,
    layout: StorageLayout,
}

impl NovelsService {
    pub fn new(db: Database, layout: StorageLayout) -> Self {
        Self { db, layout }
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<NovelRecord> {
        let visibility: String = row.get("visibility")?;
        let status: String = row.get("status")?;
        let source: String = row.get("source_meta")?;
        let stats: String = row.get("stats")?;
        Ok(NovelRecord {
            novel_id: row.get("id")?,
            owner_user_id: row.get("owner_user_id")?,
            title: row.get("title")?,
            visibility: Visibility::from_str(&visibility).unwrap_or(Visibility::Private),
            status: NovelStatus::from_str(&status).unwrap_or(NovelStatus::Created),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            source: json_or_empty(&source),
            stats: json_or_empty(&stats),
            last_job_id: row.get("last_job_id")?,
            last_error: row.get("last_error")?,
        })
    }

    /// Fetch a live (non-deleted) novel.
    pub fn get(&self, novel_id: &str) -> Result<NovelRecord> {
        let novel_id = validate_novel_id(novel_id)?;
        let conn = self.db.connect()?;
        let record = conn
            .query_row(
                "SELECT * FROM novels WHERE id = ?1",
                [novel_id],
                Self::row_to_record,
            )
            .optional()?
            .ok_or_else(|| RuntimeError::NotFound(format!("novel not found: {novel_id}")))?;

        if record.status == NovelStatus::Deleted {
            return Err(RuntimeError::NotFound(format!("novel not found: {novel_id}")));
        }
        Ok(record)
    }

    pub fn list_by_owner(&self, owner_user_id: &str) -> Result<Vec<NovelRecord>> {
        let conn = self.db.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM novels WHERE owner_user_id = ?1 AND status != 'deleted'
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt
            .query_map([owner_user_id], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_public(&self) -> Result<Vec<NovelRecord>> {
        let conn = self.db.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM novels WHERE visibility = 'public' AND status != 'deleted'
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Create an empty novel with a slug-derived globally unique id.
    pub fn create(&self, owner_user_id: &str, title: &str) -> Result<NovelRecord> {
        let owner_user_id = owner_user_id.trim();
        if owner_user_id.is_empty() {
            return Err(RuntimeError::invalid("owner_user_id", "is empty"));
        }

        let title = title.trim();
        let slug = match slugify(title) {
            s if s.is_empty() => "novel".to_string(),
            s => s,
        };

        let conn = self.db.connect()?;
        let mut novel_id = String::new();
        for _ in 0..50 {
            let suffix: u32 = rand::thread_rng().gen_range(0..0xff_ffff);
            let candidate = format!("{slug}-{suffix:06x}");
            let exists: Option<String> = conn
                .query_row("SELECT id FROM novels WHERE id = ?1", [&candidate], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_none() {
                novel_id = candidate;
                break;
            }
        }
        if novel_id.is_empty() {
            return Err(RuntimeError::Internal(
                "failed to allocate novel id".to_string(),
            ));
        }

        let now = utc_now();
        conn.execute(
            "INSERT INTO novels (id, owner_user_id, title, visibility, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'private', 'created', ?4, ?4)",
            (&novel_id, owner_user_id, title, &now),
        )?;
        drop(conn);

        self.layout.ensure_novel_dirs(owner_user_id, &novel_id)?;
        self.get(&novel_id)
    }

    /// Fetch and check ownership in one step.
    pub fn assert_owner(&self, owner_user_id: &str, novel_id: &str) -> Result<NovelRecord> {
        let record = self.get(novel_id)?;
        if record.owner_user_id != owner_user_id {
            return Err(RuntimeError::Forbidden);
        }
        Ok(record)
    }

    pub fn can_read(&self, actor_user_id: Option<&str>, novel_id: &str) -> Result<bool> {
        let record = self.get(novel_id)?;
        if actor_user_id == Some(record.owner_user_id.as_str()) {
            return Ok(true);
        }
        Ok(record.visibility == Visibility::Public)
    }

    pub fn paths(&self, novel_id: &str) -> Result<NovelPaths> {
        let record = self.get(novel_id)?;
        self.layout
            .novel_paths(&record.owner_user_id, &record.novel_id)
    }

    pub fn update(
        &self,
        owner_user_id: &str,
        novel_id: &str,
        title: Option<&str>,
        visibility: Option<Visibility>,
    ) -> Result<NovelRecord> {
        let record = self.assert_owner(owner_user_id, novel_id)?;

        let conn = self.db.connect()?;
        if let Some(title) = title {
            conn.execute(
                "UPDATE novels SET title = ?1, updated_at = ?2 WHERE id = ?3",
                (title.trim(), &utc_now(), &record.novel_id),
            )?;
        }
        if let Some(visibility) = visibility {
            conn.execute(
                "UPDATE novels SET visibility = ?1, updated_at = ?2 WHERE id = ?3",
                (visibility.as_str(), &utc_now(), &record.novel_id),
            )?;
        }
        drop(conn);
        self.get(&record.novel_id)
    }

    /// Record upload metadata and move the novel to `uploaded`.
    pub fn set_uploaded(
        &self,
        owner_user_id: &str,
        novel_id: &str,
        source_meta: &Value,
    ) -> Result<NovelRecord> {
        let record = self.assert_owner(owner_user_id, novel_id)?;
        let conn = self.db.connect()?;
        conn.execute(
            "UPDATE novels SET source_meta = ?1, status = 'uploaded', updated_at = ?2, last_error = '' WHERE id = ?3",
            (source_meta.to_string(), &utc_now(), &record.novel_id),
        )?;
        drop(conn);
        self.get(&record.novel_id)
    }

    pub fn set_processing(&self, novel_id: &str, job_id: &str) -> Result<()> {
        let conn = self.db.connect()?;
        conn.execute(
            "UPDATE novels SET status = 'processing', last_job_id = ?1, updated_at = ?2 WHERE id = ?3",
            (job_id, &utc_now(), validate_novel_id(novel_id)?),
        )?;
        Ok(())
    }

    pub fn set_ready(&self, novel_id: &str, job_id: &str, stats: &Value) -> Result<()> {
        let conn = self.db.connect()?;
        conn.execute(
            "UPDATE novels SET status = 'ready', last_job_id = ?1, stats = ?2, updated_at = ?3, last_error = '' WHERE id = ?4",
            (job_id, stats.to_string(), &utc_now(), validate_novel_id(novel_id)?),
        )?;
        Ok(())
    }

    pub fn set_failed(&self, novel_id: &str, job_id: &str, error: &str) -> Result<()> {
        let conn = self.db.connect()?;
        conn.execute(
            "UPDATE novels SET status = 'failed', last_job_id = ?1, updated_at = ?2, last_error = ?3 WHERE id = ?4",
            (job_id, &utc_now(), error, validate_novel_id(novel_id)?),
        )?;
        Ok(())
    }

    /// Soft delete: keep the row for job history, remove the workspace.
    pub fn delete(
        &self,
        owner_user_id: &str,
        novel_id: &str,
        delete_vector_db: bool,
    ) -> Result<()> {
        let record = self.assert_owner(owner_user_id, novel_id)?;
        let conn = self.db.connect()?;
        conn.execute(
            "UPDATE novels SET status = 'deleted', updated_at = ?1 WHERE id = ?2",
            (&utc_now(), &record.novel_id),
        )?;
        drop(conn);
        self.layout
            .delete_novel(&record.owner_user_id, &record.novel_id, delete_vector_db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn service() -> (tempfile::TempDir, NovelsService, String) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::new(tmp.path().join("state.sqlite3"));
        db.init_schema().unwrap();

        let layout = StorageLayout::new(&StorageConfig {
            data_root: tmp.path().join("data"),
            vector_db_root: tmp.path().join("vector_db"),
            logs_root: tmp.path().join("logs"),
            database_path: tmp.path().join("state.sqlite3"),
        });

        // Seed an owner so foreign keys hold.
        let conn = db.connect().unwrap();
        conn.execute(
            "INSERT INTO users (id, username, password_hash, created_at) VALUES ('u1', 'owner', 'x', ?1)",
            [utc_now()],
        )
        .unwrap();

        (tmp, NovelsService::new(db, layout), "u1".to_string())
    }

    #[test]
    fn slugify_produces_url_safe_ids() {
        assert_eq!(slugify("My Great Novel!"), "my-great-novel");
        assert_eq!(slugify("  大奉打更人  "), "");
    }

    #[test]
    fn create_and_fetch() {
        let (_tmp, novels, owner) = service();
        let record = novels.create(&owner, "Test Novel").unwrap();
        assert!(record.novel_id.starts_with("test-novel-"));
        assert_eq!(record.status, NovelStatus::Created);
        assert_eq!(record.visibility, Visibility::Private);

        let fetched = novels.get(&record.novel_id).unwrap();
        assert_eq!(fetched.title, "Test Novel");

        // Workspace directories were created alongside.
        assert!(novels.paths(&record.novel_id).unwrap().chapters_dir.is_dir());
    }

    #[test]
    fn only_owner_may_mutate() {
        let (_tmp, novels, owner) = service();
        let record = novels.create(&owner, "Mine").unwrap();

        assert!(matches!(
            novels.update("intruder", &record.novel_id, Some("Stolen"), None),
            Err(RuntimeError::Forbidden)
        ));
    }

    #[test]
    fn visibility_controls_reads() {
        let (_tmp, novels, owner) = service();
        let record = novels.create(&owner, "Secret").unwrap();

        assert!(novels.can_read(Some(&owner), &record.novel_id).unwrap());
        assert!(!novels.can_read(Some("other"), &record.novel_id).unwrap());
        assert!(!novels.can_read(None, &record.novel_id).unwrap());

        novels
            .update(&owner, &record.novel_id, None, Some(Visibility::Public))
            .unwrap();
        assert!(novels.can_read(None, &record.novel_id).unwrap());
        assert_eq!(novels.list_public().unwrap().len(), 1);
    }

    #[test]
    fn soft_delete_hides_the_novel() {
        let (_tmp, novels, owner) = service();
        let record = novels.create(&owner, "Gone").unwrap();
        novels.delete(&owner, &record.novel_id, true).unwrap();

        assert!(matches!(
            novels.get(&record.novel_id),
            Err(RuntimeError::NotFound(_))
        ));
        assert!(novels.list_by_owner(&owner).unwrap().is_empty());
    }

    #[test]
    fn status_transitions_record_job_context() {
        let (_tmp, novels, owner) = service();
        let record = novels.create(&owner, "Busy").unwrap();

        novels.set_processing(&record.novel_id, "job-1").unwrap();
        assert_eq!(novels.get(&record.novel_id).unwrap().status, NovelStatus::Processing);

        novels
            .set_ready(&record.novel_id, "job-1", &serde_json::json!({"total_chapters": 3}))
            .unwrap();
        let ready = novels.get(&record.novel_id).unwrap();
        assert_eq!(ready.status, NovelStatus::Ready);
        assert_eq!(ready.stats["total_chapters"], 3);
        assert_eq!(ready.last_job_id, "job-1");

        novels.set_failed(&record.novel_id, "job-2", "boom").unwrap();
        let failed = novels.get(&record.novel_id).unwrap();
        assert_eq!(failed.status, NovelStatus::Failed);
        assert_eq!(failed.last_error, "boom");
    }
}
