//! Deterministic filesystem layout for tenant-scoped storage.
//!
//! ```text
//! data/users/{user_id}/novels/{novel_id}/{input,chapters,scenes,annotated,profiles}/
//! data/users/{user_id}/sessions/{global | novels/{novel_id}}/
//! data/guests/{guest_id}/sessions/…
//! vector_db/users/{user_id}/{novel_id}/
//! logs/users/{user_id}/novels/{novel_id}/
//! ```

use std::path::{Path, PathBuf};

use crate::config::StorageConfig;
use crate::types::{Result, RuntimeError};

/// Resolved directories for one novel workspace.
#[derive(Debug, Clone)]
pub struct NovelPaths {
    pub novel_dir: PathBuf,
    pub input_dir: PathBuf,
    pub source_file: PathBuf,
    pub chapters_dir: PathBuf,
    pub scenes_dir: PathBuf,
    pub annotated_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub vector_db_path: PathBuf,
    pub log_dir: PathBuf,
}

impl NovelPaths {
    /// Directories that must exist before a pipeline run.
    pub fn all_dirs(&self) -> [&Path; 7] {
        [
            &self.input_dir,
            &self.chapters_dir,
            &self.scenes_dir,
            &self.annotated_dir,
            &self.profiles_dir,
            &self.vector_db_path,
            &self.log_dir,
        ]
    }
}

fn validate_id<'a>(value: &'a str, name: &str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(RuntimeError::invalid(name, "is empty"));
    }
    if value.contains('/') || value.contains('\\') || value.contains("..") {
        return Err(RuntimeError::invalid(name, "contains path separators"));
    }
    Ok(value)
}

fn is_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

/// Mapping from (owner, novel, guest) identifiers to on-disk directories.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    data_root: PathBuf,
    vector_db_root: PathBuf,
    logs_root: PathBuf,
}

impl StorageLayout {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            data_root: config.data_root.clone(),
            vector_db_root: config.vector_db_root.clone(),
            logs_root: config.logs_root.clone(),
        }
    }

    pub fn user_root(&self, user_id: &str) -> Result<PathBuf> {
        let user_id = validate_id(user_id, "user_id")?;
        Ok(self.data_root.join("users").join(user_id))
    }

    pub fn guest_root(&self, guest_id: &str) -> Result<PathBuf> {
        let guest_id = validate_id(guest_id, "guest_id")?;
        Ok(self.data_root.join("guests").join(guest_id))
    }

    pub fn novel_paths(&self, owner_user_id: &str, novel_id: &str) -> Result<NovelPaths> {
        let owner = validate_id(owner_user_id, "owner_user_id")?;
        let novel = validate_id(novel_id, "novel_id")?;

        let novel_dir = self.user_root(owner)?.join("novels").join(novel);
        let input_dir = novel_dir.join("input");

        Ok(NovelPaths {
            source_file: input_dir.join("source.txt"),
            chapters_dir: novel_dir.join("chapters"),
            scenes_dir: novel_dir.join("scenes"),
            annotated_dir: novel_dir.join("annotated"),
            profiles_dir: novel_dir.join("profiles"),
            vector_db_path: self.vector_db_root.join("users").join(owner).join(novel),
            log_dir: self
                .logs_root
                .join("users")
                .join(owner)
                .join("novels")
                .join(novel),
            input_dir,
            novel_dir,
        })
    }

    /// Session directory for a (user|guest) × optional novel scope.
    pub fn sessions_dir(
        &self,
        user_id: Option<&str>,
        guest_id: Option<&str>,
        novel_id: Option<&str>,
    ) -> Result<PathBuf> {
        let base = match (user_id, guest_id) {
            (Some(uid), _) => self.user_root(uid)?.join("sessions"),
            (None, Some(gid)) => self.guest_root(gid)?.join("sessions"),
            (None, None) => {
                return Err(RuntimeError::invalid(
                    "session scope",
                    "requires a user or guest id",
                ))
            }
        };

        Ok(match novel_id {
            Some(nid) => base.join("novels").join(validate_id(nid, "novel_id")?),
            None => base.join("global"),
        })
    }

    pub fn ensure_novel_dirs(&self, owner_user_id: &str, novel_id: &str) -> Result<NovelPaths> {
        let paths = self.novel_paths(owner_user_id, novel_id)?;
        for dir in paths.all_dirs() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(paths)
    }

    /// Remove a novel workspace; refuses to delete outside the owner root.
    pub fn delete_novel(
        &self,
        owner_user_id: &str,
        novel_id: &str,
        delete_vector_db: bool,
    ) -> Result<()> {
        let paths = self.novel_paths(owner_user_id, novel_id)?;
        let user_root = self.user_root(owner_user_id)?;

        if paths.novel_dir.is_dir() && is_within(&paths.novel_dir, &user_root) {
            std::fs::remove_dir_all(&paths.novel_dir)?;
        }

        if delete_vector_db {
            let vector_user_root = self.vector_db_root.join("users").join(owner_user_id);
            if paths.vector_db_path.is_dir() && is_within(&paths.vector_db_path, &vector_user_root)
            {
                std::fs::remove_dir_all(&paths.vector_db_path)?;
            }
        }
        Ok(())
    }
}
