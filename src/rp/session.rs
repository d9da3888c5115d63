//! Rolling per-session dialogue memory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::normalize_entities;
use crate::db::utc_now;
use crate::types::Result;

const MAX_TURNS: usize = 20;
const MAX_RECENT_ENTITIES: usize = 30;

/// One dialogue turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: String,
    pub content: String,
    pub ts: String,
}

/// Persistent state for one role-play session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    #[serde(default)]
    pub max_unlocked_chapter: i64,
    #[serde(default)]
    pub active_characters: Vec<String>,
    #[serde(default)]
    pub current_scene: String,
    #[serde(default)]
    pub long_term_summary: String,
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub recent_entities: Vec<String>,
    #[serde(default)]
    pub updated_at: String,
}

impl SessionState {
    pub fn new(session_id: &str, default_unlocked: i64) -> Self {
        Self {
            session_id: session_id.to_string(),
            max_unlocked_chapter: default_unlocked,
            active_characters: Vec::new(),
            current_scene: String::new(),
            long_term_summary: String::new(),
            turns: Vec::new(),
            recent_entities: Vec::new(),
            updated_at: utc_now(),
        }
    }

    /// Append a turn, keeping only the most recent 20.
    pub fn append_turn(&mut self, role: &str, content: &str) {
        self.turns.push(Turn {
            role: role.to_string(),
            content: content.to_string(),
            ts: utc_now(),
        });
        if self.turns.len() > MAX_TURNS {
            self.turns.drain(..self.turns.len() - MAX_TURNS);
        }
    }

    /// Fold runtime updates in; `max_unlocked_chapter` never decreases.
    pub fn apply_runtime_updates(
        &mut self,
        unlocked_chapter: Option<i64>,
        active_characters: Option<&[String]>,
        current_scene: Option<&str>,
    ) {
        if let Some(unlocked) = unlocked_chapter {
            self.max_unlocked_chapter = self.max_unlocked_chapter.max(unlocked);
        }
        if let Some(characters) = active_characters {
            self.active_characters = normalize_entities(characters);
        }
        if let Some(scene) = current_scene {
            self.current_scene = scene.to_string();
        }
    }

    /// Merge newly seen entities, deduplicated in order, keeping the most
    /// recent 30.
    pub fn remember_entities(&mut self, entities: &[String]) {
        let merged = normalize_entities(
            self.recent_entities
                .iter()
                .map(String::as_str)
                .chain(entities.iter().map(String::as_str)),
        );
        let from = merged.len().saturating_sub(MAX_RECENT_ENTITIES);
        self.recent_entities = merged[from..].to_vec();
    }
}

/// Filesystem-backed session store for one (user|guest, novel?) scope.
#[derive(Debug, Clone)]
pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, session_id: &str) -> PathBuf {
        let safe_id = session_id.replace(['/', '\\'], "_");
        self.base_dir.join(format!("{safe_id}.json"))
    }

    pub fn load(&self, session_id: &str, default_unlocked: i64) -> SessionState {
        let path = self.path(session_id);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_else(|| SessionState::new(session_id, default_unlocked))
    }

    pub fn save(&self, state: &mut SessionState) -> Result<()> {
        state.updated_at = utc_now();
        std::fs::create_dir_all(&self.base_dir)?;
        let path = self.path(&state.session_id);
        std::fs::write(path, serde_json::to_string_pretty(state)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turns_are_bounded_to_twenty() {
        let mut state = SessionState::new("s", 0);
        for i in 0..55 {
            state.append_turn("user", &format!("message {i}"));
            assert!(state.turns.len() <= 20);
        }
        assert_eq!(state.turns.len(), 20);
        assert_eq!(state.turns[0].content, "message 35");
        assert_eq!(state.turns[19].content, "message 54");
    }

    #[test]
    fn recent_entities_bounded_and_ordered() {
        let mut state = SessionState::new("s", 0);
        let batch: Vec<String> = (0..40).map(|i| format!("角色{i}")).collect();
        state.remember_entities(&batch);
        assert_eq!(state.recent_entities.len(), 30);
        assert_eq!(state.recent_entities[0], "角色10");
        assert_eq!(state.recent_entities[29], "角色39");

        // Remembering an already-known entity dedupes instead of growing.
        state.remember_entities(&["角色39".to_string()]);
        assert_eq!(state.recent_entities.len(), 30);
    }

    #[test]
    fn unlocked_chapter_is_max_monotonic() {
        let mut state = SessionState::new("s", 5);
        state.apply_runtime_updates(Some(10), None, None);
        assert_eq!(state.max_unlocked_chapter, 10);
        state.apply_runtime_updates(Some(3), None, None);
        assert_eq!(state.max_unlocked_chapter, 10);
        state.apply_runtime_updates(None, None, None);
        assert_eq!(state.max_unlocked_chapter, 10);
    }

    #[test]
    fn store_roundtrip_and_sanitized_names() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());

        let mut state = store.load("a/b\\c", 2);
        assert_eq!(state.max_unlocked_chapter, 2);
        state.append_turn("user", "你好");
        store.save(&mut state).unwrap();

        assert!(tmp.path().join("a_b_c.json").exists());

        let reloaded = store.load("a/b\\c", 0);
        assert_eq!(reloaded.turns.len(), 1);
        // Persisted unlocked chapter wins over the load default.
        assert_eq!(reloaded.max_unlocked_chapter, 2);
    }

    #[test]
    fn missing_session_gets_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let state = store.load("fresh", 7);
        assert_eq!(state.session_id, "fresh");
        assert_eq!(state.max_unlocked_chapter, 7);
        assert!(state.turns.is_empty());
    }
}
