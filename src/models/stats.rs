//! Aggregated call statistics for chat and embedding clients.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

/// Per-model chat usage.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ChatUsage {
    pub calls: u64,
    pub tokens: u64,
}

/// Per-model embedding usage.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct EmbeddingUsage {
    pub calls: u64,
    pub texts: u64,
}

/// Snapshot of all counters, serialisable for reports and the API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub chat: HashMap<String, ChatUsage>,
    pub embedding: HashMap<String, EmbeddingUsage>,
}

/// Registry aggregating usage across every client instance.
///
/// Owned by the model gateway; tests reset counters through [`reset`]
/// instead of restarting the process.
///
/// [`reset`]: CallStatsRegistry::reset
#[derive(Debug, Default)]
pub struct CallStatsRegistry {
    chat: Mutex<HashMap<String, ChatUsage>>,
    embedding: Mutex<HashMap<String, EmbeddingUsage>>,
}

impl CallStatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chat(&self, model: &str, tokens: u64) {
        let mut chat = self.chat.lock();
        let entry = chat.entry(model.to_string()).or_default();
        entry.calls += 1;
        entry.tokens += tokens;
    }

    pub fn record_embedding(&self, model: &str, texts: u64) {
        let mut embedding = self.embedding.lock();
        let entry = embedding.entry(model.to_string()).or_default();
        entry.calls += 1;
        entry.texts += texts;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            chat: self.chat.lock().clone(),
            embedding: self.embedding.lock().clone(),
        }
    }

    /// Clear all counters.
    pub fn reset(&self) {
        self.chat.lock().clear();
        self.embedding.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_aggregate_across_calls() {
        let stats = CallStatsRegistry::new();
        stats.record_chat("gpt-4o", 100);
        stats.record_chat("gpt-4o", 50);
        stats.record_chat("gpt-4o-mini", 10);
        stats.record_embedding("embed-small", 64);

        let snap = stats.snapshot();
        assert_eq!(
            snap.chat["gpt-4o"],
            ChatUsage {
                calls: 2,
                tokens: 150
            }
        );
        assert_eq!(snap.chat["gpt-4o-mini"].calls, 1);
        assert_eq!(
            snap.embedding["embed-small"],
            EmbeddingUsage { calls: 1, texts: 64 }
        );
    }

    #[test]
    fn reset_clears_everything() {
        let stats = CallStatsRegistry::new();
        stats.record_chat("m", 1);
        stats.record_embedding("e", 1);
        stats.reset();

        let snap = stats.snapshot();
        assert!(snap.chat.is_empty());
        assert!(snap.embedding.is_empty());
    }
}
