//! External model clients: chat completion and embeddings.
//!
//! Both clients are cheap to construct and safe to use from concurrent
//! workers; pacing and statistics live in registries owned by the
//! [`ModelGateway`], the single construction site for this shared state.

use std::sync::Arc;

use crate::config::{EmbeddingConfig, LlmConfig};
use crate::types::Result;

pub mod chat;
pub mod embedding;
pub mod limiter;
pub mod stats;

pub use chat::{ChatClient, ChatOutput, ChatProvider, ChatRequest};
pub use embedding::{EmbeddingClient, EmbeddingProvider, MockEmbeddingProvider};
pub use limiter::{RateLimiterRegistry, SharedRateLimiter};
pub use stats::{CallStatsRegistry, StatsSnapshot};

/// Owns the process-wide limiter registry and call statistics, and hands
/// out client instances wired to them.
pub struct ModelGateway {
    llm: LlmConfig,
    embedding: EmbeddingConfig,
    limiters: RateLimiterRegistry,
    stats: Arc<CallStatsRegistry>,
}

impl ModelGateway {
    pub fn new(llm: LlmConfig, embedding: EmbeddingConfig) -> Self {
        Self {
            llm,
            embedding,
            limiters: RateLimiterRegistry::new(),
            stats: Arc::new(CallStatsRegistry::new()),
        }
    }

    /// A chat client sharing the endpoint's limiter and the global stats.
    /// Workers that fan out create one instance each.
    pub fn chat_client(&self) -> Result<ChatClient> {
        let limiter = self.limiters.get(
            &self.llm.base_url,
            &self.llm.api_key,
            self.llm.rate_limit_per_minute,
        );
        ChatClient::new(&self.llm, limiter, Arc::clone(&self.stats))
    }

    pub fn embedding_client(&self) -> Result<EmbeddingClient> {
        EmbeddingClient::new(&self.embedding, Arc::clone(&self.stats))
    }

    pub fn stats(&self) -> &CallStatsRegistry {
        &self.stats
    }

    pub fn concurrent_requests(&self) -> usize {
        self.llm.concurrent_requests.max(1)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_shares_limiter_across_clients() {
        let gateway = ModelGateway::new(LlmConfig::default(), EmbeddingConfig::default());
        // Two clients for the same endpoint: same limiter instance behind
        // the scenes, verified indirectly through tightening.
        let _a = gateway.chat_client().unwrap();
        let limiter = gateway.limiters.get(
            &gateway.llm.base_url,
            &gateway.llm.api_key,
            gateway.llm.rate_limit_per_minute,
        );
        let before = limiter.interval();
        let tightened = gateway.limiters.get(&gateway.llm.base_url, &gateway.llm.api_key, 1);
        assert!(tightened.interval() >= before);
    }

    #[test]
    fn stats_are_shared_and_resettable() {
        let gateway = ModelGateway::new(LlmConfig::default(), EmbeddingConfig::default());
        gateway.stats().record_chat("m", 10);
        assert_eq!(gateway.stats().snapshot().chat["m"].tokens, 10);
        gateway.stats().reset();
        assert!(gateway.stats().snapshot().chat.is_empty());
    }
}
