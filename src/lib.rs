//! Worldbook runtime
//!
//! Ingests long-form narrative text into a per-novel knowledge base and
//! serves citation-grounded role-play queries under a spoiler boundary.
//!
//! The ingestion side runs five ordered stages over a shared chapter
//! index manifest: chapter split, scene split, metadata annotation,
//! vectorization, and character profile synthesis. The query side fuses
//! semantic, structured-filter, and profile evidence, reranks it, and
//! composes a citation-bounded worldbook payload.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod models;
pub mod novels;
pub mod pipeline;
pub mod rp;
pub mod scheduler;
pub mod storage;
pub mod text;
pub mod types;
pub mod vector;

pub use config::RuntimeConfig;
pub use types::{Result, RuntimeError};
