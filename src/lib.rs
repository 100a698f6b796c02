//! Neuro-symbolic knowledge graph ingestion and hybrid retrieval engine.
//!
//! The crate is organized around four subsystems: the ingestion pipeline
//! (`ingestion`), the two persistence tiers (`storage::canonical_store`,
//! `storage::graph_store`), the hybrid retriever (`rag`), and the
//! prompt-security layer that both lean on (`security`). `engine` composes
//! all of it behind the narrow Submit/GetStatus/Update/Delete/Query surface
//! that an enclosing host (HTTP server, CLI, message consumer, ...) calls
//! into; this crate does not ship that host itself.

pub mod config;
pub mod engine;
pub mod error;
pub mod ingestion;
pub mod models;
pub mod rag;
pub mod security;
pub mod storage;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
