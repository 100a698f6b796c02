//! Hybrid RAG retrieval: intent planning, vector/graph search, Reciprocal
//! Rank Fusion, and final answer synthesis over the fused context.

pub mod generator;
pub mod planner;
pub mod retriever;

pub use generator::{AnswerProvider, Generator, RigAnswerProvider};
pub use planner::{plan_query, QueryPlan, QueryPlanProvider, RigQueryPlanProvider, ALLOWED_INTENTS};
pub use retriever::{RetrievedChunk, Retriever, SearchMode};
