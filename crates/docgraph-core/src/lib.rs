//! # docgraph core
//!
//! Shared retrieval logic for docgraph: data models, the vector codec,
//! store abstractions, mode resolution, the retrieval engine, and response
//! synthesis.
//!
//! This crate contains no tokio, sqlx, HTTP clients, or filesystem I/O.
//! Everything external is reached through a trait ([`embedding::Embedder`],
//! [`store::ChunkStore`], [`store::GraphStore`],
//! [`synthesize::CompletionService`], [`mode::ModeEntitlements`]) so the
//! application crate can inject real backends and tests can inject fakes.

pub mod embedding;
pub mod error;
pub mod mode;
pub mod models;
pub mod query;
pub mod retrieval;
pub mod store;
pub mod synthesize;
