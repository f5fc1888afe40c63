//! # docgraph
//!
//! A multi-tenant retrieval engine that answers questions over documents
//! that were already chunked, embedded, and mined for a knowledge graph.
//!
//! Retrieval logic lives in the `docgraph-core` crate, which knows nothing
//! about SQLite or HTTP. This crate supplies the concrete services: the
//! SQLite stores, the embedding and completion providers, plan and usage
//! bookkeeping, and the `dgx` CLI and HTTP surfaces.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────┐   ┌──────────┐
//!  │   CLI    │   │   HTTP   │
//!  │  (dgx)   │   │  (axum)  │
//!  └────┬─────┘   └────┬─────┘
//!       └──────┬───────┘
//!              ▼
//!      ┌──────────────┐    ┌───────────────────┐
//!      │ QueryService │───▶│ plans / usage     │
//!      └──────┬───────┘    └───────────────────┘
//!             ▼
//!   ┌───────────────────┐   ┌───────────────────┐
//!   │ RetrievalEngine   │──▶│ EmbeddingClient   │
//!   │ + Synthesizer     │──▶│ CompletionService │
//!   └─────────┬─────────┘   └───────────────────┘
//!             ▼
//!      ┌──────────────┐
//!      │ SqliteStore  │
//!      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | Tenant-scoped chunk and graph stores |
//! | [`embedding`] | Embedding providers, retry, and batching |
//! | [`completion`] | Completion providers |
//! | [`plans`] | Plan catalog and tenant plan lookup |
//! | [`usage`] | Usage counters and query quota |
//! | [`query`] | The `execute_query` boundary |
//! | [`server`] | HTTP API |
//! | [`import`] | Snapshot import |
//! | [`embed_cmd`] | Embedding backfill |
//! | [`progress`] | Batch progress reporting |
//! | [`logging`] | Tracing subscriber setup |

pub mod completion;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod import;
pub mod logging;
pub mod migrate;
pub mod plans;
pub mod progress;
pub mod query;
pub mod server;
pub mod sqlite_store;
pub mod usage;
