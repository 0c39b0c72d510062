//! # Traq Attribution
//!
//! The project-attribution engine behind Traq: decides which user project
//! a tracked activity event belongs to.
//!
//! Three sources of evidence are combined:
//!
//! - **Rules**: weighted patterns on context fields, written by hand or
//!   learned from manual assignments, scored from a TTL cache.
//! - **Keyword detection**: a configured keyword → project table applied to
//!   window titles and git repositories.
//! - **Embeddings**: nearest-neighbor voting over vectors of previously
//!   assigned events.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────┐   ┌──────────┐
//! │ traq (CLI)   │──▶│ AssignmentService    │──▶│  SQLite   │
//! │ backfill     │   │ cache / index / embed │   │  (Store)  │
//! └──────────────┘   └──────────────────────┘   └──────────┘
//! ```
//!
//! The algorithms (context derivation, matching, learning, detection,
//! embeddings, vector index) live in the `traq-attribution-core` crate and
//! are storage-agnostic. This crate adds configuration, SQLite storage,
//! the rule cache, orchestration and the CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite [`Store`](traq_attribution_core::store::Store) implementation |
//! | [`embedding`] | Optional neural embedding backends |
//! | [`pattern_cache`] | TTL-refreshed rule cache |
//! | [`assignment`] | Assignment orchestrator |
//! | [`backfill`] | Historical batch assignment |
//! | [`embed_cmd`] | Embedding regeneration |
//! | [`progress`] | Batch progress on stderr |
//! | [`commands`] | CLI handlers |

pub mod assignment;
pub mod backfill;
pub mod commands;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod migrate;
pub mod pattern_cache;
pub mod progress;
pub mod sqlite_store;
