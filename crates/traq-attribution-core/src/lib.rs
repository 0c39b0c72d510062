//! # Traq Attribution Core
//!
//! Pure logic for deciding which project an activity event belongs to:
//! data models, context derivation, embeddings, the vector index, the
//! weighted rule matcher, rule learning, keyword detection, validation
//! and the store abstraction.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! runtime-specific dependencies. The `traq-attribution` app crate wires
//! it to SQLite, neural backends and the CLI.

pub mod context;
pub mod detect;
pub mod embedding;
pub mod error;
pub mod index;
pub mod learner;
pub mod matcher;
pub mod models;
pub mod rules;
pub mod store;
