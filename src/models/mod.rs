//! Core data model for the document storage service.
//!
//! The single entity maps to a database row via `sqlx::FromRow` and
//! serializes naturally as JSON via `serde`.

pub mod file;
