//! Core data models for the ephemeral file store.
//!
//! `ObjectRecord` maps to the `files` table via `sqlx::FromRow`; the other
//! types are exchanged between the HTTP layer and the storage pipelines.

pub mod format;
pub mod object;
