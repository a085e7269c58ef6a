//! Core data models for the chunked upload service.
//!
//! `session` describes an in-flight upload as the client declares it;
//! `upload` is the ledger record of a finalized file, mapped to SQLite via
//! `sqlx::FromRow` and serialized as JSON via `serde`.

pub mod session;
pub mod upload;
