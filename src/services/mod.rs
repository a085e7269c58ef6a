//! The chunked-upload reassembly engine.
//!
//! Leaves first: `transfer` moves bytes, `chunk_store` persists chunks,
//! `session_tracker` decides completion, `reassembler` concatenates,
//! `finalizer` commits to the output directory, `ledger` records the
//! result. `upload_service` wires them into one request flow.

pub mod chunk_store;
pub mod error;
pub mod finalizer;
pub mod ledger;
pub mod reassembler;
pub mod session_tracker;
pub mod transfer;
pub mod upload_service;
