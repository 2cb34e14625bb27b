//! # tandem-store
//!
//! Durable local storage for the message sync engine, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for messages,
//! delivery receipts, reactions, and per-channel sync state.  The store
//! is the single source of truth: every insert is idempotent on
//! `(channel, message_id)` so replayed cloud traffic and local replays
//! collapse into one row.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod reactions;
pub mod receipts;
pub mod sync_state;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
