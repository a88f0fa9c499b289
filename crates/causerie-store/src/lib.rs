//! # causerie-store
//!
//! SQLite persistence for the Causerie coordination engine.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed helpers for every record family.  All
//! durable shared state (rooms, messages, key bundles) is mutated through
//! single-statement conditional updates so concurrent operations can never
//! lose a write: the affected-row count of each guard is the arbiter of who
//! won a race.  Message content is sealed at rest with XChaCha20-Poly1305.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod prekeys;
pub mod reactions;
pub mod rooms;

mod error;
mod row;

pub use database::Database;
pub use error::{Result, StoreError};
