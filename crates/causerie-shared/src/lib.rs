//! # causerie-shared
//!
//! Domain types and wire protocol for the Causerie chat engine.
//!
//! The crate is transport- and storage-agnostic: it defines the entities the
//! coordination engine moves around (rooms, messages, key bundles), the
//! JSON wire protocol spoken over the WebSocket gateway, the error taxonomy
//! returned in acknowledgments, invite-token generation, and the opaque
//! payload-sealing capability used for content at rest.

pub mod constants;
pub mod invite;
pub mod model;
pub mod protocol;
pub mod seal;
pub mod types;

mod error;

pub use error::ChatError;
pub use model::*;
pub use types::*;
