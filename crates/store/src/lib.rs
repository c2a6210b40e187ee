//! Session persistence for turnloop.
//!
//! A session is stored as one JSON envelope per file, named by session id.
//! The envelope carries a format version; anything this crate does not
//! recognize is refused rather than guessed at.

mod envelope;
mod error;
mod store;

pub use envelope::{ENVELOPE_VERSION, SessionEnvelope, decode, encode};
pub use error::StoreError;
pub use store::{SessionStore, SessionSummary};
