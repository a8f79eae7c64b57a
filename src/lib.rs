//! `mtxbox`: an append-only local mailbox engine.
//!
//! This crate provides an RFC822/MIME parser and writer, base64 and
//! quoted-printable codecs, a single-file mailbox store in the Tenex/MTX
//! record format with shared/exclusive locking, and a search engine over
//! the store.

pub mod codec;
pub mod config;
pub mod error;
pub mod model;
pub mod parser;
pub mod search;
pub mod store;
pub mod writer;

pub use error::{Result, StoreError};
pub use store::{MailboxDriver, MailboxStore, OpenOptions, StreamState};
