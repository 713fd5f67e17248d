//! Volatile in-process stores for ceremony state.
//!
//! Both stores live for the process lifetime only and expire entries lazily
//! on read. Per-store locks give the atomic read-then-delete and
//! read-then-update guarantees the ceremony flows rely on; no cross-store
//! transactions exist or are needed.

pub mod challenge;
pub mod credential;

pub use challenge::ChallengeStore;
pub use credential::{Credential, CredentialStore};
