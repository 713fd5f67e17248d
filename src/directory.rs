//! Principal directory and account entitlements.
//!
//! Read-only reference data: who a principal is, the credential proof they
//! present to the identity provider, and which account ids they are entitled
//! to. Consulted at token issuance and again at every downstream
//! authorization check.

use base64ct::{Base64, Encoding};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

use crate::error::Error;

/// WebAuthn user handles are 16 stable bytes derived from the principal.
pub const USER_HANDLE_BYTES: usize = 16;

/// Derive the principal's stable user handle: the first 16 bytes of
/// SHA-256 over the principal string. Deterministic, so the handle survives
/// across ceremonies and process restarts without storage.
#[must_use]
pub fn derive_user_handle(principal: &str) -> [u8; USER_HANDLE_BYTES] {
    let digest = Sha256::digest(principal.as_bytes());
    let mut handle = [0u8; USER_HANDLE_BYTES];
    handle.copy_from_slice(&digest[..USER_HANDLE_BYTES]);
    handle
}

#[derive(Debug, Clone)]
pub struct PrincipalRecord {
    pub display_name: String,
    /// Base64 of the shared credential proof, compared on issuance.
    proof: String,
    pub accounts: BTreeSet<String>,
}

/// In-memory principal directory with per-principal account entitlements.
#[derive(Debug, Default)]
pub struct PrincipalDirectory {
    records: HashMap<String, PrincipalRecord>,
}

impl PrincipalDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a principal with their proof and entitled accounts.
    pub fn insert<I, S>(&mut self, principal: &str, display_name: &str, proof: &str, accounts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.records.insert(
            principal.to_string(),
            PrincipalRecord {
                display_name: display_name.to_string(),
                proof: Base64::encode_string(proof.as_bytes()),
                accounts: accounts.into_iter().map(Into::into).collect(),
            },
        );
    }

    /// Verify a credential proof and return the principal's record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UserNotFound`] for unknown principals and
    /// [`Error::TokenInvalid`] when the proof does not match.
    pub fn verify_proof(&self, principal: &str, proof: &str) -> Result<&PrincipalRecord, Error> {
        let record = self.records.get(principal).ok_or(Error::UserNotFound)?;
        if Base64::encode_string(proof.as_bytes()) != record.proof {
            return Err(Error::TokenInvalid("invalid credential proof".to_string()));
        }
        Ok(record)
    }

    /// Whether the principal is entitled to the given account id.
    #[must_use]
    pub fn is_entitled(&self, principal: &str, account_id: &str) -> bool {
        self.records
            .get(principal)
            .is_some_and(|record| record.accounts.contains(account_id))
    }

    /// The principal's entitled account ids, if the principal exists.
    #[must_use]
    pub fn entitlements(&self, principal: &str) -> Option<&BTreeSet<String>> {
        self.records.get(principal).map(|record| &record.accounts)
    }
}
