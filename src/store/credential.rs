//! Volatile credential storage keyed by credential id.

use base64ct::{Base64UrlUnpadded, Encoding};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Error;

/// A registered passkey credential.
///
/// `public_key` is opaque material produced by the ceremony engine; this core
/// never parses it. `account_id` is the optional account scope captured from
/// the verified registration token, consulted again at authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub credential_id: Vec<u8>,
    pub user_handle: Vec<u8>,
    pub public_key: Vec<u8>,
    pub sign_count: u32,
    pub principal: String,
    pub rp_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub is_resident_key: bool,
}

/// In-memory credential map; credentials are inserted at registration and
/// mutated only through [`CredentialStore::bump_sign_count`]. Never deleted.
#[derive(Debug, Default)]
pub struct CredentialStore {
    entries: RwLock<HashMap<Vec<u8>, Credential>>,
}

impl CredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a credential by id.
    pub async fn put(&self, credential: Credential) {
        let mut entries = self.entries.write().await;
        entries.insert(credential.credential_id.clone(), credential);
    }

    /// Fetch one credential by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CredentialNotFound`] for unknown ids.
    pub async fn get(&self, credential_id: &[u8]) -> Result<Credential, Error> {
        let entries = self.entries.read().await;
        entries
            .get(credential_id)
            .cloned()
            .ok_or(Error::CredentialNotFound)
    }

    /// All credentials registered by a principal; the authentication
    /// allow-list is built from this. Empty means the caller must fail with
    /// [`Error::UserNotFound`] before issuing any challenge.
    pub async fn list_by_principal(&self, principal: &str) -> Vec<Credential> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|credential| credential.principal == principal)
            .cloned()
            .collect()
    }

    /// Persist a new signature counter, atomically under the write lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CredentialNotFound`] for unknown ids and
    /// [`Error::SignatureReplaySuspected`] when the reported counter is not
    /// strictly greater than the stored one: a stalled or regressed counter
    /// is the cloned-authenticator signal.
    pub async fn bump_sign_count(&self, credential_id: &[u8], new_count: u32) -> Result<(), Error> {
        let mut entries = self.entries.write().await;
        let credential = entries
            .get_mut(credential_id)
            .ok_or(Error::CredentialNotFound)?;
        if new_count <= credential.sign_count {
            return Err(Error::SignatureReplaySuspected {
                credential_id: Base64UrlUnpadded::encode_string(credential_id),
                stored: credential.sign_count,
                reported: new_count,
            });
        }
        debug!(
            principal = %credential.principal,
            from = credential.sign_count,
            to = new_count,
            "sign count updated"
        );
        credential.sign_count = new_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(id: &[u8], principal: &str) -> Credential {
        Credential {
            credential_id: id.to_vec(),
            user_handle: vec![1; 16],
            public_key: vec![2; 77],
            sign_count: 0,
            principal: principal.to_string(),
            rp_id: "localhost".to_string(),
            account_id: Some("acc1".to_string()),
            is_resident_key: false,
        }
    }

    #[tokio::test]
    async fn put_get_and_list() -> Result<(), Error> {
        let store = CredentialStore::new();
        store.put(credential(b"cred-a", "alice")).await;
        store.put(credential(b"cred-b", "alice")).await;
        store.put(credential(b"cred-c", "bob")).await;

        assert_eq!(store.get(b"cred-a").await?.principal, "alice");
        assert_eq!(store.list_by_principal("alice").await.len(), 2);
        assert!(store.list_by_principal("carol").await.is_empty());
        assert!(matches!(
            store.get(b"missing").await,
            Err(Error::CredentialNotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn bump_requires_strictly_increasing_counter() -> Result<(), Error> {
        let store = CredentialStore::new();
        store.put(credential(b"cred-a", "alice")).await;

        store.bump_sign_count(b"cred-a", 3).await?;
        assert_eq!(store.get(b"cred-a").await?.sign_count, 3);

        // Equal and regressed counters are both replay signals.
        for stale in [3, 2, 0] {
            let result = store.bump_sign_count(b"cred-a", stale).await;
            assert!(matches!(
                result,
                Err(Error::SignatureReplaySuspected {
                    stored: 3,
                    reported,
                    ..
                }) if reported == stale
            ));
        }
        assert_eq!(store.get(b"cred-a").await?.sign_count, 3);
        Ok(())
    }

    #[tokio::test]
    async fn bump_unknown_credential() {
        let store = CredentialStore::new();
        assert!(matches!(
            store.bump_sign_count(b"missing", 1).await,
            Err(Error::CredentialNotFound)
        ));
    }
}
