//! Identity-provider role: mints the scoped tokens downstream services trust.
//!
//! One token per configured downstream audience, all sharing the same claim
//! set. Scoping each token to a single audience means a token captured from
//! one downstream service cannot be replayed against another; the codec's
//! audience check enforces it on the consuming side.

use tracing::{debug, instrument};

use crate::directory::PrincipalDirectory;
use crate::error::Error;
use crate::token::{ClaimSet, TokenCodec};

/// A scoped token together with the audience it was minted for.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub audience: String,
    pub token: String,
}

/// Issues per-audience scoped tokens after verifying principal and
/// entitlement.
pub struct TrustChainCoordinator {
    directory: PrincipalDirectory,
    codec: TokenCodec,
    audiences: Vec<String>,
}

impl TrustChainCoordinator {
    #[must_use]
    pub fn new(
        directory: PrincipalDirectory,
        codec: TokenCodec,
        audiences: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            directory,
            codec,
            audiences: audiences.into_iter().map(Into::into).collect(),
        }
    }

    /// Authenticate a principal and mint one token per downstream audience.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UserNotFound`] for unknown principals,
    /// [`Error::TokenInvalid`] for a failed credential proof and
    /// [`Error::AccountUnauthorized`] when the requested account is not in
    /// the principal's entitlements.
    #[instrument(skip(self, proof))]
    pub fn issue_tokens(
        &self,
        principal: &str,
        proof: &str,
        account_id: &str,
        now_unix_seconds: i64,
    ) -> Result<Vec<IssuedToken>, Error> {
        let record = self.directory.verify_proof(principal, proof)?;
        if !record.accounts.contains(account_id) {
            return Err(Error::AccountUnauthorized);
        }

        let claims = ClaimSet {
            subject: principal.to_string(),
            account_id: Some(account_id.to_string()),
            display_name: Some(record.display_name.clone()),
            ..ClaimSet::default()
        };

        let mut issued = Vec::with_capacity(self.audiences.len());
        for audience in &self.audiences {
            issued.push(IssuedToken {
                audience: audience.clone(),
                token: self.codec.issue(&claims, audience, now_unix_seconds)?,
            });
        }
        debug!(principal, account_id, count = issued.len(), "scoped tokens issued");
        Ok(issued)
    }
}
