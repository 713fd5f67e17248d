//! Extension verifier: account-level entitlement checks for the trust chain.
//!
//! This is the peer the cross-service verifier calls. It validates
//! identity-provider tokens scoped to its own audience, checks the subject's
//! account entitlements and runs its own challenge round-trip against the
//! client's `clientDataJSON`. The reply shape (`status`/`subject`/`account`)
//! is the wire contract the relying party inspects.

use base64ct::{Base64UrlUnpadded, Encoding};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::directory::PrincipalDirectory;
use crate::error::Error;
use crate::store::ChallengeStore;
use crate::token::TokenCodec;

/// Reply to a successful prepare call: the validity marker plus a fresh
/// challenge for the client to embed in its next WebAuthn exchange.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedExtension {
    pub status: String,
    pub subject: String,
    pub account: String,
    pub challenge: String,
    pub issued_at: i64,
    pub registered: bool,
}

/// Reply to a successful validation call.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionValidation {
    pub status: String,
    pub subject: String,
    pub account: String,
    pub authenticated: bool,
}

/// Validates scoped tokens and account entitlements for extension flows.
pub struct ExtensionVerifier {
    codec: TokenCodec,
    expected_issuer: String,
    audience: String,
    challenges: ChallengeStore,
    directory: PrincipalDirectory,
}

impl ExtensionVerifier {
    #[must_use]
    pub fn new(
        codec: TokenCodec,
        expected_issuer: impl Into<String>,
        audience: impl Into<String>,
        directory: PrincipalDirectory,
    ) -> Self {
        Self {
            codec,
            expected_issuer: expected_issuer.into(),
            audience: audience.into(),
            challenges: ChallengeStore::new(),
            directory,
        }
    }

    /// Verify the inbound token against this service's issuer/audience and
    /// return its subject and account claims.
    ///
    /// # Errors
    ///
    /// Token failures propagate from the codec; a token without an
    /// `account_id` claim fails with [`Error::ClaimsMissing`], and a subject
    /// that differs from the named principal with [`Error::SubjectMismatch`].
    pub fn verify_token(
        &self,
        principal: &str,
        token: &str,
        now_unix_seconds: i64,
    ) -> Result<(String, String), Error> {
        let claims = self.codec.verify_issued_by(
            token,
            &self.expected_issuer,
            &self.audience,
            now_unix_seconds,
        )?;
        let account = claims.account_id.ok_or(Error::ClaimsMissing("account_id"))?;
        if claims.sub != principal {
            return Err(Error::SubjectMismatch);
        }
        Ok((claims.sub, account))
    }

    /// Prepare an extension exchange: validate token and entitlement, then
    /// issue a challenge for the principal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountUnauthorized`] when the token's account is not
    /// among the principal's entitlements, besides the token failures of
    /// [`Self::verify_token`].
    #[instrument(skip(self, token))]
    pub async fn prepare(
        &self,
        principal: &str,
        token: &str,
        now_unix_seconds: i64,
    ) -> Result<PreparedExtension, Error> {
        let (subject, account) = self.verify_token(principal, token, now_unix_seconds)?;
        if !self.directory.is_entitled(&subject, &account) {
            return Err(Error::AccountUnauthorized);
        }

        let challenge = self.challenges.issue(&subject).await;
        debug!(principal, account, "extension exchange prepared");
        Ok(PreparedExtension {
            status: "valid".to_string(),
            subject,
            account,
            challenge,
            issued_at: now_unix_seconds,
            registered: true,
        })
    }

    /// Validate an extension exchange: the client's `clientDataJSON` must
    /// echo the challenge issued at prepare time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChallengeMissingOrExpired`] when no challenge is
    /// pending and [`Error::TokenInvalid`] when the `clientDataJSON` is
    /// malformed or carries a different challenge.
    #[instrument(skip(self, token, client_data_json_b64))]
    pub async fn validate(
        &self,
        principal: &str,
        token: &str,
        client_data_json_b64: &str,
        now_unix_seconds: i64,
    ) -> Result<ExtensionValidation, Error> {
        let (subject, account) = self.verify_token(principal, token, now_unix_seconds)?;
        let stored = self.challenges.consume(&subject).await?;

        let raw = Base64UrlUnpadded::decode_vec(client_data_json_b64.trim_end_matches('='))
            .map_err(|_| Error::TokenInvalid("invalid clientDataJSON encoding".to_string()))?;
        let client_data: Value = serde_json::from_slice(&raw)
            .map_err(|_| Error::TokenInvalid("invalid clientDataJSON".to_string()))?;
        let received = client_data
            .get("challenge")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::TokenInvalid("missing clientDataJSON challenge".to_string()))?;
        if received != stored {
            return Err(Error::TokenInvalid("challenge mismatch".to_string()));
        }

        debug!(principal, account, "extension exchange validated");
        Ok(ExtensionValidation {
            status: "valid".to_string(),
            subject,
            account,
            authenticated: true,
        })
    }
}
