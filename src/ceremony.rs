//! WebAuthn ceremony orchestration for the relying party.
//!
//! Drives registration and authentication across their four stages
//! (`Init -> ChallengeIssued -> Attestation/AssertionReceived -> Verified`),
//! combining challenge issuance, credential persistence and the
//! cross-service token check. The cryptographic half of the ceremony
//! (attestation statements, assertion signatures, origin checks) belongs to
//! the external [`CeremonyEngine`]; option and assertion structures pass
//! through this module opaquely.
//!
//! Ceremony state between begin and complete lives in a signed challenge
//! token instead of a server-side session, so any replica can finish a
//! ceremony another one started.

use base64ct::{Base64UrlUnpadded, Encoding};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::directory::derive_user_handle;
use crate::error::Error;
use crate::store::{ChallengeStore, Credential, CredentialStore};
use crate::token::{ClaimSet, ReplayGuard, TokenClaims, TokenCodec, DEFAULT_LEEWAY_SECONDS};
use crate::verifier::{CrossServiceVerifier, PeerTransport};

/// Credential material returned by the engine after attestation verification.
#[derive(Debug, Clone)]
pub struct RegisteredCredential {
    pub credential_id: Vec<u8>,
    pub public_key: Vec<u8>,
    pub is_resident_key: bool,
}

/// External ceremony engine: owns WebAuthn option construction and all
/// signature/attestation/origin cryptography. This core never parses COSE
/// keys or attestation statements.
pub trait CeremonyEngine: Send + Sync {
    /// Build `publicKeyCredentialCreationOptions` for a registration.
    ///
    /// # Errors
    ///
    /// Implementations fail when options cannot be built for the principal.
    fn registration_options(
        &self,
        principal: &str,
        user_handle: &[u8],
        challenge: &str,
    ) -> Result<Value, Error>;

    /// Verify an attestation response against the expected challenge.
    ///
    /// # Errors
    ///
    /// Implementations fail when the attestation does not verify.
    fn verify_attestation(
        &self,
        attestation: &Value,
        challenge: &str,
        user_handle: &[u8],
    ) -> Result<RegisteredCredential, Error>;

    /// Build `publicKeyCredentialRequestOptions` over an allow-list.
    ///
    /// # Errors
    ///
    /// Implementations fail when options cannot be built.
    fn authentication_options(
        &self,
        allow_credentials: &[Vec<u8>],
        challenge: &str,
    ) -> Result<Value, Error>;

    /// Verify an assertion and return the authenticator's reported counter.
    ///
    /// # Errors
    ///
    /// Implementations fail when signature, challenge or origin checks fail.
    fn verify_assertion(
        &self,
        assertion: &Value,
        challenge: &str,
        credential: &Credential,
    ) -> Result<u32, Error>;
}

/// Continuation state handed to the client between begin and complete.
#[derive(Debug, Clone)]
pub struct CeremonyStart {
    /// Engine-built options, passed through opaquely.
    pub options: Value,
    /// Signed, time-boxed encoding of the ceremony state.
    pub challenge_token: String,
}

/// Relying-party orchestrator over the challenge/credential stores, the
/// cross-service verifier and the external ceremony engine.
pub struct CeremonyOrchestrator<E: CeremonyEngine, T: PeerTransport> {
    engine: E,
    verifier: CrossServiceVerifier<T>,
    codec: TokenCodec,
    rp_id: String,
    challenges: ChallengeStore,
    credentials: CredentialStore,
    replay_guard: ReplayGuard,
}

impl<E: CeremonyEngine, T: PeerTransport> CeremonyOrchestrator<E, T> {
    /// Wire an orchestrator. `codec` signs the relying party's own challenge
    /// tokens (issuer and audience are both the relying party); `verifier`
    /// validates identity-provider account tokens.
    #[must_use]
    pub fn new(
        engine: E,
        verifier: CrossServiceVerifier<T>,
        codec: TokenCodec,
        rp_id: impl Into<String>,
        challenges: ChallengeStore,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            engine,
            verifier,
            codec,
            rp_id: rp_id.into(),
            challenges,
            credentials,
            replay_guard: ReplayGuard::new(),
        }
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Begin registration: derive the stable user handle, issue a challenge
    /// and bind both into a signed challenge token.
    ///
    /// # Errors
    ///
    /// Fails when the engine cannot build options or the token cannot be
    /// signed.
    #[instrument(skip(self))]
    pub async fn register_begin(
        &self,
        principal: &str,
        now_unix_seconds: i64,
    ) -> Result<CeremonyStart, Error> {
        let handle = derive_user_handle(principal);
        let challenge = self.challenges.issue(principal).await;
        let options = self
            .engine
            .registration_options(principal, &handle, &challenge)?;

        let claims = ClaimSet {
            subject: principal.to_string(),
            challenge: Some(challenge),
            handle: Some(Base64UrlUnpadded::encode_string(&handle)),
            ..ClaimSet::default()
        };
        let challenge_token = self
            .codec
            .issue(&claims, self.codec.issuer(), now_unix_seconds)?;
        debug!(principal, rp_id = %self.rp_id, "registration ceremony started");
        Ok(CeremonyStart {
            options,
            challenge_token,
        })
    }

    /// Complete registration: verify the challenge token, consume the stored
    /// challenge, delegate attestation verification to the engine, then
    /// optionally cross-validate an account token before persisting the
    /// credential with a zero sign count.
    ///
    /// A subject mismatch between the account token and the ceremony
    /// principal persists nothing.
    ///
    /// # Errors
    ///
    /// Any token, challenge, engine or cross-service failure is terminal for
    /// this attempt.
    #[instrument(skip_all)]
    pub async fn register_complete(
        &self,
        attestation: &Value,
        challenge_token: &str,
        account_token: Option<&str>,
        now_unix_seconds: i64,
    ) -> Result<Credential, Error> {
        let state = self
            .decode_challenge_token(challenge_token, now_unix_seconds)
            .await?;
        let principal = state.sub.clone();
        let challenge = state.challenge.ok_or(Error::ClaimsMissing("challenge"))?;
        let handle_b64 = state.handle.ok_or(Error::ClaimsMissing("handle"))?;
        let handle = Base64UrlUnpadded::decode_vec(&handle_b64)
            .map_err(|_| Error::TokenInvalid("invalid user handle encoding".to_string()))?;

        // The stored challenge must still be the one this token carries; a
        // newer ceremony for the same principal supersedes it.
        let stored = self.challenges.consume(&principal).await?;
        if stored != challenge {
            return Err(Error::ChallengeMissingOrExpired);
        }

        let registered = self
            .engine
            .verify_attestation(attestation, &challenge, &handle)?;

        let account_id = match account_token {
            Some(token) => {
                let claims = self.verifier.verify(token, now_unix_seconds).await?;
                if claims.sub != principal {
                    warn!(principal, "account token subject mismatch on registration");
                    return Err(Error::SubjectMismatch);
                }
                claims.account_id
            }
            None => None,
        };

        let credential = Credential {
            credential_id: registered.credential_id,
            user_handle: handle,
            public_key: registered.public_key,
            sign_count: 0,
            principal: principal.clone(),
            rp_id: self.rp_id.clone(),
            account_id,
            is_resident_key: registered.is_resident_key,
        };
        self.credentials.put(credential.clone()).await;
        debug!(principal, "registration ceremony verified");
        Ok(credential)
    }

    /// Begin authentication: build the allow-list from the principal's
    /// registered credentials, then issue a challenge and challenge token.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::UserNotFound`] before any challenge is issued when
    /// the principal has no credentials.
    #[instrument(skip(self))]
    pub async fn authenticate_begin(
        &self,
        principal: &str,
        now_unix_seconds: i64,
    ) -> Result<CeremonyStart, Error> {
        let registered = self.credentials.list_by_principal(principal).await;
        if registered.is_empty() {
            return Err(Error::UserNotFound);
        }
        let allow_credentials: Vec<Vec<u8>> = registered
            .into_iter()
            .map(|credential| credential.credential_id)
            .collect();

        let challenge = self.challenges.issue(principal).await;
        let options = self
            .engine
            .authentication_options(&allow_credentials, &challenge)?;

        let claims = ClaimSet {
            subject: principal.to_string(),
            challenge: Some(challenge),
            ..ClaimSet::default()
        };
        let challenge_token = self
            .codec
            .issue(&claims, self.codec.issuer(), now_unix_seconds)?;
        debug!(principal, "authentication ceremony started");
        Ok(CeremonyStart {
            options,
            challenge_token,
        })
    }

    /// Complete authentication: resolve the asserted credential, validate the
    /// account token cross-service, delegate assertion verification to the
    /// engine and persist the new signature counter.
    ///
    /// A counter that is not strictly greater than the stored one is treated
    /// as a cloned or replayed authenticator and rejected.
    ///
    /// # Errors
    ///
    /// Any token, credential, challenge, engine or cross-service failure is
    /// terminal for this attempt.
    #[instrument(skip_all)]
    pub async fn authenticate_complete(
        &self,
        assertion: &Value,
        challenge_token: &str,
        account_token: &str,
        now_unix_seconds: i64,
    ) -> Result<String, Error> {
        let state = self
            .decode_challenge_token(challenge_token, now_unix_seconds)
            .await?;
        let principal = state.sub.clone();
        let challenge = state.challenge.ok_or(Error::ClaimsMissing("challenge"))?;

        let credential_id = assertion
            .get("rawId")
            .and_then(Value::as_str)
            .and_then(|raw| Base64UrlUnpadded::decode_vec(raw).ok())
            .ok_or(Error::CredentialNotFound)?;
        let credential = self.credentials.get(&credential_id).await?;

        let claims = self.verifier.verify(account_token, now_unix_seconds).await?;
        if claims.sub != principal {
            warn!(principal, "account token subject mismatch on authentication");
            return Err(Error::SubjectMismatch);
        }
        // Credentials registered under an account scope only authenticate
        // within that scope.
        if credential.account_id.is_some() && claims.account_id != credential.account_id {
            return Err(Error::AccountMismatch);
        }

        let stored = self.challenges.consume(&principal).await?;
        if stored != challenge {
            return Err(Error::ChallengeMissingOrExpired);
        }

        let new_count = self
            .engine
            .verify_assertion(assertion, &challenge, &credential)?;
        if new_count <= credential.sign_count {
            warn!(
                principal,
                stored = credential.sign_count,
                reported = new_count,
                "signature counter regression; rejecting ceremony"
            );
            return Err(Error::SignatureReplaySuspected {
                credential_id: Base64UrlUnpadded::encode_string(&credential.credential_id),
                stored: credential.sign_count,
                reported: new_count,
            });
        }
        self.credentials
            .bump_sign_count(&credential_id, new_count)
            .await?;
        debug!(principal, "authentication ceremony verified");
        Ok(principal)
    }

    /// Verify a challenge token and enforce its single-use `jti`.
    async fn decode_challenge_token(
        &self,
        token: &str,
        now_unix_seconds: i64,
    ) -> Result<TokenClaims, Error> {
        let claims = self
            .codec
            .verify(token, self.codec.issuer(), now_unix_seconds)?;
        // Hold the jti for as long as verification could still accept the
        // token, leeway included.
        self.replay_guard
            .check_and_record(
                &claims.jti,
                claims.exp.saturating_add(DEFAULT_LEEWAY_SECONDS),
                now_unix_seconds,
            )
            .await?;
        Ok(claims)
    }
}
