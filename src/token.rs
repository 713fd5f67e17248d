//! Scoped token codec shared by every service in the trust chain.
//!
//! Tokens are compact dot-separated JWTs signed with HS256 under a shared
//! secret. The same codec issues identity-provider tokens (one per downstream
//! audience) and the relying party's self-issued challenge tokens, so claim
//! validation lives in exactly one place instead of drifting per service.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Error;

/// Current unix seconds; issuance and verification take this explicitly so
/// expiry boundaries stay testable.
#[must_use]
pub fn now_unix_seconds() -> i64 {
    Utc::now().timestamp()
}

type HmacSha256 = Hmac<Sha256>;

/// Default token lifetime in seconds.
pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 60;
/// Default clock-skew leeway applied to expiry checks.
pub const DEFAULT_LEEWAY_SECONDS: i64 = 30;

const NONCE_BYTES: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,
    pub typ: String,
}

impl TokenHeader {
    fn hs256() -> Self {
        Self {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

/// Full claim set carried by a scoped token.
///
/// Challenge tokens ride the same structure: the relying party embeds the
/// ceremony state (`challenge`, `handle`) next to the standard claims instead
/// of keeping server-side sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub nonce: String,
    pub jti: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// Caller-supplied claims; the codec fills in the rest at issuance.
#[derive(Debug, Clone, Default)]
pub struct ClaimSet {
    pub subject: String,
    pub account_id: Option<String>,
    pub display_name: Option<String>,
    pub challenge: Option<String>,
    pub handle: Option<String>,
}

impl ClaimSet {
    #[must_use]
    pub fn for_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, Error> {
    let json = serde_json::to_vec(value)
        .map_err(|e| Error::TokenInvalid(format!("invalid json: {e}")))?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d(segment: &str) -> Result<Vec<u8>, Error> {
    Base64UrlUnpadded::decode_vec(segment)
        .map_err(|_| Error::TokenInvalid("invalid base64url encoding".to_string()))
}

/// Sign claims into a compact HS256 token.
///
/// # Errors
///
/// Returns an error if the header or claims cannot be JSON encoded.
pub fn sign_hs256(secret: &[u8], claims: &TokenClaims) -> Result<String, Error> {
    let header_b64 = b64e_json(&TokenHeader::hs256())?;
    let claims_b64 = b64e_json(claims)?;
    let signing_input = format!("{header_b64}.{claims_b64}");

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| Error::TokenInvalid("invalid signing key length".to_string()))?;
    mac.update(signing_input.as_bytes());
    let signature_b64 = Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Verify a compact HS256 token and return its decoded claims.
///
/// Expiry is checked with a fixed leeway: a token is accepted up to and
/// including `exp + leeway`, and rejected one second later.
///
/// # Errors
///
/// Returns an error if:
/// - the token is malformed or contains invalid base64/json,
/// - the signature does not verify under `secret`,
/// - a required claim (`sub`, `iss`, `aud`, `iat`, `exp`) is absent,
/// - the claims fail validation (`iss`, `aud`, `exp`).
pub fn verify_hs256(
    token: &str,
    secret: &[u8],
    expected_issuer: &str,
    expected_audience: &str,
    now_unix_seconds: i64,
    leeway_seconds: i64,
) -> Result<TokenClaims, Error> {
    let mut parts = token.split('.');
    let header_b64 = parts
        .next()
        .ok_or_else(|| Error::TokenInvalid("invalid token format".to_string()))?;
    let claims_b64 = parts
        .next()
        .ok_or_else(|| Error::TokenInvalid("invalid token format".to_string()))?;
    let sig_b64 = parts
        .next()
        .ok_or_else(|| Error::TokenInvalid("invalid token format".to_string()))?;
    if parts.next().is_some() {
        return Err(Error::TokenInvalid("invalid token format".to_string()));
    }

    let header: TokenHeader = serde_json::from_slice(&b64d(header_b64)?)
        .map_err(|e| Error::TokenInvalid(format!("invalid header: {e}")))?;
    if header.alg != "HS256" {
        return Err(Error::TokenInvalid(format!(
            "unsupported algorithm: {}",
            header.alg
        )));
    }

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| Error::TokenInvalid("invalid signing key length".to_string()))?;
    mac.update(format!("{header_b64}.{claims_b64}").as_bytes());
    let signature = b64d(sig_b64)?;
    mac.verify_slice(&signature)
        .map_err(|_| Error::TokenInvalid("invalid signature".to_string()))?;

    let raw: serde_json::Value = serde_json::from_slice(&b64d(claims_b64)?)
        .map_err(|e| Error::TokenInvalid(format!("invalid claims json: {e}")))?;
    for required in ["sub", "iss", "aud", "iat", "exp"] {
        match raw.get(required) {
            None => return Err(Error::ClaimsMissing(required)),
            Some(value) if value.is_null() => return Err(Error::ClaimsMissing(required)),
            Some(_) => {}
        }
    }
    let claims: TokenClaims = serde_json::from_value(raw)
        .map_err(|e| Error::TokenInvalid(format!("invalid claims: {e}")))?;

    if claims.iss != expected_issuer {
        return Err(Error::IssuerMismatch);
    }
    if claims.aud != expected_audience {
        return Err(Error::AudienceMismatch);
    }
    if now_unix_seconds > claims.exp.saturating_add(leeway_seconds) {
        return Err(Error::TokenExpired);
    }

    Ok(claims)
}

/// Issues and verifies scoped tokens for one trusted issuer.
///
/// Pure function of the token plus this configuration; no side effects.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
    issuer: String,
    ttl_seconds: i64,
    leeway_seconds: i64,
}

impl TokenCodec {
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>, issuer: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            issuer: issuer.into(),
            ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
            leeway_seconds: DEFAULT_LEEWAY_SECONDS,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    #[must_use]
    pub fn with_leeway(mut self, leeway_seconds: i64) -> Self {
        self.leeway_seconds = leeway_seconds;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Issue a token scoped to a single audience.
    ///
    /// Attaches issuer, issued-at/expiry, a fresh `jti` and a random nonce;
    /// every issuance gets unique `jti`/`nonce` even for identical claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the claims cannot be encoded.
    pub fn issue(
        &self,
        claims: &ClaimSet,
        audience: &str,
        now_unix_seconds: i64,
    ) -> Result<String, Error> {
        let mut nonce = [0u8; NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce);

        let full = TokenClaims {
            sub: claims.subject.clone(),
            account_id: claims.account_id.clone(),
            name: claims.display_name.clone(),
            iss: self.issuer.clone(),
            aud: audience.to_string(),
            iat: now_unix_seconds,
            exp: now_unix_seconds.saturating_add(self.ttl_seconds),
            nonce: Base64UrlUnpadded::encode_string(&nonce),
            jti: Uuid::new_v4().to_string(),
            challenge: claims.challenge.clone(),
            handle: claims.handle.clone(),
        };
        sign_hs256(&self.secret, &full)
    }

    /// Verify a token this codec issued itself.
    ///
    /// # Errors
    ///
    /// See [`verify_hs256`].
    pub fn verify(
        &self,
        token: &str,
        expected_audience: &str,
        now_unix_seconds: i64,
    ) -> Result<TokenClaims, Error> {
        self.verify_issued_by(token, &self.issuer, expected_audience, now_unix_seconds)
    }

    /// Verify a token minted by a different trusted issuer under the shared
    /// secret (identity-provider tokens consumed downstream).
    ///
    /// # Errors
    ///
    /// See [`verify_hs256`].
    pub fn verify_issued_by(
        &self,
        token: &str,
        expected_issuer: &str,
        expected_audience: &str,
        now_unix_seconds: i64,
    ) -> Result<TokenClaims, Error> {
        verify_hs256(
            token,
            &self.secret,
            expected_issuer,
            expected_audience,
            now_unix_seconds,
            self.leeway_seconds,
        )
    }
}

/// Single-use `jti` tracking for challenge tokens.
///
/// Challenge tokens replace server-side ceremony sessions, so nothing else
/// stops a captured token from driving a second completion. Recording each
/// `jti` until its expiry closes that hole; expired entries are purged lazily.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    seen: Mutex<HashMap<String, i64>>,
}

impl ReplayGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `jti`; fails if it was already recorded and is still live.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenInvalid`] when the id has been seen before.
    pub async fn check_and_record(
        &self,
        jti: &str,
        expires_at: i64,
        now_unix_seconds: i64,
    ) -> Result<(), Error> {
        let mut seen = self.seen.lock().await;
        seen.retain(|_, exp| *exp >= now_unix_seconds);
        if seen.contains_key(jti) {
            return Err(Error::TokenInvalid(
                "challenge token replayed".to_string(),
            ));
        }
        seen.insert(jti.to_string(), expires_at);
        Ok(())
    }
}
