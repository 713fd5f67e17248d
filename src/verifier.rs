//! Cross-service token verification.
//!
//! Inbound tokens are verified locally first (signature, issuer, audience,
//! expiry), then forwarded to the peer's verification endpoint for flows that
//! require account-level authorization. Transport failures and 5xx replies
//! are retried with a fixed backoff; any 4xx is an authoritative rejection
//! and is never retried.

use serde::Deserialize;
use serde_json::json;
use std::{future::Future, pin::Pin, time::Duration};
use tokio::time::sleep;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::Error;
use crate::token::{TokenClaims, TokenCodec};

/// Maximum peer verification attempts.
pub const DEFAULT_PEER_ATTEMPTS: u32 = 3;
/// Fixed backoff between retryable failures.
pub const DEFAULT_PEER_BACKOFF: Duration = Duration::from_secs(1);
/// Per-attempt request timeout.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(2);

/// A transport-level failure (connect, timeout, read). Retryable.
#[derive(Debug)]
pub struct TransportError(pub String);

/// Raw reply from the peer endpoint before inspection.
#[derive(Debug, Clone)]
pub struct PeerReply {
    pub status: u16,
    pub body: String,
}

/// Body of a successful peer verification reply.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerVerification {
    pub status: String,
    pub subject: String,
    #[serde(default)]
    pub account: Option<String>,
}

/// Seam for the peer verification call, so retry semantics can be exercised
/// without a network.
pub trait PeerTransport: Send + Sync {
    fn post_token<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<PeerReply, TransportError>> + Send + 'a>>;
}

/// reqwest-backed transport: POST `{"token": ...}` to the configured URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl HttpTransport {
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self::with_timeout(url, DEFAULT_PEER_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(url: Url, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            timeout,
        }
    }
}

impl PeerTransport for HttpTransport {
    fn post_token<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<PeerReply, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url.clone())
                .timeout(self.timeout)
                .json(&json!({ "token": token }))
                .send()
                .await
                .map_err(|e| TransportError(e.to_string()))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| TransportError(e.to_string()))?;
            Ok(PeerReply { status, body })
        })
    }
}

/// Validates inbound scoped tokens locally, then against the peer service.
pub struct CrossServiceVerifier<T: PeerTransport> {
    codec: TokenCodec,
    expected_issuer: String,
    audience: String,
    transport: T,
    attempts: u32,
    backoff: Duration,
}

impl<T: PeerTransport> CrossServiceVerifier<T> {
    #[must_use]
    pub fn new(
        codec: TokenCodec,
        expected_issuer: impl Into<String>,
        audience: impl Into<String>,
        transport: T,
    ) -> Self {
        Self {
            codec,
            expected_issuer: expected_issuer.into(),
            audience: audience.into(),
            transport,
            attempts: DEFAULT_PEER_ATTEMPTS,
            backoff: DEFAULT_PEER_BACKOFF,
        }
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Verify a token locally only (signature, issuer, audience, expiry).
    ///
    /// # Errors
    ///
    /// See [`TokenCodec::verify_issued_by`].
    pub fn verify_local(&self, token: &str, now_unix_seconds: i64) -> Result<TokenClaims, Error> {
        self.codec
            .verify_issued_by(token, &self.expected_issuer, &self.audience, now_unix_seconds)
    }

    /// Verify a token locally and against the peer verification endpoint.
    ///
    /// The peer reply must carry the validity marker and match the locally
    /// verified subject and account id; transport success alone is not
    /// acceptance.
    ///
    /// # Errors
    ///
    /// Local verification errors propagate unchanged. Peer failures surface
    /// as [`Error::PeerRejected`] (any 4xx, missing validity marker) or
    /// [`Error::PeerUnreachable`] (retries exhausted on transport errors and
    /// 5xx replies). Claim mismatches surface as [`Error::SubjectMismatch`]
    /// or [`Error::AccountMismatch`].
    #[instrument(skip(self, token))]
    pub async fn verify(&self, token: &str, now_unix_seconds: i64) -> Result<TokenClaims, Error> {
        let claims = self.verify_local(token, now_unix_seconds)?;
        let verification = self.call_peer(token).await?;

        if verification.subject != claims.sub {
            return Err(Error::SubjectMismatch);
        }
        if verification.account != claims.account_id {
            return Err(Error::AccountMismatch);
        }
        debug!(subject = %claims.sub, "peer verification accepted");
        Ok(claims)
    }

    async fn call_peer(&self, token: &str) -> Result<PeerVerification, Error> {
        for attempt in 1..=self.attempts {
            match self.transport.post_token(token).await {
                Ok(reply) if (400..500).contains(&reply.status) => {
                    // Authoritative rejection, never retried.
                    return Err(Error::PeerRejected {
                        status: reply.status,
                        body: reply.body,
                    });
                }
                Ok(reply) if (200..300).contains(&reply.status) => {
                    let verification: PeerVerification = serde_json::from_str(&reply.body)
                        .map_err(|_| Error::PeerRejected {
                            status: reply.status,
                            body: reply.body.clone(),
                        })?;
                    if verification.status != "valid" {
                        return Err(Error::PeerRejected {
                            status: reply.status,
                            body: reply.body,
                        });
                    }
                    return Ok(verification);
                }
                Ok(reply) => {
                    warn!(attempt, status = reply.status, "peer returned retryable status");
                }
                Err(TransportError(reason)) => {
                    warn!(attempt, %reason, "peer transport error");
                }
            }
            if attempt < self.attempts {
                sleep(self.backoff).await;
            }
        }
        Err(Error::PeerUnreachable {
            attempts: self.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::ClaimSet;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    const SECRET: &[u8] = b"super-secure-token";
    const ISSUER: &str = "identity-provider";
    const AUDIENCE: &str = "relying-party-server";
    const NOW: i64 = 1_700_000_000;

    /// Pops scripted replies in order and counts calls.
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<PeerReply, TransportError>>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<PeerReply, TransportError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PeerTransport for &ScriptedTransport {
        fn post_token<'a>(
            &'a self,
            _token: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<PeerReply, TransportError>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replies
                .lock()
                .expect("scripted replies lock")
                .pop_front()
                .unwrap_or(Err(TransportError("script exhausted".to_string())));
            Box::pin(async move { reply })
        }
    }

    fn verifier(transport: &ScriptedTransport) -> CrossServiceVerifier<&ScriptedTransport> {
        CrossServiceVerifier::new(TokenCodec::new(SECRET, ISSUER), ISSUER, AUDIENCE, transport)
            .with_backoff(Duration::ZERO)
    }

    fn issue_token() -> Result<String, Error> {
        let claims = ClaimSet {
            subject: "alice".to_string(),
            account_id: Some("acc1".to_string()),
            ..ClaimSet::default()
        };
        TokenCodec::new(SECRET, ISSUER).issue(&claims, AUDIENCE, NOW)
    }

    fn valid_body(subject: &str, account: &str) -> String {
        serde_json::json!({ "status": "valid", "subject": subject, "account": account })
            .to_string()
    }

    #[tokio::test]
    async fn transport_errors_exhaust_exactly_the_retry_budget() -> Result<(), Error> {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError("connection refused".to_string())),
            Err(TransportError("connection refused".to_string())),
            Err(TransportError("connection refused".to_string())),
        ]);
        let result = verifier(&transport).verify(&issue_token()?, NOW).await;
        assert!(matches!(result, Err(Error::PeerUnreachable { attempts: 3 })));
        assert_eq!(transport.calls(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn first_attempt_403_is_final() -> Result<(), Error> {
        let transport = ScriptedTransport::new(vec![Ok(PeerReply {
            status: 403,
            body: "forbidden".to_string(),
        })]);
        let result = verifier(&transport).verify(&issue_token()?, NOW).await;
        assert!(matches!(
            result,
            Err(Error::PeerRejected { status: 403, .. })
        ));
        assert_eq!(transport.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn recovers_from_5xx_within_budget() -> Result<(), Error> {
        let transport = ScriptedTransport::new(vec![
            Ok(PeerReply {
                status: 503,
                body: String::new(),
            }),
            Err(TransportError("timed out".to_string())),
            Ok(PeerReply {
                status: 200,
                body: valid_body("alice", "acc1"),
            }),
        ]);
        let claims = verifier(&transport).verify(&issue_token()?, NOW).await?;
        assert_eq!(claims.sub, "alice");
        assert_eq!(transport.calls(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn peer_subject_must_match_local_claims() -> Result<(), Error> {
        let transport = ScriptedTransport::new(vec![Ok(PeerReply {
            status: 200,
            body: valid_body("mallory", "acc1"),
        })]);
        let result = verifier(&transport).verify(&issue_token()?, NOW).await;
        assert!(matches!(result, Err(Error::SubjectMismatch)));
        Ok(())
    }

    #[tokio::test]
    async fn peer_account_must_match_local_claims() -> Result<(), Error> {
        let transport = ScriptedTransport::new(vec![Ok(PeerReply {
            status: 200,
            body: valid_body("alice", "acc9"),
        })]);
        let result = verifier(&transport).verify(&issue_token()?, NOW).await;
        assert!(matches!(result, Err(Error::AccountMismatch)));
        Ok(())
    }

    #[tokio::test]
    async fn missing_validity_marker_is_a_rejection() -> Result<(), Error> {
        let transport = ScriptedTransport::new(vec![Ok(PeerReply {
            status: 200,
            body: serde_json::json!({ "status": "revoked", "subject": "alice", "account": "acc1" })
                .to_string(),
        })]);
        let result = verifier(&transport).verify(&issue_token()?, NOW).await;
        assert!(matches!(result, Err(Error::PeerRejected { .. })));
        assert_eq!(transport.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn local_failure_skips_the_peer_entirely() -> Result<(), Error> {
        let transport = ScriptedTransport::new(vec![]);
        let verifier = verifier(&transport);
        let expired = TokenCodec::new(SECRET, ISSUER).issue(
            &ClaimSet::for_subject("alice"),
            AUDIENCE,
            NOW - 600,
        )?;
        let result = verifier.verify(&expired, NOW).await;
        assert!(matches!(result, Err(Error::TokenExpired)));
        assert_eq!(transport.calls(), 0);
        Ok(())
    }
}
