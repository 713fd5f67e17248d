//! End-to-end flow across the three roles: the coordinator mints scoped
//! tokens, the extension verifier answers peer verification calls, and the
//! relying-party orchestrator runs full registration and authentication
//! ceremonies on top of both.

use anyhow::Result;
use base64ct::{Base64UrlUnpadded, Encoding};
use keyfed::ceremony::{CeremonyEngine, CeremonyOrchestrator, RegisteredCredential};
use keyfed::verifier::{CrossServiceVerifier, PeerReply, PeerTransport, TransportError};
use keyfed::{
    ChallengeStore, Credential, CredentialStore, Error, ExtensionVerifier, PrincipalDirectory,
    TokenCodec, TrustChainCoordinator,
};
use serde_json::{json, Value};
use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

const SECRET: &[u8] = b"super-secure-token";
const IDP_ISSUER: &str = "identity-provider";
const RP_AUDIENCE: &str = "relying-party-server";
const EXT_AUDIENCE: &str = "extension-server";
const RP_ID: &str = "localhost";
const NOW: i64 = 1_700_000_000;
const CRED_ID: &[u8] = b"integration-credential";

fn directory() -> PrincipalDirectory {
    let mut directory = PrincipalDirectory::new();
    directory.insert("alice", "Alice", "correct horse", ["acc1", "acc2"]);
    directory.insert("bob", "Bob", "hunter2", ["acc3"]);
    directory
}

/// Engine double standing in for the WebAuthn cryptographic collaborator.
struct StubEngine;

impl CeremonyEngine for StubEngine {
    fn registration_options(
        &self,
        principal: &str,
        user_handle: &[u8],
        challenge: &str,
    ) -> Result<Value, Error> {
        Ok(json!({
            "rp": { "id": RP_ID },
            "user": { "name": principal, "id": Base64UrlUnpadded::encode_string(user_handle) },
            "challenge": challenge,
        }))
    }

    fn verify_attestation(
        &self,
        _attestation: &Value,
        _challenge: &str,
        _user_handle: &[u8],
    ) -> Result<RegisteredCredential, Error> {
        Ok(RegisteredCredential {
            credential_id: CRED_ID.to_vec(),
            public_key: vec![9; 77],
            is_resident_key: false,
        })
    }

    fn authentication_options(
        &self,
        allow_credentials: &[Vec<u8>],
        challenge: &str,
    ) -> Result<Value, Error> {
        Ok(json!({
            "allowCredentials": allow_credentials
                .iter()
                .map(|id| Base64UrlUnpadded::encode_string(id))
                .collect::<Vec<_>>(),
            "challenge": challenge,
        }))
    }

    fn verify_assertion(
        &self,
        assertion: &Value,
        _challenge: &str,
        _credential: &Credential,
    ) -> Result<u32, Error> {
        let count = assertion
            .get("signCount")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

/// Peer transport backed by a live [`ExtensionVerifier`], mimicking the
/// extension service's HTTP verification endpoint: the subject is read from
/// the forwarded token, failures map to 4xx replies.
struct ExtensionPeer {
    verifier: Arc<ExtensionVerifier>,
}

impl PeerTransport for ExtensionPeer {
    fn post_token<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<PeerReply, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let subject = token
                .split('.')
                .nth(1)
                .and_then(|segment| Base64UrlUnpadded::decode_vec(segment).ok())
                .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
                .and_then(|claims| {
                    claims
                        .get("sub")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_default();

            match self.verifier.prepare(&subject, token, NOW).await {
                Ok(prepared) => Ok(PeerReply {
                    status: 200,
                    body: serde_json::to_string(&prepared)
                        .map_err(|e| TransportError(e.to_string()))?,
                }),
                Err(err) => Ok(PeerReply {
                    status: 403,
                    body: err.to_string(),
                }),
            }
        })
    }
}

fn orchestrator() -> CeremonyOrchestrator<StubEngine, ExtensionPeer> {
    // The relying party cross-checks account tokens against the extension
    // service; the extension side verifies tokens scoped to its own audience.
    let extension = Arc::new(ExtensionVerifier::new(
        TokenCodec::new(SECRET, EXT_AUDIENCE),
        IDP_ISSUER,
        EXT_AUDIENCE,
        directory(),
    ));
    let verifier = CrossServiceVerifier::new(
        TokenCodec::new(SECRET, RP_AUDIENCE),
        IDP_ISSUER,
        EXT_AUDIENCE,
        ExtensionPeer {
            verifier: extension,
        },
    )
    .with_backoff(Duration::ZERO);

    CeremonyOrchestrator::new(
        StubEngine,
        verifier,
        TokenCodec::new(SECRET, RP_AUDIENCE),
        RP_ID,
        ChallengeStore::new(),
        CredentialStore::new(),
    )
}

fn coordinator() -> TrustChainCoordinator {
    TrustChainCoordinator::new(
        directory(),
        TokenCodec::new(SECRET, IDP_ISSUER),
        [RP_AUDIENCE, EXT_AUDIENCE],
    )
}

fn token_for(issued: &[keyfed::IssuedToken], audience: &str) -> String {
    issued
        .iter()
        .find(|token| token.audience == audience)
        .map(|token| token.token.clone())
        .expect("audience present")
}

#[tokio::test]
async fn full_registration_and_authentication() -> Result<()> {
    let coordinator = coordinator();
    let orchestrator = orchestrator();

    // Coordinator: one token per downstream audience.
    let issued = coordinator.issue_tokens("alice", "correct horse", "acc1", NOW)?;
    assert_eq!(issued.len(), 2);
    let ext_token = token_for(&issued, EXT_AUDIENCE);

    // Registration ceremony, cross-checked against the extension service.
    let start = orchestrator.register_begin("alice", NOW).await?;
    assert_eq!(
        start.options.get("challenge").and_then(Value::as_str),
        orchestrator_challenge(&start.challenge_token).as_deref()
    );
    let credential = orchestrator
        .register_complete(&json!({}), &start.challenge_token, Some(&ext_token), NOW)
        .await?;
    assert_eq!(credential.sign_count, 0);
    assert_eq!(credential.account_id.as_deref(), Some("acc1"));

    // Authentication ceremony with a freshly minted token set.
    let issued = coordinator.issue_tokens("alice", "correct horse", "acc1", NOW)?;
    let start = orchestrator.authenticate_begin("alice", NOW).await?;
    let assertion = json!({
        "rawId": Base64UrlUnpadded::encode_string(CRED_ID),
        "signCount": 1,
    });
    let principal = orchestrator
        .authenticate_complete(
            &assertion,
            &start.challenge_token,
            &token_for(&issued, EXT_AUDIENCE),
            NOW,
        )
        .await?;
    assert_eq!(principal, "alice");
    assert_eq!(orchestrator.credentials().get(CRED_ID).await?.sign_count, 1);
    Ok(())
}

/// Extract the challenge claim from an unverified token for assertions only.
fn orchestrator_challenge(token: &str) -> Option<String> {
    let claims_b64 = token.split('.').nth(1)?;
    let claims: Value = serde_json::from_slice(&Base64UrlUnpadded::decode_vec(claims_b64).ok()?).ok()?;
    claims
        .get("challenge")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[tokio::test]
async fn rp_token_is_not_accepted_by_the_extension_peer() -> Result<()> {
    let coordinator = coordinator();
    let orchestrator = orchestrator();

    let issued = coordinator.issue_tokens("alice", "correct horse", "acc1", NOW)?;
    let rp_token = token_for(&issued, RP_AUDIENCE);

    let start = orchestrator.register_begin("alice", NOW).await?;
    // The relying-party audience token must not pass a check scoped to the
    // extension audience, so the ceremony fails before anything persists.
    let result = orchestrator
        .register_complete(&json!({}), &start.challenge_token, Some(&rp_token), NOW)
        .await;
    assert!(matches!(result, Err(Error::AudienceMismatch)));
    assert!(orchestrator
        .credentials()
        .list_by_principal("alice")
        .await
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn unentitled_account_is_rejected_by_the_peer() -> Result<()> {
    let orchestrator = orchestrator();

    // Mint a token for bob's account under alice's name by bypassing the
    // coordinator's entitlement check; the extension peer still rejects it.
    let claims = keyfed::ClaimSet {
        subject: "alice".to_string(),
        account_id: Some("acc3".to_string()),
        ..keyfed::ClaimSet::default()
    };
    let forged = TokenCodec::new(SECRET, IDP_ISSUER).issue(&claims, EXT_AUDIENCE, NOW)?;

    let start = orchestrator.register_begin("alice", NOW).await?;
    let result = orchestrator
        .register_complete(&json!({}), &start.challenge_token, Some(&forged), NOW)
        .await;
    assert!(matches!(result, Err(Error::PeerRejected { status: 403, .. })));
    Ok(())
}

#[tokio::test]
async fn extension_round_trip_with_client_data() -> Result<()> {
    let coordinator = coordinator();
    let extension = ExtensionVerifier::new(
        TokenCodec::new(SECRET, EXT_AUDIENCE),
        IDP_ISSUER,
        EXT_AUDIENCE,
        directory(),
    );

    let issued = coordinator.issue_tokens("bob", "hunter2", "acc3", NOW)?;
    let token = token_for(&issued, EXT_AUDIENCE);

    let prepared = extension.prepare("bob", &token, NOW).await?;
    let client_data = Base64UrlUnpadded::encode_string(
        json!({ "type": "webauthn.get", "challenge": prepared.challenge })
            .to_string()
            .as_bytes(),
    );
    let validated = extension.validate("bob", &token, &client_data, NOW).await?;
    assert!(validated.authenticated);
    assert_eq!(validated.account, "acc3");
    Ok(())
}
