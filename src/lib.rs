//! Federated passkey authentication core.
//!
//! Three cooperating roles share this crate: an identity provider that mints
//! scoped bearer tokens ([`coordinator`]), an extension verifier that
//! authorizes account-level entitlements ([`extension`]), and a relying-party
//! WebAuthn orchestrator that runs registration and authentication ceremonies
//! gated by cross-service tokens ([`ceremony`]). The trust-and-challenge
//! protocol binding them lives here; HTTP surfaces and the WebAuthn
//! cryptographic engine are collaborators owned by the host.

pub mod ceremony;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod extension;
pub mod store;
pub mod token;
pub mod verifier;

pub use ceremony::{CeremonyEngine, CeremonyOrchestrator, CeremonyStart, RegisteredCredential};
pub use coordinator::{IssuedToken, TrustChainCoordinator};
pub use directory::{derive_user_handle, PrincipalDirectory};
pub use error::Error;
pub use extension::ExtensionVerifier;
pub use store::{ChallengeStore, Credential, CredentialStore};
pub use token::{now_unix_seconds, ClaimSet, ReplayGuard, TokenClaims, TokenCodec};
pub use verifier::{CrossServiceVerifier, HttpTransport, PeerTransport};
