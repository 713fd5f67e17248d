use thiserror::Error;

/// Failure kinds shared by every service in the trust chain.
///
/// Each variant is a stable kind; the attached data is the human-readable
/// reason. Nothing here is retried internally except [`Error::PeerUnreachable`],
/// which the cross-service verifier produces only after its retry budget is
/// spent.
#[derive(Debug, Error)]
pub enum Error {
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token: {0}")]
    TokenInvalid(String),
    #[error("invalid issuer")]
    IssuerMismatch,
    #[error("invalid audience")]
    AudienceMismatch,
    #[error("missing required claim: {0}")]
    ClaimsMissing(&'static str),
    #[error("missing or expired challenge")]
    ChallengeMissingOrExpired,
    #[error("credential not found")]
    CredentialNotFound,
    #[error("user not found or no credentials registered")]
    UserNotFound,
    #[error("account id does not match token claims")]
    AccountMismatch,
    #[error("token subject does not match principal")]
    SubjectMismatch,
    #[error("account not in principal entitlements")]
    AccountUnauthorized,
    #[error("peer verification endpoint unreachable after {attempts} attempts")]
    PeerUnreachable { attempts: u32 },
    #[error("peer rejected token ({status}): {body}")]
    PeerRejected { status: u16, body: String },
    #[error("signature counter regression for credential {credential_id}: stored {stored}, reported {reported}")]
    SignatureReplaySuspected {
        credential_id: String,
        stored: u32,
        reported: u32,
    },
}

impl Error {
    /// Stable machine-readable kind, independent of the reason text.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TokenExpired => "token_expired",
            Self::TokenInvalid(_) => "token_invalid",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::AudienceMismatch => "audience_mismatch",
            Self::ClaimsMissing(_) => "claims_missing",
            Self::ChallengeMissingOrExpired => "challenge_missing_or_expired",
            Self::CredentialNotFound => "credential_not_found",
            Self::UserNotFound => "user_not_found",
            Self::AccountMismatch => "account_mismatch",
            Self::SubjectMismatch => "subject_mismatch",
            Self::AccountUnauthorized => "account_unauthorized",
            Self::PeerUnreachable { .. } => "peer_unreachable",
            Self::PeerRejected { .. } => "peer_rejected",
            Self::SignatureReplaySuspected { .. } => "signature_replay_suspected",
        }
    }
}
