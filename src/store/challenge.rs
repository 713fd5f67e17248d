//! Single-use, TTL-bound challenge storage keyed by principal.

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Error;

/// Default challenge lifetime in seconds.
pub const DEFAULT_CHALLENGE_TTL_SECONDS: u64 = 120;

const CHALLENGE_BYTES: usize = 32;

/// Generate a fresh base64url challenge from 32 random bytes.
#[must_use]
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

#[derive(Debug, Clone)]
struct StoredChallenge {
    value: String,
    expires_at: Instant,
}

/// At most one live challenge per principal, consumed exactly once.
///
/// A single mutex over the map makes `consume` an atomic retrieve-and-delete,
/// so two concurrent completions cannot both succeed on one challenge.
#[derive(Debug)]
pub struct ChallengeStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, StoredChallenge>>,
}

impl Default for ChallengeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChallengeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(DEFAULT_CHALLENGE_TTL_SECONDS))
    }

    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a challenge for a principal, invalidating any unconsumed one.
    ///
    /// Starting a new ceremony always supersedes a stale ceremony in flight.
    pub async fn issue(&self, principal: &str) -> String {
        let challenge = generate_challenge();
        let mut entries = self.entries.lock().await;
        if entries
            .insert(
                principal.to_string(),
                StoredChallenge {
                    value: challenge.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            )
            .is_some()
        {
            debug!(principal, "superseded an unconsumed challenge");
        }
        challenge
    }

    /// Atomically retrieve and delete the principal's challenge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChallengeMissingOrExpired`] when no challenge is
    /// stored or the stored one has passed its TTL; expired entries are
    /// removed as a side effect.
    pub async fn consume(&self, principal: &str) -> Result<String, Error> {
        let mut entries = self.entries.lock().await;
        let stored = entries
            .remove(principal)
            .ok_or(Error::ChallengeMissingOrExpired)?;
        if Instant::now() > stored.expires_at {
            return Err(Error::ChallengeMissingOrExpired);
        }
        Ok(stored.value)
    }
}
