use rand::{distributions::Alphanumeric, thread_rng, Rng};
use sha2::{Digest, Sha256};

/// One-time password-reset secret. `raw` goes to the user out-of-band and is
/// never persisted or logged; the store keeps only `hash`.
pub struct ResetToken {
    pub raw: String,
    pub hash: String,
}

impl ResetToken {
    /// Generate a fresh high-entropy secret and its lookup digest.
    pub fn generate() -> Self {
        let raw: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(64)
            .map(char::from)
            .collect();
        let hash = hash_reset_token(&raw);
        Self { raw, hash }
    }
}

/// SHA-256 hex digest of a raw reset secret. Deterministic so the
/// reset-completion path can re-derive the stored lookup key.
pub fn hash_reset_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}
