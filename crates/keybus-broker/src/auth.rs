// Challenge-response authentication material and verification.
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const CHALLENGE_BYTES: usize = 32;

/// One issued login challenge. Replaced wholesale on every `klogin`.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub challenge: [u8; CHALLENGE_BYTES],
    pub salt: [u8; CHALLENGE_BYTES],
}

pub(crate) fn generate() -> Challenge {
    let mut challenge = [0u8; CHALLENGE_BYTES];
    let mut salt = [0u8; CHALLENGE_BYTES];
    random_bytes(&mut challenge);
    random_bytes(&mut salt);
    Challenge { challenge, salt }
}

// Prefer the OS RNG; if it fails, keep serving with the thread-local
// generator. That fallback is NOT cryptographically safe and is logged.
fn random_bytes(buf: &mut [u8]) {
    if let Err(err) = OsRng.try_fill_bytes(buf) {
        tracing::warn!(error = %err, "os rng unavailable, falling back to insecure rng");
        rand::thread_rng().fill_bytes(buf);
    }
}

/// Check a client-supplied HMAC-SHA256 over the issued challenge.
///
/// The MAC key is the configured password concatenated with the salt;
/// the comparison is constant-time. Any length mismatch fails.
pub(crate) fn verify(password: &str, challenge: &Challenge, client_hash: &[u8]) -> bool {
    let mut key = Vec::with_capacity(password.len() + challenge.salt.len());
    key.extend_from_slice(password.as_bytes());
    key.extend_from_slice(&challenge.salt);
    let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
        return false;
    };
    mac.update(&challenge.challenge);
    let computed = mac.finalize().into_bytes();
    computed.as_slice().ct_eq(client_hash).into()
}
