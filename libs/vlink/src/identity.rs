//! The per-process transport identity: uid, keypair and its fingerprint.

use std::fmt;

use boringtun::x25519::{PublicKey, StaticSecret};
use rand::SeedableRng as _;
use rand::rngs::StdRng;

pub const FINGERPRINT_ALG: &str = "x25519";

/// Immutable for the process lifetime. The fingerprint is what peers pin:
/// a link only becomes ready against the key it names.
pub struct NodeIdentity {
    uid: String,
    secret: StaticSecret,
    public: PublicKey,
}

impl NodeIdentity {
    pub fn generate(uid: String) -> Self {
        let mut rng = StdRng::from_entropy();
        let secret = StaticSecret::random_from_rng(&mut rng);
        let public = PublicKey::from(&secret);

        Self {
            uid,
            secret,
            public,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn secret(&self) -> StaticSecret {
        self.secret.clone()
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// RFC 4572 presentation: algorithm, space, uppercase hex pairs joined
    /// by colons.
    pub fn fingerprint(&self) -> String {
        format_fingerprint(self.public.as_bytes())
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("uid", &self.uid)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

pub fn format_fingerprint(key: &[u8; 32]) -> String {
    let hex_pairs = key
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");

    format!("{FINGERPRINT_ALG} {hex_pairs}")
}

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("fingerprint has no algorithm prefix")]
    MissingAlgorithm,
    #[error("unsupported fingerprint algorithm `{0}`")]
    UnsupportedAlgorithm(String),
    #[error("fingerprint digest is not {expected} bytes of hex")]
    BadDigest { expected: usize },
}

/// Splits `"<alg> <hex>"` and returns the peer's pinned public key.
pub fn parse_fingerprint(fingerprint: &str) -> Result<PublicKey, FingerprintError> {
    let (alg, digest) = fingerprint
        .trim()
        .split_once(' ')
        .ok_or(FingerprintError::MissingAlgorithm)?;

    if !alg.eq_ignore_ascii_case(FINGERPRINT_ALG) {
        return Err(FingerprintError::UnsupportedAlgorithm(alg.to_owned()));
    }

    let compact: String = digest.chars().filter(|c| *c != ':').collect();
    let bytes = hex::decode(compact).map_err(|_| FingerprintError::BadDigest { expected: 32 })?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| FingerprintError::BadDigest { expected: 32 })?;

    Ok(PublicKey::from(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_round_trips() {
        let identity = NodeIdentity::generate("a".repeat(40));

        let key = parse_fingerprint(&identity.fingerprint()).unwrap();

        assert_eq!(key.as_bytes(), identity.public().as_bytes());
    }

    #[test]
    fn fingerprint_presentation_form() {
        let identity = NodeIdentity::generate("a".repeat(40));
        let fingerprint = identity.fingerprint();

        let (alg, digest) = fingerprint.split_once(' ').unwrap();
        assert_eq!(alg, FINGERPRINT_ALG);
        assert_eq!(digest.split(':').count(), 32);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() || c == ':'));
        assert!(!digest.chars().any(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn rejects_malformed_fingerprints() {
        assert!(matches!(
            parse_fingerprint("deadbeef"),
            Err(FingerprintError::MissingAlgorithm)
        ));
        assert!(matches!(
            parse_fingerprint("sha-1 AB:CD"),
            Err(FingerprintError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            parse_fingerprint("x25519 AB:CD"),
            Err(FingerprintError::BadDigest { .. })
        ));
    }

    #[test]
    fn tampered_fingerprint_pins_a_different_key() {
        let identity = NodeIdentity::generate("a".repeat(40));
        let mut fingerprint = identity.fingerprint();

        // Flip one hex digit.
        let flipped = if fingerprint.ends_with('0') { '1' } else { '0' };
        fingerprint.pop();
        fingerprint.push(flipped);

        let key = parse_fingerprint(&fingerprint).unwrap();
        assert_ne!(key.as_bytes(), identity.public().as_bytes());
    }
}
