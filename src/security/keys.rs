//! P-256 identity key pairs
//!
//! A key pair is the 32-byte private scalar, the matching 65-byte
//! uncompressed public point, and the hidden-service hostname peers use
//! to connect back to the owner. The private scalar is zeroed from
//! memory on drop.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{ProjectivePoint, PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Error from key handling or key agreement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Bytes do not encode a valid curve point
    BadPoint,
    /// Bytes do not encode a valid private scalar
    BadScalar,
    /// Key agreement produced the identity point
    EmptySecret,
    /// Persisted key material could not be decoded
    BadEncoding,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::BadPoint => write!(f, "malformed curve point"),
            CryptoError::BadScalar => write!(f, "malformed private scalar"),
            CryptoError::EmptySecret => write!(f, "key agreement produced no secret"),
            CryptoError::BadEncoding => write!(f, "malformed persisted key material"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// A P-256 identity key pair bound to a hidden-service domain.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    /// 32-byte private scalar (keep this secret!)
    pub secret: [u8; 32],
    /// 65-byte uncompressed public point
    #[zeroize(skip)]
    pub public: [u8; 65],
    /// Hidden-service hostname peers connect back to
    #[zeroize(skip)]
    pub domain: String,
}

// Custom Debug implementation to prevent accidental private key exposure in logs
impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("secret", &"[REDACTED]")
            .field("public", &hex::encode(self.public))
            .field("domain", &self.domain)
            .finish()
    }
}

impl KeyPair {
    /// Restore a key pair from a stored private scalar.
    pub fn from_secret(secret: &[u8; 32], domain: String) -> Result<Self, CryptoError> {
        let sk = SecretKey::from_slice(secret).map_err(|_| CryptoError::BadScalar)?;
        let point = sk.public_key().to_encoded_point(false);
        let mut public = [0u8; 65];
        public.copy_from_slice(point.as_bytes());
        Ok(Self { secret: *secret, public, domain })
    }
}

/// Generate a new random key pair for `domain`.
///
/// Uses the operating system's cryptographically secure random number
/// generator.
pub fn generate_key_pair(domain: String) -> KeyPair {
    let (secret, public) = generate_ephemeral();
    KeyPair { secret, public, domain }
}

/// Generate a raw scalar/point pair, e.g. for one handshake.
pub fn generate_ephemeral() -> ([u8; 32], [u8; 65]) {
    let sk = SecretKey::random(&mut OsRng);
    let point = sk.public_key().to_encoded_point(false);
    let mut public = [0u8; 65];
    public.copy_from_slice(point.as_bytes());
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&sk.to_bytes());
    (secret, public)
}

/// ECDH key agreement: `secret * their_point`, as the 65-byte
/// uncompressed encoding of the shared point.
pub fn agree(their_public: &[u8], secret: &[u8; 32]) -> Result<[u8; 65], CryptoError> {
    let point = PublicKey::from_sec1_bytes(their_public).map_err(|_| CryptoError::BadPoint)?;
    let sk = SecretKey::from_slice(secret).map_err(|_| CryptoError::BadScalar)?;
    let shared = ProjectivePoint::from(*point.as_affine()) * *sk.to_nonzero_scalar();
    let affine = shared.to_affine();
    let encoded = affine.to_encoded_point(false);
    let bytes = encoded.as_bytes();
    if bytes.len() != 65 {
        // The identity encodes as a single zero byte.
        return Err(CryptoError::EmptySecret);
    }
    let mut out = [0u8; 65];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Session key: SHA-256 over the shared-point encoding.
pub fn session_key(shared: &[u8; 65]) -> [u8; 32] {
    Sha256::digest(shared).into()
}

/// Persisted form of the authentication key material.
///
/// Stored as base64 strings next to the hidden-service descriptor; the
/// control channel that publishes the descriptor is an external
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySet {
    /// Base64 of the 65-byte public point
    pub auth_public: String,
    /// Base64 of the 32-byte private scalar
    pub auth_secret: String,
}

impl KeySet {
    /// Capture a key pair's material for persistence.
    pub fn from_key_pair(kp: &KeyPair) -> Self {
        Self {
            auth_public: BASE64.encode(kp.public),
            auth_secret: BASE64.encode(kp.secret),
        }
    }

    /// Restore the key pair, binding it to `domain`.
    pub fn to_key_pair(&self, domain: String) -> Result<KeyPair, CryptoError> {
        let public = BASE64
            .decode(&self.auth_public)
            .map_err(|_| CryptoError::BadEncoding)?;
        let secret = BASE64
            .decode(&self.auth_secret)
            .map_err(|_| CryptoError::BadEncoding)?;
        let secret: [u8; 32] = secret.try_into().map_err(|_| CryptoError::BadEncoding)?;
        let kp = KeyPair::from_secret(&secret, domain)?;
        if kp.public.as_slice() != public.as_slice() {
            return Err(CryptoError::BadEncoding);
        }
        Ok(kp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key_pair() {
        let kp = generate_key_pair("a.onion".into());
        assert_eq!(kp.public[0], 0x04);
        assert_ne!(kp.secret, [0u8; 32]);
        assert_eq!(kp.domain, "a.onion");
    }

    #[test]
    fn test_unique_key_pairs() {
        let kp1 = generate_key_pair("a.onion".into());
        let kp2 = generate_key_pair("a.onion".into());
        assert_ne!(kp1.secret, kp2.secret);
        assert_ne!(kp1.public, kp2.public);
    }

    #[test]
    fn test_from_secret_is_deterministic() {
        let kp = generate_key_pair("a.onion".into());
        let restored = KeyPair::from_secret(&kp.secret, kp.domain.clone()).unwrap();
        assert_eq!(restored.public, kp.public);
    }

    #[test]
    fn test_zero_scalar_rejected() {
        assert_eq!(
            KeyPair::from_secret(&[0u8; 32], "a.onion".into()).unwrap_err(),
            CryptoError::BadScalar
        );
    }

    #[test]
    fn test_agreement_matches_both_ways() {
        let alice = generate_key_pair("a.onion".into());
        let bob = generate_key_pair("b.onion".into());

        let ab = agree(&bob.public, &alice.secret).unwrap();
        let ba = agree(&alice.public, &bob.secret).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(session_key(&ab), session_key(&ba));
    }

    #[test]
    fn test_agreement_differs_per_pair() {
        let alice = generate_key_pair("a.onion".into());
        let bob = generate_key_pair("b.onion".into());
        let carol = generate_key_pair("c.onion".into());

        let ab = agree(&bob.public, &alice.secret).unwrap();
        let ac = agree(&carol.public, &alice.secret).unwrap();
        assert_ne!(ab, ac);
    }

    #[test]
    fn test_malformed_point_rejected() {
        let kp = generate_key_pair("a.onion".into());
        assert_eq!(agree(&[0x04; 65], &kp.secret).unwrap_err(), CryptoError::BadPoint);
        assert_eq!(agree(&[], &kp.secret).unwrap_err(), CryptoError::BadPoint);
        assert_eq!(agree(&[0x02], &kp.secret).unwrap_err(), CryptoError::BadPoint);
    }

    #[test]
    fn test_key_set_round_trip() {
        let kp = generate_key_pair("a.onion".into());
        let set = KeySet::from_key_pair(&kp);
        let restored = set.to_key_pair("a.onion".into()).unwrap();
        assert_eq!(restored.secret, kp.secret);
        assert_eq!(restored.public, kp.public);
    }

    #[test]
    fn test_key_set_rejects_tampered_public() {
        let kp = generate_key_pair("a.onion".into());
        let other = generate_key_pair("a.onion".into());
        let mut set = KeySet::from_key_pair(&kp);
        set.auth_public = BASE64.encode(other.public);
        assert_eq!(
            set.to_key_pair("a.onion".into()).unwrap_err(),
            CryptoError::BadEncoding
        );
    }

    #[test]
    fn test_debug_does_not_expose_secret() {
        let kp = generate_key_pair("a.onion".into());
        let debug_output = format!("{:?}", kp);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(debug_output.contains(&hex::encode(kp.public)));
    }
}
