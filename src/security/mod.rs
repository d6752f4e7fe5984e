//! Cryptography: identity key pairs and the mutual handshake
//!
//! Identities are P-256 key pairs; the handshake derives a SHA-256
//! session key from an ECDH agreement and proves the client holds the
//! private scalar for the public key it advertised. Binding that key to
//! the claimed hidden-service domain happens separately, by connecting
//! back to the domain (see the servent's verification module).

mod handshake;
mod keys;

pub use handshake::{HandshakeError, ServerAuth};
pub use keys::{
    agree, generate_ephemeral, generate_key_pair, session_key, CryptoError, KeyPair, KeySet,
};
