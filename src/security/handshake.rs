//! Two-step mutual authentication handshake
//!
//! The client opens with its identity, the server answers with a fresh
//! ephemeral challenge point, and the client proves possession of its
//! private scalar by returning the SHA-256 session key both sides derive
//! from the ECDH agreement:
//!
//! 1. client -> server `{login: <public>, domain: <hostname>}`
//! 2. server -> client `{chal: <ephemeral public>}`
//! 3. client -> server `{sha2: <session key>}`
//!
//! The exchange proves key possession only; whether the key actually
//! belongs to the claimed domain is established by connecting back to it.

use subtle::ConstantTimeEq;

use crate::network::document::{Doc, DocBuilder, BIN_DIGEST, BIN_POINT};
use crate::security::keys::{
    agree, generate_ephemeral, session_key, CryptoError, KeyPair,
};

/// Error during a handshake exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Key material failed to parse or agree
    Crypto(CryptoError),
    /// A required element is missing or has the wrong type
    MissingField(&'static str),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::Crypto(e) => write!(f, "handshake crypto failure: {}", e),
            HandshakeError::MissingField(name) => write!(f, "handshake missing field: {}", name),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<CryptoError> for HandshakeError {
    fn from(e: CryptoError) -> Self {
        HandshakeError::Crypto(e)
    }
}

impl KeyPair {
    /// Build the opening message: `{login, domain}`.
    pub fn step1(&self) -> Vec<u8> {
        DocBuilder::new()
            .append_binary("login", BIN_POINT, &self.public)
            .append_string("domain", &self.domain)
            .build()
    }

    /// Answer the server's challenge with the derived session key.
    pub fn step2(&self, resp: Doc<'_>) -> Result<Vec<u8>, HandshakeError> {
        let (_, challenge) = resp
            .lookup("chal")
            .and_then(|v| v.as_binary())
            .ok_or(HandshakeError::MissingField("chal"))?;
        let shared = agree(challenge, &self.secret)?;
        let sk = session_key(&shared);
        Ok(DocBuilder::new().append_binary("sha2", BIN_DIGEST, &sk).build())
    }
}

/// Server side of the handshake.
///
/// One instance per session; it captures the client's claimed identity
/// during step 1 and verifies the returned digest in step 2.
#[derive(Debug, Default)]
pub struct ServerAuth {
    client_public: Vec<u8>,
    domain: String,
    expected: Option<[u8; 32]>,
}

impl ServerAuth {
    /// Create a fresh server-side handshake state.
    pub fn new() -> Self {
        Self::default()
    }

    /// The public key the client advertised in step 1.
    pub fn client_public(&self) -> &[u8] {
        &self.client_public
    }

    /// The domain the client claimed in step 1.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Consume the client's opening message; returns the challenge doc.
    pub fn step1(&mut self, doc: Doc<'_>) -> Result<Vec<u8>, HandshakeError> {
        let (ephemeral_secret, ephemeral_public) = generate_ephemeral();

        let (_, login) = doc
            .lookup("login")
            .and_then(|v| v.as_binary())
            .ok_or(HandshakeError::MissingField("login"))?;
        let domain = doc
            .lookup("domain")
            .and_then(|v| v.as_str())
            .ok_or(HandshakeError::MissingField("domain"))?;

        // Copy out of the document buffer; it is recycled after this call.
        self.client_public = login.to_vec();
        self.domain = domain.to_string();

        let shared = agree(&self.client_public, &ephemeral_secret)?;
        self.expected = Some(session_key(&shared));

        Ok(DocBuilder::new()
            .append_binary("chal", BIN_POINT, &ephemeral_public)
            .build())
    }

    /// Synthesize the step-1 message locally from a supplied identity,
    /// as if it had come from a real client. Used when this side wants
    /// to verify that a remote peer controls `public`.
    pub fn one_pass_prep(&mut self, public: &[u8], domain: &str) -> Result<Vec<u8>, HandshakeError> {
        let login = DocBuilder::new()
            .append_binary("login", BIN_POINT, public)
            .append_string("domain", domain)
            .build();
        self.step1(Doc::new(&login))
    }

    /// Verify the client's digest in constant time.
    pub fn step2(&self, doc: Doc<'_>) -> bool {
        let Some(expected) = &self.expected else {
            return false;
        };
        let Some((_, digest)) = doc.lookup("sha2").and_then(|v| v.as_binary()) else {
            return false;
        };
        digest.len() == 32 && bool::from(expected.as_slice().ct_eq(digest))
    }
}
