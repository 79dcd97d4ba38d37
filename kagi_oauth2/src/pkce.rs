//! Proof Key for Code Exchange ([RFC 7636])
//!
//! The verifier is sent with the authorization code on exchange; the
//! `S256` challenge derived from it is sent when requesting the code.
//!
//!   [RFC 7636]: https://datatracker.ietf.org/doc/html/rfc7636

use std::fmt;

use aliri_braid::braid;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// The only challenge method produced by this module
pub const CHALLENGE_METHOD: &str = "S256";

const VERIFIER_BYTES: usize = 32;

/// A PKCE code verifier
#[braid(serde, debug = "owned", display = "owned")]
pub struct CodeVerifier;

impl fmt::Debug for CodeVerifierRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("***CODE VERIFIER***")
    }
}

impl fmt::Display for CodeVerifierRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("***CODE VERIFIER***")
    }
}

/// A PKCE code challenge
#[braid(serde)]
pub struct CodeChallenge;

impl CodeVerifier {
    /// Generates a fresh verifier from 32 random bytes
    ///
    /// The encoded verifier is 43 characters of URL-safe base64, the minimum
    /// length permitted.
    pub fn generate() -> Self {
        Self::new(random_urlsafe(VERIFIER_BYTES))
    }
}

impl CodeVerifierRef {
    /// Derives the `S256` challenge for this verifier
    pub fn challenge(&self) -> CodeChallenge {
        let hash = Sha256::digest(self.as_str().as_bytes());
        CodeChallenge::new(URL_SAFE_NO_PAD.encode(hash))
    }
}

/// A verifier and its derived challenge
#[derive(Debug, Clone)]
pub struct Pkce {
    /// The secret verifier, retained until the code is exchanged
    pub verifier: CodeVerifier,
    /// The challenge sent on the authorization request
    pub challenge: CodeChallenge,
}

impl Pkce {
    /// Generates a new verifier/challenge pair
    pub fn generate() -> Self {
        let verifier = CodeVerifier::generate();
        let challenge = verifier.challenge();
        Self {
            verifier,
            challenge,
        }
    }
}

/// Generates a random state value for CSRF protection on the authorization
/// request
pub fn generate_state() -> String {
    random_urlsafe(VERIFIER_BYTES)
}

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
