// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pieces shared between the client and the server side.

use core::fmt;
use std::error::Error as StdError;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::{thread_rng, RngCore};

pub mod scram;

/// Kind of credential a mechanism may ask a [`CredentialRetriever`] for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    /// The plaintext password.
    Password,

    /// A previously derived salted password.
    SaltedPassword,

    /// The salt that was used to derive the stored salted password.
    Salt,

    /// The iteration count that was used to derive the stored salted
    /// password.
    Iterations,
}

/// A credential handed out by a [`CredentialRetriever`].
#[derive(Clone)]
pub enum Credential {
    /// A plaintext password.
    Password(String),

    /// A salted password.
    SaltedPassword(Vec<u8>),

    /// A salt.
    Salt(Vec<u8>),

    /// An iteration count.
    Iterations(u32),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secrets.
        match self {
            Credential::Password(_) => write!(f, "Credential::Password(_)"),
            Credential::SaltedPassword(_) => write!(f, "Credential::SaltedPassword(_)"),
            Credential::Salt(_) => write!(f, "Credential::Salt(_)"),
            Credential::Iterations(it) => write!(f, "Credential::Iterations({})", it),
        }
    }
}

impl Credential {
    /// Unwraps a plaintext password.
    pub fn into_password(self) -> Option<String> {
        match self {
            Credential::Password(password) => Some(password),
            _ => None,
        }
    }

    /// Unwraps a byte credential (salted password or salt).
    pub fn into_octets(self) -> Option<Vec<u8>> {
        match self {
            Credential::SaltedPassword(octets) | Credential::Salt(octets) => Some(octets),
            _ => None,
        }
    }

    /// Unwraps an iteration count.
    pub fn into_iterations(self) -> Option<u32> {
        match self {
            Credential::Iterations(it) => Some(it),
            _ => None,
        }
    }
}

/// Source of authentication secrets.
///
/// A mechanism queries the retriever with the authentication id, its own
/// mechanism name and the [`CredentialKey`] it is interested in. Returning
/// `None` means the credential is not available; mechanisms fall back to
/// other keys where the protocol permits (e.g. deriving a salted password
/// from a plaintext one).
pub trait CredentialRetriever: Send + Sync {
    /// Looks up a single credential.
    fn retrieve(&self, authn_id: &str, mechanism: &str, key: CredentialKey) -> Option<Credential>;
}

impl<F> CredentialRetriever for F
where
    F: Fn(&str, &str, CredentialKey) -> Option<Credential> + Send + Sync,
{
    fn retrieve(&self, authn_id: &str, mechanism: &str, key: CredentialKey) -> Option<Credential> {
        self(authn_id, mechanism, key)
    }
}

impl CredentialRetriever for Arc<dyn CredentialRetriever> {
    fn retrieve(&self, authn_id: &str, mechanism: &str, key: CredentialKey) -> Option<Credential> {
        (**self).retrieve(authn_id, mechanism, key)
    }
}

/// Secrets agreed upon during a successful SCRAM exchange.
///
/// Callers may cache these instead of the plaintext password: the salted
/// password together with its salt and iteration count is sufficient for
/// any future exchange with the same parameters.
#[derive(Clone)]
pub struct NegotiatedProperties {
    /// The salt used for this exchange.
    pub salt: Vec<u8>,

    /// The derived salted password.
    pub salted_password: Vec<u8>,

    /// The iteration count used for this exchange.
    pub iterations: u32,
}

impl fmt::Debug for NegotiatedProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiatedProperties")
            .field("salt", &BASE64.encode(&self.salt))
            .field("salted_password", &"_")
            .field("iterations", &self.iterations)
            .finish()
    }
}

/// Failure conditions of an authentication exchange, loosely following the
/// vocabulary of RFC 4422 and RFC 5802.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// The exchange was aborted by the local party.
    Aborted,

    /// The peer failed to prove it is the client it claims to be.
    ClientNotAuthorized,

    /// The credentials are no longer valid.
    CredentialsExpired,

    /// No credentials could be obtained for the authentication id.
    CredentialsNotFound,

    /// The authorization id was rejected.
    InvalidAuthzid,

    /// A received message violates the mechanism syntax.
    MalformedRequest,

    /// The mechanism is too weak for this party's policy.
    MechanismTooWeak,

    /// The server failed to prove it knows the credentials.
    ServerNotAuthorized,
}

impl Condition {
    /// Returns the kebab-case token for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Aborted => "aborted",
            Condition::ClientNotAuthorized => "client-not-authorized",
            Condition::CredentialsExpired => "credentials-expired",
            Condition::CredentialsNotFound => "credentials-not-found",
            Condition::InvalidAuthzid => "invalid-authzid",
            Condition::MalformedRequest => "malformed-request",
            Condition::MechanismTooWeak => "mechanism-too-weak",
            Condition::ServerNotAuthorized => "server-not-authorized",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error produced by a failed authentication exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    condition: Condition,
    text: Option<String>,
}

impl AuthError {
    /// Creates an error carrying only a condition.
    pub fn new(condition: Condition) -> AuthError {
        AuthError {
            condition,
            text: None,
        }
    }

    /// Creates an error with a condition and an explanatory text.
    pub fn with_text<T: Into<String>>(condition: Condition, text: T) -> AuthError {
        AuthError {
            condition,
            text: Some(text.into()),
        }
    }

    /// Gets the failure condition.
    pub fn condition(&self) -> Condition {
        self.condition
    }

    /// Gets the explanatory text, if any.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{}: {}", self.condition, text),
            None => write!(f, "{}", self.condition),
        }
    }
}

impl StdError for AuthError {}

/// Generates a nonce of 12 random octets, rendered as 16 base64 characters.
pub(crate) fn generate_nonce() -> String {
    let mut octets = [0u8; 12];
    thread_rng().fill_bytes(&mut octets);
    BASE64.encode(octets)
}

/// Generates a random salt for deriving a fresh salted password.
pub(crate) fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; 8];
    thread_rng().fill_bytes(&mut salt);
    salt
}

/// XORs two equally sized byte strings.
pub(crate) fn xor(lhs: &[u8], rhs: &[u8]) -> Vec<u8> {
    debug_assert_eq!(lhs.len(), rhs.len());
    lhs.iter().zip(rhs.iter()).map(|(a, b)| a ^ b).collect()
}

/// Compares two byte strings without leaking the position of a mismatch.
pub(crate) fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut acc = 0u8;
    for (a, b) in lhs.iter().zip(rhs.iter()) {
        acc |= a ^ b;
    }
    acc == 0
}
