// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The stateless cryptographic kernel of SCRAM (RFC 5802 section 3) and the
//! message syntax helpers shared by both parties.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha1::{Digest, Sha1 as Sha1Digest};
use sha2::Sha256 as Sha256Digest;

use crate::common::{AuthError, Condition};

/// Provider of the digest family a SCRAM mechanism is parameterized with.
pub trait ScramProvider: Send + Sync + 'static {
    /// The digest name as embedded in the mechanism name, e.g. `SHA-1`.
    const ALGORITHM: &'static str;

    /// The full SASL mechanism name, e.g. `SCRAM-SHA-1`.
    const MECHANISM: &'static str;

    /// `H(data)`.
    fn hash(data: &[u8]) -> Vec<u8>;

    /// `HMAC(key, data)`.
    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8>;

    /// `Hi(password, salt, iterations)`: the iterated HMAC construction,
    /// i.e. PBKDF2 with this provider's HMAC and a digest-length output.
    fn derive(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8>;
}

/// The SHA-1 digest family, for `SCRAM-SHA-1`.
pub struct Sha1;

impl ScramProvider for Sha1 {
    const ALGORITHM: &'static str = "SHA-1";
    const MECHANISM: &'static str = "SCRAM-SHA-1";

    fn hash(data: &[u8]) -> Vec<u8> {
        Sha1Digest::digest(data).to_vec()
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac =
            Hmac::<Sha1Digest>::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn derive(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut output = vec![0u8; 20];
        pbkdf2_hmac::<Sha1Digest>(password, salt, iterations, &mut output);
        output
    }
}

/// The SHA-256 digest family, for `SCRAM-SHA-256`.
pub struct Sha256;

impl ScramProvider for Sha256 {
    const ALGORITHM: &'static str = "SHA-256";
    const MECHANISM: &'static str = "SCRAM-SHA-256";

    fn hash(data: &[u8]) -> Vec<u8> {
        Sha256Digest::digest(data).to_vec()
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac =
            Hmac::<Sha256Digest>::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn derive(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut output = vec![0u8; 32];
        pbkdf2_hmac::<Sha256Digest>(password, salt, iterations, &mut output);
        output
    }
}

/// `ClientKey := HMAC(SaltedPassword, "Client Key")`
pub fn client_key<P: ScramProvider>(salted_password: &[u8]) -> Vec<u8> {
    P::hmac(salted_password, b"Client Key")
}

/// `ServerKey := HMAC(SaltedPassword, "Server Key")`
pub fn server_key<P: ScramProvider>(salted_password: &[u8]) -> Vec<u8> {
    P::hmac(salted_password, b"Server Key")
}

/// `StoredKey := H(ClientKey)`
pub fn stored_key<P: ScramProvider>(client_key: &[u8]) -> Vec<u8> {
    P::hash(client_key)
}

/// `ClientSignature := HMAC(StoredKey, AuthMessage)`
pub fn client_signature<P: ScramProvider>(stored_key: &[u8], auth_message: &str) -> Vec<u8> {
    P::hmac(stored_key, auth_message.as_bytes())
}

/// `ServerSignature := HMAC(ServerKey, AuthMessage)`
pub fn server_signature<P: ScramProvider>(server_key: &[u8], auth_message: &str) -> Vec<u8> {
    P::hmac(server_key, auth_message.as_bytes())
}

/// `ClientProof := ClientKey XOR ClientSignature`
pub fn client_proof(client_key: &[u8], client_signature: &[u8]) -> Vec<u8> {
    crate::common::xor(client_key, client_signature)
}

/// Reassembles the canonical `AuthMessage`:
/// `client-first-message-bare , server-first-message ,
/// client-final-message-without-proof`.
pub fn auth_message(
    client_nonce: &str,
    full_nonce: &str,
    username: &str,
    salt: &[u8],
    iterations: u32,
    gs2_header: &str,
) -> String {
    let client_first_bare = format!("n={},r={}", escape_username(username), client_nonce);
    let server_first = format!("r={},s={},i={}", full_nonce, BASE64.encode(salt), iterations);
    let client_final_without_proof =
        format!("c={},r={}", BASE64.encode(gs2_header.as_bytes()), full_nonce);
    format!(
        "{},{},{}",
        client_first_bare, server_first, client_final_without_proof
    )
}

/// Escapes a username for embedding into a SCRAM message (`saslname`).
pub fn escape_username(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            ',' => escaped.push_str("=2C"),
            '=' => escaped.push_str("=3D"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Reverses [`escape_username`]. Any `=` sequence other than `=2C` and `=3D`
/// is a malformed request.
pub fn unescape_username(name: &str) -> Result<String, AuthError> {
    let mut unescaped = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c != '=' {
            unescaped.push(c);
            continue;
        }
        let escape: String = chars.by_ref().take(2).collect();
        match escape.as_str() {
            "2C" => unescaped.push(','),
            "3D" => unescaped.push('='),
            other => {
                return Err(AuthError::with_text(
                    Condition::MalformedRequest,
                    format!("invalid username escape `={}`", other),
                ));
            }
        }
    }
    Ok(unescaped)
}

/// Key under which [`parse_message`] stores the reassembled gs2 header.
pub const KEY_GS2_HEADER: &str = "gs2-header";

/// Key under which [`parse_message`] stores the channel binding flag.
pub const KEY_GS2_CBIND_FLAG: &str = "gs2-cbind-flag";

/// Decodes a SCRAM message into its attribute map.
///
/// When `has_gs2_header` is set, the first field must be the channel binding
/// flag (`n`, `y` or `p=<name>`) and the second the authorization id field
/// (empty or `a=<authzid>`); both are folded into [`KEY_GS2_HEADER`] next to
/// their individual entries. All remaining fields are `key=value` pairs,
/// splitting on the first `=` only.
pub fn parse_message(
    message: &str,
    has_gs2_header: bool,
) -> Result<HashMap<String, String>, AuthError> {
    let malformed = || AuthError::with_text(Condition::MalformedRequest, "invalid message syntax");
    let mut attributes = HashMap::new();
    let mut fields = message.split(',');

    if has_gs2_header {
        let flag = fields.next().ok_or_else(malformed)?;
        match flag {
            "n" | "y" => {
                attributes.insert(KEY_GS2_CBIND_FLAG.to_owned(), flag.to_owned());
            }
            _ if flag.starts_with("p=") && flag.len() > 2 => {
                attributes.insert(KEY_GS2_CBIND_FLAG.to_owned(), "p".to_owned());
                attributes.insert("p".to_owned(), flag[2..].to_owned());
            }
            _ => return Err(malformed()),
        }
        let authzid = fields.next().ok_or_else(malformed)?;
        if !authzid.is_empty() {
            let value = authzid.strip_prefix("a=").ok_or_else(malformed)?;
            attributes.insert("a".to_owned(), value.to_owned());
        }
        attributes.insert(KEY_GS2_HEADER.to_owned(), format!("{},{},", flag, authzid));
    }

    for field in fields {
        if field.is_empty() {
            continue;
        }
        let (key, value) = field.split_once('=').ok_or_else(malformed)?;
        if key.is_empty() {
            return Err(malformed());
        }
        attributes.insert(key.to_owned(), value.to_owned());
    }
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The running example of RFC 5802 section 5.
    const USERNAME: &str = "user";
    const PASSWORD: &str = "pencil";
    const CLIENT_NONCE: &str = "fyko+d2lbbFgONRv9qkxdawL";
    const FULL_NONCE: &str = "fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j";
    const SALT_B64: &str = "QSXCR+Q6sek8bf92";
    const ITERATIONS: u32 = 4096;

    fn rfc5802_auth_message() -> String {
        let salt = BASE64.decode(SALT_B64).unwrap();
        auth_message(CLIENT_NONCE, FULL_NONCE, USERNAME, &salt, ITERATIONS, "n,,")
    }

    #[test]
    fn auth_message_matches_rfc5802() {
        assert_eq!(
            rfc5802_auth_message(),
            "n=user,r=fyko+d2lbbFgONRv9qkxdawL,\
             r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096,\
             c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j"
        );
    }

    #[test]
    fn client_proof_matches_rfc5802() {
        let salt = BASE64.decode(SALT_B64).unwrap();
        let salted = Sha1::derive(PASSWORD.as_bytes(), &salt, ITERATIONS);
        let client_key = client_key::<Sha1>(&salted);
        let stored_key = stored_key::<Sha1>(&client_key);
        let signature = client_signature::<Sha1>(&stored_key, &rfc5802_auth_message());
        let proof = client_proof(&client_key, &signature);
        assert_eq!(BASE64.encode(proof), "v0X8v3Bz2T0CJGbJQyF0X+HI4Ts=");
    }

    #[test]
    fn server_signature_matches_rfc5802() {
        let salt = BASE64.decode(SALT_B64).unwrap();
        let salted = Sha1::derive(PASSWORD.as_bytes(), &salt, ITERATIONS);
        let signature = server_signature::<Sha1>(
            &server_key::<Sha1>(&salted),
            &rfc5802_auth_message(),
        );
        assert_eq!(BASE64.encode(signature), "rmF9pqV8S7suAoZWja4dJRkFsKQ=");
    }

    #[test]
    fn sha256_derivation_is_deterministic() {
        let salted = Sha256::derive(b"pencil", b"salt", 4096);
        assert_eq!(salted.len(), 32);
        assert_eq!(salted, Sha256::derive(b"pencil", b"salt", 4096));
        assert_ne!(salted, Sha256::derive(b"pencil", b"salt", 4097));
    }

    #[test]
    fn username_escaping_round_trip() {
        assert_eq!(escape_username("user"), "user");
        assert_eq!(escape_username("a,b=c"), "a=2Cb=3Dc");
        assert_eq!(unescape_username("a=2Cb=3Dc").unwrap(), "a,b=c");
        assert_eq!(
            unescape_username("=2D").unwrap_err().condition(),
            Condition::MalformedRequest
        );
    }

    #[test]
    fn parse_client_first() {
        let attributes = parse_message("n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL", true).unwrap();
        assert_eq!(attributes[KEY_GS2_HEADER], "n,,");
        assert_eq!(attributes[KEY_GS2_CBIND_FLAG], "n");
        assert_eq!(attributes["n"], "user");
        assert_eq!(attributes["r"], CLIENT_NONCE);
        assert!(!attributes.contains_key("a"));
    }

    #[test]
    fn parse_client_first_with_authzid() {
        let attributes = parse_message("n,a=admin,n=user,r=abc", true).unwrap();
        assert_eq!(attributes[KEY_GS2_HEADER], "n,a=admin,");
        assert_eq!(attributes["a"], "admin");
    }

    #[test]
    fn parse_value_with_equals_signs() {
        // base64 padding must survive: `=` only splits on the first occurrence.
        let attributes = parse_message("c=biws,r=abc,p=dGVzdA==", false).unwrap();
        assert_eq!(attributes["p"], "dGVzdA==");
    }

    #[test]
    fn parse_rejects_bad_gs2_flag() {
        assert!(parse_message("x,,n=user,r=abc", true).is_err());
        assert!(parse_message("n,b=admin,n=user,r=abc", true).is_err());
    }
}
