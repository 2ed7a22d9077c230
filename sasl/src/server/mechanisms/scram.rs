// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Server side of SCRAM.

use core::marker::PhantomData;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::common::scram::{
    self, parse_message, unescape_username, ScramProvider, KEY_GS2_CBIND_FLAG, KEY_GS2_HEADER,
};
use crate::common::{
    constant_time_eq, generate_nonce, generate_salt, AuthError, Condition, Credential,
    CredentialKey, CredentialRetriever, NegotiatedProperties,
};
use crate::server::Mechanism;

/// Iteration count used when deriving a fresh salted password. RFC 5802
/// requires at least 4096.
pub const DEFAULT_ITERATIONS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initialized,
    InitialResponseReceived,
    ChallengeSent,
    FinalResponseReceived,
    Completed,
}

/// Server party of a SCRAM exchange, parameterized by the digest family.
///
/// The retriever is expected to hand out either a
/// (`SaltedPassword`, `Salt`, `Iterations`) triple from storage, or a
/// plaintext `Password` from which a salted password is derived on the fly
/// with a fresh random salt and [`DEFAULT_ITERATIONS`].
pub struct ScramServer<P: ScramProvider> {
    state: State,
    retriever: Arc<dyn CredentialRetriever>,
    server_nonce: String,
    gs2_header: String,
    username: String,
    authz_id: String,
    client_nonce: String,
    full_nonce: String,
    salt: Vec<u8>,
    iterations: u32,
    salted_password: Vec<u8>,
    properties: Option<NegotiatedProperties>,
    error: Option<AuthError>,
    _provider: PhantomData<P>,
}

impl<P: ScramProvider> ScramServer<P> {
    /// Creates a server party drawing credentials from `retriever`.
    pub fn new(retriever: Arc<dyn CredentialRetriever>) -> ScramServer<P> {
        ScramServer {
            state: State::Initialized,
            retriever,
            server_nonce: generate_nonce(),
            gs2_header: String::new(),
            username: String::new(),
            authz_id: String::new(),
            client_nonce: String::new(),
            full_nonce: String::new(),
            salt: Vec::new(),
            iterations: 0,
            salted_password: Vec::new(),
            properties: None,
            error: None,
            _provider: PhantomData,
        }
    }

    fn fail(&mut self, error: AuthError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn consume_initial_response(&mut self, response: &[u8]) {
        let malformed =
            |text: &str| AuthError::with_text(Condition::MalformedRequest, text.to_owned());
        let message = match core::str::from_utf8(response) {
            Ok(message) => message,
            Err(_) => return self.fail(malformed("response is not UTF-8")),
        };
        let attributes = match parse_message(message, true) {
            Ok(attributes) => attributes,
            Err(error) => return self.fail(error),
        };

        if attributes.get(KEY_GS2_CBIND_FLAG).map(String::as_str) != Some("n") {
            return self.fail(malformed("channel binding is not supported"));
        }
        if attributes.contains_key("m") {
            return self.fail(malformed("mandatory extensions are not supported"));
        }
        self.gs2_header = attributes
            .get(KEY_GS2_HEADER)
            .cloned()
            .unwrap_or_default();
        self.authz_id = attributes.get("a").cloned().unwrap_or_default();

        self.username = match attributes.get("n").map(|it| unescape_username(it)) {
            Some(Ok(username)) if !username.is_empty() => username,
            Some(Err(error)) => return self.fail(error),
            _ => return self.fail(malformed("empty username")),
        };
        self.client_nonce = match attributes.get("r") {
            Some(nonce) if !nonce.is_empty() => nonce.clone(),
            _ => return self.fail(malformed("empty nonce")),
        };
        self.full_nonce = format!("{}{}", self.client_nonce, self.server_nonce);
    }

    /// Obtains the salted password for the presented username: a stored
    /// derivation when the retriever has a complete set, a fresh derivation
    /// from the plaintext password otherwise.
    fn prepare_credentials(&mut self) -> Result<(), AuthError> {
        let stored = self
            .retriever
            .retrieve(&self.username, P::MECHANISM, CredentialKey::SaltedPassword)
            .and_then(Credential::into_octets);
        if let Some(salted_password) = stored {
            let salt = self
                .retriever
                .retrieve(&self.username, P::MECHANISM, CredentialKey::Salt)
                .and_then(Credential::into_octets);
            let iterations = self
                .retriever
                .retrieve(&self.username, P::MECHANISM, CredentialKey::Iterations)
                .and_then(Credential::into_iterations);
            if let (Some(salt), Some(iterations)) = (salt, iterations) {
                self.salted_password = salted_password;
                self.salt = salt;
                self.iterations = iterations;
                return Ok(());
            }
        }

        match self
            .retriever
            .retrieve(&self.username, P::MECHANISM, CredentialKey::Password)
        {
            Some(Credential::Password(password)) => {
                self.salt = generate_salt();
                self.iterations = DEFAULT_ITERATIONS;
                self.salted_password =
                    P::derive(password.as_bytes(), &self.salt, self.iterations);
                Ok(())
            }
            _ => Err(AuthError::new(Condition::ClientNotAuthorized)),
        }
    }

    fn first_challenge(&mut self) -> Vec<u8> {
        if let Err(error) = self.prepare_credentials() {
            self.fail(error);
            self.state = State::Completed;
            return self.error_message();
        }
        self.state = State::ChallengeSent;
        format!(
            "r={},s={},i={}",
            self.full_nonce,
            BASE64.encode(&self.salt),
            self.iterations
        )
        .into_bytes()
    }

    fn auth_message(&self) -> String {
        scram::auth_message(
            &self.client_nonce,
            &self.full_nonce,
            &self.username,
            &self.salt,
            self.iterations,
            &self.gs2_header,
        )
    }

    fn consume_final_response(&mut self, response: &[u8]) {
        // Errors are recorded, not acted upon: the final challenge gets a
        // chance to report them to the client as an `e=` message.
        let malformed =
            |text: &str| AuthError::with_text(Condition::MalformedRequest, text.to_owned());
        let message = match core::str::from_utf8(response) {
            Ok(message) => message,
            Err(_) => return self.fail(malformed("response is not UTF-8")),
        };
        let attributes = match parse_message(message, false) {
            Ok(attributes) => attributes,
            Err(error) => return self.fail(error),
        };

        if attributes.contains_key("m") {
            return self.fail(malformed("mandatory extensions are not supported"));
        }
        let channel_binding = BASE64.encode(self.gs2_header.as_bytes());
        if attributes.get("c") != Some(&channel_binding) {
            return self.fail(malformed("channel binding mismatch"));
        }
        if attributes.get("r") != Some(&self.full_nonce) {
            return self.fail(AuthError::with_text(
                Condition::ClientNotAuthorized,
                "nonce mismatch",
            ));
        }

        let client_key = scram::client_key::<P>(&self.salted_password);
        let stored_key = scram::stored_key::<P>(&client_key);
        let signature = scram::client_signature::<P>(&stored_key, &self.auth_message());
        let expected_proof = scram::client_proof(&client_key, &signature);
        match attributes.get("p").map(|it| BASE64.decode(it)) {
            Some(Ok(proof)) if constant_time_eq(&proof, &expected_proof) => {}
            Some(Ok(_)) => {
                self.fail(AuthError::with_text(
                    Condition::ClientNotAuthorized,
                    "client proof incorrect",
                ));
            }
            _ => self.fail(malformed("missing or undecodable proof")),
        }
    }

    fn error_message(&self) -> Vec<u8> {
        let condition = self
            .error
            .as_ref()
            .map(AuthError::condition)
            .unwrap_or(Condition::ClientNotAuthorized);
        format!("e={}", condition).into_bytes()
    }

    fn final_challenge(&mut self) -> Vec<u8> {
        self.state = State::Completed;
        if self.error.is_some() {
            return self.error_message();
        }
        let signature = scram::server_signature::<P>(
            &scram::server_key::<P>(&self.salted_password),
            &self.auth_message(),
        );
        self.properties = Some(NegotiatedProperties {
            salt: self.salt.clone(),
            salted_password: self.salted_password.clone(),
            iterations: self.iterations,
        });
        format!("v={}", BASE64.encode(signature)).into_bytes()
    }
}

impl<P: ScramProvider> Mechanism for ScramServer<P> {
    fn name(&self) -> &'static str {
        P::MECHANISM
    }

    fn is_server_first(&self) -> bool {
        false
    }

    fn challenge(&mut self) -> Vec<u8> {
        match self.state {
            State::InitialResponseReceived if self.error.is_some() => {
                self.state = State::Completed;
                self.error_message()
            }
            State::InitialResponseReceived => self.first_challenge(),
            State::FinalResponseReceived => self.final_challenge(),
            _ => panic!("SCRAM server must not challenge in {:?}", self.state),
        }
    }

    fn accept_response(&mut self, response: &[u8]) {
        match self.state {
            State::Initialized => {
                self.consume_initial_response(response);
                self.state = State::InitialResponseReceived;
            }
            State::ChallengeSent => {
                self.consume_final_response(response);
                self.state = State::FinalResponseReceived;
            }
            _ => panic!(
                "SCRAM server must not accept a response in {:?}",
                self.state
            ),
        }
    }

    fn is_completed(&self) -> bool {
        self.state == State::Completed
    }

    fn error(&self) -> Option<&AuthError> {
        self.error.as_ref()
    }

    fn authorization_id(&self) -> Option<&str> {
        if self.state != State::Completed || self.error.is_some() {
            return None;
        }
        if self.authz_id.is_empty() {
            Some(&self.username)
        } else {
            Some(&self.authz_id)
        }
    }

    fn negotiated_properties(&self) -> Option<&NegotiatedProperties> {
        self.properties.as_ref()
    }
}
