// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Client side of SCRAM.

use core::marker::PhantomData;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::client::Mechanism;
use crate::common::scram::{self, escape_username, parse_message, ScramProvider};
use crate::common::{
    constant_time_eq, generate_nonce, AuthError, Condition, Credential, CredentialKey,
    CredentialRetriever, NegotiatedProperties,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    FirstResponseSent,
    ChallengeReceived,
    FinalResponseSent,
    Completed,
}

/// Client party of a SCRAM exchange, parameterized by the digest family.
///
/// Channel binding is not attempted: the gs2 header is always `n,,` (or
/// `n,a=<authzid>,` when an authorization id is requested).
pub struct ScramClient<P: ScramProvider> {
    state: State,
    authn_id: String,
    retriever: Arc<dyn CredentialRetriever>,
    gs2_header: String,
    client_nonce: String,
    full_nonce: String,
    salt: Vec<u8>,
    iterations: u32,
    server_signature: Vec<u8>,
    properties: Option<NegotiatedProperties>,
    error: Option<AuthError>,
    _provider: PhantomData<P>,
}

impl<P: ScramProvider> ScramClient<P> {
    /// Creates a client for the given authentication id. The authorization
    /// id is only transmitted when present; most servers derive it from the
    /// authentication id.
    pub fn new(
        authn_id: &str,
        authz_id: Option<&str>,
        retriever: Arc<dyn CredentialRetriever>,
    ) -> ScramClient<P> {
        let gs2_header = match authz_id {
            Some(authz_id) => format!("n,a={},", escape_username(authz_id)),
            None => "n,,".to_owned(),
        };
        ScramClient {
            state: State::Initial,
            authn_id: authn_id.to_owned(),
            retriever,
            gs2_header,
            client_nonce: generate_nonce(),
            full_nonce: String::new(),
            salt: Vec::new(),
            iterations: 0,
            server_signature: Vec::new(),
            properties: None,
            error: None,
            _provider: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_nonce(mut self, nonce: &str) -> ScramClient<P> {
        self.client_nonce = nonce.to_owned();
        self
    }

    fn fail(&mut self, error: AuthError) {
        self.error = Some(error);
        self.state = State::Completed;
    }

    fn initial_response(&mut self) -> Vec<u8> {
        self.state = State::FirstResponseSent;
        format!(
            "{}n={},r={}",
            self.gs2_header,
            escape_username(&self.authn_id),
            self.client_nonce
        )
        .into_bytes()
    }

    /// Fetches the salted password, preferring a cached derivation over
    /// re-deriving from the plaintext password.
    fn lookup_salted_password(&self) -> Result<Vec<u8>, AuthError> {
        if let Some(salted) = self
            .retriever
            .retrieve(&self.authn_id, P::MECHANISM, CredentialKey::SaltedPassword)
            .and_then(Credential::into_octets)
        {
            return Ok(salted);
        }
        match self
            .retriever
            .retrieve(&self.authn_id, P::MECHANISM, CredentialKey::Password)
        {
            Some(Credential::Password(password)) => {
                Ok(P::derive(password.as_bytes(), &self.salt, self.iterations))
            }
            _ => Err(AuthError::new(Condition::CredentialsNotFound)),
        }
    }

    fn final_response(&mut self) -> Option<Vec<u8>> {
        let salted_password = match self.lookup_salted_password() {
            Ok(salted_password) => salted_password,
            Err(error) => {
                self.fail(error);
                return None;
            }
        };

        let auth_message = scram::auth_message(
            &self.client_nonce,
            &self.full_nonce,
            &self.authn_id,
            &self.salt,
            self.iterations,
            &self.gs2_header,
        );
        let client_key = scram::client_key::<P>(&salted_password);
        let stored_key = scram::stored_key::<P>(&client_key);
        let signature = scram::client_signature::<P>(&stored_key, &auth_message);
        let proof = scram::client_proof(&client_key, &signature);
        self.server_signature =
            scram::server_signature::<P>(&scram::server_key::<P>(&salted_password), &auth_message);
        self.properties = Some(NegotiatedProperties {
            salt: self.salt.clone(),
            salted_password,
            iterations: self.iterations,
        });

        self.state = State::FinalResponseSent;
        Some(
            format!(
                "c={},r={},p={}",
                BASE64.encode(self.gs2_header.as_bytes()),
                self.full_nonce,
                BASE64.encode(proof)
            )
            .into_bytes(),
        )
    }

    fn consume_server_first(&mut self, challenge: &[u8]) {
        let malformed =
            |text: &str| AuthError::with_text(Condition::MalformedRequest, text.to_owned());
        let message = match core::str::from_utf8(challenge) {
            Ok(message) => message,
            Err(_) => return self.fail(malformed("challenge is not UTF-8")),
        };
        let attributes = match parse_message(message, false) {
            Ok(attributes) => attributes,
            Err(error) => return self.fail(error),
        };
        if attributes.contains_key("m") {
            return self.fail(malformed("mandatory extensions are not supported"));
        }

        let full_nonce = match attributes.get("r") {
            Some(nonce) if nonce.starts_with(&self.client_nonce) => nonce.clone(),
            Some(_) => {
                return self.fail(AuthError::with_text(
                    Condition::ClientNotAuthorized,
                    "server nonce does not begin with the client nonce",
                ));
            }
            None => return self.fail(malformed("missing nonce")),
        };
        let salt = match attributes.get("s").map(|it| BASE64.decode(it)) {
            Some(Ok(salt)) => salt,
            _ => return self.fail(malformed("missing or undecodable salt")),
        };
        let iterations = match attributes.get("i").map(|it| it.parse::<u32>()) {
            Some(Ok(iterations)) => iterations,
            _ => return self.fail(malformed("missing or invalid iteration count")),
        };

        self.full_nonce = full_nonce;
        self.salt = salt;
        self.iterations = iterations;
        self.state = State::ChallengeReceived;
    }

    fn consume_server_final(&mut self, challenge: &[u8]) {
        let message = match core::str::from_utf8(challenge) {
            Ok(message) => message,
            Err(_) => {
                return self.fail(AuthError::with_text(
                    Condition::MalformedRequest,
                    "challenge is not UTF-8",
                ));
            }
        };
        let attributes = match parse_message(message, false) {
            Ok(attributes) => attributes,
            Err(error) => return self.fail(error),
        };

        if let Some(reason) = attributes.get("e") {
            return self.fail(AuthError::with_text(
                Condition::ClientNotAuthorized,
                reason.clone(),
            ));
        }
        match attributes.get("v").map(|it| BASE64.decode(it)) {
            Some(Ok(signature)) if constant_time_eq(&signature, &self.server_signature) => {
                self.state = State::Completed;
            }
            Some(Ok(_)) | Some(Err(_)) => self.fail(AuthError::with_text(
                Condition::ServerNotAuthorized,
                "server signature mismatch",
            )),
            None => self.fail(AuthError::with_text(
                Condition::MalformedRequest,
                "missing server signature",
            )),
        }
    }
}

impl<P: ScramProvider> Mechanism for ScramClient<P> {
    fn name(&self) -> &'static str {
        P::MECHANISM
    }

    fn is_client_first(&self) -> bool {
        true
    }

    fn respond(&mut self) -> Option<Vec<u8>> {
        match self.state {
            State::Initial => Some(self.initial_response()),
            State::ChallengeReceived => self.final_response(),
            _ => panic!("SCRAM client must not respond in {:?}", self.state),
        }
    }

    fn accept_challenge(&mut self, challenge: &[u8]) {
        match self.state {
            State::FirstResponseSent => self.consume_server_first(challenge),
            State::FinalResponseSent => self.consume_server_final(challenge),
            _ => panic!(
                "SCRAM client must not accept a challenge in {:?}",
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

    fn negotiated_properties(&self) -> Option<&NegotiatedProperties> {
        if self.state == State::Completed && self.error.is_none() {
            self.properties.as_ref()
        } else {
            None
        }
    }
}
