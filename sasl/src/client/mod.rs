// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The initiating (client) side of an authentication exchange.

use std::sync::Arc;

use crate::common::scram::{ScramProvider, Sha1, Sha256};
use crate::common::{AuthError, CredentialRetriever, NegotiatedProperties};

pub mod mechanisms;

use self::mechanisms::ScramClient;

/// A client-side SASL mechanism.
///
/// The exchange is driven by alternating [`respond`][`Mechanism::respond`]
/// and [`accept_challenge`][`Mechanism::accept_challenge`] calls, starting
/// with `respond` when [`is_client_first`][`Mechanism::is_client_first`]
/// reports `true`. A failure does not abort the call sequence; it is
/// recorded and visible through [`error`][`Mechanism::error`] once
/// [`is_completed`][`Mechanism::is_completed`] reports `true`.
pub trait Mechanism: Send {
    /// The SASL mechanism name, e.g. `SCRAM-SHA-1`.
    fn name(&self) -> &'static str;

    /// Whether this mechanism sends the first message of the exchange.
    fn is_client_first(&self) -> bool;

    /// Produces the next message to send, or `None` if the mechanism cannot
    /// continue (the failure is recorded).
    ///
    /// # Panics
    ///
    /// Panics if the mechanism is not in a state where it may respond.
    fn respond(&mut self) -> Option<Vec<u8>>;

    /// Consumes a challenge (or additional data of a success notification)
    /// received from the server.
    ///
    /// # Panics
    ///
    /// Panics if the mechanism is not awaiting a challenge.
    fn accept_challenge(&mut self, challenge: &[u8]);

    /// Whether the exchange has finished, successfully or not.
    fn is_completed(&self) -> bool;

    /// The failure that terminated the exchange, if any.
    fn error(&self) -> Option<&AuthError>;

    /// Secrets agreed upon during the exchange, available once it completed
    /// successfully.
    fn negotiated_properties(&self) -> Option<&NegotiatedProperties>;
}

/// Instantiates the client mechanism with the given name, or `None` if the
/// name is not supported.
pub fn new_client(
    mechanism: &str,
    authn_id: &str,
    authz_id: Option<&str>,
    retriever: Arc<dyn CredentialRetriever>,
) -> Option<Box<dyn Mechanism>> {
    if mechanism == Sha1::MECHANISM {
        Some(Box::new(ScramClient::<Sha1>::new(
            authn_id, authz_id, retriever,
        )))
    } else if mechanism == Sha256::MECHANISM {
        Some(Box::new(ScramClient::<Sha256>::new(
            authn_id, authz_id, retriever,
        )))
    } else {
        None
    }
}

/// Walks `preferred` in order and instantiates the first mechanism that the
/// peer advertises, or `None` if the two lists share no supported entry.
pub fn select_client<A: AsRef<str>>(
    preferred: &[String],
    advertised: &[A],
    authn_id: &str,
    authz_id: Option<&str>,
    retriever: Arc<dyn CredentialRetriever>,
) -> Option<Box<dyn Mechanism>> {
    for name in preferred {
        if advertised.iter().any(|it| it.as_ref() == name.as_str()) {
            if let Some(client) = new_client(name, authn_id, authz_id, retriever.clone()) {
                return Some(client);
            }
        }
    }
    None
}
