// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The receiving (server) side of an authentication exchange.

use crate::common::{AuthError, NegotiatedProperties};

pub mod mechanisms;

/// A server-side SASL mechanism.
///
/// The exchange alternates [`accept_response`][`Mechanism::accept_response`]
/// and [`challenge`][`Mechanism::challenge`] calls; for a client-first
/// mechanism such as SCRAM the first call is `accept_response` with the
/// client's initial message. Failures are recorded rather than returned: the
/// final [`challenge`][`Mechanism::challenge`] reports them to the peer and
/// [`error`][`Mechanism::error`] exposes them locally.
pub trait Mechanism: Send {
    /// The SASL mechanism name, e.g. `SCRAM-SHA-1`.
    fn name(&self) -> &'static str;

    /// Whether this mechanism sends the first message of the exchange.
    fn is_server_first(&self) -> bool;

    /// Produces the next challenge (or the final result message).
    ///
    /// # Panics
    ///
    /// Panics if no response has been accepted since the last challenge.
    fn challenge(&mut self) -> Vec<u8>;

    /// Consumes a response received from the client.
    ///
    /// # Panics
    ///
    /// Panics if the mechanism is not awaiting a response.
    fn accept_response(&mut self, response: &[u8]);

    /// Whether the exchange has finished, successfully or not.
    fn is_completed(&self) -> bool;

    /// The failure that terminated the exchange, if any.
    fn error(&self) -> Option<&AuthError>;

    /// The authorization id the client ends up with, available once the
    /// exchange completed successfully. Falls back to the authentication id
    /// when the client did not request a distinct one.
    fn authorization_id(&self) -> Option<&str>;

    /// Secrets agreed upon during the exchange, available once it completed
    /// successfully.
    fn negotiated_properties(&self) -> Option<&NegotiatedProperties>;
}
