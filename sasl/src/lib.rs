// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Implementation of [SCRAM](https://www.rfc-editor.org/rfc/rfc5802), the
//! salted challenge-response SASL mechanism, for both the initiating and the
//! receiving side of an authentication exchange.
//!
//! Channel binding is not supported: clients always send the `n,,` gs2
//! header and the server rejects anything else.
//!
//! A party object ([`client::Mechanism`] or [`server::Mechanism`]) consumes
//! and produces the raw (already base64-decoded) SASL payloads; wrapping
//! them into `<auth/>`, `<challenge/>` and friends is the caller's business.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

pub mod client;
pub mod common;
pub mod server;

pub use crate::common::{
    AuthError, Condition, Credential, CredentialKey, CredentialRetriever, NegotiatedProperties,
};
