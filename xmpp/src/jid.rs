// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XMPP addresses (Jabber identifiers).

use core::fmt;
use core::str::FromStr;
use std::error::Error as StdError;

/// Error of parsing text that is not a well-formed JID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidJidSyntax;

impl fmt::Display for InvalidJidSyntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid JID syntax")
    }
}

impl StdError for InvalidJidSyntax {}

/// An XMPP address, `localpart@domainpart/resourcepart`.
///
/// The local part names an account on a server, the domain part names the
/// server, and the resource part names one client connected with that
/// account. Local and resource part may each be absent.
///
/// This type stores whatever code points it is given: no stringprep or
/// normalization is applied, and equality is plain componentwise
/// comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: String,
    domain: String,
    resource: String,
}

impl Jid {
    /// Creates a JID from its three parts.
    pub fn new<L, D, R>(local: L, domain: D, resource: R) -> Jid
    where
        L: Into<String>,
        D: Into<String>,
        R: Into<String>,
    {
        Jid {
            local: local.into(),
            domain: domain.into(),
            resource: resource.into(),
        }
    }

    /// The JID with all three parts empty.
    pub fn empty() -> Jid {
        Jid::new("", "", "")
    }

    /// Gets the local part. Empty if absent.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Gets the domain part. Empty only on the empty JID.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Gets the resource part. Empty if absent.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Whether all three parts are empty.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.domain.is_empty() && self.resource.is_empty()
    }

    /// Whether this JID carries no resource part.
    pub fn is_bare(&self) -> bool {
        self.resource.is_empty()
    }

    /// Returns this JID with the resource part removed.
    pub fn to_bare(&self) -> Jid {
        if self.is_bare() {
            self.clone()
        } else {
            Jid::new(self.local.clone(), self.domain.clone(), "")
        }
    }
}

impl FromStr for Jid {
    type Err = InvalidJidSyntax;

    /// Parses the text form: the first `/` (if any) separates the resource
    /// from the bare JID, and within the bare JID the first `@` (if any)
    /// separates the local part from the domain. A leading `@` or `/`, or a
    /// separator that leaves the domain empty, is a syntax error.
    /// Whitespace-only input yields the empty JID.
    fn from_str(text: &str) -> Result<Jid, InvalidJidSyntax> {
        if text.trim().is_empty() {
            return Ok(Jid::empty());
        }

        let (bare, resource) = match text.find('/') {
            Some(0) => return Err(InvalidJidSyntax),
            Some(slash) => (&text[..slash], &text[slash + 1..]),
            None => (text, ""),
        };
        let (local, domain) = match bare.find('@') {
            Some(0) => return Err(InvalidJidSyntax),
            Some(at) => (&bare[..at], &bare[at + 1..]),
            None => ("", bare),
        };
        if domain.is_empty() {
            return Err(InvalidJidSyntax);
        }
        Ok(Jid::new(local, domain, resource))
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.local.is_empty() {
            write!(f, "{}@", self.local)?;
        }
        f.write_str(&self.domain)?;
        if !self.resource.is_empty() {
            write!(f, "/{}", self.resource)?;
        }
        Ok(())
    }
}
