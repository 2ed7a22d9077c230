// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Detailed error types.

use core::fmt;
use std::error::Error as StdError;
use std::io::Error as IoError;
use std::sync::Arc;

use eddy_sasl::AuthError;

use crate::jid::InvalidJidSyntax;
use crate::stanza::StanzaError;
use crate::stream_error::StreamError;

/// Top-level error type.
///
/// Recorded errors are handed out to several listeners (the login future,
/// the event stream, the handshaker accessors), hence `Clone`; the one
/// non-cloneable payload, [`std::io::Error`], is shared behind an [`Arc`].
#[derive(Debug, Clone)]
pub enum Error {
    /// I/O error reported by the transport
    Io(Arc<IoError>),
    /// Error parsing a JID
    JidParse(InvalidJidSyntax),
    /// SASL authentication failed
    Auth(AuthError),
    /// A stream error was sent to the peer
    Stream(StreamError),
    /// A stream error was received from the peer
    PeerStream(StreamError),
    /// A stanza of type `error` was received during negotiation
    Stanza(StanzaError),
    /// The peer misbehaved during stream negotiation
    Handshake(String),
    /// Connection closed
    Disconnected,
    /// Operation not valid in the current state
    InvalidState,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::JidParse(e) => write!(f, "JID parse error: {}", e),
            Error::Auth(e) => write!(f, "authentication error: {}", e),
            Error::Stream(e) => write!(f, "sent {}", e),
            Error::PeerStream(e) => write!(f, "received {}", e),
            Error::Stanza(e) => write!(f, "stanza error: {}", e),
            Error::Handshake(e) => write!(f, "handshake error: {}", e),
            Error::Disconnected => write!(f, "disconnected"),
            Error::InvalidState => write!(f, "invalid state"),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<InvalidJidSyntax> for Error {
    fn from(e: InvalidJidSyntax) -> Self {
        Error::JidParse(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<StreamError> for Error {
    fn from(e: StreamError) -> Self {
        Error::Stream(e)
    }
}

impl From<StanzaError> for Error {
    fn from(e: StanzaError) -> Self {
        Error::Stanza(e)
    }
}
