// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Events published on a session's event stream.

use crate::error::Error;

/// High-level event emitted by a [`Session`][`crate::session::Session`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The network connection is gone, orderly or not. Races any in-flight
    /// negotiation work.
    ConnectionTerminated,

    /// TLS deployment after a StartTLS request has finished. On success the
    /// handshaker restarts the stream over the now-secured transport.
    StartTlsHandshakeCompleted {
        /// The error when deploying TLS failed, `None` on success.
        error: Option<Error>,
    },

    /// An error escaped the processing pipeline or a background task.
    ExceptionCaught(Error),
}
