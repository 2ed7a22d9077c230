// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Core of an [XMPP](https://xmpp.org/) client with asynchronous I/O using
//! [tokio](https://tokio.rs/): stream negotiation (StartTLS, SASL, resource
//! binding), steady-state stanza exchange, and orderly shutdown, all built
//! around a full-duplex [`pipeline`] of XML documents.
//!
//! # Getting started
//!
//! Bring a [`Transport`][`session::Transport`] — anything that can move
//! parsed top-level XML elements and framing `<open/>`/`<close/>` documents
//! (RFC 7395 style) between the network and the session — then create a
//! [`Session`], call [`login`][`Session::login`], and consume
//! [`inbound_stanzas`][`Session::inbound_stanzas`].
//!
//! # Scope
//!
//! Concrete TCP/WebSocket transports, XMPP extensions (disco, pubsub, …)
//! and credential storage live outside this crate. In-band registration,
//! stream compression and stream resumption are not implemented.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

pub use eddy_sasl as sasl;
pub use minidom;

pub mod error;
pub mod event;
pub mod handshake;
pub mod jid;
pub mod ns;
pub mod pipeline;
pub mod reactive;
pub mod session;
pub mod stanza;
pub mod stream_error;

#[doc(inline)]
pub use crate::error::Error;
pub use crate::event::SessionEvent;
pub use crate::jid::Jid;
pub use crate::session::{Session, SessionConfig, Transport};
pub use crate::stanza::Stanza;
