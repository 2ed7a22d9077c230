// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XML namespaces used by the stream core.

/// RFC 7395: XMPP subprotocol for WebSocket, `<open/>` and `<close/>`
/// framing elements.
pub const FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";

/// RFC 6120: stream header namespace, `<features/>` and `<error/>`.
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// RFC 6120: stream error defined conditions.
pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// RFC 6120: StartTLS.
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// RFC 6120: SASL negotiation.
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// RFC 6120: resource binding.
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// RFC 6120: client-to-server stanzas.
pub const JABBER_CLIENT: &str = "jabber:client";

/// RFC 6120: stanza error defined conditions.
pub const XMPP_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// XEP-0198: stream management advertisement.
pub const SM: &str = "urn:xmpp:sm:3";

/// RFC 6121: roster versioning advertisement.
pub const ROSTER_VER: &str = "urn:xmpp:features:rosterver";
