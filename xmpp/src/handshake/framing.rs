// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Builders and readers for the RFC 7395 framing elements.
//!
//! The transport contract of this crate is framed: every top-level element
//! of the XMPP stream arrives and leaves as its own document, with
//! `<open/>` and `<close/>` taking the place of the `<stream:stream>`
//! header and footer.

use minidom::Element;

use crate::jid::Jid;
use crate::ns;

/// The only stream version this implementation speaks.
pub const SUPPORTED_VERSION: &str = "1.0";

/// Builds the `<open/>` element initiating (or restarting) a stream to
/// `domain`.
pub fn open_element(domain: &str) -> Element {
    Element::builder("open", ns::FRAMING)
        .attr("to", domain)
        .attr("version", SUPPORTED_VERSION)
        .build()
}

/// Builds the `<close/>` element ending a stream.
pub fn close_element() -> Element {
    Element::builder("close", ns::FRAMING).build()
}

/// Whether the element is a framing `<open/>`.
pub fn is_open(element: &Element) -> bool {
    element.is("open", ns::FRAMING)
}

/// Whether the element is a framing `<close/>`.
pub fn is_close(element: &Element) -> bool {
    element.is("close", ns::FRAMING)
}

/// The `version` attribute of a stream opening. Empty if absent.
pub fn open_version(element: &Element) -> &str {
    element.attr("version").unwrap_or("")
}

/// The `from` attribute of a stream opening, parsed as a JID. The empty JID
/// if absent or malformed.
pub fn open_from(element: &Element) -> Jid {
    element
        .attr("from")
        .and_then(|from| from.parse().ok())
        .unwrap_or_else(Jid::empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_carries_domain_and_version() {
        let open = open_element("example.com");
        assert!(is_open(&open));
        assert_eq!(open.attr("to"), Some("example.com"));
        assert_eq!(open.attr("version"), Some("1.0"));
    }

    #[test]
    fn close_is_bare() {
        let close = close_element();
        assert!(is_close(&close));
        assert!(!is_open(&close));
    }

    #[test]
    fn reads_server_opening() {
        let open: Element = "<open xmlns='urn:ietf:params:xml:ns:xmpp-framing'
            from='example.com' id='x1' version='1.0'/>"
            .parse()
            .unwrap();
        assert_eq!(open_version(&open), "1.0");
        assert_eq!(open_from(&open), Jid::new("", "example.com", ""));
    }

    #[test]
    fn missing_attributes_read_as_empty() {
        let open: Element = "<open xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>"
            .parse()
            .unwrap();
        assert_eq!(open_version(&open), "");
        assert!(open_from(&open).is_empty());
    }
}
