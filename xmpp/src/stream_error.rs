// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream-level errors as defined in RFC 6120 section 4.9.

use core::fmt;
use std::error::Error as StdError;

use minidom::Element;

use crate::ns;

/// Stream error conditions (RFC 6120 section 4.9.3).
///
/// Only conditions without mandatory element content are modelled; an
/// unrecognized condition parses as [`UndefinedCondition`][`DefinedCondition::UndefinedCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinedCondition {
    /// The entity has sent XML that cannot be processed.
    BadFormat,

    /// A new stream conflicts with this one, or the resource is in use
    /// elsewhere.
    Conflict,

    /// The peer has not responded to traffic over the stream.
    ConnectionTimeout,

    /// The `to` attribute does not name a hosted domain.
    HostUnknown,

    /// The server hit an internal misconfiguration or fault.
    InternalServerError,

    /// The `from` attribute does not match the authorized identity.
    InvalidFrom,

    /// The entity has sent invalid XML.
    InvalidXml,

    /// The peer attempted something it is not authorized to do yet, such as
    /// sending stanzas before the negotiation completed.
    NotAuthorized,

    /// The stream is not well-formed XML.
    NotWellFormed,

    /// The peer violated a local service policy.
    PolicyViolation,

    /// A mandatory-to-negotiate feature cannot be negotiated.
    UnsupportedFeature,

    /// The peer sent a top-level element this entity does not understand.
    UnsupportedStanzaType,

    /// The peer requested a stream version this entity does not support.
    UnsupportedVersion,

    /// The error does not fall under the other conditions.
    UndefinedCondition,
}

impl DefinedCondition {
    /// Returns the element name of this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinedCondition::BadFormat => "bad-format",
            DefinedCondition::Conflict => "conflict",
            DefinedCondition::ConnectionTimeout => "connection-timeout",
            DefinedCondition::HostUnknown => "host-unknown",
            DefinedCondition::InternalServerError => "internal-server-error",
            DefinedCondition::InvalidFrom => "invalid-from",
            DefinedCondition::InvalidXml => "invalid-xml",
            DefinedCondition::NotAuthorized => "not-authorized",
            DefinedCondition::NotWellFormed => "not-well-formed",
            DefinedCondition::PolicyViolation => "policy-violation",
            DefinedCondition::UnsupportedFeature => "unsupported-feature",
            DefinedCondition::UnsupportedStanzaType => "unsupported-stanza-type",
            DefinedCondition::UnsupportedVersion => "unsupported-version",
            DefinedCondition::UndefinedCondition => "undefined-condition",
        }
    }

    fn from_name(name: &str) -> DefinedCondition {
        match name {
            "bad-format" => DefinedCondition::BadFormat,
            "conflict" => DefinedCondition::Conflict,
            "connection-timeout" => DefinedCondition::ConnectionTimeout,
            "host-unknown" => DefinedCondition::HostUnknown,
            "internal-server-error" => DefinedCondition::InternalServerError,
            "invalid-from" => DefinedCondition::InvalidFrom,
            "invalid-xml" => DefinedCondition::InvalidXml,
            "not-authorized" => DefinedCondition::NotAuthorized,
            "not-well-formed" => DefinedCondition::NotWellFormed,
            "policy-violation" => DefinedCondition::PolicyViolation,
            "unsupported-feature" => DefinedCondition::UnsupportedFeature,
            "unsupported-stanza-type" => DefinedCondition::UnsupportedStanzaType,
            "unsupported-version" => DefinedCondition::UnsupportedVersion,
            _ => DefinedCondition::UndefinedCondition,
        }
    }
}

impl fmt::Display for DefinedCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stream error: a defined condition plus an optional descriptive text.
///
/// Receiving or sending one of these always ends the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    /// The defined condition.
    pub condition: DefinedCondition,

    /// Optional human-readable text.
    pub text: Option<String>,
}

impl StreamError {
    /// Creates a stream error carrying only a condition.
    pub fn new(condition: DefinedCondition) -> StreamError {
        StreamError {
            condition,
            text: None,
        }
    }

    /// Creates a stream error with descriptive text.
    pub fn with_text<T: Into<String>>(condition: DefinedCondition, text: T) -> StreamError {
        StreamError {
            condition,
            text: Some(text.into()),
        }
    }

    /// Renders this error as an `<error/>` element in the stream namespace.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("error", ns::STREAM)
            .append(Element::builder(self.condition.as_str(), ns::STREAMS).build());
        if let Some(text) = &self.text {
            builder = builder.append(
                Element::builder("text", ns::STREAMS)
                    .append(text.as_str())
                    .build(),
            );
        }
        builder.build()
    }

    /// Parses an `<error/>` element in the stream namespace.
    ///
    /// Returns `None` if the element is not a stream error at all; an error
    /// element without a recognizable condition yields
    /// [`DefinedCondition::UndefinedCondition`].
    pub fn from_element(element: &Element) -> Option<StreamError> {
        if !element.is("error", ns::STREAM) {
            return None;
        }
        let mut condition = DefinedCondition::UndefinedCondition;
        let mut text = None;
        for child in element.children() {
            if child.ns() != ns::STREAMS {
                continue;
            }
            if child.name() == "text" {
                text = Some(child.text());
            } else {
                condition = DefinedCondition::from_name(child.name());
            }
        }
        Some(StreamError { condition, text })
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "stream error: {}: {}", self.condition, text),
            None => write!(f, "stream error: {}", self.condition),
        }
    }
}

impl StdError for StreamError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_condition_and_text() {
        let error = StreamError::with_text(
            DefinedCondition::PolicyViolation,
            "too many connections",
        );
        let element = error.to_element();
        assert!(element.is("error", ns::STREAM));
        assert!(element
            .get_child("policy-violation", ns::STREAMS)
            .is_some());
        assert_eq!(
            element.get_child("text", ns::STREAMS).unwrap().text(),
            "too many connections"
        );
    }

    #[test]
    fn round_trip() {
        let error = StreamError::with_text(DefinedCondition::Conflict, "logged in elsewhere");
        assert_eq!(StreamError::from_element(&error.to_element()), Some(error));

        let bare = StreamError::new(DefinedCondition::UnsupportedVersion);
        assert_eq!(StreamError::from_element(&bare.to_element()), Some(bare));
    }

    #[test]
    fn unknown_condition_parses_as_undefined() {
        let element: Element = "<error xmlns='http://etherx.jabber.org/streams'>\
             <brand-new-condition xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
             </error>"
            .parse()
            .unwrap();
        let error = StreamError::from_element(&element).unwrap();
        assert_eq!(error.condition, DefinedCondition::UndefinedCondition);
    }

    #[test]
    fn foreign_elements_are_not_stream_errors() {
        let element: Element = "<error xmlns='jabber:client'/>".parse().unwrap();
        assert_eq!(StreamError::from_element(&element), None);
    }
}
