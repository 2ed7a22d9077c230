// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stanzas: the top-level `<iq/>`, `<message/>` and `<presence/>` elements
//! exchanged once a stream is negotiated.

use core::fmt;
use std::error::Error as StdError;

use minidom::Element;
use rand::{thread_rng, Rng};

use crate::jid::{InvalidJidSyntax, Jid};
use crate::ns;

/// Stanza kind, named after the root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// An `<iq/>` request or response.
    Iq,
    /// A `<message/>`.
    Message,
    /// A `<presence/>`.
    Presence,
}

/// Type of an `<iq/>` stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    /// A query for information.
    Get,
    /// A request to change state.
    Set,
    /// A positive response to a `get` or `set`.
    Result,
    /// A negative response to a `get` or `set`.
    Error,
}

impl IqType {
    fn from_str(value: &str) -> Option<IqType> {
        match value {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }
}

/// A wrapper around an XML document whose root is a stanza, with accessors
/// for the attributes the core cares about.
#[derive(Debug, Clone)]
pub struct Stanza {
    xml: Element,
}

fn make_id() -> String {
    let id: u64 = thread_rng().gen();
    format!("{}", id)
}

impl Stanza {
    /// Whether the element's root qualifies as a stanza.
    pub fn is_stanza(element: &Element) -> bool {
        matches!(element.name(), "iq" | "message" | "presence")
    }

    /// Wraps an element, or refuses if its root is not one of `iq`,
    /// `message`, `presence`.
    pub fn new(xml: Element) -> Result<Stanza, Element> {
        if Stanza::is_stanza(&xml) {
            Ok(Stanza { xml })
        } else {
            Err(xml)
        }
    }

    /// Builds an `<iq/>` template with the given type and id.
    pub fn iq_template(iq_type: IqType, id: &str, from: Option<&Jid>, to: Option<&Jid>) -> Element {
        let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", iq_type.as_str())
            .attr("id", id);
        if let Some(from) = from.filter(|it| !it.is_empty()) {
            builder = builder.attr("from", from.to_string());
        }
        if let Some(to) = to.filter(|it| !it.is_empty()) {
            builder = builder.attr("to", to.to_string());
        }
        builder.build()
    }

    /// Gets the wrapped XML.
    pub fn xml(&self) -> &Element {
        &self.xml
    }

    /// Unwraps the XML.
    pub fn into_xml(self) -> Element {
        self.xml
    }

    /// Gets the stanza kind.
    pub fn kind(&self) -> Kind {
        match self.xml.name() {
            "iq" => Kind::Iq,
            "message" => Kind::Message,
            _ => Kind::Presence,
        }
    }

    /// Gets the `id` attribute. Empty if absent.
    pub fn id(&self) -> &str {
        self.xml.attr("id").unwrap_or("")
    }

    /// Assigns a random id if none is set yet.
    pub fn ensure_id(&mut self) -> &str {
        if self.xml.attr("id").is_none() {
            self.xml.set_attr("id", make_id());
        }
        self.id()
    }

    /// Gets the sender address.
    pub fn sender(&self) -> Result<Jid, InvalidJidSyntax> {
        self.xml.attr("from").unwrap_or("").parse()
    }

    /// Gets the recipient address.
    pub fn recipient(&self) -> Result<Jid, InvalidJidSyntax> {
        self.xml.attr("to").unwrap_or("").parse()
    }

    /// Gets the type of an `<iq/>`, or `None` for other kinds and
    /// unrecognized values.
    pub fn iq_type(&self) -> Option<IqType> {
        if self.kind() != Kind::Iq {
            return None;
        }
        IqType::from_str(self.xml.attr("type").unwrap_or(""))
    }

    /// Gets the local name of the payload of an `<iq/>`. Empty if there is
    /// no payload.
    pub fn iq_name(&self) -> &str {
        self.xml
            .children()
            .next()
            .map(Element::name)
            .unwrap_or("")
    }

    /// Gets the namespace of the payload of an `<iq/>`. Empty if there is no
    /// payload.
    pub fn iq_namespace(&self) -> String {
        self.xml
            .children()
            .next()
            .map(|child| child.ns())
            .unwrap_or_default()
    }

    /// Derives the template of a result to this `<iq/>`: sender and
    /// recipient swapped, same id, `type="result"`.
    ///
    /// Fails with [`Error::InvalidState`][`crate::Error::InvalidState`] when
    /// this stanza is not an `<iq/>` awaiting a response.
    pub fn result_template(&self) -> Result<Element, crate::Error> {
        match self.iq_type() {
            Some(IqType::Get) | Some(IqType::Set) => {}
            _ => return Err(crate::Error::InvalidState),
        }
        Ok(Stanza::iq_template(
            IqType::Result,
            self.id(),
            self.recipient().ok().as_ref(),
            self.sender().ok().as_ref(),
        ))
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Element {
        stanza.xml
    }
}

/// A stanza-level `<error/>`, reduced to what stream negotiation needs:
/// the defined condition name and the optional text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    /// Name of the defined condition child, e.g. `conflict`.
    pub condition: String,

    /// Optional human-readable text.
    pub text: Option<String>,
}

impl StanzaError {
    /// Extracts the error from a stanza of type `error`.
    pub fn from_stanza(stanza: &Stanza) -> Option<StanzaError> {
        let error = stanza.xml().get_child("error", ns::JABBER_CLIENT)?;
        let mut condition = "undefined-condition".to_owned();
        let mut text = None;
        for child in error.children() {
            if child.ns() != ns::XMPP_STANZAS {
                continue;
            }
            if child.name() == "text" {
                text = Some(child.text());
            } else {
                condition = child.name().to_owned();
            }
        }
        Some(StanzaError { condition, text })
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{}: {}", self.condition, text),
            None => f.write_str(&self.condition),
        }
    }
}

impl StdError for StanzaError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Element {
        "<message xmlns='jabber:client' id='m1' from='juliet@example.com/balcony'
                  to='romeo@example.net' type='chat'><body xmlns='jabber:client'>hi</body>
         </message>"
            .parse()
            .unwrap()
    }

    #[test]
    fn wraps_stanzas_only() {
        assert!(Stanza::new(message()).is_ok());
        let open: Element = "<open xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>"
            .parse()
            .unwrap();
        assert!(Stanza::new(open).is_err());
    }

    #[test]
    fn accessors() {
        let stanza = Stanza::new(message()).unwrap();
        assert_eq!(stanza.kind(), Kind::Message);
        assert_eq!(stanza.id(), "m1");
        assert_eq!(
            stanza.sender().unwrap(),
            Jid::new("juliet", "example.com", "balcony")
        );
        assert_eq!(
            stanza.recipient().unwrap(),
            Jid::new("romeo", "example.net", "")
        );
        assert_eq!(stanza.iq_type(), None);
    }

    #[test]
    fn iq_payload() {
        let iq: Element = "<iq xmlns='jabber:client' type='get' id='p1'>
            <ping xmlns='urn:xmpp:ping'/></iq>"
            .parse()
            .unwrap();
        let stanza = Stanza::new(iq).unwrap();
        assert_eq!(stanza.iq_type(), Some(IqType::Get));
        assert_eq!(stanza.iq_name(), "ping");
        assert_eq!(stanza.iq_namespace(), "urn:xmpp:ping");
    }

    #[test]
    fn result_template_swaps_addresses() {
        let iq: Element = "<iq xmlns='jabber:client' type='get' id='p1'
             from='romeo@example.net' to='juliet@example.com'/>"
            .parse()
            .unwrap();
        let result = Stanza::new(iq).unwrap().result_template().unwrap();
        assert_eq!(result.attr("type"), Some("result"));
        assert_eq!(result.attr("id"), Some("p1"));
        assert_eq!(result.attr("from"), Some("juliet@example.com"));
        assert_eq!(result.attr("to"), Some("romeo@example.net"));
    }

    #[test]
    fn result_template_refuses_responses() {
        let iq: Element = "<iq xmlns='jabber:client' type='result' id='p1'/>"
            .parse()
            .unwrap();
        assert!(Stanza::new(iq).unwrap().result_template().is_err());
        assert!(Stanza::new(message()).unwrap().result_template().is_err());
    }

    #[test]
    fn ensure_id_is_sticky() {
        let presence: Element = "<presence xmlns='jabber:client'/>".parse().unwrap();
        let mut stanza = Stanza::new(presence).unwrap();
        let id = stanza.ensure_id().to_owned();
        assert!(!id.is_empty());
        assert_eq!(stanza.ensure_id(), id);
    }

    #[test]
    fn stanza_error_extraction() {
        let iq: Element = "<iq xmlns='jabber:client' type='error' id='b1'>
            <error xmlns='jabber:client' type='cancel'>
                <conflict xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>
                <text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>resource taken</text>
            </error></iq>"
            .parse()
            .unwrap();
        let error = StanzaError::from_stanza(&Stanza::new(iq).unwrap()).unwrap();
        assert_eq!(error.condition, "conflict");
        assert_eq!(error.text.as_deref(), Some("resource taken"));
    }
}
