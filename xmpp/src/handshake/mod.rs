// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream negotiation: the state machine that drives a freshly opened XML
//! stream through feature negotiation up to the point where stanzas may
//! flow.
//!
//! The [`HandshakerPipe`] lives inside the session's XML
//! [`Pipeline`][`crate::pipeline::Pipeline`]. It consumes every inbound
//! document while the handshake is running, emits the client side of the
//! negotiation through the same pipeline, and once completed turns into a
//! transparent forwarder for stanzas.
//!
//! Contrary to RFC 6120, a failed SASL exchange is not retried with another
//! mechanism; the handshake is aborted immediately.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use minidom::Element;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use eddy_sasl::client as sasl_client;
use eddy_sasl::{AuthError, Condition, CredentialRetriever, NegotiatedProperties};

use crate::error::Error;
use crate::event::SessionEvent;
use crate::jid::Jid;
use crate::ns;
use crate::pipeline::{self, Object, Pipe, PipelineHandle};
use crate::reactive::{Publisher, Subscription};
use crate::stanza::{IqType, Stanza, StanzaError};
use crate::stream_error::{DefinedCondition, StreamError};

pub mod framing;


/// A negotiable capability a server may advertise in `<features/>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamFeature {
    /// Opportunistic TLS on the existing connection.
    StartTls,

    /// SASL authentication.
    Sasl,

    /// Binding of the client resource.
    ResourceBinding,

    /// XEP-0198 stream management availability. Informational only.
    StreamManagement,

    /// Roster versioning availability. Informational only.
    RosterVersioning,
}

impl StreamFeature {
    /// The fixed order in which negotiable features are attempted.
    pub const NEGOTIATION_ORDER: [StreamFeature; 3] = [
        StreamFeature::StartTls,
        StreamFeature::Sasl,
        StreamFeature::ResourceBinding,
    ];

    /// Features that are merely advertisements and need no negotiation.
    pub const INFORMATIONAL: [StreamFeature; 2] = [
        StreamFeature::StreamManagement,
        StreamFeature::RosterVersioning,
    ];

    /// Namespace of the feature's advertisement element.
    pub fn namespace(&self) -> &'static str {
        match self {
            StreamFeature::StartTls => ns::TLS,
            StreamFeature::Sasl => ns::SASL,
            StreamFeature::ResourceBinding => ns::BIND,
            StreamFeature::StreamManagement => ns::SM,
            StreamFeature::RosterVersioning => ns::ROSTER_VER,
        }
    }

    /// Local name of the feature's advertisement element.
    pub fn name(&self) -> &'static str {
        match self {
            StreamFeature::StartTls => "starttls",
            StreamFeature::Sasl => "mechanisms",
            StreamFeature::ResourceBinding => "bind",
            StreamFeature::StreamManagement => "sm",
            StreamFeature::RosterVersioning => "ver",
        }
    }

    /// Whether the handshake may not complete without this feature.
    pub fn is_mandatory(&self) -> bool {
        matches!(self, StreamFeature::Sasl | StreamFeature::ResourceBinding)
    }

    /// Whether this feature is a mere advertisement.
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            StreamFeature::StreamManagement | StreamFeature::RosterVersioning
        )
    }
}

/// States of a [`HandshakerPipe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Freshly constructed, no stream opened yet.
    Initialized,

    /// A stream opening has been sent, awaiting the server's.
    Started,

    /// Stream features are being negotiated.
    Negotiating,

    /// All mandatory features are negotiated; stanzas may flow.
    Completed,

    /// A stream closing has been sent, awaiting the confirmation.
    StreamClosing,

    /// No XMPP stream is running any more.
    StreamClosed,

    /// Removed from its pipeline. Terminal.
    Disposed,
}

/// Event emitted by a [`HandshakerPipe`].
#[derive(Debug, Clone)]
pub enum HandshakeEvent {
    /// A stream feature has just been negotiated (or, for informational
    /// features, noticed).
    FeatureNegotiated(StreamFeature),
}

/// Parameters of a [`HandshakerPipe`].
pub struct HandshakerConfig {
    /// The account to authenticate as; its local part is the SASL
    /// authentication id, its domain the expected stream peer.
    pub jid: Jid,

    /// Optional authorization identity, a bare JID.
    pub authz_id: Option<Jid>,

    /// Preferred SASL mechanisms, most preferred first. Empty means the
    /// default of `SCRAM-SHA-1`.
    pub sasl_mechanisms: Vec<String>,

    /// Resource to request at bind time; the server generates one when
    /// absent (and may override the request either way).
    pub resource: Option<String>,

    /// Whether the handshake should perform in-band registration. Not
    /// supported; setting this fails the handshake immediately.
    pub registering: bool,
}

impl HandshakerConfig {
    /// Creates a config with defaults for everything but the account.
    pub fn new(jid: Jid) -> HandshakerConfig {
        HandshakerConfig {
            jid,
            authz_id: None,
            sasl_mechanisms: Vec::new(),
            resource: None,
            registering: false,
        }
    }
}

/// Negotiation state guarded by one mutex.
struct Inner {
    pipeline: Option<PipelineHandle>,
    negotiated: HashSet<StreamFeature>,
    negotiating: Option<StreamFeature>,
    sasl: Option<Box<dyn sasl_client::Mechanism>>,
    sasl_properties: Option<NegotiatedProperties>,
    bind_request_id: String,
    negotiated_jid: Option<Jid>,
    client_stream_error: Option<StreamError>,
    server_stream_error: Option<StreamError>,
    handshake_error: Option<Error>,
}

/// The stream negotiation state machine, as a [`Pipe`].
///
/// The handshake starts as soon as the pipe sits in a running pipeline. To
/// learn about its completion, watch [`state`][`HandshakerPipe::state`] for
/// [`HandshakeState::Completed`]; to learn why a handshake failed, consult
/// [`handshake_error`][`HandshakerPipe::handshake_error`] and the two
/// stream error accessors.
pub struct HandshakerPipe {
    weak: Weak<HandshakerPipe>,
    jid: Jid,
    authz_id: Option<Jid>,
    retriever: Arc<dyn CredentialRetriever>,
    sasl_mechanisms: Vec<String>,
    preset_resource: String,
    registering: bool,
    state: watch::Sender<HandshakeState>,
    events: Publisher<HandshakeEvent>,
    session_events: StdMutex<Option<Subscription<SessionEvent>>>,
    inner: StdMutex<Inner>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

fn sasl_element(name: &str) -> Element {
    Element::builder(name, ns::SASL).build()
}

fn auth_element(mechanism: &str, initial: Option<&[u8]>) -> Element {
    let mut builder = Element::builder("auth", ns::SASL).attr("mechanism", mechanism);
    if let Some(payload) = initial {
        let encoded = BASE64.encode(payload);
        // A single `=` stands for an empty initial response.
        builder = builder.append(if encoded.is_empty() {
            "=".to_owned()
        } else {
            encoded
        });
    }
    builder.build()
}

fn response_element(payload: &[u8]) -> Element {
    Element::builder("response", ns::SASL)
        .append(BASE64.encode(payload))
        .build()
}

fn mandatory_satisfied(negotiated: &HashSet<StreamFeature>) -> bool {
    StreamFeature::NEGOTIATION_ORDER
        .iter()
        .filter(|feature| feature.is_mandatory())
        .all(|feature| negotiated.contains(feature))
}

impl HandshakerPipe {
    /// Creates a handshaker for one login attempt.
    ///
    /// `session_events` is subscribed immediately: a
    /// [`SessionEvent::ConnectionTerminated`] forces the state to
    /// [`HandshakeState::StreamClosed`] whatever was in flight, and a
    /// successful [`SessionEvent::StartTlsHandshakeCompleted`] triggers the
    /// stream restart after StartTLS.
    pub fn new(
        session_events: &Publisher<SessionEvent>,
        retriever: Arc<dyn CredentialRetriever>,
        config: HandshakerConfig,
    ) -> Arc<HandshakerPipe> {
        let sasl_mechanisms = if config.sasl_mechanisms.is_empty() {
            vec!["SCRAM-SHA-1".to_owned()]
        } else {
            config.sasl_mechanisms
        };
        let (state, _) = watch::channel(HandshakeState::Initialized);
        let subscription = session_events.subscribe();
        Arc::new_cyclic(|weak| HandshakerPipe {
            weak: weak.clone(),
            jid: config.jid,
            authz_id: config.authz_id,
            retriever,
            sasl_mechanisms,
            preset_resource: config.resource.unwrap_or_default(),
            registering: config.registering,
            state,
            events: Publisher::new(),
            session_events: StdMutex::new(Some(subscription)),
            inner: StdMutex::new(Inner {
                pipeline: None,
                negotiated: HashSet::new(),
                negotiating: None,
                sasl: None,
                sasl_properties: None,
                bind_request_id: String::new(),
                negotiated_jid: None,
                client_stream_error: None,
                server_stream_error: None,
                handshake_error: None,
            }),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Gets the current state.
    pub fn current_state(&self) -> HandshakeState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn state(&self) -> watch::Receiver<HandshakeState> {
        self.state.subscribe()
    }

    /// Subscribes to handshake events.
    pub fn events(&self) -> Subscription<HandshakeEvent> {
        self.events.subscribe()
    }

    /// The JID assigned during resource binding, or `None` before that.
    pub fn negotiated_jid(&self) -> Option<Jid> {
        self.lock_inner().negotiated_jid.clone()
    }

    /// The features negotiated so far.
    pub fn negotiated_features(&self) -> HashSet<StreamFeature> {
        self.lock_inner().negotiated.clone()
    }

    /// The error that failed the handshake, if any.
    pub fn handshake_error(&self) -> Option<Error> {
        self.lock_inner().handshake_error.clone()
    }

    /// The stream error this client sent during the last stream, if any.
    pub fn client_stream_error(&self) -> Option<StreamError> {
        self.lock_inner().client_stream_error.clone()
    }

    /// The stream error the server sent during the last stream, if any.
    pub fn server_stream_error(&self) -> Option<StreamError> {
        self.lock_inner().server_stream_error.clone()
    }

    /// Secrets agreed upon during SASL, usable to log in again without the
    /// plaintext password.
    pub fn sasl_negotiated_properties(&self) -> Option<NegotiatedProperties> {
        self.lock_inner().sasl_properties.clone()
    }

    /// Closes the XMPP stream, resolving once the server confirms (or the
    /// connection dies). Idempotent; only fails once the pipe is disposed.
    pub async fn close_stream(&self) -> Result<(), Error> {
        let mut state_rx = self.state.subscribe();
        {
            let inner = self.lock_inner();
            match self.current_state() {
                HandshakeState::Disposed => return Err(Error::InvalidState),
                HandshakeState::Initialized => {
                    self.transition(HandshakeState::StreamClosed);
                    return Ok(());
                }
                HandshakeState::StreamClosed => return Ok(()),
                HandshakeState::StreamClosing => {}
                _ => {
                    self.transition(HandshakeState::StreamClosing);
                    self.write_doc(&inner, framing::close_element());
                }
            }
        }
        let result = match state_rx
            .wait_for(|state| {
                matches!(
                    state,
                    HandshakeState::StreamClosed | HandshakeState::Disposed
                )
            })
            .await
        {
            Ok(state) if *state == HandshakeState::StreamClosed => Ok(()),
            _ => Err(Error::InvalidState),
        };
        result
    }

    /// Sends a stream error to the server and closes the stream.
    pub fn send_stream_error(&self, error: StreamError) {
        let mut inner = self.lock_inner();
        self.send_stream_error_locked(&mut inner, error);
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("handshaker lock poisoned")
    }

    fn transition(&self, to: HandshakeState) {
        let from = *self.state.borrow();
        if from != to {
            log::debug!("handshaker is now {:?}", to);
            self.state.send_replace(to);
        }
    }

    fn write_doc(&self, inner: &Inner, doc: Element) {
        match &inner.pipeline {
            Some(pipeline) => pipeline.write(doc),
            None => log::error!("handshaker has no pipeline to write to"),
        }
    }

    fn spawn_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().expect("task lock poisoned").push(task);
    }

    fn send_stream_error_locked(&self, inner: &mut Inner, error: StreamError) {
        log::warn!("closing stream with error: {}", error);
        self.write_doc(inner, error.to_element());
        inner.client_stream_error = Some(error);
        self.initiate_close(inner);
    }

    fn record_handshake_error(&self, inner: &mut Inner, error: Error) {
        log::warn!("handshake failed: {}", error);
        if inner.handshake_error.is_none() {
            inner.handshake_error = Some(error);
        }
        self.initiate_close(inner);
    }

    fn initiate_close(&self, inner: &mut Inner) {
        match self.current_state() {
            HandshakeState::Initialized => self.transition(HandshakeState::StreamClosed),
            HandshakeState::StreamClosing
            | HandshakeState::StreamClosed
            | HandshakeState::Disposed => {}
            _ => {
                self.write_doc(inner, framing::close_element());
                self.transition(HandshakeState::StreamClosing);
            }
        }
    }

    fn start(&self) {
        let mut inner = self.lock_inner();
        if self.current_state() != HandshakeState::Initialized {
            log::debug!("not starting a handshake from {:?}", self.current_state());
            return;
        }
        if self.registering {
            inner.handshake_error = Some(Error::Handshake(
                "in-band registration is not supported".to_owned(),
            ));
            self.transition(HandshakeState::StreamClosed);
            return;
        }
        self.transition(HandshakeState::Started);
        self.write_doc(&inner, framing::open_element(self.jid.domain()));
    }

    fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::ConnectionTerminated => {
                let _inner = self.lock_inner();
                match self.current_state() {
                    HandshakeState::StreamClosed | HandshakeState::Disposed => {}
                    _ => {
                        log::debug!("connection terminated, stream is gone");
                        self.transition(HandshakeState::StreamClosed);
                    }
                }
            }
            SessionEvent::StartTlsHandshakeCompleted { error: None } => {
                let inner = self.lock_inner();
                if self.current_state() == HandshakeState::Negotiating
                    && inner.negotiated.contains(&StreamFeature::StartTls)
                {
                    log::debug!("TLS deployed, restarting the stream");
                    self.write_doc(&inner, framing::open_element(self.jid.domain()));
                }
            }
            SessionEvent::StartTlsHandshakeCompleted { error: Some(error) } => {
                let mut inner = self.lock_inner();
                self.record_handshake_error(&mut inner, error);
            }
            SessionEvent::ExceptionCaught(_) => {}
        }
    }

    /// Validates a stream opening received from the server. Returns whether
    /// it was acceptable.
    fn consume_stream_opening(&self, inner: &mut Inner, element: &Element) -> bool {
        let version = framing::open_version(element);
        if version != framing::SUPPORTED_VERSION {
            self.send_stream_error_locked(
                inner,
                StreamError::with_text(DefinedCondition::UnsupportedVersion, version),
            );
            return false;
        }
        let from = framing::open_from(element);
        if from != Jid::new("", self.jid.domain(), "") {
            self.send_stream_error_locked(
                inner,
                StreamError::with_text(DefinedCondition::InvalidFrom, from.to_string()),
            );
            return false;
        }
        true
    }

    fn consume_stream_features(&self, inner: &mut Inner, element: &Element) {
        let announced: Vec<&Element> = element.children().collect();

        for feature in StreamFeature::INFORMATIONAL {
            for child in &announced {
                if child.is(feature.name(), feature.namespace())
                    && inner.negotiated.insert(feature)
                {
                    log::debug!("server offers {:?}", feature);
                    self.events
                        .publish(HandshakeEvent::FeatureNegotiated(feature));
                }
            }
        }

        for feature in StreamFeature::NEGOTIATION_ORDER {
            if let Some(child) = announced
                .iter()
                .find(|child| child.is(feature.name(), feature.namespace()))
            {
                inner.negotiating = Some(feature);
                log::debug!("negotiating {:?}", feature);
                match feature {
                    StreamFeature::StartTls => {
                        self.write_doc(inner, Element::builder("starttls", ns::TLS).build());
                    }
                    StreamFeature::Sasl => self.initiate_sasl(inner, child),
                    StreamFeature::ResourceBinding => self.initiate_resource_binding(inner),
                    _ => {}
                }
                return;
            }
        }

        if mandatory_satisfied(&inner.negotiated) {
            log::debug!("nothing left to negotiate");
            self.transition(HandshakeState::Completed);
        } else {
            self.send_stream_error_locked(
                inner,
                StreamError::with_text(
                    DefinedCondition::UnsupportedFeature,
                    "mandatory stream features are missing",
                ),
            );
        }
    }

    fn initiate_sasl(&self, inner: &mut Inner, mechanisms_element: &Element) {
        let advertised: Vec<String> = mechanisms_element
            .children()
            .filter(|child| child.is("mechanism", ns::SASL))
            .map(|child| child.text().trim().to_owned())
            .collect();
        let authz_id = self.authz_id.as_ref().map(Jid::to_string);
        let client = sasl_client::select_client(
            &self.sasl_mechanisms,
            &advertised,
            self.jid.local(),
            authz_id.as_deref(),
            self.retriever.clone(),
        );
        let Some(mut client) = client else {
            self.write_doc(inner, sasl_element("abort"));
            self.send_stream_error_locked(
                inner,
                StreamError::with_text(
                    DefinedCondition::PolicyViolation,
                    "no supported SASL mechanisms",
                ),
            );
            return;
        };

        log::debug!("authenticating with {}", client.name());
        if client.is_client_first() {
            match client.respond() {
                Some(initial) => {
                    self.write_doc(inner, auth_element(client.name(), Some(&initial)));
                }
                None => {
                    self.write_doc(inner, sasl_element("abort"));
                    self.send_stream_error_locked(
                        inner,
                        StreamError::with_text(
                            DefinedCondition::PolicyViolation,
                            "cannot produce an initial SASL response",
                        ),
                    );
                    return;
                }
            }
        } else {
            self.write_doc(inner, auth_element(client.name(), None));
        }
        inner.sasl = Some(client);
    }

    fn consume_sasl(&self, inner: &mut Inner, element: &Element) {
        let payload = element.text();
        let payload = payload.trim();
        // A single `=` stands for an empty payload.
        let decoded = if payload.is_empty() || payload == "=" {
            Some(Vec::new())
        } else {
            BASE64.decode(payload).ok()
        };

        match element.name() {
            "failure" => {
                if let Some(feature) = inner.negotiating.take() {
                    inner.negotiated.remove(&feature);
                }
                inner.sasl = None;
                self.record_handshake_error(
                    inner,
                    Error::Auth(AuthError::new(Condition::ClientNotAuthorized)),
                );
            }
            "success" => {
                let Some(mut client) = inner.sasl.take() else {
                    self.send_stream_error_locked(
                        inner,
                        StreamError::with_text(
                            DefinedCondition::PolicyViolation,
                            "no SASL exchange in progress",
                        ),
                    );
                    return;
                };
                let Some(decoded) = decoded else {
                    self.send_stream_error_locked(
                        inner,
                        StreamError::with_text(
                            DefinedCondition::InvalidXml,
                            "undecodable SASL payload",
                        ),
                    );
                    return;
                };
                if !decoded.is_empty() {
                    // Additional data with success: the final challenge.
                    client.accept_challenge(&decoded);
                }
                if !client.is_completed() {
                    self.send_stream_error_locked(
                        inner,
                        StreamError::with_text(
                            DefinedCondition::PolicyViolation,
                            "SASL not finished yet",
                        ),
                    );
                } else if let Some(error) = client.error().cloned() {
                    inner.handshake_error.get_or_insert(Error::Auth(error));
                    self.send_stream_error_locked(
                        inner,
                        StreamError::with_text(
                            DefinedCondition::NotAuthorized,
                            "incorrect server proof",
                        ),
                    );
                } else {
                    inner.sasl_properties = client.negotiated_properties().cloned();
                    if let Some(feature) = inner.negotiating.take() {
                        if inner.negotiated.insert(feature) {
                            self.events
                                .publish(HandshakeEvent::FeatureNegotiated(feature));
                        }
                    }
                    log::debug!("authenticated, restarting the stream");
                    self.write_doc(inner, framing::open_element(self.jid.domain()));
                }
            }
            "challenge" => {
                let Some(mut client) = inner.sasl.take() else {
                    self.send_stream_error_locked(
                        inner,
                        StreamError::with_text(
                            DefinedCondition::PolicyViolation,
                            "no SASL exchange in progress",
                        ),
                    );
                    return;
                };
                let Some(decoded) = decoded else {
                    self.send_stream_error_locked(
                        inner,
                        StreamError::with_text(
                            DefinedCondition::InvalidXml,
                            "undecodable SASL payload",
                        ),
                    );
                    return;
                };
                client.accept_challenge(&decoded);
                if !client.is_completed() {
                    match client.respond() {
                        Some(response) => {
                            self.write_doc(inner, response_element(&response));
                            inner.sasl = Some(client);
                        }
                        None => {
                            self.write_doc(inner, sasl_element("abort"));
                            self.send_stream_error_locked(
                                inner,
                                StreamError::with_text(
                                    DefinedCondition::PolicyViolation,
                                    "malformed SASL message",
                                ),
                            );
                        }
                    }
                } else if let Some(error) = client.error().cloned() {
                    inner.handshake_error.get_or_insert(Error::Auth(error));
                    self.write_doc(inner, sasl_element("abort"));
                    self.send_stream_error_locked(
                        inner,
                        StreamError::new(DefinedCondition::NotAuthorized),
                    );
                } else {
                    inner.sasl = Some(client);
                }
            }
            _ => {
                self.send_stream_error_locked(
                    inner,
                    StreamError::new(DefinedCondition::UnsupportedStanzaType),
                );
            }
        }
    }

    fn consume_starttls(&self, inner: &mut Inner, element: &Element) {
        match element.name() {
            "proceed" => {
                inner.negotiating = None;
                if inner.negotiated.insert(StreamFeature::StartTls) {
                    self.events
                        .publish(HandshakeEvent::FeatureNegotiated(StreamFeature::StartTls));
                }
                // The session deploys TLS now; the stream restarts once it
                // signals completion.
            }
            "failure" => {
                self.record_handshake_error(
                    inner,
                    Error::Handshake("server refused to proceed with StartTLS".to_owned()),
                );
            }
            _ => {
                self.send_stream_error_locked(
                    inner,
                    StreamError::new(DefinedCondition::UnsupportedStanzaType),
                );
            }
        }
    }

    fn initiate_resource_binding(&self, inner: &mut Inner) {
        inner.bind_request_id = Uuid::new_v4().to_string();
        let mut bind = Element::builder("bind", ns::BIND);
        if !self.preset_resource.is_empty() {
            bind = bind.append(
                Element::builder("resource", ns::BIND)
                    .append(self.preset_resource.as_str())
                    .build(),
            );
        }
        let mut iq = Stanza::iq_template(IqType::Set, &inner.bind_request_id, None, None);
        iq.append_child(bind.build());
        self.write_doc(inner, iq);
    }

    fn consume_resource_binding(&self, inner: &mut Inner, stanza: &Stanza) {
        if stanza.id() != inner.bind_request_id {
            self.send_stream_error_locked(
                inner,
                StreamError::new(DefinedCondition::NotAuthorized),
            );
            return;
        }
        match stanza.iq_type() {
            Some(IqType::Error) => {
                let error = StanzaError::from_stanza(stanza)
                    .map(Error::Stanza)
                    .unwrap_or_else(|| {
                        Error::Handshake("resource binding failed without a cause".to_owned())
                    });
                self.record_handshake_error(inner, error);
            }
            Some(IqType::Result) => {
                let assigned = stanza
                    .xml()
                    .get_child("bind", ns::BIND)
                    .and_then(|bind| bind.get_child("jid", ns::BIND))
                    .and_then(|jid| jid.text().trim().parse::<Jid>().ok())
                    .filter(|jid| !jid.is_empty());
                match assigned {
                    Some(jid) => {
                        // The server has the last word on the resource.
                        log::debug!("bound to {}", jid);
                        inner.negotiated_jid = Some(jid);
                        inner.negotiating = None;
                        if inner.negotiated.insert(StreamFeature::ResourceBinding) {
                            self.events.publish(HandshakeEvent::FeatureNegotiated(
                                StreamFeature::ResourceBinding,
                            ));
                        }
                        if mandatory_satisfied(&inner.negotiated) {
                            self.transition(HandshakeState::Completed);
                        }
                    }
                    None => {
                        self.send_stream_error_locked(
                            inner,
                            StreamError::with_text(
                                DefinedCondition::InvalidXml,
                                "malformed resource binding result",
                            ),
                        );
                    }
                }
            }
            _ => {
                log::debug!("ignoring resource binding iq of unexpected type");
            }
        }
    }
}

impl Pipe for HandshakerPipe {
    fn on_reading(
        &self,
        _pipeline: &PipelineHandle,
        obj: Object,
        out: &mut Vec<Object>,
    ) -> Result<(), Error> {
        if self.current_state() == HandshakeState::Disposed {
            return Err(Error::InvalidState);
        }
        let element = match obj.downcast::<Element>() {
            Ok(element) => *element,
            Err(obj) => {
                out.push(obj);
                return Ok(());
            }
        };

        let mut inner = self.lock_inner();
        let state = self.current_state();
        if state == HandshakeState::Initialized || state == HandshakeState::StreamClosed {
            return Ok(());
        }
        if state == HandshakeState::Disposed {
            return Err(Error::InvalidState);
        }

        if framing::is_open(&element) {
            match state {
                HandshakeState::Started => {
                    if self.consume_stream_opening(&mut inner, &element) {
                        self.transition(HandshakeState::Negotiating);
                    }
                }
                HandshakeState::Negotiating => {
                    // Stream restart after StartTLS or SASL.
                    self.consume_stream_opening(&mut inner, &element);
                }
                HandshakeState::Completed => {
                    self.send_stream_error_locked(
                        &mut inner,
                        StreamError::with_text(
                            DefinedCondition::Conflict,
                            "server unexpectedly restarted the stream",
                        ),
                    );
                }
                _ => {}
            }
        } else if framing::is_close(&element) {
            if state != HandshakeState::StreamClosing {
                self.write_doc(&inner, framing::close_element());
            }
            self.transition(HandshakeState::StreamClosed);
        } else if element.is("features", ns::STREAM) {
            if state == HandshakeState::Negotiating {
                self.consume_stream_features(&mut inner, &element);
            } else {
                self.send_stream_error_locked(
                    &mut inner,
                    StreamError::with_text(
                        DefinedCondition::PolicyViolation,
                        "re-negotiating features is not allowed",
                    ),
                );
            }
        } else if element.ns() == ns::TLS {
            if state == HandshakeState::Negotiating
                && inner.negotiating == Some(StreamFeature::StartTls)
            {
                self.consume_starttls(&mut inner, &element);
            } else {
                self.send_stream_error_locked(
                    &mut inner,
                    StreamError::with_text(
                        DefinedCondition::PolicyViolation,
                        "not negotiating StartTLS at the time",
                    ),
                );
            }
        } else if element.ns() == ns::SASL {
            if state == HandshakeState::Negotiating
                && inner.negotiating == Some(StreamFeature::Sasl)
            {
                self.consume_sasl(&mut inner, &element);
            } else {
                self.send_stream_error_locked(
                    &mut inner,
                    StreamError::with_text(
                        DefinedCondition::PolicyViolation,
                        "not negotiating SASL at the time",
                    ),
                );
            }
        } else if element.name() == "iq" {
            if state == HandshakeState::Negotiating
                && inner.negotiating == Some(StreamFeature::ResourceBinding)
            {
                match Stanza::new(element) {
                    Ok(stanza) => self.consume_resource_binding(&mut inner, &stanza),
                    Err(_) => {}
                }
            } else if state == HandshakeState::Completed {
                out.push(Box::new(element));
            } else {
                self.send_stream_error_locked(
                    &mut inner,
                    StreamError::with_text(
                        DefinedCondition::NotAuthorized,
                        "stanzas are not allowed before the stream negotiation completes",
                    ),
                );
            }
        } else if let Some(error) = StreamError::from_element(&element) {
            log::warn!("server closed the stream: {}", error);
            inner.server_stream_error = Some(error.clone());
            if state != HandshakeState::Completed {
                inner
                    .handshake_error
                    .get_or_insert(Error::PeerStream(error));
            }
            self.initiate_close(&mut inner);
        } else {
            self.send_stream_error_locked(
                &mut inner,
                StreamError::new(DefinedCondition::UnsupportedStanzaType),
            );
        }
        Ok(())
    }

    fn on_writing(
        &self,
        _pipeline: &PipelineHandle,
        obj: Object,
        out: &mut Vec<Object>,
    ) -> Result<(), Error> {
        let state = self.current_state();
        if state == HandshakeState::Disposed {
            return Err(Error::InvalidState);
        }
        if obj.is::<Element>()
            && (state == HandshakeState::Initialized || state == HandshakeState::StreamClosed)
        {
            // No stream to write documents to.
            return Ok(());
        }
        out.push(obj);
        Ok(())
    }

    fn on_added(&self, pipeline: &PipelineHandle) {
        {
            let mut inner = self.lock_inner();
            if self.current_state() != HandshakeState::Initialized {
                log::error!("a used HandshakerPipe cannot be added to a pipeline again");
                return;
            }
            inner.pipeline = Some(pipeline.clone());
        }

        if let Some(mut subscription) = self
            .session_events
            .lock()
            .expect("subscription lock poisoned")
            .take()
        {
            let weak = self.weak.clone();
            self.spawn_task(tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    let Some(pipe) = weak.upgrade() else { break };
                    pipe.handle_session_event(event);
                }
            }));
        }

        if pipeline.current_state() == pipeline::State::Running {
            self.start();
        } else {
            let mut state_rx = pipeline.state();
            let weak = self.weak.clone();
            self.spawn_task(tokio::spawn(async move {
                if state_rx
                    .wait_for(|state| *state == pipeline::State::Running)
                    .await
                    .is_ok()
                {
                    if let Some(pipe) = weak.upgrade() {
                        pipe.start();
                    }
                }
            }));
        }
    }

    fn on_removed(&self, _pipeline: &PipelineHandle) {
        {
            let _inner = self.lock_inner();
            self.transition(HandshakeState::Disposed);
        }
        for task in self
            .tasks
            .lock()
            .expect("task lock poisoned")
            .drain(..)
        {
            task.abort();
        }
    }
}
