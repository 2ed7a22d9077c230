// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The session: connection lifecycle, login and stanza exchange.
//!
//! A [`Session`] owns the XML [`Pipeline`] and a [`Transport`]. The
//! transport moves parsed documents between the network and the pipeline;
//! the session wires a [`HandshakerPipe`] into the pipeline, sequences the
//! lifecycle states around it and exposes the streams an application works
//! with: inbound [`Stanza`]s and [`SessionEvent`]s.

use core::time::Duration;
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use futures::Stream;
use minidom::Element;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use eddy_sasl::{Credential, CredentialKey, CredentialRetriever};

use crate::error::Error;
use crate::event::SessionEvent;
use crate::handshake::{
    HandshakeEvent, HandshakeState, HandshakerConfig, HandshakerPipe, StreamFeature,
};
use crate::jid::Jid;
use crate::pipeline::{BlankPipe, Pipeline, PipelineError, PipelineEvent, PipelineHandle};
use crate::reactive::{Publisher, Subscription};
use crate::stanza::Stanza;
use crate::stream_error::StreamError;

#[cfg(test)]
mod tests;

/// Name of the pipeline slot the handshaker occupies.
pub const HANDSHAKER_PIPE: &str = "handshaker";

/// How TLS relates to a transport's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// The connection is TLS from the first byte.
    Direct,

    /// TLS is deployed in-band after `<starttls/>`.
    StartTls,

    /// No TLS at all. For testing and local setups.
    Plain,
}

/// States of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection; logins may start from here.
    Disconnected,

    /// The transport is being opened.
    Connecting,

    /// The transport is open, the handshake not started yet.
    Connected,

    /// The stream is being negotiated.
    Handshaking,

    /// Logged in; stanzas flow.
    Online,

    /// The stream and connection are being torn down.
    Disconnecting,

    /// Shut down for good. Terminal.
    Disposed,
}

/// Hand-off for feeding received documents into the session.
#[derive(Clone)]
pub struct XmlFeed {
    pipeline: PipelineHandle,
}

impl XmlFeed {
    /// Feeds one received top-level element into the XML pipeline.
    pub fn feed(&self, document: Element) {
        log::trace!("[XML received] {:?}", document);
        self.pipeline.read(document);
    }
}

/// Everything a transport needs to exchange documents with the session.
pub struct TransportContext {
    /// Documents the session wants sent, in order.
    pub outbound: Subscription<Element>,

    /// Where to deliver each received top-level element.
    pub feed: XmlFeed,

    /// Session event stream, for publishing
    /// [`SessionEvent::ConnectionTerminated`] on connection loss.
    pub events: Arc<Publisher<SessionEvent>>,
}

/// The network side of a session: TCP, WebSocket, an in-memory loop for
/// tests, or anything else that can move parsed top-level XML elements.
///
/// Implementations must deliver each received element through
/// [`TransportContext::feed`], send every element appearing on
/// [`TransportContext::outbound`], and publish
/// [`SessionEvent::ConnectionTerminated`] when the connection is lost.
pub trait Transport: Send + 'static {
    /// How TLS is layered onto this transport.
    fn tls_mode(&self) -> TlsMode;

    /// Establishes the connection and wires it to the given context. For a
    /// [`TlsMode::Direct`] transport this includes the TLS handshake and
    /// certificate verification.
    fn open(&mut self, ctx: TransportContext) -> BoxFuture<'_, Result<(), Error>>;

    /// Upgrades the established connection to TLS, after the server agreed
    /// to `<starttls/>`.
    fn deploy_tls(&mut self) -> BoxFuture<'_, Result<(), Error>>;

    /// Tears the connection down without ceremony.
    fn kill(&mut self);
}

/// Tunables of a [`Session`].
#[derive(Clone)]
pub struct SessionConfig {
    /// Preferred SASL mechanisms, most preferred first. Empty means the
    /// default of `SCRAM-SHA-1`.
    pub sasl_mechanisms: Vec<String>,

    /// Resource to request at bind time.
    pub resource: Option<String>,

    /// Authorization identity, when acting on behalf of another account.
    pub authz_id: Option<Jid>,

    /// Request in-band registration during login. Unsupported; leaving this
    /// set fails every login.
    pub registering: bool,

    /// How long [`Session::disconnect`] waits for the orderly `<close/>`
    /// confirmation before tearing the transport down anyway.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            sasl_mechanisms: Vec::new(),
            resource: None,
            authz_id: None,
            registering: false,
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// An XMPP client session.
///
/// Create one with a [`Transport`], then [`login`][`Session::login`],
/// exchange stanzas, and eventually [`disconnect`][`Session::disconnect`]
/// or [`dispose`][`Session::dispose`]. Nothing reconnects automatically: a
/// lost connection puts the session back into
/// [`SessionState::Disconnected`] and the application decides what to do.
pub struct Session {
    config: SessionConfig,
    jid: Jid,
    pipeline: Pipeline<Element, Element>,
    transport: Arc<TokioMutex<Box<dyn Transport>>>,
    state: Arc<watch::Sender<SessionState>>,
    events: Arc<Publisher<SessionEvent>>,
    handshaker: StdMutex<Option<Arc<HandshakerPipe>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Cleans up a failed or abandoned login attempt.
struct LoginGuard {
    armed: bool,
    transport: Arc<TokioMutex<Box<dyn Transport>>>,
    state: Arc<watch::Sender<SessionState>>,
    pipeline: PipelineHandle,
}

impl Drop for LoginGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::debug!("login did not complete, killing the connection");
        self.pipeline.stop_now();
        self.pipeline.clear_queues();
        if *self.state.borrow() != SessionState::Disposed {
            self.state.send_replace(SessionState::Disconnected);
        }
        let transport = self.transport.clone();
        tokio::spawn(async move {
            transport.lock().await.kill();
        });
    }
}

impl Session {
    /// Creates a session for the given account over the given transport.
    ///
    /// Must be called from within a tokio runtime: the session spawns its
    /// housekeeping tasks right away.
    pub fn new(jid: Jid, transport: Box<dyn Transport>, config: SessionConfig) -> Session {
        let pipeline: Pipeline<Element, Element> = Pipeline::new();
        let events: Arc<Publisher<SessionEvent>> = Arc::new(Publisher::new());
        let (state, _) = watch::channel(SessionState::Disconnected);
        let state = Arc::new(state);

        // Reserve the handshaker's slot at the inbound end.
        let _ = pipeline
            .handle()
            .add_at_inbound_end(Some(HANDSHAKER_PIPE), Arc::new(BlankPipe));

        let session = Session {
            config,
            jid,
            pipeline,
            transport: Arc::new(TokioMutex::new(transport)),
            state,
            events,
            handshaker: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        };

        // A dying connection resets the lifecycle, whatever was going on.
        {
            let mut subscription = session.events.subscribe();
            let state = session.state.clone();
            let pipeline = session.pipeline.handle().clone();
            session.spawn_task(tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    if let SessionEvent::ConnectionTerminated = event {
                        log::debug!("connection terminated");
                        if *state.borrow() != SessionState::Disposed {
                            state.send_replace(SessionState::Disconnected);
                        }
                        pipeline.stop_now();
                    }
                }
            }));
        }

        // Unhandled pipeline errors surface on the session's event stream.
        {
            let mut subscription = session.pipeline.events();
            let events = session.events.clone();
            session.spawn_task(tokio::spawn(async move {
                while let Some(PipelineEvent::ExceptionCaught { error, .. }) =
                    subscription.recv().await
                {
                    events.publish(SessionEvent::ExceptionCaught(error));
                }
            }));
        }

        session
    }

    fn spawn_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().expect("task lock poisoned").push(task);
    }

    /// The account this session logs in as.
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    /// Gets the current lifecycle state.
    pub fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Subscribes to lifecycle state changes.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Subscribes to session events.
    pub fn events(&self) -> Subscription<SessionEvent> {
        self.events.subscribe()
    }

    /// The stream of inbound stanzas. Non-stanza documents reaching the
    /// inbound end are skipped.
    pub fn inbound_stanzas(&self) -> impl Stream<Item = Stanza> {
        use futures::StreamExt;
        self.pipeline
            .inbound_stream()
            .filter_map(|element| futures::future::ready(Stanza::new(element).ok()))
    }

    /// The JID the server bound this session to, once online.
    pub fn negotiated_jid(&self) -> Option<Jid> {
        self.current_handshaker()
            .and_then(|handshaker| handshaker.negotiated_jid())
    }

    /// The stream features negotiated during the last handshake.
    pub fn stream_features(&self) -> Vec<StreamFeature> {
        self.current_handshaker()
            .map(|handshaker| handshaker.negotiated_features().into_iter().collect())
            .unwrap_or_default()
    }

    fn current_handshaker(&self) -> Option<Arc<HandshakerPipe>> {
        self.handshaker
            .lock()
            .expect("handshaker lock poisoned")
            .clone()
    }

    /// Logs in with a password.
    pub async fn login(&self, password: &str) -> Result<(), Error> {
        let local = self.jid.local().to_owned();
        let password = password.to_owned();
        let retriever =
            move |authn_id: &str, _mechanism: &str, key: CredentialKey| {
                if authn_id == local && key == CredentialKey::Password {
                    Some(Credential::Password(password.clone()))
                } else {
                    None
                }
            };
        self.login_with(Arc::new(retriever)).await
    }

    /// Logs in drawing credentials from `retriever`, which allows password
    /// stores, cached salted passwords and distinct authorization ids.
    ///
    /// Resolves once the session is [`SessionState::Online`]. Fails — and
    /// returns the session to [`SessionState::Disconnected`] — when the
    /// connection cannot be opened or any negotiation step is refused.
    pub async fn login_with(&self, retriever: Arc<dyn CredentialRetriever>) -> Result<(), Error> {
        if *self.state.borrow() != SessionState::Disconnected {
            return Err(Error::InvalidState);
        }
        self.state.send_replace(SessionState::Connecting);
        let tls_mode = self.transport.lock().await.tls_mode();
        log::debug!("connecting to {} ({:?} TLS)", self.jid.domain(), tls_mode);

        let mut guard = LoginGuard {
            armed: true,
            transport: self.transport.clone(),
            state: self.state.clone(),
            pipeline: self.pipeline.handle().clone(),
        };

        let mut handshaker_config = HandshakerConfig::new(self.jid.clone());
        handshaker_config.authz_id = self.config.authz_id.clone();
        handshaker_config.sasl_mechanisms = self.config.sasl_mechanisms.clone();
        handshaker_config.resource = self.config.resource.clone();
        handshaker_config.registering = self.config.registering;
        let handshaker = HandshakerPipe::new(&self.events, retriever, handshaker_config);

        self.install_handshaker(handshaker.clone()).await?;

        // StartTLS hand-off: the handshaker reports the negotiated feature,
        // the transport deploys TLS, and the completion event lets the
        // handshaker restart the stream.
        {
            let mut subscription = handshaker.events();
            let transport = self.transport.clone();
            let events = self.events.clone();
            self.spawn_task(tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    let HandshakeEvent::FeatureNegotiated(StreamFeature::StartTls) = event
                    else {
                        continue;
                    };
                    log::debug!("deploying TLS on the transport");
                    let result = transport.lock().await.deploy_tls().await;
                    events.publish(SessionEvent::StartTlsHandshakeCompleted {
                        error: result.err(),
                    });
                }
            }));
        }

        let ctx = TransportContext {
            outbound: self.pipeline.outbound_stream(),
            feed: XmlFeed {
                pipeline: self.pipeline.handle().clone(),
            },
            events: self.events.clone(),
        };
        self.transport.lock().await.open(ctx).await?;

        self.state.send_replace(SessionState::Connected);
        self.pipeline.start();
        self.state.send_replace(SessionState::Handshaking);
        log::debug!("handshaking as {}", self.jid);

        let mut handshake = handshaker.state();
        let outcome = handshake
            .wait_for(|state| {
                matches!(
                    state,
                    HandshakeState::Completed
                        | HandshakeState::StreamClosed
                        | HandshakeState::Disposed
                )
            })
            .await;
        match outcome {
            Ok(state) if *state == HandshakeState::Completed => {
                guard.armed = false;
                self.state.send_replace(SessionState::Online);
                log::debug!("online as {}", self.jid);
                Ok(())
            }
            _ => Err(handshaker
                .handshake_error()
                .or_else(|| handshaker.server_stream_error().map(Error::PeerStream))
                .or_else(|| handshaker.client_stream_error().map(Error::Stream))
                .unwrap_or(Error::Disconnected)),
        }
    }

    /// Puts the fresh handshaker into its named slot, replacing the blank
    /// placeholder or the previous login's handshaker.
    async fn install_handshaker(&self, handshaker: Arc<HandshakerPipe>) -> Result<(), Error> {
        let replaced = self
            .pipeline
            .handle()
            .replace(HANDSHAKER_PIPE, handshaker.clone())
            .await;
        match replaced {
            Some(Ok(_old)) => {}
            Some(Err(PipelineError::NoSuchEntry(_))) => {
                // The placeholder insertion from `new` may still be queued.
                match self
                    .pipeline
                    .handle()
                    .add_at_inbound_end(Some(HANDSHAKER_PIPE), handshaker.clone())
                    .await
                {
                    Some(Ok(())) => {}
                    _ => return Err(Error::InvalidState),
                }
            }
            _ => return Err(Error::InvalidState),
        }
        *self.handshaker.lock().expect("handshaker lock poisoned") = Some(handshaker);
        Ok(())
    }

    /// Closes the stream and the connection. Idempotent.
    pub async fn disconnect(&self) -> Result<(), Error> {
        match *self.state.borrow() {
            SessionState::Disconnected | SessionState::Disposed => return Ok(()),
            SessionState::Disconnecting => {
                let mut rx = self.state.subscribe();
                let _ = rx
                    .wait_for(|state| {
                        matches!(state, SessionState::Disconnected | SessionState::Disposed)
                    })
                    .await;
                return Ok(());
            }
            _ => {}
        }
        self.state.send_replace(SessionState::Disconnecting);
        log::debug!("disconnecting");

        if let Some(handshaker) = self.current_handshaker() {
            let closed =
                tokio::time::timeout(self.config.close_timeout, handshaker.close_stream()).await;
            if closed.is_err() {
                log::debug!("giving up on a clean stream closure after timeout");
            }
        }
        self.kill_connection().await;
        if *self.state.borrow() != SessionState::Disposed {
            self.state.send_replace(SessionState::Disconnected);
        }
        Ok(())
    }

    /// Shuts the session down for good, disconnecting first if needed.
    pub async fn dispose(&self) -> Result<(), Error> {
        if *self.state.borrow() == SessionState::Disposed {
            return Ok(());
        }
        self.disconnect().await?;

        // Detach the handshaker before the session goes away.
        let _ = self.pipeline.handle().remove_all().await;
        *self.handshaker.lock().expect("handshaker lock poisoned") = None;
        self.pipeline.stop_now();
        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
        self.state.send_replace(SessionState::Disposed);
        log::debug!("session disposed");
        Ok(())
    }

    /// Sends a stanza, assigning a random id if it has none. The stanza is
    /// not validated beyond that; the server closes the stream on protocol
    /// violations.
    pub fn send(&self, mut stanza: Stanza) -> Result<(), Error> {
        if *self.state.borrow() == SessionState::Disposed {
            return Err(Error::InvalidState);
        }
        stanza.ensure_id();
        self.pipeline.write(stanza.into_xml());
        Ok(())
    }

    /// Sends a stream error to the server and closes the stream.
    pub fn send_stream_error(&self, error: StreamError) -> Result<(), Error> {
        let handshaker = self.current_handshaker().ok_or(Error::InvalidState)?;
        self.events
            .publish(SessionEvent::ExceptionCaught(Error::Stream(error.clone())));
        handshaker.send_stream_error(error);
        Ok(())
    }

    async fn kill_connection(&self) {
        log::debug!("killing the connection");
        self.transport.lock().await.kill();
        self.pipeline.stop_now();
        self.pipeline.clear_queues();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
    }
}
