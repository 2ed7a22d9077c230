// Copyright (c) 2026 eddy-rs developers
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end sessions over an in-memory transport scripted to act as the
//! server.

use super::*;

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

use eddy_sasl::common::scram::Sha1;
use eddy_sasl::server::mechanisms::ScramServer;
use eddy_sasl::server::Mechanism as _;

use crate::handshake::framing;
use crate::ns;

const ASSIGNED_JID: &str = "juliet@example.com/balcony-42";

fn parse(xml: &str) -> Element {
    xml.parse().expect("test XML must parse")
}

fn decode_payload(element: &Element) -> Vec<u8> {
    let text = element.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        Vec::new()
    } else {
        BASE64.decode(text).expect("payload must be base64")
    }
}

/// Plays an XMPP server on the other end of the pipeline.
async fn server_script(
    mut outbound: Subscription<Element>,
    feed: XmlFeed,
    events: Arc<Publisher<SessionEvent>>,
    seen: mpsc::UnboundedSender<Element>,
    server_password: String,
) {
    let retriever: Arc<dyn CredentialRetriever> = Arc::new(
        move |_: &str, _: &str, key: CredentialKey| match key {
            CredentialKey::Password => Some(Credential::Password(server_password.clone())),
            _ => None,
        },
    );
    let mut scram: Option<ScramServer<Sha1>> = None;
    let mut authenticated = false;
    let mut bound = false;

    while let Some(doc) = outbound.recv().await {
        if framing::is_open(&doc) {
            feed.feed(parse(&format!(
                "<open xmlns='{}' from='example.com' id='s1' version='1.0'/>",
                ns::FRAMING
            )));
            if authenticated {
                feed.feed(parse(&format!(
                    "<features xmlns='{}'><bind xmlns='{}'/></features>",
                    ns::STREAM,
                    ns::BIND
                )));
            } else {
                feed.feed(parse(&format!(
                    "<features xmlns='{}'><mechanisms xmlns='{}'>\
                     <mechanism>SCRAM-SHA-1</mechanism></mechanisms></features>",
                    ns::STREAM,
                    ns::SASL
                )));
            }
        } else if doc.is("auth", ns::SASL) {
            let mut server = ScramServer::<Sha1>::new(retriever.clone());
            server.accept_response(&decode_payload(&doc));
            let challenge = server.challenge();
            if server.error().is_some() {
                feed.feed(parse(&format!(
                    "<failure xmlns='{}'><not-authorized/></failure>",
                    ns::SASL
                )));
            } else {
                feed.feed(
                    Element::builder("challenge", ns::SASL)
                        .append(BASE64.encode(&challenge))
                        .build(),
                );
                scram = Some(server);
            }
        } else if doc.is("response", ns::SASL) {
            let Some(server) = scram.as_mut() else { continue };
            server.accept_response(&decode_payload(&doc));
            let server_final = server.challenge();
            if server.error().is_some() {
                feed.feed(parse(&format!(
                    "<failure xmlns='{}'><not-authorized/></failure>",
                    ns::SASL
                )));
            } else {
                authenticated = true;
                feed.feed(
                    Element::builder("success", ns::SASL)
                        .append(BASE64.encode(&server_final))
                        .build(),
                );
            }
        } else if doc.name() == "iq" && !bound {
            bound = true;
            let id = doc.attr("id").unwrap_or("").to_owned();
            feed.feed(parse(&format!(
                "<iq xmlns='jabber:client' type='result' id='{}'>\
                 <bind xmlns='{}'><jid>{}</jid></bind></iq>",
                id,
                ns::BIND,
                ASSIGNED_JID
            )));
            // Greet the fresh session with a message right away.
            feed.feed(parse(
                "<message xmlns='jabber:client' id='srv-1' from='example.com'>\
                 <body xmlns='jabber:client'>welcome</body></message>",
            ));
        } else if framing::is_close(&doc) {
            feed.feed(parse(&format!("<close xmlns='{}'/>", ns::FRAMING)));
            events.publish(SessionEvent::ConnectionTerminated);
            break;
        } else {
            let _ = seen.send(doc);
        }
    }
}

struct ScriptedTransport {
    server_password: String,
    seen: mpsc::UnboundedSender<Element>,
    events: Option<Arc<Publisher<SessionEvent>>>,
    task: Option<JoinHandle<()>>,
}

impl ScriptedTransport {
    fn new(server_password: &str) -> (ScriptedTransport, mpsc::UnboundedReceiver<Element>) {
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        (
            ScriptedTransport {
                server_password: server_password.to_owned(),
                seen: seen_tx,
                events: None,
                task: None,
            },
            seen_rx,
        )
    }
}

impl Transport for ScriptedTransport {
    fn tls_mode(&self) -> TlsMode {
        TlsMode::Direct
    }

    fn open(&mut self, ctx: TransportContext) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.events = Some(ctx.events.clone());
            self.task = Some(tokio::spawn(server_script(
                ctx.outbound,
                ctx.feed,
                ctx.events,
                self.seen.clone(),
                self.server_password.clone(),
            )));
            Ok(())
        })
    }

    fn deploy_tls(&mut self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(futures::future::ready(Ok(())))
    }

    fn kill(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(events) = &self.events {
            events.publish(SessionEvent::ConnectionTerminated);
        }
    }
}

fn session(server_password: &str) -> (Session, mpsc::UnboundedReceiver<Element>) {
    let (transport, seen) = ScriptedTransport::new(server_password);
    let session = Session::new(
        "juliet@example.com".parse().unwrap(),
        Box::new(transport),
        SessionConfig::default(),
    );
    (session, seen)
}

#[tokio::test]
async fn login_reaches_online_and_binds() {
    let (session, _seen) = session("pencil");
    assert_eq!(session.current_state(), SessionState::Disconnected);

    timeout(Duration::from_secs(5), session.login("pencil"))
        .await
        .expect("login timed out")
        .expect("login failed");

    assert_eq!(session.current_state(), SessionState::Online);
    assert_eq!(
        session.negotiated_jid(),
        Some(ASSIGNED_JID.parse().unwrap())
    );
    assert!(session
        .stream_features()
        .contains(&StreamFeature::ResourceBinding));
}

#[tokio::test]
async fn stanzas_flow_both_ways_when_online() {
    let (session, mut seen) = session("pencil");
    let mut stanzas = Box::pin(session.inbound_stanzas());

    timeout(Duration::from_secs(5), session.login("pencil"))
        .await
        .unwrap()
        .unwrap();

    // Inbound: the scripted server greets after binding.
    let greeting = timeout(Duration::from_secs(5), stanzas.next())
        .await
        .expect("no greeting")
        .expect("stanza stream ended");
    assert_eq!(greeting.id(), "srv-1");

    // Outbound: the server sees what we send, with an id filled in.
    session
        .send(Stanza::new(parse("<message xmlns='jabber:client'><body xmlns='jabber:client'>hello</body></message>")).unwrap())
        .unwrap();
    let delivered = timeout(Duration::from_secs(5), seen.recv())
        .await
        .expect("server saw nothing")
        .expect("server channel closed");
    assert_eq!(delivered.name(), "message");
    assert!(delivered.attr("id").is_some());
}

#[tokio::test]
async fn disconnect_closes_the_stream_first() {
    let (session, _seen) = session("pencil");
    timeout(Duration::from_secs(5), session.login("pencil"))
        .await
        .unwrap()
        .unwrap();

    timeout(Duration::from_secs(5), session.disconnect())
        .await
        .expect("disconnect timed out")
        .unwrap();
    assert_eq!(session.current_state(), SessionState::Disconnected);

    // Idempotent.
    session.disconnect().await.unwrap();
    assert_eq!(session.current_state(), SessionState::Disconnected);
}

#[tokio::test]
async fn wrong_password_fails_the_login() {
    let (session, _seen) = session("swordfish");
    let error = timeout(Duration::from_secs(5), session.login("pencil"))
        .await
        .expect("login timed out")
        .expect_err("login must fail");
    match error {
        Error::Auth(_) => {}
        other => panic!("unexpected login error: {:?}", other),
    }
    // Back to square one; a new login may start.
    let mut rx = session.state();
    timeout(
        Duration::from_secs(5),
        rx.wait_for(|state| *state == SessionState::Disconnected),
    )
    .await
    .expect("session did not settle")
    .unwrap();
}

#[tokio::test]
async fn login_requires_disconnected() {
    let (session, _seen) = session("pencil");
    timeout(Duration::from_secs(5), session.login("pencil"))
        .await
        .unwrap()
        .unwrap();
    match session.login("pencil").await {
        Err(Error::InvalidState) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn dispose_is_terminal() {
    let (session, _seen) = session("pencil");
    timeout(Duration::from_secs(5), session.login("pencil"))
        .await
        .unwrap()
        .unwrap();

    timeout(Duration::from_secs(5), session.dispose())
        .await
        .expect("dispose timed out")
        .unwrap();
    assert_eq!(session.current_state(), SessionState::Disposed);

    match session.login("pencil").await {
        Err(Error::InvalidState) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(session.send(Stanza::new(parse("<presence xmlns='jabber:client'/>")).unwrap()).is_err());

    // Disposing again is a no-op.
    session.dispose().await.unwrap();
}

#[tokio::test]
async fn second_login_after_disconnect_works() {
    let (session, _seen) = session("pencil");
    timeout(Duration::from_secs(5), session.login("pencil"))
        .await
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(5), session.disconnect())
        .await
        .unwrap()
        .unwrap();

    timeout(Duration::from_secs(5), session.login("pencil"))
        .await
        .expect("second login timed out")
        .expect("second login failed");
    assert_eq!(session.current_state(), SessionState::Online);
}

#[tokio::test]
async fn registration_flag_fails_logins() {
    let (transport, _seen) = ScriptedTransport::new("pencil");
    let mut config = SessionConfig::default();
    config.registering = true;
    let session = Session::new(
        "juliet@example.com".parse().unwrap(),
        Box::new(transport),
        config,
    );

    let error = timeout(Duration::from_secs(5), session.login("pencil"))
        .await
        .expect("login timed out")
        .expect_err("registration must be refused");
    match error {
        Error::Handshake(_) => {}
        other => panic!("unexpected login error: {:?}", other),
    }
}
