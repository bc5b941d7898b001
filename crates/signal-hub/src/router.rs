use crate::{
    registry::Registry,
    session::{Session, TransportError, CLOSE_NORMAL},
};
use serde_json::Value;
use signal_core::{
    decode_client_message, forward_payload, settings_reply, unavailable_reply, ClientMessage,
    Identity, SignalError,
};
use tracing::{debug, info, warn};

pub struct MessageRouter {
    access_token: String,
    max_frame_bytes: usize,
}

impl MessageRouter {
    pub fn new(access_token: impl Into<String>, max_frame_bytes: usize) -> Self {
        Self {
            access_token: access_token.into(),
            max_frame_bytes,
        }
    }

    /// Returns the reply owed to the sender, if any. Forwarded payloads go to
    /// the target directly.
    pub async fn handle_frame(
        &self,
        registry: &Registry,
        session: &Session,
        raw: &[u8],
    ) -> Option<Value> {
        if session.is_closed() {
            return None;
        }
        let msg = match decode_client_message(raw, self.max_frame_bytes) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(event = "message_invalid", conn_id = %session.conn_id(), error = %err);
                return Some(SignalError::from(err).reply());
            }
        };
        match self.handle_message(registry, session, msg).await {
            Ok(reply) => reply,
            Err(err) => Some(err.reply()),
        }
    }

    async fn handle_message(
        &self,
        registry: &Registry,
        session: &Session,
        msg: ClientMessage,
    ) -> Result<Option<Value>, SignalError> {
        if !session.is_authenticated().await {
            if !msg.fields.grants_access(&self.access_token) {
                warn!(event = "access_denied", conn_id = %session.conn_id());
                return Err(SignalError::AccessDenied);
            }
            session.grant_access().await;
            info!(event = "access_granted", conn_id = %session.conn_id());
        }

        let identity = msg.fields.identity();
        let settings = identity.is_some();
        if let Some(identity) = identity {
            session.set_identity(identity).await;
        }
        session.update_presence(msg.fields.presence()).await;

        match msg.fields.contact() {
            Some(contact) => self.route(registry, session, contact, msg).await,
            None => Ok(Some(settings_reply(settings))),
        }
    }

    async fn route(
        &self,
        registry: &Registry,
        sender: &Session,
        contact: Identity,
        msg: ClientMessage,
    ) -> Result<Option<Value>, SignalError> {
        let matches = registry
            .find_by_identity(&contact.unique_id, &contact.application_id)
            .await;
        let Some(target) = matches.first() else {
            let searching = !registry.has_peers(sender.conn_id()).await;
            debug!(
                event = "contact_missing",
                conn_id = %sender.conn_id(),
                contact = %contact,
                searching = searching
            );
            return Err(if searching {
                SignalError::NoContacts
            } else {
                SignalError::ContactNotFound
            });
        };

        if !target.presence().await.available {
            debug!(
                event = "contact_unavailable",
                conn_id = %sender.conn_id(),
                contact = %contact
            );
            return Ok(Some(unavailable_reply(&contact)));
        }

        let sender_identity = sender.identity().await;
        let payload = forward_payload(msg.body, &sender_identity);
        match target.send_json(&payload) {
            Ok(()) => info!(
                event = "contact_forwarded",
                conn_id = %sender.conn_id(),
                target_conn_id = %target.conn_id(),
                from = %sender_identity,
                to = %contact
            ),
            Err(err) => {
                warn!(
                    event = "send_error",
                    conn_id = %target.conn_id(),
                    from = %sender_identity,
                    error = %err
                );
                // a dead transport must not stay routable
                if err == TransportError::Closed {
                    registry
                        .close_session(target, CLOSE_NORMAL, "send_error")
                        .await;
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::{test_session, AccessState, Outbound, Timeouts},
        sweeper::SweepConfig,
    };
    use serde_json::json;
    use std::{sync::Arc, time::Duration};
    use tokio::sync::mpsc;

    const TOKEN: &str = "T";

    fn setup() -> (Arc<Registry>, MessageRouter) {
        let registry = Arc::new(Registry::new(SweepConfig {
            interval: Duration::from_secs(60),
            timeouts: Timeouts {
                connect: Duration::from_secs(600),
                expiry: Duration::from_secs(3600),
            },
        }));
        (
            registry,
            MessageRouter::new(TOKEN, signal_core::DEFAULT_MAX_FRAME_BYTES),
        )
    }

    async fn send(
        router: &MessageRouter,
        registry: &Registry,
        session: &Session,
        value: Value,
    ) -> Option<Value> {
        router
            .handle_frame(registry, session, value.to_string().as_bytes())
            .await
    }

    fn next_text(rx: &mut mpsc::Receiver<Outbound>) -> Option<Value> {
        match rx.try_recv() {
            Ok(Outbound::Text(text)) => Some(serde_json::from_str(&text).expect("json")),
            _ => None,
        }
    }

    async fn connect(
        router: &MessageRouter,
        registry: &Arc<Registry>,
        conn_id: &str,
        handshake: Value,
    ) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        let (session, rx) = test_session(conn_id);
        registry.add(session.clone()).await;
        let reply = send(router, registry, &session, handshake).await;
        assert_eq!(reply, Some(json!({"response": "ok", "settings": true})));
        (session, rx)
    }

    #[tokio::test]
    async fn handshake_with_token_authenticates() {
        let (registry, router) = setup();
        let (session, _rx) = connect(
            &router,
            &registry,
            "conn-1",
            json!({"uniqueID": "a1", "applicationID": "app1", "accessToken": TOKEN}),
        )
        .await;
        assert_eq!(session.access_state().await, AccessState::Authenticated);
        assert_eq!(session.identity().await, Identity::new("a1", "app1"));
    }

    #[tokio::test]
    async fn wrong_or_missing_token_is_soft_denied() {
        let (registry, router) = setup();
        let (session, _rx) = test_session("conn-1");
        registry.add(session.clone()).await;

        for handshake in [
            json!({"uniqueID": "a1", "applicationID": "app1", "accessToken": "nope"}),
            json!({"uniqueID": "a1", "applicationID": "app1"}),
            json!({"uniqueID": "", "applicationID": "app1", "accessToken": TOKEN}),
        ] {
            let reply = send(&router, &registry, &session, handshake).await;
            assert_eq!(
                reply,
                Some(json!({"response": "error", "error": "Access Denied"}))
            );
        }
        let reply = send(
            &router,
            &registry,
            &session,
            json!({"contactUniqueID": "b1", "contactApplicationID": "app1"}),
        )
        .await;
        assert_eq!(
            reply,
            Some(json!({"response": "error", "error": "Access Denied"}))
        );
        assert_eq!(session.access_state().await, AccessState::Unauthenticated);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn malformed_frame_does_not_change_state() {
        let (registry, router) = setup();
        let (session, _rx) = test_session("conn-1");
        registry.add(session.clone()).await;

        let reply = router.handle_frame(&registry, &session, b"{not json").await;
        assert_eq!(
            reply,
            Some(json!({"response": "error", "error": "Unable to read request"}))
        );
        assert_eq!(session.access_state().await, AccessState::Unauthenticated);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn authenticated_updates_report_settings_and_presence() {
        let (registry, router) = setup();
        let (session, _rx) = connect(
            &router,
            &registry,
            "conn-1",
            json!({"uniqueID": "a1", "applicationID": "app1", "accessToken": TOKEN}),
        )
        .await;

        let reply = send(&router, &registry, &session, json!({"available": true})).await;
        assert_eq!(reply, Some(json!({"response": "ok", "settings": false})));
        assert!(session.presence().await.available);
        assert_eq!(session.identity().await, Identity::new("a1", "app1"));

        let reply = send(
            &router,
            &registry,
            &session,
            json!({"uniqueID": "a2", "applicationID": "app1", "broadcast": true}),
        )
        .await;
        assert_eq!(reply, Some(json!({"response": "ok", "settings": true})));
        assert_eq!(session.identity().await, Identity::new("a2", "app1"));
        let presence = session.presence().await;
        assert!(presence.available);
        assert!(presence.broadcast);
    }

    #[tokio::test]
    async fn missing_contact_errors_distinguish_empty_registry() {
        let (registry, router) = setup();
        let (alice, _alice_rx) = connect(
            &router,
            &registry,
            "conn-1",
            json!({"uniqueID": "a1", "applicationID": "app1", "accessToken": TOKEN}),
        )
        .await;
        let contact = json!({"contactUniqueID": "b1", "contactApplicationID": "app1"});

        let reply = send(&router, &registry, &alice, contact.clone()).await;
        assert_eq!(
            reply,
            Some(json!({"response": "error", "error": "No contacts, searching"}))
        );

        let (_carol, _carol_rx) = connect(
            &router,
            &registry,
            "conn-2",
            json!({"uniqueID": "c1", "applicationID": "app1", "accessToken": TOKEN}),
        )
        .await;
        let reply = send(&router, &registry, &alice, contact).await;
        assert_eq!(
            reply,
            Some(json!({"response": "error", "error": "No contacts, unable to find contact."}))
        );
        assert_eq!(alice.access_state().await, AccessState::Authenticated);
        assert_eq!(alice.identity().await, Identity::new("a1", "app1"));
    }

    #[tokio::test]
    async fn unavailable_contact_bounces_to_sender() {
        let (registry, router) = setup();
        let (alice, _alice_rx) = connect(
            &router,
            &registry,
            "conn-1",
            json!({"uniqueID": "a1", "applicationID": "app1", "accessToken": TOKEN}),
        )
        .await;
        let (_bob, mut bob_rx) = connect(
            &router,
            &registry,
            "conn-2",
            json!({"uniqueID": "b1", "applicationID": "app1", "accessToken": TOKEN}),
        )
        .await;

        let reply = send(
            &router,
            &registry,
            &alice,
            json!({"contactUniqueID": "b1", "contactApplicationID": "app1", "offer": "sdp"}),
        )
        .await;
        assert_eq!(
            reply,
            Some(json!({
                "contactUniqueID": "b1",
                "contactApplicationID": "app1",
                "response": "ok",
                "available": false,
            }))
        );
        assert_eq!(next_text(&mut bob_rx), None);
    }

    #[tokio::test]
    async fn available_contact_receives_rewritten_payload() {
        let (registry, router) = setup();
        let (alice, mut alice_rx) = connect(
            &router,
            &registry,
            "conn-1",
            json!({"uniqueID": "a1", "applicationID": "app1", "accessToken": TOKEN}),
        )
        .await;
        let (_bob, mut bob_rx) = connect(
            &router,
            &registry,
            "conn-2",
            json!({"uniqueID": "b1", "applicationID": "app1", "accessToken": TOKEN, "available": true}),
        )
        .await;

        let reply = send(
            &router,
            &registry,
            &alice,
            json!({"contactUniqueID": "b1", "contactApplicationID": "app1", "contactMessage": "hi"}),
        )
        .await;
        assert_eq!(reply, None);
        assert_eq!(
            next_text(&mut bob_rx),
            Some(json!({
                "contactMessage": "hi",
                "contactUniqueID": "a1",
                "contactApplicationID": "app1",
                "response": "ok",
                "available": true,
            }))
        );
        assert_eq!(next_text(&mut alice_rx), None);
    }

    #[tokio::test]
    async fn duplicate_identity_routes_to_earliest_registration() {
        let (registry, router) = setup();
        let (alice, _alice_rx) = connect(
            &router,
            &registry,
            "conn-1",
            json!({"uniqueID": "a1", "applicationID": "app1", "accessToken": TOKEN}),
        )
        .await;
        let handshake =
            json!({"uniqueID": "b1", "applicationID": "app1", "accessToken": TOKEN, "available": true});
        let (_first, mut first_rx) = connect(&router, &registry, "conn-2", handshake.clone()).await;
        let (_second, mut second_rx) = connect(&router, &registry, "conn-3", handshake).await;

        send(
            &router,
            &registry,
            &alice,
            json!({"contactUniqueID": "b1", "contactApplicationID": "app1"}),
        )
        .await;
        assert!(next_text(&mut first_rx).is_some());
        assert!(next_text(&mut second_rx).is_none());
    }

    #[tokio::test]
    async fn failed_forward_is_swallowed() {
        let (registry, router) = setup();
        let (alice, _alice_rx) = connect(
            &router,
            &registry,
            "conn-1",
            json!({"uniqueID": "a1", "applicationID": "app1", "accessToken": TOKEN}),
        )
        .await;
        let (_bob, bob_rx) = connect(
            &router,
            &registry,
            "conn-2",
            json!({"uniqueID": "b1", "applicationID": "app1", "accessToken": TOKEN, "available": true}),
        )
        .await;
        drop(bob_rx);

        let reply = send(
            &router,
            &registry,
            &alice,
            json!({"contactUniqueID": "b1", "contactApplicationID": "app1"}),
        )
        .await;
        assert_eq!(reply, None);
        assert!(!alice.is_closed());
    }

    #[tokio::test]
    async fn dead_target_is_closed_and_unroutable() {
        let (registry, router) = setup();
        let (alice, _alice_rx) = connect(
            &router,
            &registry,
            "conn-1",
            json!({"uniqueID": "a1", "applicationID": "app1", "accessToken": TOKEN}),
        )
        .await;
        let (bob, bob_rx) = connect(
            &router,
            &registry,
            "conn-2",
            json!({"uniqueID": "b1", "applicationID": "app1", "accessToken": TOKEN, "available": true}),
        )
        .await;
        drop(bob_rx);
        let contact = json!({"contactUniqueID": "b1", "contactApplicationID": "app1"});

        let reply = send(&router, &registry, &alice, contact.clone()).await;
        assert_eq!(reply, None);
        assert_eq!(bob.access_state().await, AccessState::Closed);
        assert!(registry.find_by_identity("b1", "app1").await.is_empty());
        assert!(registry.find_by_connection("conn-2").await.is_none());
        assert_eq!(registry.len().await, 1);

        let reply = send(&router, &registry, &alice, contact).await;
        assert_eq!(
            reply,
            Some(json!({"response": "error", "error": "No contacts, searching"}))
        );
        assert_eq!(alice.access_state().await, AccessState::Authenticated);
    }

    #[tokio::test]
    async fn full_target_queue_keeps_session_open() {
        let (registry, router) = setup();
        let (alice, _alice_rx) = connect(
            &router,
            &registry,
            "conn-1",
            json!({"uniqueID": "a1", "applicationID": "app1", "accessToken": TOKEN}),
        )
        .await;
        let (tx, _bob_rx) = mpsc::channel(1);
        let bob = Arc::new(Session::new("conn-2", None, tx));
        bob.grant_access().await;
        bob.set_identity(Identity::new("b1", "app1")).await;
        bob.update_presence(signal_core::PresenceUpdate {
            available: Some(true),
            ..Default::default()
        })
        .await;
        registry.add(bob.clone()).await;
        let contact = json!({"contactUniqueID": "b1", "contactApplicationID": "app1"});

        assert_eq!(send(&router, &registry, &alice, contact.clone()).await, None);
        assert_eq!(send(&router, &registry, &alice, contact).await, None);
        assert_eq!(bob.access_state().await, AccessState::Authenticated);
        assert_eq!(registry.len().await, 2);
    }
}
