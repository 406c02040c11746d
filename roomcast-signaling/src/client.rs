//! Per-connection message pumps
//!
//! Each accepted WebSocket gets a read pump (runs in the connection task,
//! decodes frames and dispatches them) and a write pump (spawned, drains the
//! client's bounded outbound queue and keeps the connection alive with pings).

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::SignalingBackend;
use crate::config::SignalingConfig;
use crate::hub::{ClientHandle, HubHandle};
use crate::message::{MessageKind, SignalMessage};

pub struct Client {
    handle: ClientHandle,
    hub: HubHandle,
    backend: Arc<dyn SignalingBackend>,
    config: Arc<SignalingConfig>,
}

impl Client {
    #[must_use]
    pub fn new(
        handle: ClientHandle,
        hub: HubHandle,
        backend: Arc<dyn SignalingBackend>,
        config: Arc<SignalingConfig>,
    ) -> Self {
        Self {
            handle,
            hub,
            backend,
            config,
        }
    }

    #[must_use]
    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Register with the hub and pump messages until either side goes away
    pub async fn serve(self, socket: WebSocket, outbound: mpsc::Receiver<SignalMessage>) {
        if let Err(e) = self.hub.register(self.handle.clone()).await {
            warn!(
                room_id = %self.handle.room_id,
                user_id = %self.handle.user_id,
                error = %e,
                "Failed to register client"
            );
            return;
        }

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(write_pump(
            sink,
            outbound,
            self.handle.closed_token(),
            Arc::clone(&self.config),
        ));

        self.read_pump(stream).await;

        if let Err(e) = self.hub.unregister(&self.handle).await {
            debug!(user_id = %self.handle.user_id, error = %e, "Unregister after disconnect failed");
        }
        self.handle.close();
        let _ = writer.await;

        info!(
            room_id = %self.handle.room_id,
            user_id = %self.handle.user_id,
            connection_id = self.handle.connection_id,
            "WebSocket connection closed"
        );
    }

    /// Read frames until the peer closes, the read deadline passes or the hub
    /// closes this client. Any inbound frame refreshes the deadline.
    pub async fn read_pump<S, E>(&self, mut stream: S)
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let closed = self.handle.closed_token();
        let pong_wait = self.config.pong_wait();
        loop {
            let next = tokio::select! {
                () = closed.cancelled() => {
                    debug!(user_id = %self.handle.user_id, "Client closed by hub");
                    break;
                }
                next = timeout(pong_wait, stream.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    warn!(
                        room_id = %self.handle.room_id,
                        user_id = %self.handle.user_id,
                        "Read deadline exceeded, dropping connection"
                    );
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(user_id = %self.handle.user_id, error = %e, "WebSocket read failed");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Text(text) => self.handle_text(text.as_str()).await,
                Message::Close(_) => break,
                Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let mut message: SignalMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    room_id = %self.handle.room_id,
                    user_id = %self.handle.user_id,
                    error = %e,
                    "Malformed message dropped"
                );
                return;
            }
        };

        message.room_id = self.handle.room_id.clone();
        message.user_id = self.handle.user_id.clone();
        debug!(
            room_id = %message.room_id,
            user_id = %message.user_id,
            kind = %message.kind,
            "Message received"
        );
        self.dispatch(message).await;
    }

    pub async fn dispatch(&self, message: SignalMessage) {
        let room_id = &self.handle.room_id;
        let user_id = &self.handle.user_id;

        if self.handle.is_closed() {
            debug!(room_id = %room_id, user_id = %user_id, kind = %message.kind, "Client closed, message ignored");
            return;
        }

        match message.kind {
            MessageKind::Join => {
                info!(room_id = %room_id, user_id = %user_id, "Join received");
            }
            MessageKind::Offer => self.handle_offer(&message).await,
            MessageKind::Answer => {
                let result = self
                    .hub
                    .broadcast(room_id.clone(), message, Some(self.handle.connection_id))
                    .await;
                if let Err(e) = result {
                    warn!(room_id = %room_id, user_id = %user_id, error = %e, "Failed to relay answer");
                }
            }
            MessageKind::IceCandidate => {
                let result = self
                    .backend
                    .handle_ice_candidate(room_id, user_id, message.payload)
                    .await;
                if let Err(e) = result {
                    warn!(room_id = %room_id, user_id = %user_id, error = %e, "ICE candidate dropped");
                }
            }
            MessageKind::Leave => {
                info!(room_id = %room_id, user_id = %user_id, "Leave received");
                if let Err(e) = self.hub.unregister(&self.handle).await {
                    warn!(room_id = %room_id, user_id = %user_id, error = %e, "Failed to unregister");
                }
            }
        }
    }

    async fn handle_offer(&self, message: &SignalMessage) {
        let room_id = &self.handle.room_id;
        let user_id = &self.handle.user_id;

        let payload = match message.sdp_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(room_id = %room_id, user_id = %user_id, error = %e, "Malformed offer payload dropped");
                return;
            }
        };

        let answer = match self
            .backend
            .handle_offer(room_id, user_id, payload.role, payload.description())
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!(room_id = %room_id, user_id = %user_id, error = %e, "Offer rejected");
                return;
            }
        };

        match self
            .handle
            .try_deliver(SignalMessage::answer(room_id.clone(), answer))
        {
            Ok(()) => debug!(room_id = %room_id, user_id = %user_id, "Answer queued"),
            Err(TrySendError::Full(_)) => {
                warn!(room_id = %room_id, user_id = %user_id, "Outbound queue full, answer dropped");
            }
            Err(TrySendError::Closed(_)) => {
                // nothing else releases a session committed after the hub dropped us
                warn!(room_id = %room_id, user_id = %user_id, "Client closed during negotiation");
                if let Err(e) = self.hub.release_orphaned(&self.handle).await {
                    warn!(room_id = %room_id, user_id = %user_id, error = %e, "Failed to release session");
                }
            }
        }
    }
}

/// Drain the outbound queue into `sink`, pinging every ping period. Once the
/// client is closed, flush what is already queued and send a close frame.
pub async fn write_pump<K>(
    mut sink: K,
    mut outbound: mpsc::Receiver<SignalMessage>,
    closed: CancellationToken,
    config: Arc<SignalingConfig>,
) where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let write_wait = config.write_wait();
    let period = config.ping_period();
    let mut ping = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            () = closed.cancelled() => {
                while let Ok(message) = outbound.try_recv() {
                    if !send_message(&mut sink, &message, write_wait).await {
                        return;
                    }
                }
                let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
                break;
            }
            next = outbound.recv() => {
                let Some(message) = next else {
                    let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
                    break;
                };
                if !send_message(&mut sink, &message, write_wait).await {
                    break;
                }
            }
            _ = ping.tick() => {
                match timeout(write_wait, sink.send(Message::Ping(Bytes::new()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(error = %e, "Ping failed");
                        break;
                    }
                    Err(_) => {
                        debug!("Ping timed out");
                        break;
                    }
                }
            }
        }
    }
    debug!("Write pump stopped");
}

async fn send_message<K>(sink: &mut K, message: &SignalMessage, write_wait: std::time::Duration) -> bool
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!(kind = %message.kind, error = %e, "Failed to encode message");
            return true;
        }
    };
    match timeout(write_wait, sink.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => {
            debug!(kind = %message.kind, user_id = %message.user_id, "Message sent");
            true
        }
        Ok(Err(e)) => {
            warn!(kind = %message.kind, error = %e, "Failed to send message");
            false
        }
        Err(_) => {
            warn!(kind = %message.kind, "Write deadline exceeded");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use async_trait::async_trait;
    use roomcast_sfu::testing::{eventually, StubEngine, VALID_OFFER};
    use roomcast_sfu::{PeerRole, RoomId, SessionDescription, SfuConfig, SfuManager, UserId};
    use std::time::Duration;

    struct Harness {
        sfu: Arc<SfuManager<StubEngine>>,
        hub: HubHandle,
        config: Arc<SignalingConfig>,
        _shutdown: tokio_util::sync::DropGuard,
    }

    impl Harness {
        fn new(config: SignalingConfig) -> Self {
            let sfu = Arc::new(SfuManager::new(StubEngine::new(), SfuConfig::default()));
            let shutdown = CancellationToken::new();
            let (hub, _task) = Hub::spawn(sfu.clone(), &config, shutdown.clone());
            Self {
                sfu,
                hub,
                config: Arc::new(config),
                _shutdown: shutdown.drop_guard(),
            }
        }

        async fn connect(&self, room: &str, user: &str) -> (Client, mpsc::Receiver<SignalMessage>) {
            let (handle, outbound) = ClientHandle::new(RoomId::from(room), UserId::from(user), 16);
            self.hub.register(handle.clone()).await.unwrap();
            let client = Client::new(handle, self.hub.clone(), self.sfu.clone(), Arc::clone(&self.config));
            (client, outbound)
        }
    }

    fn frames(texts: &[String]) -> impl Stream<Item = Result<Message, axum::Error>> + Unpin {
        let frames: Vec<Result<Message, axum::Error>> = texts
            .iter()
            .map(|text| Ok(Message::Text(text.clone().into())))
            .collect();
        futures::stream::iter(frames)
    }

    fn offer_json(room: &str, user: &str) -> String {
        serde_json::json!({
            "type": "offer",
            "room_id": room,
            "user_id": user,
            "payload": { "sdp": VALID_OFFER, "type": "offer" }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_offer_is_answered_on_own_queue() {
        let harness = Harness::new(SignalingConfig::default());
        let (client, mut outbound) = harness.connect("r1", "alice").await;

        // identities on the wire are ignored in favor of the connection's
        client.read_pump(frames(&[offer_json("elsewhere", "mallory")])).await;

        let answer = outbound.try_recv().unwrap();
        assert_eq!(answer.kind, MessageKind::Answer);
        assert_eq!(answer.user_id.as_str(), "sfu");
        assert_eq!(answer.payload["type"], "answer");
        assert_eq!(answer.payload["sdp"], "answer:r1/alice");
        assert!(harness.sfu.has_room(&RoomId::from("r1")));
        assert!(!harness.sfu.has_room(&RoomId::from("elsewhere")));
    }

    #[tokio::test]
    async fn test_malformed_messages_are_dropped() {
        let harness = Harness::new(SignalingConfig::default());
        let (client, mut outbound) = harness.connect("r1", "alice").await;

        let bad_offer = serde_json::json!({ "type": "offer", "payload": { "sdp": 7 } }).to_string();
        client
            .read_pump(frames(&[
                "{not json".to_string(),
                bad_offer,
                offer_json("r1", "alice"),
            ]))
            .await;

        assert_eq!(outbound.try_recv().unwrap().kind, MessageKind::Answer);
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejected_offer_sends_nothing() {
        let harness = Harness::new(SignalingConfig::default());
        let (client, mut outbound) = harness.connect("r1", "alice").await;
        let invalid = serde_json::json!({
            "type": "offer",
            "payload": { "sdp": "invalid sdp", "type": "offer" }
        })
        .to_string();

        client.read_pump(frames(&[invalid])).await;

        assert!(outbound.try_recv().is_err());
        assert!(!harness.sfu.has_room(&RoomId::from("r1")));
    }

    #[tokio::test]
    async fn test_answer_is_relayed_to_others() {
        let harness = Harness::new(SignalingConfig::default());
        let (alice, mut alice_rx) = harness.connect("r1", "alice").await;
        let (_bob, mut bob_rx) = harness.connect("r1", "bob").await;

        let answer = serde_json::json!({
            "type": "answer",
            "payload": { "sdp": "v=0", "type": "answer" }
        })
        .to_string();
        alice.read_pump(frames(&[answer])).await;
        harness.hub.room_count().await.unwrap();

        let relayed = bob_rx.try_recv().unwrap();
        assert_eq!(relayed.kind, MessageKind::Answer);
        assert_eq!(relayed.user_id.as_str(), "alice");
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_candidate_reaches_session() {
        let harness = Harness::new(SignalingConfig::default());
        let (client, _outbound) = harness.connect("r1", "alice").await;
        let candidate = serde_json::json!({
            "type": "ice_candidate",
            "payload": { "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0 }
        })
        .to_string();

        client
            .read_pump(frames(&[offer_json("r1", "alice"), candidate]))
            .await;

        let session = harness.sfu.engine().session("r1", "alice").unwrap();
        assert_eq!(session.candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_leave_releases_everything() {
        let harness = Harness::new(SignalingConfig::default());
        let (client, _outbound) = harness.connect("r1", "alice").await;
        let leave = serde_json::json!({ "type": "leave" }).to_string();

        client.read_pump(frames(&[offer_json("r1", "alice"), leave])).await;
        harness.hub.room_count().await.unwrap();

        assert!(client.handle().is_closed());
        assert_eq!(harness.hub.room_count().await.unwrap(), 0);
        let session = harness.sfu.engine().session("r1", "alice").unwrap();
        assert!(eventually(|| session.is_closed()).await);
        assert!(eventually(|| !harness.sfu.has_room(&RoomId::from("r1"))).await);
    }

    #[tokio::test]
    async fn test_closed_client_ignores_offers() {
        let harness = Harness::new(SignalingConfig::default());
        let (client, mut outbound) = harness.connect("r1", "alice").await;
        client.handle().close();

        client.read_pump(frames(&[offer_json("r1", "alice")])).await;

        assert!(outbound.try_recv().is_err());
        assert!(harness.sfu.engine().session("r1", "alice").is_none());
        assert_eq!(harness.sfu.room_count(), 0);
    }

    /// Closes the connection while the offer is being negotiated
    struct ClosingBackend {
        sfu: Arc<SfuManager<StubEngine>>,
        client: ClientHandle,
    }

    #[async_trait]
    impl SignalingBackend for ClosingBackend {
        async fn handle_offer(
            &self,
            room_id: &RoomId,
            user_id: &UserId,
            role: Option<PeerRole>,
            offer: SessionDescription,
        ) -> crate::Result<SessionDescription> {
            let negotiated = SfuManager::handle_offer(self.sfu.as_ref(), room_id, user_id, role, offer).await?;
            self.client.close();
            Ok(negotiated.answer)
        }

        async fn handle_ice_candidate(
            &self,
            room_id: &RoomId,
            user_id: &UserId,
            payload: serde_json::Value,
        ) -> crate::Result<()> {
            SignalingBackend::handle_ice_candidate(self.sfu.as_ref(), room_id, user_id, payload).await
        }

        async fn release_session(&self, room_id: &RoomId, user_id: &UserId) -> Option<PeerRole> {
            SignalingBackend::release_session(self.sfu.as_ref(), room_id, user_id).await
        }
    }

    #[tokio::test]
    async fn test_session_negotiated_after_close_is_released() {
        let harness = Harness::new(SignalingConfig::default());
        let (handle, mut outbound) = ClientHandle::new(RoomId::from("r1"), UserId::from("alice"), 16);
        harness.hub.register(handle.clone()).await.unwrap();
        let backend = Arc::new(ClosingBackend {
            sfu: Arc::clone(&harness.sfu),
            client: handle.clone(),
        });
        let client = Client::new(handle, harness.hub.clone(), backend, Arc::clone(&harness.config));

        client.read_pump(frames(&[offer_json("r1", "alice")])).await;

        assert!(outbound.try_recv().is_err());
        let session = harness.sfu.engine().session("r1", "alice").unwrap();
        assert!(eventually(|| session.is_closed()).await);
        assert!(eventually(|| !harness.sfu.has_room(&RoomId::from("r1"))).await);
    }

    #[tokio::test]
    async fn test_read_deadline_ends_pump() {
        let harness = Harness::new(SignalingConfig {
            pong_wait_secs: 0,
            ..SignalingConfig::default()
        });
        let (client, _outbound) = harness.connect("r1", "alice").await;
        let stream = futures::stream::pending::<Result<Message, axum::Error>>();
        let finished = tokio::time::timeout(Duration::from_secs(1), client.read_pump(stream)).await;
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn test_write_pump_flushes_then_closes() {
        let (handle, outbound) = ClientHandle::new(RoomId::from("r1"), UserId::from("alice"), 8);
        let (sink, mut written) = futures::channel::mpsc::unbounded::<Message>();

        handle
            .try_deliver(SignalMessage {
                kind: MessageKind::Join,
                room_id: RoomId::from("r1"),
                user_id: UserId::from("alice"),
                payload: serde_json::Value::Null,
            })
            .unwrap();
        handle.close();

        write_pump(
            sink,
            outbound,
            handle.closed_token(),
            Arc::new(SignalingConfig::default()),
        )
        .await;

        let first = written.next().await.unwrap();
        let Message::Text(text) = first else {
            panic!("expected text frame, got {first:?}");
        };
        let sent: SignalMessage = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(sent.kind, MessageKind::Join);
        assert!(matches!(written.next().await, Some(Message::Close(None))));
    }
}
