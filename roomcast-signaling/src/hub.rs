//! Connection registry
//!
//! A single task owns the room -> user -> client map. Registration,
//! unregistration, broadcast and inspection requests arrive on separate bounded
//! channels and are applied one at a time, so the map needs no lock.
//!
//! The hub only tracks delivery channels. Session state belongs to the SFU; the
//! hub asks the backend to release a session when a client goes away. Releases
//! run as their own tasks, so a slow SFU room never stalls other rooms.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use roomcast_sfu::{PeerKey, PeerRole, RoomId, UserId};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::SignalingBackend;
use crate::config::SignalingConfig;
use crate::error::{Result, SignalingError};
use crate::message::SignalMessage;

/// Identifies one accepted connection
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Delivery handle for one connected client
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    sender: mpsc::Sender<SignalMessage>,
    closed: CancellationToken,
}

impl ClientHandle {
    /// New handle plus the receiving end of its outbound queue
    #[must_use]
    pub fn new(
        room_id: RoomId,
        user_id: UserId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<SignalMessage>) {
        let (sender, outbound) = mpsc::channel(capacity.max(1));
        let handle = Self {
            room_id,
            user_id,
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            sender,
            closed: CancellationToken::new(),
        };
        (handle, outbound)
    }

    /// Queue a message without waiting
    pub fn try_deliver(
        &self,
        message: SignalMessage,
    ) -> std::result::Result<(), TrySendError<SignalMessage>> {
        if self.closed.is_cancelled() {
            return Err(TrySendError::Closed(message));
        }
        self.sender.try_send(message)
    }

    /// Stop all further delivery; the write pump sends a close frame
    pub fn close(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

struct Registration {
    client: ClientHandle,
    ack: oneshot::Sender<()>,
}

enum Departure {
    /// Connection closed or sent `leave`
    Unregister {
        room_id: RoomId,
        user_id: UserId,
        connection_id: ConnectionId,
    },
    /// A session was committed for a connection the hub had already dropped
    Orphaned { room_id: RoomId, user_id: UserId },
}

struct BroadcastRequest {
    room_id: RoomId,
    message: SignalMessage,
    exclude: Option<ConnectionId>,
}

enum HubQuery {
    RoomMembers {
        room_id: RoomId,
        reply: oneshot::Sender<Vec<UserId>>,
    },
    RoomCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Completion of a background session release
struct Released {
    key: PeerKey,
    role: Option<PeerRole>,
    /// Connection spared if the release tears the room down
    keep: Option<ConnectionId>,
}

/// Cloneable front end of the hub task
#[derive(Clone)]
pub struct HubHandle {
    register: mpsc::Sender<Registration>,
    departures: mpsc::Sender<Departure>,
    broadcast: mpsc::Sender<BroadcastRequest>,
    query: mpsc::Sender<HubQuery>,
}

impl HubHandle {
    /// Register a client; returns once the hub has applied it and any release
    /// of a previous session under the same identity has finished
    pub async fn register(&self, client: ClientHandle) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.register
            .send(Registration { client, ack })
            .await
            .map_err(|_| SignalingError::HubClosed)?;
        done.await.map_err(|_| SignalingError::HubClosed)
    }

    pub async fn unregister(&self, client: &ClientHandle) -> Result<()> {
        self.departures
            .send(Departure::Unregister {
                room_id: client.room_id.clone(),
                user_id: client.user_id.clone(),
                connection_id: client.connection_id,
            })
            .await
            .map_err(|_| SignalingError::HubClosed)
    }

    /// Release the session `client` negotiated after the hub closed it
    pub async fn release_orphaned(&self, client: &ClientHandle) -> Result<()> {
        self.departures
            .send(Departure::Orphaned {
                room_id: client.room_id.clone(),
                user_id: client.user_id.clone(),
            })
            .await
            .map_err(|_| SignalingError::HubClosed)
    }

    /// Deliver `message` to every client in `room_id` except `exclude`
    pub async fn broadcast(
        &self,
        room_id: RoomId,
        message: SignalMessage,
        exclude: Option<ConnectionId>,
    ) -> Result<()> {
        self.broadcast
            .send(BroadcastRequest {
                room_id,
                message,
                exclude,
            })
            .await
            .map_err(|_| SignalingError::HubClosed)
    }

    /// Registered users of a room, sorted
    pub async fn room_members(&self, room_id: &RoomId) -> Result<Vec<UserId>> {
        let (reply, answer) = oneshot::channel();
        self.query
            .send(HubQuery::RoomMembers {
                room_id: room_id.clone(),
                reply,
            })
            .await
            .map_err(|_| SignalingError::HubClosed)?;
        answer.await.map_err(|_| SignalingError::HubClosed)
    }

    pub async fn room_count(&self) -> Result<usize> {
        let (reply, answer) = oneshot::channel();
        self.query
            .send(HubQuery::RoomCount { reply })
            .await
            .map_err(|_| SignalingError::HubClosed)?;
        answer.await.map_err(|_| SignalingError::HubClosed)
    }
}

pub struct Hub {
    rooms: HashMap<RoomId, HashMap<UserId, ClientHandle>>,
    backend: Arc<dyn SignalingBackend>,
    register: mpsc::Receiver<Registration>,
    departures: mpsc::Receiver<Departure>,
    broadcast: mpsc::Receiver<BroadcastRequest>,
    query: mpsc::Receiver<HubQuery>,
    released_tx: mpsc::UnboundedSender<Released>,
    released: mpsc::UnboundedReceiver<Released>,
    /// In-flight releases per identity
    releasing: HashMap<PeerKey, usize>,
    /// Registration acks held back until the identity's releases finish
    pending_acks: HashMap<PeerKey, Vec<oneshot::Sender<()>>>,
}

impl Hub {
    #[must_use]
    pub fn new(backend: Arc<dyn SignalingBackend>, config: &SignalingConfig) -> (Self, HubHandle) {
        let capacity = config.hub_queue_capacity.max(1);
        let (register_tx, register) = mpsc::channel(capacity);
        let (departures_tx, departures) = mpsc::channel(capacity);
        let (broadcast_tx, broadcast) = mpsc::channel(capacity);
        let (query_tx, query) = mpsc::channel(capacity);
        let (released_tx, released) = mpsc::unbounded_channel();

        let hub = Self {
            rooms: HashMap::new(),
            backend,
            register,
            departures,
            broadcast,
            query,
            released_tx,
            released,
            releasing: HashMap::new(),
            pending_acks: HashMap::new(),
        };
        let handle = HubHandle {
            register: register_tx,
            departures: departures_tx,
            broadcast: broadcast_tx,
            query: query_tx,
        };
        (hub, handle)
    }

    /// Spawn the event loop
    pub fn spawn(
        backend: Arc<dyn SignalingBackend>,
        config: &SignalingConfig,
        shutdown: CancellationToken,
    ) -> (HubHandle, tokio::task::JoinHandle<()>) {
        let (hub, handle) = Self::new(backend, config);
        let task = tokio::spawn(hub.run(shutdown));
        (handle, task)
    }

    /// Apply requests one at a time. Nothing in here awaits the SFU: session
    /// releases run as separate tasks and report back on `released`.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Hub started");
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(released) = self.released.recv() => {
                    self.on_released(released);
                }
                Some(registration) = self.register.recv() => {
                    self.register_client(registration);
                }
                Some(departure) = self.departures.recv() => {
                    self.on_departure(departure);
                }
                Some(request) = self.broadcast.recv() => {
                    self.broadcast_to_room(request);
                }
                Some(query) = self.query.recv() => {
                    self.answer_query(query);
                }
                else => break,
            }
        }

        for client in self.rooms.values().flat_map(HashMap::values) {
            client.close();
        }
        info!(rooms = self.rooms.len(), "Hub stopped");
    }

    fn register_client(&mut self, registration: Registration) {
        let Registration { client, ack } = registration;
        let key = PeerKey::new(client.room_id.clone(), client.user_id.clone());
        let connection_id = client.connection_id;

        let replaced = self
            .rooms
            .entry(key.room_id.clone())
            .or_default()
            .insert(key.user_id.clone(), client);

        if let Some(previous) = replaced {
            previous.close();
            warn!(
                room_id = %key.room_id,
                user_id = %key.user_id,
                old_connection_id = previous.connection_id,
                connection_id,
                "Identity reconnected, replaced previous connection"
            );
            self.release(key.clone(), Some(connection_id));
        }

        if self.releasing.contains_key(&key) {
            debug!(peer = %key, "Registration waits for a pending session release");
            self.pending_acks.entry(key.clone()).or_default().push(ack);
        } else {
            let _ = ack.send(());
        }

        let members = self.rooms.get(&key.room_id).map_or(0, HashMap::len);
        info!(
            room_id = %key.room_id,
            user_id = %key.user_id,
            connection_id,
            members,
            "Client registered"
        );
    }

    fn on_departure(&mut self, departure: Departure) {
        match departure {
            Departure::Unregister {
                room_id,
                user_id,
                connection_id,
            } => self.unregister_client(room_id, user_id, connection_id),
            Departure::Orphaned { room_id, user_id } => {
                warn!(
                    room_id = %room_id,
                    user_id = %user_id,
                    "Releasing session negotiated by a closed connection"
                );
                self.release(PeerKey::new(room_id, user_id), None);
            }
        }
    }

    fn unregister_client(&mut self, room_id: RoomId, user_id: UserId, connection_id: ConnectionId) {
        let Some(clients) = self.rooms.get_mut(&room_id) else {
            debug!(room_id = %room_id, user_id = %user_id, "Unregister for unknown room ignored");
            return;
        };
        let current = clients
            .get(&user_id)
            .is_some_and(|client| client.connection_id == connection_id);
        if !current {
            debug!(
                room_id = %room_id,
                user_id = %user_id,
                connection_id,
                "Unregister for stale or unknown connection ignored"
            );
            return;
        }

        if let Some(client) = clients.remove(&user_id) {
            client.close();
        }
        let members = clients.len();
        if members == 0 {
            self.rooms.remove(&room_id);
            debug!(room_id = %room_id, "Room has no more clients, removed");
        }

        info!(
            room_id = %room_id,
            user_id = %user_id,
            connection_id,
            members,
            "Client unregistered"
        );
        self.release(PeerKey::new(room_id, user_id), None);
    }

    /// Ask the backend to drop `key`'s session without blocking the loop
    fn release(&mut self, key: PeerKey, keep: Option<ConnectionId>) {
        *self.releasing.entry(key.clone()).or_default() += 1;
        let backend = Arc::clone(&self.backend);
        let done = self.released_tx.clone();
        tokio::spawn(async move {
            let role = backend.release_session(&key.room_id, &key.user_id).await;
            let _ = done.send(Released { key, role, keep });
        });
    }

    fn on_released(&mut self, released: Released) {
        let Released { key, role, keep } = released;

        if let Entry::Occupied(mut pending) = self.releasing.entry(key.clone()) {
            *pending.get_mut() -= 1;
            if *pending.get() == 0 {
                pending.remove();
                for ack in self.pending_acks.remove(&key).unwrap_or_default() {
                    let _ = ack.send(());
                }
            }
        }

        debug!(peer = %key, role = ?role, "Session release finished");
        if role == Some(PeerRole::Publisher) {
            self.evict_room(&key.room_id, keep);
        }
    }

    /// Close every client left in a room whose publisher is gone and release
    /// whatever session each of them still holds
    fn evict_room(&mut self, room_id: &RoomId, keep: Option<ConnectionId>) {
        let Some(clients) = self.rooms.get_mut(room_id) else {
            return;
        };
        let mut evicted = Vec::new();
        clients.retain(|user_id, client| {
            if keep == Some(client.connection_id) {
                return true;
            }
            client.close();
            evicted.push(user_id.clone());
            false
        });
        if clients.is_empty() {
            self.rooms.remove(room_id);
        }
        info!(room_id = %room_id, evicted = evicted.len(), "Publisher left, closed remaining room clients");

        for user_id in evicted {
            self.release(PeerKey::new(room_id.clone(), user_id), None);
        }
    }

    fn broadcast_to_room(&self, request: BroadcastRequest) {
        let BroadcastRequest {
            room_id,
            message,
            exclude,
        } = request;

        let Some(clients) = self.rooms.get(&room_id) else {
            debug!(room_id = %room_id, kind = %message.kind, "Broadcast to unknown room ignored");
            return;
        };

        let mut sent = 0usize;
        for client in clients.values() {
            if exclude == Some(client.connection_id) {
                continue;
            }
            match client.try_deliver(message.clone()) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        room_id = %room_id,
                        user_id = %client.user_id,
                        kind = %message.kind,
                        "Outbound queue full, message dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        room_id = %room_id,
                        user_id = %client.user_id,
                        "Client already closed, message dropped"
                    );
                }
            }
        }

        debug!(
            room_id = %room_id,
            kind = %message.kind,
            sent,
            members = clients.len(),
            "Broadcast complete"
        );
    }

    fn answer_query(&self, query: HubQuery) {
        match query {
            HubQuery::RoomMembers { room_id, reply } => {
                let mut members: Vec<UserId> = self
                    .rooms
                    .get(&room_id)
                    .map(|clients| clients.keys().cloned().collect())
                    .unwrap_or_default();
                members.sort();
                let _ = reply.send(members);
            }
            HubQuery::RoomCount { reply } => {
                let _ = reply.send(self.rooms.len());
            }
        }
    }
}
