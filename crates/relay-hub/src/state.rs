use axum::extract::ws::Message as WsMessage;
use chrono::{DateTime, Utc};
use relay_core::order::{self, OrderEvent, Transition, TransitionError, TransitionRequest};
use relay_core::protocol::{
    AuthSuccessPayload, ConversationListUpdatePayload, ErrorPayload, Frame, FrameKind,
    InitFleetPayload, NewMessagePayload, OrderPayload, RiderMovedPayload, RiderPositionPayload,
    UnreadCountUpdatePayload,
};
use relay_core::{Message, MessageKind, Order, OrderId, RiderPosition, Role, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct Session {
    pub user_id: UserId,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("unknown order {0}")]
    UnknownOrder(OrderId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("not a participant of this conversation")]
    Forbidden,
}

/// One live socket. The outbound half is an mpsc sender drained by the
/// connection's write task; a full or closed channel marks the connection
/// dead and it gets removed on the next send attempt.
pub struct ClientConn {
    pub conn_id: String,
    pub user_id: UserId,
    pub role: Role,
    sender: mpsc::Sender<WsMessage>,
}

impl ClientConn {
    pub fn new(
        conn_id: String,
        user_id: UserId,
        role: Role,
        sender: mpsc::Sender<WsMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn_id,
            user_id,
            role,
            sender,
        })
    }

    pub async fn send_frame(&self, frame: &Frame) -> bool {
        let text = match frame.to_text() {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "frame_encode_error", error = %err);
                return false;
            }
        };
        self.sender.send(WsMessage::Text(text)).await.is_ok()
    }
}

/// Per-order message thread plus the read bookkeeping for each participant.
/// `next_id` assigns the authoritative per-conversation ordering key.
#[derive(Default)]
struct Conversation {
    messages: Vec<Message>,
    next_id: u64,
    watermarks: HashMap<UserId, u64>,
    unread: HashMap<UserId, u64>,
    client_keys: HashMap<String, u64>,
}

impl Conversation {
    fn unread_for(&self, user_id: UserId) -> u64 {
        self.unread.get(&user_id).copied().unwrap_or(0)
    }
}

pub struct HubState {
    conn_counter: AtomicU64,
    order_counter: AtomicU64,
    sessions: HashMap<String, Session>,
    connections: RwLock<HashMap<String, Arc<ClientConn>>>,
    rooms: RwLock<HashMap<OrderId, HashMap<String, Arc<ClientConn>>>>,
    tracking: RwLock<HashMap<String, Arc<ClientConn>>>,
    orders: RwLock<HashMap<OrderId, Arc<Mutex<Order>>>>,
    conversations: RwLock<HashMap<OrderId, Arc<Mutex<Conversation>>>>,
    fleet: RwLock<HashMap<UserId, RiderPosition>>,
}

impl HubState {
    pub fn new(sessions: HashMap<String, Session>) -> Self {
        Self {
            conn_counter: AtomicU64::new(0),
            order_counter: AtomicU64::new(0),
            sessions,
            connections: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            tracking: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            conversations: RwLock::new(HashMap::new()),
            fleet: RwLock::new(HashMap::new()),
        }
    }

    pub fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub fn authenticate(&self, token: &str) -> Option<Session> {
        self.sessions.get(token).copied()
    }

    fn admin_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<_> = self
            .sessions
            .values()
            .filter(|session| session.role == Role::Admin)
            .map(|session| session.user_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Assigned rider plus every admin console.
    async fn participants(&self, order_id: OrderId) -> Result<Vec<UserId>, HubError> {
        let order = self.order_snapshot(order_id).await?;
        let mut ids = self.admin_ids();
        if let Some(rider) = order.deliveryman_id {
            if !ids.contains(&rider) {
                ids.push(rider);
            }
        }
        Ok(ids)
    }

    pub async fn register(&self, conn: Arc<ClientConn>) {
        if let Ok(auth) = Frame::new(
            FrameKind::AuthSuccess,
            &AuthSuccessPayload {
                user_id: conn.user_id,
                role: conn.role,
            },
        ) {
            conn.send_frame(&auth).await;
        }
        self.connections
            .write()
            .await
            .insert(conn.conn_id.clone(), conn.clone());
        info!(
            event = "client_connected",
            conn_id = %conn.conn_id,
            user_id = conn.user_id,
            role = conn.role.as_str()
        );
    }

    /// Tears the connection down and drops every room membership it held.
    pub async fn remove(&self, conn: &ClientConn, reason: &str) {
        self.connections.write().await.remove(&conn.conn_id);
        {
            let mut rooms = self.rooms.write().await;
            rooms.retain(|_, members| {
                members.remove(&conn.conn_id);
                !members.is_empty()
            });
        }
        self.tracking.write().await.remove(&conn.conn_id);
        info!(
            event = "client_disconnected",
            conn_id = %conn.conn_id,
            user_id = conn.user_id,
            reason = reason
        );
    }

    pub async fn join_conversation(
        &self,
        conn: &Arc<ClientConn>,
        order_id: OrderId,
    ) -> Result<(), HubError> {
        if !self.orders.read().await.contains_key(&order_id) {
            return Err(HubError::UnknownOrder(order_id));
        }
        self.rooms
            .write()
            .await
            .entry(order_id)
            .or_default()
            .insert(conn.conn_id.clone(), conn.clone());
        info!(event = "conversation_joined", conn_id = %conn.conn_id, order_id);
        Ok(())
    }

    /// No-op when the connection never joined.
    pub async fn leave_conversation(&self, conn: &ClientConn, order_id: OrderId) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(&order_id) {
            members.remove(&conn.conn_id);
            if members.is_empty() {
                rooms.remove(&order_id);
            }
        }
    }

    pub async fn join_tracking(&self, conn: &Arc<ClientConn>) {
        self.tracking
            .write()
            .await
            .insert(conn.conn_id.clone(), conn.clone());
        let mut riders: Vec<_> = self.fleet.read().await.values().cloned().collect();
        riders.sort_by_key(|position| position.rider_id);
        if let Ok(frame) = Frame::new(FrameKind::InitFleet, &InitFleetPayload { riders }) {
            if !conn.send_frame(&frame).await {
                self.remove(conn, "send_error").await;
            }
        }
    }

    pub async fn update_position(
        &self,
        rider_id: UserId,
        payload: &RiderPositionPayload,
        now: DateTime<Utc>,
    ) {
        let position = RiderPosition {
            rider_id,
            lat: payload.lat,
            lng: payload.lng,
            status: payload.status.clone(),
            updated_at: now,
        };
        self.fleet.write().await.insert(rider_id, position.clone());
        if let Ok(frame) = Frame::new(FrameKind::RiderMoved, &RiderMovedPayload { position }) {
            self.broadcast_tracking(&frame).await;
        }
    }

    pub async fn create_order(&self, shop_id: u64, is_urgent: bool) -> Order {
        let id = self.order_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut order = Order::new(id, shop_id, Utc::now());
        order.is_urgent = is_urgent;
        self.orders
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(order.clone())));
        self.conversations
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(Conversation::default())));
        info!(event = "order_created", order_id = id, shop_id);
        order
    }

    async fn order_handle(&self, order_id: OrderId) -> Result<Arc<Mutex<Order>>, HubError> {
        self.orders
            .read()
            .await
            .get(&order_id)
            .cloned()
            .ok_or(HubError::UnknownOrder(order_id))
    }

    pub async fn order_snapshot(&self, order_id: OrderId) -> Result<Order, HubError> {
        let handle = self.order_handle(order_id).await?;
        let order = handle.lock().await;
        Ok(order.clone())
    }

    pub async fn assign_order(
        &self,
        order_id: OrderId,
        rider_id: UserId,
    ) -> Result<Order, HubError> {
        let handle = self.order_handle(order_id).await?;
        let snapshot = {
            let mut order = handle.lock().await;
            order.deliveryman_id = Some(rider_id);
            order.clone()
        };
        info!(event = "order_assigned", order_id, rider_id);
        if let Ok(frame) = Frame::new(
            FrameKind::NewOrderAssigned,
            &OrderPayload {
                order: snapshot.clone(),
            },
        ) {
            self.send_to_user(rider_id, &frame).await;
        }
        self.notify_list_update(order_id).await;
        Ok(snapshot)
    }

    /// Applies one status transition under the order's own lock, then fans
    /// the result out. A `Noop` (idempotent replay) is a success without a
    /// second broadcast.
    pub async fn apply_status(
        &self,
        order_id: OrderId,
        req: &TransitionRequest,
        now: DateTime<Utc>,
    ) -> Result<(Order, Option<OrderEvent>), HubError> {
        let handle = self.order_handle(order_id).await?;
        let (snapshot, outcome) = {
            let mut order = handle.lock().await;
            let outcome = order::apply(&mut order, req, now)?;
            (order.clone(), outcome)
        };
        match outcome {
            Transition::Applied(event) => {
                info!(
                    event = "order_transition",
                    order_id,
                    from = event.from.as_str(),
                    to = event.to.as_str(),
                    user_id = event.user_id
                );
                self.broadcast_order_update(&snapshot).await;
                Ok((snapshot, Some(event)))
            }
            Transition::Noop => Ok((snapshot, None)),
        }
    }

    /// Records the pickup confirmation. Idempotent: a replayed confirmation
    /// keeps the original timestamp.
    pub async fn confirm_pickup(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<Order, HubError> {
        let handle = self.order_handle(order_id).await?;
        let snapshot = {
            let mut order = handle.lock().await;
            if order.picked_up_at.is_none() {
                order.picked_up_at = Some(now);
            }
            order.clone()
        };
        info!(event = "pickup_confirmed", order_id);
        self.broadcast_order_update(&snapshot).await;
        Ok(snapshot)
    }

    /// Appends a message and fans it out. Holding the conversation lock
    /// across the fan-out is what guarantees per-conversation id order on
    /// every receiving socket. Returns the message and whether it was newly
    /// created (false when the client key deduped it).
    pub async fn post_message(
        &self,
        order_id: OrderId,
        author_id: UserId,
        body: String,
        kind: MessageKind,
        client_key: Option<String>,
    ) -> Result<(Message, bool), HubError> {
        let participants = self.participants(order_id).await?;
        let convo_handle = self
            .conversations
            .read()
            .await
            .get(&order_id)
            .cloned()
            .ok_or(HubError::UnknownOrder(order_id))?;
        let mut convo = convo_handle.lock().await;

        if let Some(key) = client_key.as_deref() {
            if let Some(existing_id) = convo.client_keys.get(key).copied() {
                if let Some(existing) =
                    convo.messages.iter().find(|m| m.id == existing_id).cloned()
                {
                    return Ok((existing, false));
                }
            }
        }

        convo.next_id += 1;
        let message = Message {
            id: convo.next_id,
            conversation_id: order_id,
            author_id,
            body,
            kind,
            created_at: Utc::now(),
            client_key: client_key.clone(),
        };
        convo.messages.push(message.clone());
        if let Some(key) = client_key {
            convo.client_keys.insert(key, message.id);
        }

        let mut counters = Vec::new();
        for user_id in &participants {
            if *user_id == author_id {
                continue;
            }
            let count = convo.unread.entry(*user_id).or_insert(0);
            *count += 1;
            counters.push((*user_id, *count));
        }

        if let Ok(frame) = Frame::new(
            FrameKind::NewMessage,
            &NewMessagePayload {
                message: message.clone(),
            },
        ) {
            self.broadcast_room(order_id, &frame).await;
        }
        for (user_id, unread) in counters {
            if let Ok(frame) = Frame::new(
                FrameKind::UnreadCountUpdate,
                &UnreadCountUpdatePayload { order_id, unread },
            ) {
                self.send_to_user(user_id, &frame).await;
            }
        }
        drop(convo);

        self.notify_list_update(order_id).await;
        Ok((message, true))
    }

    /// History pull. When `read_up_to` is present the caller's watermark
    /// advances (never backwards) and exactly one unread update goes back to
    /// that participant only.
    pub async fn read_history(
        &self,
        order_id: OrderId,
        user_id: UserId,
        read_up_to: Option<u64>,
    ) -> Result<Vec<Message>, HubError> {
        let participants = self.participants(order_id).await?;
        if !participants.contains(&user_id) {
            return Err(HubError::Forbidden);
        }
        let convo_handle = self
            .conversations
            .read()
            .await
            .get(&order_id)
            .cloned()
            .ok_or(HubError::UnknownOrder(order_id))?;
        let mut convo = convo_handle.lock().await;
        let messages = convo.messages.clone();

        if let Some(up_to) = read_up_to {
            let last_id = convo.next_id;
            let mark = up_to.min(last_id);
            let watermark = convo.watermarks.entry(user_id).or_insert(0);
            if mark > *watermark {
                *watermark = mark;
            }
            let watermark = *watermark;
            let unread = convo
                .messages
                .iter()
                .filter(|m| m.id > watermark && m.author_id != user_id)
                .count() as u64;
            convo.unread.insert(user_id, unread);
            if let Ok(frame) = Frame::new(
                FrameKind::UnreadCountUpdate,
                &UnreadCountUpdatePayload { order_id, unread },
            ) {
                self.send_to_user(user_id, &frame).await;
            }
        }

        Ok(messages)
    }

    pub async fn unread_count(&self, order_id: OrderId, user_id: UserId) -> u64 {
        let handle = self.conversations.read().await.get(&order_id).cloned();
        match handle {
            Some(handle) => handle.lock().await.unread_for(user_id),
            None => 0,
        }
    }

    async fn broadcast_order_update(&self, order: &Order) {
        let frame = match Frame::new(
            FrameKind::OrderStatusUpdate,
            &OrderPayload {
                order: order.clone(),
            },
        ) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        // Audience is the union of the order's room and every admin
        // console; a conn present in both gets the frame once.
        let mut audience: HashMap<String, Arc<ClientConn>> = HashMap::new();
        if let Some(members) = self.rooms.read().await.get(&order.id) {
            for (conn_id, conn) in members {
                audience.insert(conn_id.clone(), conn.clone());
            }
        }
        for conn in self.connections.read().await.values() {
            if conn.role == Role::Admin {
                audience.insert(conn.conn_id.clone(), conn.clone());
            }
        }
        for conn in audience.values() {
            if !conn.send_frame(&frame).await {
                warn!(event = "send_error", conn_id = %conn.conn_id);
                self.remove(conn, "send_error").await;
            }
        }
    }

    async fn notify_list_update(&self, order_id: OrderId) {
        if let Ok(frame) = Frame::new(
            FrameKind::ConversationListUpdate,
            &ConversationListUpdatePayload { order_id },
        ) {
            self.broadcast_admins(&frame).await;
        }
    }

    pub async fn send_error(&self, conn: &ClientConn, code: &str, message: &str) {
        if let Ok(frame) = Frame::new(
            FrameKind::Error,
            &ErrorPayload {
                code: code.to_string(),
                message: message.to_string(),
            },
        ) {
            let _ = conn.send_frame(&frame).await;
        }
    }

    async fn send_to_user(&self, user_id: UserId, frame: &Frame) {
        let targets: Vec<_> = self
            .connections
            .read()
            .await
            .values()
            .filter(|conn| conn.user_id == user_id)
            .cloned()
            .collect();
        for conn in targets {
            if !conn.send_frame(frame).await {
                warn!(event = "send_error", conn_id = %conn.conn_id);
                self.remove(&conn, "send_error").await;
            }
        }
    }

    async fn broadcast_admins(&self, frame: &Frame) {
        let targets: Vec<_> = self
            .connections
            .read()
            .await
            .values()
            .filter(|conn| conn.role == Role::Admin)
            .cloned()
            .collect();
        for conn in targets {
            if !conn.send_frame(frame).await {
                warn!(event = "send_error", conn_id = %conn.conn_id);
                self.remove(&conn, "send_error").await;
            }
        }
    }

    async fn broadcast_room(&self, order_id: OrderId, frame: &Frame) {
        let targets: Vec<_> = self
            .rooms
            .read()
            .await
            .get(&order_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default();
        for conn in targets {
            if !conn.send_frame(frame).await {
                warn!(event = "send_error", conn_id = %conn.conn_id);
                self.remove(&conn, "send_error").await;
            }
        }
    }

    async fn broadcast_tracking(&self, frame: &Frame) {
        let targets: Vec<_> = self.tracking.read().await.values().cloned().collect();
        for conn in targets {
            if !conn.send_frame(frame).await {
                warn!(event = "send_error", conn_id = %conn.conn_id);
                self.remove(&conn, "send_error").await;
            }
        }
    }
}
