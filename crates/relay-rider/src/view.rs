use crate::cache::ReadThroughCache;
use chrono::{DateTime, Utc};
use relay_core::{Message, Order, OrderId, RiderPosition, UserId};
use std::collections::HashMap;

/// A message as the UI sees it. A send made while offline shows up as a
/// speculative record immediately; the confirmed server record with the
/// matching dedupe key supersedes it instead of silently overwriting the
/// list.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalMessage {
    Speculative {
        client_key: String,
        body: String,
        sent_at: DateTime<Utc>,
    },
    Confirmed(Message),
}

#[derive(Debug, Default)]
pub struct ConversationView {
    pub messages: Vec<LocalMessage>,
    pub unread: u64,
}

/// Local state fed by the dispatch table. Owned by the adapter layer;
/// everything here is refreshed by explicit events or explicit pulls.
#[derive(Default)]
pub struct ClientView {
    /// Filled by AUTH_SUCCESS once the hub has accepted the credential.
    pub user_id: Option<UserId>,
    pub conversations: HashMap<OrderId, ConversationView>,
    pub orders: ReadThroughCache<OrderId, Order>,
    pub fleet: HashMap<UserId, RiderPosition>,
    /// Set by list-invalidation hints; cleared by the next full list pull.
    pub list_dirty: bool,
}

impl ClientView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_speculative(&mut self, order_id: OrderId, client_key: String, body: String) {
        self.conversations
            .entry(order_id)
            .or_default()
            .messages
            .push(LocalMessage::Speculative {
                client_key,
                body,
                sent_at: Utc::now(),
            });
    }

    /// Applies a confirmed message. When its client key matches a
    /// speculative record, the confirmed record takes that slot.
    pub fn confirm_message(&mut self, message: Message) {
        let convo = self.conversations.entry(message.conversation_id).or_default();
        if let Some(key) = message.client_key.as_deref() {
            if let Some(slot) = convo.messages.iter_mut().find(|m| {
                matches!(m, LocalMessage::Speculative { client_key, .. } if client_key == key)
            }) {
                *slot = LocalMessage::Confirmed(message);
                return;
            }
        }
        convo.messages.push(LocalMessage::Confirmed(message));
    }

    pub fn set_unread(&mut self, order_id: OrderId, unread: u64) {
        self.conversations.entry(order_id).or_default().unread = unread;
    }

    pub fn apply_order(&mut self, order: Order) {
        self.orders.refresh(order.id, order);
    }

    /// List-invalidation hint: the cached order may be stale, the next read
    /// goes to the server.
    pub fn mark_list_dirty(&mut self, order_id: OrderId) {
        self.list_dirty = true;
        self.orders.invalidate(&order_id);
    }

    pub fn init_fleet(&mut self, riders: Vec<RiderPosition>) {
        self.fleet = riders
            .into_iter()
            .map(|position| (position.rider_id, position))
            .collect();
    }

    pub fn apply_position(&mut self, position: RiderPosition) {
        self.fleet.insert(position.rider_id, position);
    }
}
