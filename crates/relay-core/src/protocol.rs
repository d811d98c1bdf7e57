use crate::{Message, Order, OrderId, RiderPosition, Role, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Close codes shared by hub and client. 1000 means the session ended on
/// purpose, 1008 means the credential was rejected; anything else is
/// treated as transient and retried.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameKind {
    // client -> server
    JoinConversation,
    LeaveConversation,
    AdminJoinTracking,
    RiderPosition,
    // server -> client
    NewMessage,
    UnreadCountUpdate,
    ConversationListUpdate,
    NewOrderAssigned,
    OrderStatusUpdate,
    InitFleet,
    RiderMoved,
    Error,
    AuthSuccess,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::JoinConversation => "JOIN_CONVERSATION",
            FrameKind::LeaveConversation => "LEAVE_CONVERSATION",
            FrameKind::AdminJoinTracking => "ADMIN_JOIN_TRACKING",
            FrameKind::RiderPosition => "RIDER_POSITION",
            FrameKind::NewMessage => "NEW_MESSAGE",
            FrameKind::UnreadCountUpdate => "UNREAD_COUNT_UPDATE",
            FrameKind::ConversationListUpdate => "CONVERSATION_LIST_UPDATE",
            FrameKind::NewOrderAssigned => "NEW_ORDER_ASSIGNED",
            FrameKind::OrderStatusUpdate => "ORDER_STATUS_UPDATE",
            FrameKind::InitFleet => "INIT_FLEET",
            FrameKind::RiderMoved => "RIDER_MOVED",
            FrameKind::Error => "ERROR",
            FrameKind::AuthSuccess => "AUTH_SUCCESS",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "JOIN_CONVERSATION" => Ok(FrameKind::JoinConversation),
            "LEAVE_CONVERSATION" => Ok(FrameKind::LeaveConversation),
            "ADMIN_JOIN_TRACKING" => Ok(FrameKind::AdminJoinTracking),
            "RIDER_POSITION" => Ok(FrameKind::RiderPosition),
            "NEW_MESSAGE" => Ok(FrameKind::NewMessage),
            "UNREAD_COUNT_UPDATE" => Ok(FrameKind::UnreadCountUpdate),
            "CONVERSATION_LIST_UPDATE" => Ok(FrameKind::ConversationListUpdate),
            "NEW_ORDER_ASSIGNED" => Ok(FrameKind::NewOrderAssigned),
            "ORDER_STATUS_UPDATE" => Ok(FrameKind::OrderStatusUpdate),
            "INIT_FLEET" => Ok(FrameKind::InitFleet),
            "RIDER_MOVED" => Ok(FrameKind::RiderMoved),
            "ERROR" => Ok(FrameKind::Error),
            "AUTH_SUCCESS" => Ok(FrameKind::AuthSuccess),
            other => Err(format!("unknown frame type: {other}")),
        }
    }
}

/// Wire envelope: `{type, payload}`. The payload stays untyped here and is
/// parsed per-kind by the receiving dispatch table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub payload: Value,
}

/// Envelope with the type left as a plain string, for receivers that must
/// log and drop unrecognized types instead of failing to parse.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn new<T: Serialize>(kind: FrameKind, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinConversationPayload {
    #[serde(rename = "orderId")]
    pub order_id: OrderId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiderPositionPayload {
    pub lat: f64,
    pub lng: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessagePayload {
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnreadCountUpdatePayload {
    #[serde(rename = "orderId")]
    pub order_id: OrderId,
    pub unread: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationListUpdatePayload {
    #[serde(rename = "orderId")]
    pub order_id: OrderId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPayload {
    pub order: Order,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitFleetPayload {
    pub riders: Vec<RiderPosition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiderMovedPayload {
    pub position: RiderPosition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSuccessPayload {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    pub role: Role,
}
