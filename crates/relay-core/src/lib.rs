use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod action;
pub mod order;
pub mod protocol;

pub type OrderId = u64;
pub type UserId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub shop_id: u64,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub deliveryman_id: Option<UserId>,
    #[serde(default)]
    pub picked_up_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub follow_up_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub amount_received: Option<i64>,
    #[serde(default)]
    pub is_urgent: bool,
    #[serde(default)]
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(id: OrderId, shop_id: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            shop_id,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Unpaid,
            deliveryman_id: None,
            picked_up_at: None,
            follow_up_at: None,
            amount_received: None,
            is_urgent: false,
            is_archived: false,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    InProgress,
    ReadyForPickup,
    EnRoute,
    Delivered,
    FailedDelivery,
    Cancelled,
    NotAnswering,
    Unreachable,
    ToRelaunch,
    Postponed,
    ReturnDeclared,
    ReceivedAtHub,
    ReturnedToShop,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::ReadyForPickup => "ready_for_pickup",
            OrderStatus::EnRoute => "en_route",
            OrderStatus::Delivered => "delivered",
            OrderStatus::FailedDelivery => "failed_delivery",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::NotAnswering => "not_answering",
            OrderStatus::Unreachable => "unreachable",
            OrderStatus::ToRelaunch => "to_relaunch",
            OrderStatus::Postponed => "postponed",
            OrderStatus::ReturnDeclared => "return_declared",
            OrderStatus::ReceivedAtHub => "received_at_hub",
            OrderStatus::ReturnedToShop => "returned_to_shop",
        }
    }

    /// Active statuses are the ones a rider is still working: the main
    /// pipeline before an outcome, plus the deferred follow-up branch.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::InProgress | OrderStatus::ReadyForPickup | OrderStatus::EnRoute
        ) || self.is_deferred()
    }

    pub fn is_deferred(&self) -> bool {
        matches!(
            self,
            OrderStatus::NotAnswering
                | OrderStatus::Unreachable
                | OrderStatus::ToRelaunch
                | OrderStatus::Postponed
        )
    }

    pub fn is_return_branch(&self) -> bool {
        matches!(
            self,
            OrderStatus::ReturnDeclared | OrderStatus::ReceivedAtHub | OrderStatus::ReturnedToShop
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::ReturnedToShop
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "pending" => Ok(OrderStatus::Pending),
            "in_progress" => Ok(OrderStatus::InProgress),
            "ready_for_pickup" => Ok(OrderStatus::ReadyForPickup),
            "en_route" => Ok(OrderStatus::EnRoute),
            "delivered" => Ok(OrderStatus::Delivered),
            "failed_delivery" => Ok(OrderStatus::FailedDelivery),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "not_answering" => Ok(OrderStatus::NotAnswering),
            "unreachable" => Ok(OrderStatus::Unreachable),
            "to_relaunch" => Ok(OrderStatus::ToRelaunch),
            "postponed" => Ok(OrderStatus::Postponed),
            "return_declared" => Ok(OrderStatus::ReturnDeclared),
            "received_at_hub" => Ok(OrderStatus::ReceivedAtHub),
            "returned_to_shop" => Ok(OrderStatus::ReturnedToShop),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
    Waived,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Partial => "partial",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Waived => "waived",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Rider,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Rider => "rider",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    System,
}

/// One entry in an order's conversation. The id is assigned by the server
/// and is the authoritative ordering key within the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub conversation_id: OrderId,
    pub author_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

/// Latest known position of a rider, overwritten in place. Position history
/// belongs to an external store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiderPosition {
    pub rider_id: UserId,
    pub lat: f64,
    pub lng: f64,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}
