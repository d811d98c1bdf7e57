use crate::{Order, OrderId, OrderStatus, PaymentStatus, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How far in the past a `follow_up_at` may sit before it is rejected.
/// Absorbs the latency between the rider picking a time and the write
/// reaching the server (possibly after an offline replay).
pub const FOLLOW_UP_TOLERANCE_MINS: i64 = 5;

/// Body of the order-status write. Field names match the wire shape of
/// `PUT /api/orders/:id/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionRequest {
    pub status: OrderStatus,
    #[serde(rename = "userId")]
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_received: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up_at: Option<DateTime<Utc>>,
}

impl TransitionRequest {
    pub fn new(status: OrderStatus, user_id: UserId) -> Self {
        Self {
            status,
            user_id,
            payment_status: None,
            amount_received: None,
            follow_up_at: None,
        }
    }
}

/// Emitted for every effective transition so the hub can fan it out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderEvent {
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub user_id: UserId,
    pub at: DateTime<Utc>,
}

/// Outcome of a validated transition. `Noop` is the idempotent re-apply
/// case: the queue replays writes at-least-once, so setting a status the
/// order already has must succeed without a second domain event.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(OrderEvent),
    Noop,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("transition {from} -> {to} is not allowed")]
    NotAllowed { from: OrderStatus, to: OrderStatus },
    #[error("cannot start delivery before pickup is confirmed")]
    PickupNotConfirmed,
    #[error("{status} requires a follow_up_at")]
    FollowUpRequired { status: OrderStatus },
    #[error("follow_up_at is more than {FOLLOW_UP_TOLERANCE_MINS} minutes in the past")]
    FollowUpInPast,
    #[error("failed_delivery requires an amount_received")]
    AmountRequired,
}

/// Whether `to` is reachable from `from`, ignoring the per-target guards
/// (pickup confirmation, follow-up time, amount received).
pub fn is_allowed(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;

    // Return declaration cuts across the table: any active state, or a
    // failed/cancelled outcome, but never twice and never after delivery.
    if to == ReturnDeclared {
        return from.is_active() || matches!(from, FailedDelivery | Cancelled);
    }

    match from {
        Pending => matches!(to, InProgress | Cancelled),
        InProgress => {
            matches!(to, ReadyForPickup | EnRoute | Delivered | FailedDelivery | Cancelled)
                || to.is_deferred()
        }
        ReadyForPickup => matches!(to, EnRoute | Cancelled) || to.is_deferred(),
        EnRoute => matches!(to, Delivered | FailedDelivery | Cancelled) || to.is_deferred(),
        NotAnswering | Unreachable | ToRelaunch | Postponed => {
            matches!(
                to,
                InProgress | ReadyForPickup | EnRoute | Delivered | FailedDelivery | Cancelled
            ) || to.is_deferred()
        }
        ReturnDeclared => matches!(to, ReceivedAtHub),
        ReceivedAtHub => matches!(to, ReturnedToShop),
        Delivered | FailedDelivery | Cancelled | ReturnedToShop => false,
    }
}

/// Validates and applies one status transition. On error the order is left
/// untouched; all guards run before any field is written.
pub fn apply(
    order: &mut Order,
    req: &TransitionRequest,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    let from = order.status;
    let to = req.status;

    if from == to {
        return Ok(Transition::Noop);
    }

    if !is_allowed(from, to) {
        return Err(TransitionError::NotAllowed { from, to });
    }

    if to == OrderStatus::EnRoute && order.picked_up_at.is_none() {
        return Err(TransitionError::PickupNotConfirmed);
    }

    let follow_up = match to {
        OrderStatus::ToRelaunch | OrderStatus::Postponed => {
            let at = req
                .follow_up_at
                .ok_or(TransitionError::FollowUpRequired { status: to })?;
            if at < now - Duration::minutes(FOLLOW_UP_TOLERANCE_MINS) {
                return Err(TransitionError::FollowUpInPast);
            }
            Some(at)
        }
        _ => None,
    };

    if to == OrderStatus::FailedDelivery && req.amount_received.is_none() {
        return Err(TransitionError::AmountRequired);
    }

    order.status = to;
    order.follow_up_at = follow_up;
    if let Some(payment) = req.payment_status {
        order.payment_status = payment;
    }
    if to == OrderStatus::FailedDelivery {
        order.amount_received = req.amount_received;
    }

    Ok(Transition::Applied(OrderEvent {
        order_id: order.id,
        from,
        to,
        user_id: req.user_id,
        at: now,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(status: OrderStatus) -> Order {
        let mut order = Order::new(7, 1, Utc::now());
        order.status = status;
        order
    }

    fn req(status: OrderStatus) -> TransitionRequest {
        TransitionRequest::new(status, 42)
    }

    #[test]
    fn transition_outside_the_table_is_rejected_and_leaves_status_unchanged() {
        let mut o = order(OrderStatus::Pending);
        let err = apply(&mut o, &req(OrderStatus::Delivered), Utc::now()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::NotAllowed {
                from: OrderStatus::Pending,
                to: OrderStatus::Delivered
            }
        );
        assert_eq!(o.status, OrderStatus::Pending);
    }

    #[test]
    fn terminal_states_accept_nothing_but_return_from_cancelled() {
        for terminal in [
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
            OrderStatus::ReturnedToShop,
        ] {
            let mut o = order(terminal);
            assert!(apply(&mut o, &req(OrderStatus::InProgress), Utc::now()).is_err());
            assert_eq!(o.status, terminal);
        }
        assert!(is_allowed(OrderStatus::Cancelled, OrderStatus::ReturnDeclared));
        assert!(!is_allowed(OrderStatus::Delivered, OrderStatus::ReturnDeclared));
        assert!(!is_allowed(OrderStatus::ReturnedToShop, OrderStatus::ReturnDeclared));
    }

    #[test]
    fn en_route_requires_a_recorded_pickup() {
        let mut o = order(OrderStatus::ReadyForPickup);
        let err = apply(&mut o, &req(OrderStatus::EnRoute), Utc::now()).unwrap_err();
        assert_eq!(err, TransitionError::PickupNotConfirmed);
        assert_eq!(o.status, OrderStatus::ReadyForPickup);

        o.picked_up_at = Some(Utc::now());
        let out = apply(&mut o, &req(OrderStatus::EnRoute), Utc::now()).unwrap();
        assert!(matches!(out, Transition::Applied(_)));
        assert_eq!(o.status, OrderStatus::EnRoute);
    }

    #[test]
    fn to_relaunch_requires_follow_up_within_tolerance() {
        let now = Utc::now();

        let mut o = order(OrderStatus::EnRoute);
        let err = apply(&mut o, &req(OrderStatus::ToRelaunch), now).unwrap_err();
        assert_eq!(
            err,
            TransitionError::FollowUpRequired {
                status: OrderStatus::ToRelaunch
            }
        );

        let mut stale = req(OrderStatus::ToRelaunch);
        stale.follow_up_at = Some(now - Duration::minutes(6));
        assert_eq!(
            apply(&mut o, &stale, now).unwrap_err(),
            TransitionError::FollowUpInPast
        );
        assert_eq!(o.status, OrderStatus::EnRoute);

        // Exactly "now" and exactly at the tolerance edge both pass.
        for at in [now, now - Duration::minutes(FOLLOW_UP_TOLERANCE_MINS)] {
            let mut o = order(OrderStatus::EnRoute);
            let mut ok = req(OrderStatus::ToRelaunch);
            ok.follow_up_at = Some(at);
            apply(&mut o, &ok, now).unwrap();
            assert_eq!(o.status, OrderStatus::ToRelaunch);
            assert_eq!(o.follow_up_at, Some(at));
        }
    }

    #[test]
    fn not_answering_does_not_require_follow_up() {
        let mut o = order(OrderStatus::EnRoute);
        apply(&mut o, &req(OrderStatus::NotAnswering), Utc::now()).unwrap();
        assert_eq!(o.status, OrderStatus::NotAnswering);
        assert_eq!(o.follow_up_at, None);
    }

    #[test]
    fn leaving_the_deferred_branch_clears_follow_up() {
        let now = Utc::now();
        let mut o = order(OrderStatus::EnRoute);
        o.picked_up_at = Some(now);
        let mut defer = req(OrderStatus::Postponed);
        defer.follow_up_at = Some(now + Duration::hours(2));
        apply(&mut o, &defer, now).unwrap();
        assert!(o.follow_up_at.is_some());

        apply(&mut o, &req(OrderStatus::EnRoute), now).unwrap();
        assert_eq!(o.follow_up_at, None);
    }

    #[test]
    fn failed_delivery_requires_amount_and_zero_counts() {
        let mut o = order(OrderStatus::EnRoute);
        assert_eq!(
            apply(&mut o, &req(OrderStatus::FailedDelivery), Utc::now()).unwrap_err(),
            TransitionError::AmountRequired
        );

        let mut with_amount = req(OrderStatus::FailedDelivery);
        with_amount.amount_received = Some(0);
        apply(&mut o, &with_amount, Utc::now()).unwrap();
        assert_eq!(o.status, OrderStatus::FailedDelivery);
        assert_eq!(o.amount_received, Some(0));
    }

    #[test]
    fn return_branch_walks_to_the_shop_and_ends_there() {
        let mut o = order(OrderStatus::FailedDelivery);
        apply(&mut o, &req(OrderStatus::ReturnDeclared), Utc::now()).unwrap();
        apply(&mut o, &req(OrderStatus::ReceivedAtHub), Utc::now()).unwrap();
        apply(&mut o, &req(OrderStatus::ReturnedToShop), Utc::now()).unwrap();
        assert!(o.status.is_terminal());
        // No second return declaration once in the branch.
        let mut back = order(OrderStatus::ReturnDeclared);
        assert!(apply(&mut back, &req(OrderStatus::ReturnDeclared), Utc::now()).is_ok_and(
            |t| t == Transition::Noop
        ));
        assert!(apply(&mut back, &req(OrderStatus::EnRoute), Utc::now()).is_err());
    }

    #[test]
    fn reapplying_the_current_status_is_an_idempotent_noop() {
        let now = Utc::now();
        let mut o = order(OrderStatus::EnRoute);
        o.picked_up_at = Some(now);

        let mut fail = req(OrderStatus::FailedDelivery);
        fail.amount_received = Some(1500);
        let first = apply(&mut o, &fail, now).unwrap();
        assert!(matches!(first, Transition::Applied(_)));

        let second = apply(&mut o, &fail, now).unwrap();
        assert_eq!(second, Transition::Noop);
        assert_eq!(o.status, OrderStatus::FailedDelivery);
        assert_eq!(o.amount_received, Some(1500));
    }

    #[test]
    fn effective_transition_records_the_acting_user() {
        let now = Utc::now();
        let mut o = order(OrderStatus::Pending);
        match apply(&mut o, &req(OrderStatus::InProgress), now).unwrap() {
            Transition::Applied(event) => {
                assert_eq!(event.user_id, 42);
                assert_eq!(event.from, OrderStatus::Pending);
                assert_eq!(event.to, OrderStatus::InProgress);
                assert_eq!(event.at, now);
            }
            Transition::Noop => panic!("expected an applied transition"),
        }
    }

    #[test]
    fn payment_status_is_carried_when_supplied() {
        let mut o = order(OrderStatus::EnRoute);
        o.picked_up_at = Some(Utc::now());
        let mut delivered = req(OrderStatus::Delivered);
        delivered.payment_status = Some(PaymentStatus::Paid);
        apply(&mut o, &delivered, Utc::now()).unwrap();
        assert_eq!(o.payment_status, PaymentStatus::Paid);
    }
}
