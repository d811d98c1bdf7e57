use crate::replay::{Transport, TransportError};
use relay_core::action::{HttpMethod, NewAction, PendingAction};
use relay_core::order::TransitionRequest;
use relay_core::OrderId;
use relay_storage::{ActionQueue, QueueError};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// What happened to a write the user just made. `Queued` is the offline-first
/// path: the action is pending, not failed. `Rejected` is a synchronous
/// validation failure and never reaches the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied(u16),
    Rejected(u16),
    Queued(i64),
}

/// Write path: try the network first, fall back to the durable queue on
/// transient failure.
pub struct Outbox<T: Transport> {
    transport: T,
    queue: Arc<Mutex<ActionQueue>>,
}

impl<T: Transport> Outbox<T> {
    pub fn new(transport: T, queue: Arc<Mutex<ActionQueue>>) -> Self {
        Self { transport, queue }
    }

    pub async fn submit(&self, action: NewAction) -> Result<WriteOutcome, QueueError> {
        let attempt = PendingAction {
            id: 0,
            url: action.url.clone(),
            method: action.method,
            payload: action.payload.clone(),
            token: action.token.clone(),
        };
        match self.transport.send(&attempt).await {
            Ok(status) if (200..300).contains(&status) => Ok(WriteOutcome::Applied(status)),
            Ok(status) if (400..500).contains(&status) => {
                warn!(event = "write_rejected", url = %action.url, status);
                Ok(WriteOutcome::Rejected(status))
            }
            Ok(status) => {
                info!(event = "write_queued", url = %action.url, status);
                let id = self.queue.lock().await.enqueue(&action)?;
                Ok(WriteOutcome::Queued(id))
            }
            Err(err) => {
                info!(event = "write_queued", url = %action.url, error = %err);
                let id = self.queue.lock().await.enqueue(&action)?;
                Ok(WriteOutcome::Queued(id))
            }
        }
    }
}

/// `PUT /api/orders/:id/status`, naturally idempotent under replay: the
/// hub answers a repeat of the current status with a no-op success.
pub fn status_update_action(
    api_base: &str,
    order_id: OrderId,
    req: &TransitionRequest,
    token: &str,
) -> NewAction {
    NewAction::new(
        HttpMethod::Put,
        format!("{api_base}/api/orders/{order_id}/status"),
        serde_json::to_value(req).unwrap_or_else(|_| json!({})),
        token,
    )
}

pub fn pickup_action(api_base: &str, order_id: OrderId, token: &str) -> NewAction {
    NewAction::new(
        HttpMethod::Post,
        format!("{api_base}/api/orders/{order_id}/pickup"),
        json!({}),
        token,
    )
}

/// Message creates are not idempotent by themselves, so each one carries a
/// client-generated key the hub dedupes on.
pub fn message_action(api_base: &str, order_id: OrderId, body: &str, token: &str) -> NewAction {
    NewAction::new(
        HttpMethod::Post,
        format!("{api_base}/api/conversations/{order_id}/messages"),
        json!({
            "body": body,
            "clientKey": uuid::Uuid::new_v4().to_string(),
        }),
        token,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::OrderStatus;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct MockTransport {
        script: StdMutex<VecDeque<Result<u16, TransportError>>>,
    }

    impl Transport for &MockTransport {
        async fn send(&self, _action: &PendingAction) -> Result<u16, TransportError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(200))
        }
    }

    fn transport(script: Vec<Result<u16, TransportError>>) -> MockTransport {
        MockTransport {
            script: StdMutex::new(script.into()),
        }
    }

    fn queue() -> Arc<Mutex<ActionQueue>> {
        Arc::new(Mutex::new(ActionQueue::open_in_memory().expect("open")))
    }

    fn action() -> NewAction {
        status_update_action(
            "http://hub",
            4,
            &TransitionRequest::new(OrderStatus::InProgress, 9),
            "token",
        )
    }

    #[tokio::test]
    async fn successful_write_never_touches_the_queue() {
        let queue = queue();
        let transport = transport(vec![Ok(200)]);
        let outbox = Outbox::new(&transport, queue.clone());

        let outcome = outbox.submit(action()).await.expect("submit");
        assert_eq!(outcome, WriteOutcome::Applied(200));
        assert!(queue.lock().await.is_empty().expect("is_empty"));
    }

    #[tokio::test]
    async fn validation_rejection_is_surfaced_and_not_queued() {
        let queue = queue();
        let transport = transport(vec![Ok(422)]);
        let outbox = Outbox::new(&transport, queue.clone());

        let outcome = outbox.submit(action()).await.expect("submit");
        assert_eq!(outcome, WriteOutcome::Rejected(422));
        assert!(queue.lock().await.is_empty().expect("is_empty"));
    }

    #[tokio::test]
    async fn network_failure_enqueues_the_action() {
        let queue = queue();
        let transport = transport(vec![Err(TransportError::Network("offline".into()))]);
        let outbox = Outbox::new(&transport, queue.clone());

        let outcome = outbox.submit(action()).await.expect("submit");
        assert!(matches!(outcome, WriteOutcome::Queued(_)));
        let pending = queue.lock().await.pending().expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].url, "http://hub/api/orders/4/status");
        assert_eq!(pending[0].token, "token");
    }

    #[tokio::test]
    async fn server_error_counts_as_transient_and_enqueues() {
        let queue = queue();
        let transport = transport(vec![Ok(502)]);
        let outbox = Outbox::new(&transport, queue.clone());

        let outcome = outbox.submit(action()).await.expect("submit");
        assert!(matches!(outcome, WriteOutcome::Queued(_)));
        assert_eq!(queue.lock().await.len().expect("len"), 1);
    }

    #[test]
    fn message_actions_carry_a_fresh_client_key() {
        let first = message_action("http://hub", 1, "hello", "t");
        let second = message_action("http://hub", 1, "hello", "t");
        let key = |action: &NewAction| action.payload["clientKey"].as_str().unwrap().to_string();
        assert_ne!(key(&first), key(&second));
        assert_eq!(first.payload["body"], "hello");
    }
}
