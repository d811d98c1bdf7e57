use relay_core::action::{HttpMethod, PendingAction};
use relay_storage::{ActionQueue, QueueError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
}

/// The resend half of the replay path. Returns the HTTP status on any
/// response, or a transport error when the request never completed.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn send(&self, action: &PendingAction) -> Result<u16, TransportError>;
}

/// Raised when a queued action is dropped for good; the UI must surface it
/// as a failed action requiring manual re-entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayNotice {
    Dropped { action: PendingAction, status: u16 },
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub applied: usize,
    pub dropped: usize,
    pub deferred: usize,
}

/// Drains the durable queue against the server when connectivity returns.
/// Passes never overlap: a drain started while one is running waits for it.
pub struct ReplayAgent<T: Transport> {
    queue: Arc<Mutex<ActionQueue>>,
    transport: T,
    notices: mpsc::Sender<ReplayNotice>,
    pass: Mutex<()>,
}

impl<T: Transport> ReplayAgent<T> {
    pub fn new(
        queue: Arc<Mutex<ActionQueue>>,
        transport: T,
        notices: mpsc::Sender<ReplayNotice>,
    ) -> Self {
        Self {
            queue,
            transport,
            notices,
            pass: Mutex::new(()),
        }
    }

    /// One replay pass in enqueue order. A record's permanent failure never
    /// blocks the records behind it; transient failures stay queued for the
    /// next pass.
    pub async fn drain(&self) -> Result<DrainSummary, QueueError> {
        let _pass = self.pass.lock().await;
        let records = {
            let queue = self.queue.lock().await;
            queue.pending()?
        };
        let mut summary = DrainSummary::default();

        for record in records {
            match self.transport.send(&record).await {
                Ok(status) if (200..300).contains(&status) => {
                    self.queue.lock().await.delete(record.id)?;
                    info!(event = "replay_applied", action_id = record.id, status);
                    summary.applied += 1;
                }
                Ok(status) if (400..500).contains(&status) => {
                    // Definite client error: retrying forever would never
                    // succeed. Drop it and tell the user.
                    self.queue.lock().await.delete(record.id)?;
                    warn!(event = "replay_dropped", action_id = record.id, status);
                    let _ = self
                        .notices
                        .send(ReplayNotice::Dropped {
                            action: record,
                            status,
                        })
                        .await;
                    summary.dropped += 1;
                }
                Ok(status) => {
                    warn!(event = "replay_deferred", action_id = record.id, status);
                    summary.deferred += 1;
                }
                Err(err) => {
                    warn!(event = "replay_deferred", action_id = record.id, error = %err);
                    summary.deferred += 1;
                }
            }
        }

        Ok(summary)
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

impl Transport for HttpTransport {
    async fn send(&self, action: &PendingAction) -> Result<u16, TransportError> {
        let method = match action.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let response = self
            .client
            .request(method, &action.url)
            .bearer_auth(&action.token)
            .json(&action.payload)
            .send()
            .await;
        match response {
            Ok(resp) => Ok(resp.status().as_u16()),
            Err(err) if err.is_timeout() => Err(TransportError::Timeout),
            Err(err) => Err(TransportError::Network(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::action::NewAction;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct MockTransport {
        script: StdMutex<VecDeque<Result<u16, TransportError>>>,
        calls: StdMutex<Vec<String>>,
    }

    impl MockTransport {
        fn scripted(script: Vec<Result<u16, TransportError>>) -> Self {
            Self {
                script: StdMutex::new(script.into()),
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Transport for &MockTransport {
        async fn send(&self, action: &PendingAction) -> Result<u16, TransportError> {
            self.calls.lock().unwrap().push(action.url.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(200))
        }
    }

    fn queue_with(urls: &[&str]) -> Arc<Mutex<ActionQueue>> {
        let queue = ActionQueue::open_in_memory().expect("open queue");
        for url in urls {
            queue
                .enqueue(&NewAction::new(
                    relay_core::action::HttpMethod::Put,
                    *url,
                    json!({"status": "en_route", "userId": 3}),
                    "token",
                ))
                .expect("enqueue");
        }
        Arc::new(Mutex::new(queue))
    }

    #[tokio::test]
    async fn drain_resends_in_enqueue_order_and_empties_the_queue() {
        let queue = queue_with(&["/one", "/two", "/three"]);
        let transport = MockTransport::scripted(vec![Ok(200), Ok(200), Ok(201)]);
        let (tx, _rx) = mpsc::channel(8);
        let agent = ReplayAgent::new(queue.clone(), &transport, tx);

        let summary = agent.drain().await.expect("drain");
        assert_eq!(
            summary,
            DrainSummary {
                applied: 3,
                dropped: 0,
                deferred: 0
            }
        );
        assert_eq!(transport.calls(), vec!["/one", "/two", "/three"]);
        assert!(queue.lock().await.is_empty().expect("is_empty"));
    }

    #[tokio::test]
    async fn permanent_rejection_drops_only_that_record_with_one_notice() {
        let queue = queue_with(&["/one", "/two", "/three"]);
        let transport = MockTransport::scripted(vec![Ok(200), Ok(404), Ok(200)]);
        let (tx, mut rx) = mpsc::channel(8);
        let agent = ReplayAgent::new(queue.clone(), &transport, tx);

        let summary = agent.drain().await.expect("drain");
        assert_eq!(
            summary,
            DrainSummary {
                applied: 2,
                dropped: 1,
                deferred: 0
            }
        );
        assert!(queue.lock().await.is_empty().expect("is_empty"));

        let mut notices = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notices.push(notice);
        }
        assert_eq!(notices.len(), 1);
        match &notices[0] {
            ReplayNotice::Dropped { action, status } => {
                assert_eq!(action.url, "/two");
                assert_eq!(*status, 404);
            }
        }
    }

    #[tokio::test]
    async fn transient_failure_leaves_the_record_for_the_next_pass() {
        let queue = queue_with(&["/one", "/two", "/three"]);
        let transport = MockTransport::scripted(vec![
            Ok(200),
            Err(TransportError::Network("connection refused".into())),
            Ok(200),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        let agent = ReplayAgent::new(queue.clone(), &transport, tx);

        let summary = agent.drain().await.expect("drain");
        assert_eq!(
            summary,
            DrainSummary {
                applied: 2,
                dropped: 0,
                deferred: 1
            }
        );
        let left = queue.lock().await.pending().expect("pending");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].url, "/two");
        assert!(rx.try_recv().is_err(), "transient failures raise no notice");
    }

    #[tokio::test]
    async fn timeout_and_server_errors_are_transient() {
        let queue = queue_with(&["/one", "/two"]);
        let transport =
            MockTransport::scripted(vec![Err(TransportError::Timeout), Ok(503)]);
        let (tx, _rx) = mpsc::channel(8);
        let agent = ReplayAgent::new(queue.clone(), &transport, tx);

        let summary = agent.drain().await.expect("drain");
        assert_eq!(
            summary,
            DrainSummary {
                applied: 0,
                dropped: 0,
                deferred: 2
            }
        );
        assert_eq!(queue.lock().await.len().expect("len"), 2);
    }

    #[tokio::test]
    async fn second_pass_picks_up_what_the_first_left() {
        let queue = queue_with(&["/one"]);
        let transport = MockTransport::scripted(vec![
            Err(TransportError::Network("offline".into())),
            Ok(200),
        ]);
        let (tx, _rx) = mpsc::channel(8);
        let agent = ReplayAgent::new(queue.clone(), &transport, tx);

        agent.drain().await.expect("first pass");
        assert_eq!(queue.lock().await.len().expect("len"), 1);
        agent.drain().await.expect("second pass");
        assert!(queue.lock().await.is_empty().expect("is_empty"));
        assert_eq!(transport.calls(), vec!["/one", "/one"]);
    }
}
