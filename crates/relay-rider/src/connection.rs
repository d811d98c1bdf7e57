use crate::dispatch::Dispatcher;
use futures_util::{SinkExt, StreamExt};
use relay_core::protocol::{
    Frame, FrameKind, JoinConversationPayload, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
};
use relay_core::OrderId;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{info, warn};
use url::Url;

/// Fixed delay before a reconnect attempt after an abnormal close.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    LoggedOut,
    AuthRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Stop(SessionEnd),
}

/// Close-code policy: 1000 ends the session on purpose, 1008 means the
/// credential was rejected (force re-login, never retry). Anything else,
/// including a missing close frame, is transient.
pub fn on_close(code: Option<u16>, delay: Duration) -> RetryDecision {
    match code {
        Some(CLOSE_NORMAL) => RetryDecision::Stop(SessionEnd::LoggedOut),
        Some(CLOSE_POLICY_VIOLATION) => RetryDecision::Stop(SessionEnd::AuthRejected),
        _ => RetryDecision::Retry(delay),
    }
}

/// The interest set re-announced on every (re)connect, so a fresh socket
/// lands in the same rooms the previous one was in.
#[derive(Default)]
pub struct Interest {
    pub conversations: BTreeSet<OrderId>,
    pub tracking: bool,
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub hub_url: Url,
    pub token: String,
    pub retry_delay: Duration,
}

/// One logical connection per session. Owns reconnects so callers never see
/// them; inbound frames go through the dispatch table, outbound frames come
/// in over a channel, and each successful open signals the replay agent.
pub struct HubConnection {
    config: ConnectionConfig,
    interest: Arc<Mutex<Interest>>,
    dispatcher: Dispatcher,
    resume_tx: mpsc::Sender<()>,
}

impl HubConnection {
    pub fn new(
        config: ConnectionConfig,
        interest: Arc<Mutex<Interest>>,
        dispatcher: Dispatcher,
        resume_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            config,
            interest,
            dispatcher,
            resume_tx,
        }
    }

    fn socket_url(&self) -> Url {
        let mut url = self.config.hub_url.clone();
        url.query_pairs_mut().append_pair("token", &self.config.token);
        url
    }

    /// Runs until logout or an authentication rejection.
    pub async fn run(
        &self,
        mut outbound: mpsc::Receiver<Frame>,
        mut logout: mpsc::Receiver<()>,
    ) -> SessionEnd {
        loop {
            let url = self.socket_url();
            let (mut ws, _) = match connect_async(url.as_str()).await {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "connect_error", error = %err);
                    tokio::time::sleep(self.config.retry_delay).await;
                    continue;
                }
            };
            info!(event = "connected");

            // Connectivity is back: wake the replay agent, then re-announce
            // interest so the new socket sees what the old one saw.
            let _ = self.resume_tx.try_send(());
            if !self.announce(&mut ws).await {
                let _ = ws.close(None).await;
                tokio::time::sleep(self.config.retry_delay).await;
                continue;
            }

            let mut close_code: Option<u16> = None;
            let decision = loop {
                tokio::select! {
                    inbound = ws.next() => {
                        match inbound {
                            Some(Ok(Message::Text(text))) => self.dispatcher.dispatch(&text),
                            Some(Ok(Message::Close(frame))) => {
                                close_code = frame.map(|f| u16::from(f.code));
                                break on_close(close_code, self.config.retry_delay);
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(event = "read_error", error = %err);
                                break on_close(None, self.config.retry_delay);
                            }
                            None => break on_close(None, self.config.retry_delay),
                        }
                    }
                    frame = outbound.recv() => {
                        match frame {
                            Some(frame) => {
                                let text = match frame.to_text() {
                                    Ok(value) => value,
                                    Err(err) => {
                                        warn!(event = "frame_encode_error", error = %err);
                                        continue;
                                    }
                                };
                                if ws.send(Message::Text(text)).await.is_err() {
                                    break on_close(None, self.config.retry_delay);
                                }
                            }
                            None => break RetryDecision::Stop(SessionEnd::LoggedOut),
                        }
                    }
                    _ = logout.recv() => {
                        let _ = ws
                            .close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "logout".into(),
                            }))
                            .await;
                        break RetryDecision::Stop(SessionEnd::LoggedOut);
                    }
                }
            };

            match decision {
                RetryDecision::Retry(delay) => {
                    warn!(event = "disconnected", close_code = close_code.unwrap_or(0));
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Stop(end) => {
                    info!(event = "session_end", kind = ?end);
                    return end;
                }
            }
        }
    }

    async fn announce<S>(&self, ws: &mut S) -> bool
    where
        S: futures_util::Sink<Message> + Unpin,
    {
        let interest = self.interest.lock().await;
        for order_id in &interest.conversations {
            let frame = match Frame::new(
                FrameKind::JoinConversation,
                &JoinConversationPayload { order_id: *order_id },
            ) {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            let text = match frame.to_text() {
                Ok(value) => value,
                Err(_) => continue,
            };
            if ws.send(Message::Text(text)).await.is_err() {
                return false;
            }
        }
        if interest.tracking {
            let frame = Frame {
                kind: FrameKind::AdminJoinTracking,
                payload: serde_json::json!({}),
            };
            if let Ok(text) = frame.to_text() {
                if ws.send(Message::Text(text)).await.is_err() {
                    return false;
                }
            }
        }
        true
    }
}
