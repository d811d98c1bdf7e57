use clap::Parser;
use relay_core::order::TransitionRequest;
use relay_core::protocol::{
    AuthSuccessPayload, ConversationListUpdatePayload, Frame, FrameKind, InitFleetPayload,
    JoinConversationPayload, NewMessagePayload, OrderPayload, RiderMovedPayload,
    UnreadCountUpdatePayload,
};
use relay_core::{OrderId, OrderStatus};
use relay_storage::ActionQueue;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

mod cache;
mod connection;
mod dispatch;
mod outbox;
mod replay;
mod view;

use connection::{ConnectionConfig, HubConnection, Interest, SessionEnd, RETRY_DELAY};
use dispatch::Dispatcher;
use outbox::{Outbox, WriteOutcome};
use replay::{HttpTransport, ReplayAgent, ReplayNotice};
use view::ClientView;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "relay-rider")]
struct Args {
    #[arg(long, default_value = "ws://127.0.0.1:8787/ws")]
    hub_url: String,
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    api_url: String,
    #[arg(long, env = "RELAY_TOKEN")]
    token: String,
    #[arg(long, default_value = "relay-queue.db")]
    queue: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let hub_url: Url = match args.hub_url.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_hub_url", error = %err, url = %args.hub_url);
            return;
        }
    };

    let queue = match ActionQueue::open(&args.queue) {
        Ok(value) => Arc::new(Mutex::new(value)),
        Err(err) => {
            error!(event = "queue_open_error", error = %err, path = %args.queue);
            return;
        }
    };

    let transport = match HttpTransport::new(HTTP_TIMEOUT) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "http_client_error", error = %err);
            return;
        }
    };

    let (notice_tx, mut notice_rx) = mpsc::channel::<ReplayNotice>(32);
    let agent = Arc::new(ReplayAgent::new(queue.clone(), transport.clone(), notice_tx));

    // Permanently failed actions must stay user-visible; a dropped write
    // needs manual re-entry.
    tokio::spawn(async move {
        while let Some(notice) = notice_rx.recv().await {
            match notice {
                ReplayNotice::Dropped { action, status } => {
                    error!(
                        event = "action_dropped",
                        url = %action.url,
                        method = action.method.as_str(),
                        status,
                        "queued action was rejected by the server; re-enter it manually"
                    );
                }
            }
        }
    });

    let (resume_tx, mut resume_rx) = mpsc::channel::<()>(4);
    let drain_agent = agent.clone();
    tokio::spawn(async move {
        while resume_rx.recv().await.is_some() {
            match drain_agent.drain().await {
                Ok(summary) => info!(
                    event = "replay_pass",
                    applied = summary.applied,
                    dropped = summary.dropped,
                    deferred = summary.deferred
                ),
                Err(err) => warn!(event = "replay_error", error = %err),
            }
        }
    });

    let view = Arc::new(StdMutex::new(ClientView::new()));
    let dispatcher = build_dispatcher(view.clone());

    let interest = Arc::new(Mutex::new(Interest::default()));
    let config = ConnectionConfig {
        hub_url,
        token: args.token.clone(),
        retry_delay: RETRY_DELAY,
    };
    let connection = HubConnection::new(config, interest.clone(), dispatcher, resume_tx);

    let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(64);
    let (logout_tx, logout_rx) = mpsc::channel::<()>(1);

    let outbox = Outbox::new(transport, queue);
    tokio::spawn(command_loop(
        outbox,
        args.api_url.clone(),
        args.token.clone(),
        view,
        interest,
        outbound_tx,
        logout_tx,
    ));

    match connection.run(outbound_rx, logout_rx).await {
        SessionEnd::LoggedOut => info!(event = "logged_out"),
        SessionEnd::AuthRejected => {
            error!(event = "auth_rejected", "credential rejected by the hub; log in again")
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Every inbound frame type funnels through this one table; handlers only
/// mutate the local view, rendering happens elsewhere.
fn build_dispatcher(view: Arc<StdMutex<ClientView>>) -> Dispatcher {
    let on_auth = view.clone();
    let on_message = view.clone();
    let on_unread = view.clone();
    let on_order = view.clone();
    let on_assigned = view.clone();
    let on_list = view.clone();
    let on_fleet = view.clone();
    let on_moved = view;

    Dispatcher::new()
        .on(FrameKind::AuthSuccess, move |payload| {
            if let Ok(parsed) = serde_json::from_value::<AuthSuccessPayload>(payload) {
                info!(event = "authenticated", user_id = parsed.user_id);
                on_auth.lock().unwrap().user_id = Some(parsed.user_id);
            }
        })
        .on(FrameKind::NewMessage, move |payload| {
            if let Ok(parsed) = serde_json::from_value::<NewMessagePayload>(payload) {
                on_message.lock().unwrap().confirm_message(parsed.message);
            }
        })
        .on(FrameKind::UnreadCountUpdate, move |payload| {
            if let Ok(parsed) = serde_json::from_value::<UnreadCountUpdatePayload>(payload) {
                on_unread
                    .lock()
                    .unwrap()
                    .set_unread(parsed.order_id, parsed.unread);
            }
        })
        .on(FrameKind::OrderStatusUpdate, move |payload| {
            if let Ok(parsed) = serde_json::from_value::<OrderPayload>(payload) {
                on_order.lock().unwrap().apply_order(parsed.order);
            }
        })
        .on(FrameKind::NewOrderAssigned, move |payload| {
            if let Ok(parsed) = serde_json::from_value::<OrderPayload>(payload) {
                info!(event = "order_assigned", order_id = parsed.order.id);
                on_assigned.lock().unwrap().apply_order(parsed.order);
            }
        })
        .on(FrameKind::ConversationListUpdate, move |payload| {
            if let Ok(parsed) = serde_json::from_value::<ConversationListUpdatePayload>(payload) {
                on_list.lock().unwrap().mark_list_dirty(parsed.order_id);
            }
        })
        .on(FrameKind::InitFleet, move |payload| {
            if let Ok(parsed) = serde_json::from_value::<InitFleetPayload>(payload) {
                on_fleet.lock().unwrap().init_fleet(parsed.riders);
            }
        })
        .on(FrameKind::RiderMoved, move |payload| {
            if let Ok(parsed) = serde_json::from_value::<RiderMovedPayload>(payload) {
                on_moved.lock().unwrap().apply_position(parsed.position);
            }
        })
        .on(FrameKind::Error, |payload| {
            warn!(event = "hub_error", payload = %payload);
        })
}

/// Line-based command interface: `join <order>`, `leave <order>`, `track`,
/// `msg <order> <text>`, `status <order> <status> [follow_up_at] [amount]`,
/// `pickup <order>`, `logout`.
async fn command_loop(
    outbox: Outbox<HttpTransport>,
    api_url: String,
    token: String,
    view: Arc<StdMutex<ClientView>>,
    interest: Arc<Mutex<Interest>>,
    outbound: mpsc::Sender<Frame>,
    logout: mpsc::Sender<()>,
) {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["join", order] => {
                let Some(order_id) = parse_order_id(order) else { continue };
                interest.lock().await.conversations.insert(order_id);
                send_join(&outbound, FrameKind::JoinConversation, order_id).await;
            }
            ["leave", order] => {
                let Some(order_id) = parse_order_id(order) else { continue };
                interest.lock().await.conversations.remove(&order_id);
                send_join(&outbound, FrameKind::LeaveConversation, order_id).await;
            }
            ["track"] => {
                interest.lock().await.tracking = true;
                let frame = Frame {
                    kind: FrameKind::AdminJoinTracking,
                    payload: serde_json::json!({}),
                };
                let _ = outbound.send(frame).await;
            }
            ["msg", order, text @ ..] if !text.is_empty() => {
                let Some(order_id) = parse_order_id(order) else { continue };
                let body = text.join(" ");
                let action = outbox::message_action(&api_url, order_id, &body, &token);
                if let Some(key) = action.payload["clientKey"].as_str() {
                    view.lock()
                        .unwrap()
                        .record_speculative(order_id, key.to_string(), body.clone());
                }
                report(outbox.submit(action).await);
            }
            ["status", order, status, rest @ ..] => {
                let Some(order_id) = parse_order_id(order) else { continue };
                let Ok(status) = status.parse::<OrderStatus>() else {
                    warn!(event = "bad_command", line = %line, "unknown status");
                    continue;
                };
                let Some(user_id) = view.lock().unwrap().user_id else {
                    warn!(event = "not_authenticated_yet");
                    continue;
                };
                let mut req = TransitionRequest::new(status, user_id);
                if let Some(follow_up) = rest.first() {
                    match follow_up.parse() {
                        Ok(at) => req.follow_up_at = Some(at),
                        Err(_) => req.amount_received = follow_up.parse().ok(),
                    }
                }
                if let Some(amount) = rest.get(1) {
                    req.amount_received = amount.parse().ok();
                }
                let action = outbox::status_update_action(&api_url, order_id, &req, &token);
                report(outbox.submit(action).await);
            }
            ["pickup", order] => {
                let Some(order_id) = parse_order_id(order) else { continue };
                let action = outbox::pickup_action(&api_url, order_id, &token);
                report(outbox.submit(action).await);
            }
            ["logout"] => {
                let _ = logout.send(()).await;
                return;
            }
            [] => {}
            _ => warn!(event = "bad_command", line = %line),
        }
    }
}

fn parse_order_id(raw: &str) -> Option<OrderId> {
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(event = "bad_command", order = raw, "order id must be a number");
            None
        }
    }
}

async fn send_join(outbound: &mpsc::Sender<Frame>, kind: FrameKind, order_id: OrderId) {
    if let Ok(frame) = Frame::new(kind, &JoinConversationPayload { order_id }) {
        let _ = outbound.send(frame).await;
    }
}

fn report(outcome: Result<WriteOutcome, relay_storage::QueueError>) {
    match outcome {
        Ok(WriteOutcome::Applied(status)) => info!(event = "write_applied", status),
        Ok(WriteOutcome::Queued(id)) => info!(event = "write_pending", action_id = id),
        Ok(WriteOutcome::Rejected(status)) => {
            warn!(event = "write_rejected", status, "the server refused this request")
        }
        Err(err) => error!(event = "queue_error", error = %err),
    }
}
