use crate::state::{HubError, HubState, Session};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use relay_core::order::TransitionRequest;
use relay_core::{Message, MessageKind, Order, OrderId, Role, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid credential")
    }

    fn forbidden(message: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::UnknownOrder(id) => Self::new(
                StatusCode::NOT_FOUND,
                "unknown_order",
                format!("order {id} does not exist"),
            ),
            HubError::Transition(inner) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_transition",
                inner.to_string(),
            ),
            HubError::Forbidden => Self::forbidden("not a participant of this conversation"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "code": self.code,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn session(state: &HubState, headers: &HeaderMap) -> Result<Session, ApiError> {
    bearer(headers)
        .and_then(|token| state.authenticate(token))
        .ok_or_else(ApiError::unauthorized)
}

/// Assigned rider or any admin may write to an order.
async fn authorize_order_write(
    state: &HubState,
    session: &Session,
    order_id: OrderId,
) -> Result<Order, ApiError> {
    let order = state.order_snapshot(order_id).await?;
    match session.role {
        Role::Admin => Ok(order),
        Role::Rider if order.deliveryman_id == Some(session.user_id) => Ok(order),
        Role::Rider => Err(ApiError::forbidden("order is not assigned to you")),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderBody {
    #[serde(rename = "shopId")]
    pub shop_id: u64,
    #[serde(default, rename = "isUrgent")]
    pub is_urgent: bool,
}

pub async fn create_order(
    State(state): State<Arc<HubState>>,
    headers: HeaderMap,
    Json(body): Json<CreateOrderBody>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let session = session(&state, &headers)?;
    if session.role != Role::Admin {
        return Err(ApiError::forbidden("admin role required"));
    }
    let order = state.create_order(body.shop_id, body.is_urgent).await;
    Ok((StatusCode::CREATED, Json(order)))
}

#[derive(Debug, Deserialize)]
pub struct AssignBody {
    #[serde(rename = "deliverymanId")]
    pub deliveryman_id: UserId,
}

pub async fn assign_order(
    State(state): State<Arc<HubState>>,
    Path(order_id): Path<OrderId>,
    headers: HeaderMap,
    Json(body): Json<AssignBody>,
) -> Result<Json<Order>, ApiError> {
    let session = session(&state, &headers)?;
    if session.role != Role::Admin {
        return Err(ApiError::forbidden("admin role required"));
    }
    let order = state.assign_order(order_id, body.deliveryman_id).await?;
    Ok(Json(order))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub order: Order,
    /// False when the write was an idempotent replay of the current status.
    pub changed: bool,
}

pub async fn update_status(
    State(state): State<Arc<HubState>>,
    Path(order_id): Path<OrderId>,
    headers: HeaderMap,
    Json(body): Json<TransitionRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let session = session(&state, &headers)?;
    authorize_order_write(&state, &session, order_id).await?;
    let (order, event) = state.apply_status(order_id, &body, Utc::now()).await?;
    Ok(Json(StatusResponse {
        order,
        changed: event.is_some(),
    }))
}

pub async fn confirm_pickup(
    State(state): State<Arc<HubState>>,
    Path(order_id): Path<OrderId>,
    headers: HeaderMap,
) -> Result<Json<Order>, ApiError> {
    let session = session(&state, &headers)?;
    authorize_order_write(&state, &session, order_id).await?;
    let order = state.confirm_pickup(order_id, Utc::now()).await?;
    Ok(Json(order))
}

#[derive(Debug, Deserialize)]
pub struct NewMessageBody {
    pub body: String,
    #[serde(default, rename = "clientKey")]
    pub client_key: Option<String>,
}

pub async fn post_message(
    State(state): State<Arc<HubState>>,
    Path(order_id): Path<OrderId>,
    headers: HeaderMap,
    Json(body): Json<NewMessageBody>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let session = session(&state, &headers)?;
    authorize_order_write(&state, &session, order_id).await?;
    let (message, created) = state
        .post_message(
            order_id,
            session.user_id,
            body.body,
            MessageKind::User,
            body.client_key,
        )
        .await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        warn!(event = "message_deduped", order_id, message_id = message.id);
        StatusCode::OK
    };
    Ok((status, Json(message)))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub read_up_to: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub messages: Vec<Message>,
}

pub async fn read_history(
    State(state): State<Arc<HubState>>,
    Path(order_id): Path<OrderId>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, ApiError> {
    let session = session(&state, &headers)?;
    let messages = state
        .read_history(order_id, session.user_id, query.read_up_to)
        .await?;
    Ok(Json(HistoryResponse { messages }))
}
