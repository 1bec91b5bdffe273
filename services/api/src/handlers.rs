//! Axum Handlers for the REST API
//!
//! Operational endpoints that sit next to the Twilio media stream: health,
//! live call inspection, and the order and menu lookups kitchen staff use.
//! It uses `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use restaurant_core::store::OrderStatus;
use std::sync::Arc;
use tracing::{error, info};

use crate::{
    models::{
        ErrorResponse, HealthResponse, MenuItemResponse, MenuSearchQuery, OrderStatusResponse,
        UpdateOrderStatusPayload,
    },
    state::AppState,
    ws::bridge::SessionSnapshot,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Report service health and the number of calls in progress.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_calls: state.sessions.len().await,
        agent_key_configured: !state.config.deepgram_api_key.is_empty(),
        store: state.config.store.as_str().to_string(),
    })
}

/// List the calls currently bridged to the voice agent.
#[utoipa::path(
    get,
    path = "/calls",
    responses(
        (status = 200, description = "Live call sessions", body = [SessionSnapshot])
    )
)]
pub async fn list_calls(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSnapshot>> {
    Json(state.sessions.snapshots().await)
}

/// Get the kitchen status of an order.
#[utoipa::path(
    get,
    path = "/orders/{id}",
    responses(
        (status = 200, description = "Order status", body = OrderStatusResponse),
        (status = 404, description = "Order not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = i64, Path, description = "Order ID")
    )
)]
pub async fn get_order_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<OrderStatusResponse>, ApiError> {
    let status = state
        .store
        .get_order_status(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {} not found", id)))?;

    Ok(Json(OrderStatusResponse {
        order_id: id,
        status: status.to_string(),
    }))
}

/// Move an order to a new kitchen status.
#[utoipa::path(
    patch,
    path = "/orders/{id}/status",
    request_body = UpdateOrderStatusPayload,
    responses(
        (status = 200, description = "Order status updated successfully", body = OrderStatusResponse),
        (status = 400, description = "Unknown status", body = ErrorResponse),
        (status = 404, description = "Order not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = i64, Path, description = "Order ID")
    )
)]
pub async fn update_order_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateOrderStatusPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let status: OrderStatus = payload
        .status
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("'{}' is not an order status", payload.status)))?;

    if !state.store.update_order_status(id, status).await? {
        return Err(ApiError::NotFound(format!("Order {} not found", id)));
    }
    info!(order_id = id, %status, "Order status changed");

    Ok((
        StatusCode::OK,
        Json(OrderStatusResponse {
            order_id: id,
            status: status.to_string(),
        }),
    ))
}

/// Search the menu by dish name.
#[utoipa::path(
    get,
    path = "/menu/search",
    responses(
        (status = 200, description = "Matching menu items, best match first", body = [MenuItemResponse]),
        (status = 400, description = "Empty query", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(MenuSearchQuery)
)]
pub async fn search_menu(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MenuSearchQuery>,
) -> Result<Json<Vec<MenuItemResponse>>, ApiError> {
    if query.q.trim().is_empty() {
        return Err(ApiError::BadRequest("q must not be empty".to_string()));
    }
    let items = state.store.find_menu_items(&query.q).await?;
    Ok(Json(items.into_iter().map(MenuItemResponse::from).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StoreKind};
    use restaurant_core::{
        BackendStore, InMemoryStore,
        store::{NewOrder, NewOrderLine},
    };
    use serde_json::json;
    use std::time::Duration;
    use tracing::Level;

    fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            deepgram_api_key: "test-key".to_string(),
            agent_url: "ws://127.0.0.1:1/agent".to_string(),
            agent_settings_path: "./agent_settings.json".into(),
            validate_agent_key: false,
            store: StoreKind::Memory,
            database_url: None,
            menu_seed_path: None,
            control_timeout: Duration::from_secs(120),
            audio_read_timeout: Duration::from_secs(2),
            max_audio_skips: 5,
            shutdown_grace: Duration::from_millis(200),
            agent_keepalive: None,
            audio_chunk_bytes: 3200,
            caller_vad_threshold: 900,
            log_level: Level::INFO,
        }
    }

    fn test_state() -> (Arc<AppState>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::demo());
        let state = AppState::new(store.clone(), json!({}), test_config());
        (Arc::new(state), store)
    }

    async fn place_order(store: &InMemoryStore) -> i64 {
        let item = store.menu()[0].clone();
        store
            .create_order(&NewOrder {
                customer_name: Some("Ada".to_string()),
                notes: None,
                lines: vec![NewOrderLine {
                    item_id: item.id,
                    quantity: 1,
                    unit_price_cents: item.price_cents,
                }],
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check_reports_store_and_calls() {
        let (state, _) = test_state();
        let Json(health) = health_check(State(state)).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.active_calls, 0);
        assert!(health.agent_key_configured);
        assert_eq!(health.store, "memory");
    }

    #[tokio::test]
    async fn test_list_calls_empty() {
        let (state, _) = test_state();
        let Json(calls) = list_calls(State(state)).await;
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_get_order_status_found_and_missing() {
        let (state, store) = test_state();
        let order_id = place_order(&store).await;

        let Json(response) = get_order_status(State(state.clone()), Path(order_id))
            .await
            .ok()
            .unwrap();
        assert_eq!(response.order_id, order_id);
        assert_eq!(response.status, "pending");

        let missing = get_order_status(State(state), Path(9999)).await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_order_status_changes_status() {
        let (state, store) = test_state();
        let order_id = place_order(&store).await;

        let response = update_order_status(
            State(state.clone()),
            Path(order_id),
            Json(UpdateOrderStatusPayload {
                status: "Ready".to_string(),
            }),
        )
        .await
        .ok()
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            store.get_order_status(order_id).await.unwrap(),
            Some(OrderStatus::Ready)
        );
    }

    #[tokio::test]
    async fn test_update_order_status_rejects_bad_input() {
        let (state, store) = test_state();
        let order_id = place_order(&store).await;

        let unknown_status = update_order_status(
            State(state.clone()),
            Path(order_id),
            Json(UpdateOrderStatusPayload {
                status: "eaten".to_string(),
            }),
        )
        .await;
        assert!(matches!(unknown_status, Err(ApiError::BadRequest(_))));

        let unknown_order = update_order_status(
            State(state),
            Path(order_id + 100),
            Json(UpdateOrderStatusPayload {
                status: "ready".to_string(),
            }),
        )
        .await;
        assert!(matches!(unknown_order, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_search_menu() {
        let (state, _) = test_state();
        let Json(items) = search_menu(
            State(state.clone()),
            Query(MenuSearchQuery {
                q: "pizza".to_string(),
            }),
        )
        .await
        .ok()
        .unwrap();
        assert!(items.len() >= 2);
        assert_eq!(items[0].name, "Margherita Pizza");
        assert_eq!(items[1].name, "Pepperoni Pizza");

        let empty = search_menu(
            State(state),
            Query(MenuSearchQuery {
                q: "  ".to_string(),
            }),
        )
        .await;
        assert!(matches!(empty, Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(
            ApiError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        let internal: ApiError = anyhow::anyhow!("boom").into();
        assert_eq!(
            internal.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
