//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, the Twilio media stream endpoint, and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        ErrorResponse, HealthResponse, MenuItemResponse, OrderStatusResponse,
        UpdateOrderStatusPayload,
    },
    state::AppState,
    ws::{
        bridge::{SessionSnapshot, SessionState, SessionStats},
        ws_handler,
    },
};

use axum::{
    Router,
    routing::{get, patch},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health_check,
        handlers::list_calls,
        handlers::get_order_status,
        handlers::update_order_status,
        handlers::search_menu,
    ),
    components(
        schemas(HealthResponse, SessionSnapshot, SessionState, SessionStats, OrderStatusResponse, UpdateOrderStatusPayload, MenuItemResponse, ErrorResponse)
    ),
    tags(
        (name = "Restaurant Voice Agent API", description = "Call monitoring and order lookups for the restaurant phone agent")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/", get(|| async { "Restaurant voice agent is running" }))
        .route("/health", get(handlers::health_check))
        .route("/calls", get(handlers::list_calls))
        .route("/orders/{id}", get(handlers::get_order_status))
        .route("/orders/{id}/status", patch(handlers::update_order_status))
        .route("/menu/search", get(handlers::search_menu))
        // Twilio's <Stream> verb connects here.
        .route("/twilio", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_every_route() {
        let doc = ApiDoc::openapi();
        for path in [
            "/health",
            "/calls",
            "/orders/{id}",
            "/orders/{id}/status",
            "/menu/search",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
