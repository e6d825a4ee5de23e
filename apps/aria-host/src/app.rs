//! Router wiring: WebSocket upgrades and the HTTP bridge-session endpoints
//! share one port.

use std::sync::Arc;

use axum::{
    response::Json,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::http_bridge;
use crate::registry::Broker;
use crate::websocket::websocket_handler;

pub fn build_router(broker: Arc<Broker>, metrics: Option<PrometheusHandle>) -> Router {
    // Bridges dial the discovery url directly, so the upgrade lives at the
    // root as well as /ws.
    let ws_routes = Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
        .with_state(broker.clone());

    let bridge_routes = Router::new()
        .route("/bridge/connect", post(http_bridge::connect))
        .route("/bridge/hello", post(http_bridge::hello))
        .route("/bridge/events", post(http_bridge::events))
        .route("/bridge/control/result", post(http_bridge::control_result))
        .route("/bridge/control/poll", post(http_bridge::control_poll))
        .route("/bridge/heartbeat", post(http_bridge::heartbeat))
        .route("/bridge/disconnect", post(http_bridge::disconnect))
        .with_state(broker);

    let mut app = Router::new()
        .merge(ws_routes)
        .merge(bridge_routes)
        .route("/health", get(health_check));

    if let Some(handle) = metrics {
        app = app.route("/metrics", get(move || async move { handle.render() }));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}
