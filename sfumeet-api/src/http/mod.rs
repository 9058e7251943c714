// Module: http
// HTTP surface: signaling WebSocket, health and statistics

pub mod error;
pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use sfumeet_core::config::{ServerConfig, SignalingConfig};
use sfumeet_sfu::RoomDirectory;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::AppError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<RoomDirectory>,
    pub signaling: SignalingConfig,
}

/// Create the HTTP router with all routes
pub fn create_router(
    directory: Arc<RoomDirectory>,
    server: &ServerConfig,
    signaling: SignalingConfig,
) -> Router {
    let state = AppState {
        directory,
        signaling,
    };

    let router = Router::new()
        .route(&server.ws_path, get(websocket::websocket_handler))
        .merge(health::create_health_router());

    // Apply layers before state
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Apply state to all routes (must be last)
    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use sfumeet_sfu::{LocalEngine, SfuConfig};
    use tower::ServiceExt;

    fn app() -> (Arc<LocalEngine>, Arc<RoomDirectory>, Router) {
        let engine = Arc::new(LocalEngine::default());
        let directory = RoomDirectory::new(engine.clone(), SfuConfig::default());
        let router = create_router(
            Arc::clone(&directory),
            &ServerConfig::default(),
            SignalingConfig::default(),
        );
        (engine, directory, router)
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_follows_engine() {
        let (engine, _directory, router) = app();
        let (status, body) = get(router.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["engine_alive"], true);

        engine.kill();
        let (status, body) = get(router, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unavailable");
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let (_engine, directory, router) = app();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel::<sfumeet_proto::ServerEnvelope>();
        directory
            .join("R1".into(), "p1".into(), Arc::new(tx))
            .await
            .unwrap();

        let (status, body) = get(router, "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rooms"], 1);
        assert_eq!(body["peers"], 1);
        assert_eq!(body["room_stats"][0]["room_id"], "R1");
    }

    #[tokio::test]
    async fn test_websocket_route_requires_upgrade() {
        let (_engine, _directory, router) = app();
        let response = router
            .oneshot(Request::get("/ws?roomId=R1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
