use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // 认证
        .route("/register", post(handlers::register))
        .route("/login", post(handlers::login))

        // 摄像头管理
        .route("/available_cameras", get(handlers::available_cameras))
        .route("/toggle_camera/:camera_id", post(handlers::toggle_camera))
        .route("/cameras", get(handlers::list_cameras))
        .route("/cameras/:camera_id/health", get(handlers::camera_health))

        // 视频流
        .route("/video_feed/:camera_id", get(handlers::video_feed))

        // 健康检查
        .route("/health", get(handlers::health_check))

        .with_state(state)

        // CORS中间件
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
