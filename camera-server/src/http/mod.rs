// 摄像头视频流服务 - HTTP接口

pub(crate) mod error;
mod handlers;
mod response;
mod routes;
mod server;
pub(crate) mod state;

pub use error::{ApiError, ApiResult};
pub use handlers::{
    AvailableCameras, CameraView, DetectionHealth, HealthCheckResponse, LoginResponse,
    MessageResponse, ServiceHealth, ToggleResponse,
};
pub use response::ApiResponse;
pub use routes::create_router;
pub use server::HttpServer;
pub use state::AppState;
