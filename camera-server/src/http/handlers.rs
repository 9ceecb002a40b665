// 摄像头视频流服务 - HTTP处理器

use super::error::{ApiError, ApiResult};
use super::response::ApiResponse;
use super::state::AppState;
use crate::auth::{AuthUser, RequestToken};
use crate::streaming::{multipart_chunk, multipart_content_type, SseFrameData, StreamFormat};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use common::{CameraId, CameraStatus};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use tracing::{info, warn};

/// 注册/登录请求
#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl CredentialsRequest {
    fn into_parts(self) -> ApiResult<(String, String)> {
        match (self.username, self.password) {
            (Some(u), Some(p)) if !u.trim().is_empty() && !p.is_empty() => Ok((u, p)),
            _ => Err(ApiError::bad_request("Missing username or password")),
        }
    }
}

fn parse_credentials(
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> ApiResult<(String, String)> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    request.into_parts()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

/// 摄像头视图：池状态加上帧源和客户端信息
#[derive(Debug, Serialize, Deserialize)]
pub struct CameraView {
    #[serde(flatten)]
    pub status: CameraStatus,
    pub streaming: bool,
    pub last_sequence: u64,
    pub clients: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AvailableCameras {
    pub available_cameras: Vec<CameraId>,
    pub current_camera: CameraId,
    pub cameras: Vec<CameraView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToggleResponse {
    pub camera_id: CameraId,
    pub enabled: bool,
    pub streaming: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub camera_id: CameraId,
    pub healthy: bool,
}

/// 检测阶段状态
#[derive(Debug, Serialize, Deserialize)]
pub struct DetectionHealth {
    pub enabled: bool,
    pub detector: Option<String>,
    /// 累计失败次数（错误、panic、超时）
    pub failures: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: String,
    pub backend: String,
    pub cameras: usize,
    pub streaming_cameras: usize,
    pub active_streams: usize,
    pub detection: DetectionHealth,
    pub uptime_secs: i64,
}

#[derive(Debug, Deserialize)]
pub struct VideoFeedQuery {
    #[serde(default)]
    pub format: StreamFormat,
}

async fn camera_views(state: &AppState) -> Vec<CameraView> {
    state
        .pool
        .statuses()
        .await
        .into_iter()
        .map(|status| {
            let info = state.sources.info(status.camera_id);
            CameraView {
                streaming: info.is_some(),
                last_sequence: info.map(|i| i.last_sequence).unwrap_or(0),
                clients: state.multiplexer.streams_for(status.camera_id),
                status,
            }
        })
        .collect()
}

/// 服务健康检查
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<ServiceHealth>> {
    let detection = state.sources.detection();

    Json(ApiResponse::success(ServiceHealth {
        status: "ok".to_string(),
        backend: state.pool.backend_name().to_string(),
        cameras: state.pool.camera_ids().len(),
        streaming_cameras: state.sources.running_ids().len(),
        active_streams: state.multiplexer.active_count(),
        detection: DetectionHealth {
            enabled: detection.is_enabled(),
            detector: detection.detector_name().map(str::to_string),
            failures: detection.failure_count(),
        },
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    }))
}

/// 用户注册
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApiResponse<MessageResponse>>)> {
    let (username, password) = parse_credentials(payload)?;
    state.users.register(&username, &password).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(MessageResponse {
            message: "User registered successfully".to_string(),
        })),
    ))
}

/// 用户登录
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<LoginResponse>>> {
    let (username, password) = parse_credentials(payload)?;
    state.users.verify(&username, &password)?;

    let access_token = state.auth.issue_token(username.trim())?;
    info!("User logged in: {}", username.trim());

    Ok(Json(ApiResponse::success(LoginResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in: state.auth.ttl().as_secs(),
    })))
}

/// 可用摄像头
///
/// 重新探测尚未入池的ID，并为新发现的摄像头启动帧源。
pub async fn available_cameras(
    _user: AuthUser,
    State(state): State<AppState>,
) -> Json<ApiResponse<AvailableCameras>> {
    let available: Vec<CameraId> = state.pool.discover().await.into_iter().collect();

    let started = state.sources.start_enabled().await;
    if !started.is_empty() {
        info!("Started frame sources for cameras {:?}", started);
    }

    Json(ApiResponse::success(AvailableCameras {
        current_camera: available.first().copied().unwrap_or(0),
        cameras: camera_views(&state).await,
        available_cameras: available,
    }))
}

/// 摄像头列表
pub async fn list_cameras(
    _user: AuthUser,
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<CameraView>>> {
    Json(ApiResponse::success(camera_views(&state).await))
}

/// 单个摄像头健康检查
pub async fn camera_health(
    _user: AuthUser,
    Path(camera_id): Path<CameraId>,
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<HealthCheckResponse>>> {
    let healthy = state.pool.health_check(camera_id).await?;
    Ok(Json(ApiResponse::success(HealthCheckResponse {
        camera_id,
        healthy,
    })))
}

/// 切换摄像头启用状态
pub async fn toggle_camera(
    user: AuthUser,
    Path(camera_id): Path<CameraId>,
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<ToggleResponse>>> {
    let enabled = state.pool.toggle(camera_id).await?;
    let streaming = state.sources.reconcile(camera_id).await;

    info!(
        "Camera {} toggled {} by {}",
        camera_id,
        if enabled { "on" } else { "off" },
        user.username
    );

    Ok(Json(ApiResponse::success(ToggleResponse {
        camera_id,
        enabled,
        streaming,
    })))
}

/// 视频流
///
/// `?format=mjpeg`（默认）返回 multipart JPEG 流，`?format=sse` 返回 SSE 事件流。
pub async fn video_feed(
    Path(camera_id): Path<CameraId>,
    Query(query): Query<VideoFeedQuery>,
    RequestToken(token): RequestToken,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let frames = state
        .multiplexer
        .open_stream(camera_id, token.as_deref(), query.format)
        .await?;
    let quality = state.multiplexer.config().jpeg_quality;

    match query.format {
        StreamFormat::Mjpeg => {
            let chunks = frames.filter_map(move |frame| async move {
                match frame.encode(quality).await {
                    Ok(jpeg) => Some(Ok::<_, Infallible>(multipart_chunk(&jpeg))),
                    Err(e) => {
                        warn!("Camera {} frame {} skipped: {}", frame.camera_id, frame.sequence, e);
                        None
                    }
                }
            });

            Response::builder()
                .header(header::CONTENT_TYPE, multipart_content_type())
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(chunks))
                .map_err(|e| ApiError::internal(e.to_string()))
        }
        StreamFormat::Sse => {
            let events = frames.filter_map(move |frame| async move {
                let data = match frame.encode(quality).await {
                    Ok(jpeg) => SseFrameData::new(&frame, &jpeg),
                    Err(e) => {
                        warn!("Camera {} frame {} skipped: {}", frame.camera_id, frame.sequence, e);
                        return None;
                    }
                };
                let json = serde_json::to_string(&data).ok()?;
                Some(Ok::<_, Infallible>(
                    Event::default()
                        .event("frame")
                        .id(frame.sequence.to_string())
                        .data(json),
                ))
            });

            Ok(Sse::new(events)
                .keep_alive(
                    KeepAlive::new()
                        .interval(Duration::from_secs(15))
                        .text("keep-alive"),
                )
                .into_response())
        }
    }
}
