use crate::auth::{CredentialStore, JwtAuth};
use crate::camera::CameraPool;
use crate::streaming::{FrameSourceManager, StreamMultiplexer};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub pool: CameraPool,
    pub sources: FrameSourceManager,
    pub multiplexer: StreamMultiplexer,
    pub auth: Arc<JwtAuth>,
    pub users: Arc<CredentialStore>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        sources: FrameSourceManager,
        multiplexer: StreamMultiplexer,
        auth: Arc<JwtAuth>,
        users: Arc<CredentialStore>,
    ) -> Self {
        Self {
            pool: sources.pool().clone(),
            sources,
            multiplexer,
            auth,
            users,
            started_at: Utc::now(),
        }
    }
}
