// 摄像头视频流服务 - 认证模块
//
// 用户名/密码存储、HS256 令牌签发与校验，以及从请求中提取令牌的 axum 提取器。

pub mod extract;
pub mod jwt;
pub mod store;

use thiserror::Error;

pub use extract::{AuthUser, RequestToken};
pub use jwt::{Claims, JwtAuth};
pub use store::CredentialStore;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Username already exists")]
    UserExists,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Missing token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token signing failed: {0}")]
    Signing(String),

    #[error("Credential store error: {0}")]
    Store(String),
}

/// 令牌校验接缝
///
/// 校验通过返回令牌主体（用户名）。
pub trait TokenVerifier: Send + Sync {
    fn verify_token(&self, token: &str) -> Result<String, AuthError>;
}
