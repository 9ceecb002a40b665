// 请求令牌提取
//
// 令牌可以放在 `Authorization: Bearer` 头，也可以放在 `?token=` 查询参数
// （<img> 标签无法设置请求头）。

use super::TokenVerifier;
use crate::http::error::ApiError;
use crate::http::state::AppState;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;
use std::convert::Infallible;

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// 从请求中取出令牌（不校验）
pub fn token_from_parts(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    from_header.or_else(|| {
        Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|q| q.0.token)
            .filter(|t| !t.is_empty())
    })
}

/// 原始令牌，由调用方决定何时校验
#[derive(Debug, Clone)]
pub struct RequestToken(pub Option<String>);

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequestToken
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(RequestToken(token_from_parts(parts)))
    }
}

/// 已认证用户
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts).ok_or_else(|| ApiError::unauthorized("Missing token"))?;

        let username = state
            .auth
            .verify_token(&token)
            .map_err(|e| ApiError::unauthorized(e.to_string()))?;

        Ok(AuthUser { username })
    }
}
