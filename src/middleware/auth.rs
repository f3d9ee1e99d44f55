//! API Key 认证
//!
//! `RequireApiKey` extractor：校验 `x-api-key` header

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::HeaderMap, request::Parts},
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// 放在 handler 参数首位即可要求认证
#[derive(Debug, Clone)]
pub struct RequireApiKey;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        verify_api_key(&parts.headers, &state.api_key)
    }
}

/// 校验 header 中的 key，逐字节比较耗时与内容无关
pub fn verify_api_key(headers: &HeaderMap, expected_key: &str) -> Result<RequireApiKey, ApiError> {
    let Some(provided) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) else {
        tracing::warn!("Missing {} header", API_KEY_HEADER);
        return Err(ApiError::unauthorized());
    };

    if keys_match(provided.as_bytes(), expected_key.as_bytes()) {
        Ok(RequireApiKey)
    } else {
        tracing::warn!("Invalid API key provided");
        Err(ApiError::unauthorized())
    }
}

fn keys_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_verify_api_key() {
        let mut headers = HeaderMap::new();
        assert!(verify_api_key(&headers, "test-key").is_err());

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("wrong-key"));
        assert!(verify_api_key(&headers, "test-key").is_err());

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("test-key"));
        assert!(verify_api_key(&headers, "test-key").is_ok());
    }

    #[test]
    fn test_prefix_is_not_a_match() {
        assert!(!keys_match(b"test", b"test-key"));
        assert!(keys_match(b"", b""));
    }
}
