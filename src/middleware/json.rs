//! JSON 请求体提取器
//!
//! 与 `axum::Json` 相同，但解析失败返回统一的 400 错误体，而不是 axum 默认的 422 纯文本

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
    Json,
};

use crate::error::ApiError;

/// 请求体放在 handler 参数末位
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Target {
        #[allow(dead_code)]
        port: u16,
    }

    fn request(body: &'static str) -> Request {
        Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn reject(body: &'static str) -> serde_json::Value {
        match ApiJson::<Target>::from_request(request(body), &()).await {
            Err(ApiError::BadRequest {
                details: Some(details),
                ..
            }) => details,
            other => panic!("expected 400, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_valid_body() {
        let ApiJson(target) = ApiJson::<Target>::from_request(request(r#"{"port": 22}"#), &())
            .await
            .unwrap();
        assert_eq!(target.port, 22);
    }

    #[tokio::test]
    async fn test_schema_errors_are_bad_request() {
        let details = reject(r#"{}"#).await;
        assert!(details.to_string().contains("missing field `port`"));

        let details = reject(r#"{"port": 22, "prot": 1}"#).await;
        assert!(details.to_string().contains("unknown field `prot`"));
    }

    #[tokio::test]
    async fn test_string_values_are_not_echoed() {
        let details = reject(r#"{"port": "hunter2"}"#).await;
        assert!(!details.to_string().contains("hunter2"));
    }
}
