//! 统一错误处理
//!
//! - `DeployError`：部署流水线与各服务的错误分类（校验 / 凭据 / 连接 / 阶段 / 解密）
//! - `ApiError`：HTTP 层错误，实现 `IntoResponse`

use std::sync::LazyLock;
use std::time::Duration;

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::domain::deploy::DeployStage;

/// 错误类别（可序列化，随 `DeploymentResult` 返回给调用方）
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Credential,
    Connection,
    Stage,
    Decryption,
    Timeout,
    Cancelled,
    Conflict,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Credential => "credential",
            ErrorKind::Connection => "connection",
            ErrorKind::Stage => "stage",
            ErrorKind::Decryption => "decryption",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Conflict => "conflict",
        }
    }
}

/// 部署核心错误
#[derive(Debug, Error)]
pub enum DeployError {
    /// 输入不完整或格式错误，不重试
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// 凭据缺失或形态不合法
    #[error("Credential error: {0}")]
    Credential(String),

    /// SSH / Git 网络、认证或连接超时
    #[error("Connection error: {0}")]
    Connection(String),

    /// 流水线阶段内部的非凭据失败
    #[error("{stage} failed: {message}")]
    Stage { stage: DeployStage, message: String },

    /// 密文损坏或被篡改
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// 整体运行超时
    #[error("Deployment timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// 调用方取消
    #[error("Deployment cancelled")]
    Cancelled,

    /// 同一 deploymentId 已在执行
    #[error("Deployment '{0}' is already running")]
    AlreadyRunning(String),
}

impl DeployError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }

    pub fn stage(stage: DeployStage, message: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::Validation(_) => ErrorKind::Validation,
            DeployError::Credential(_) => ErrorKind::Credential,
            DeployError::Connection(_) => ErrorKind::Connection,
            DeployError::Stage { .. } => ErrorKind::Stage,
            DeployError::Decryption(_) => ErrorKind::Decryption,
            DeployError::Timeout(_) => ErrorKind::Timeout,
            DeployError::Cancelled => ErrorKind::Cancelled,
            DeployError::AlreadyRunning(_) => ErrorKind::Conflict,
        }
    }
}

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效，可附带逐项说明
    BadRequest {
        message: String,
        details: Option<serde_json::Value>,
    },
    /// 409 - 冲突（同一部署已在进行）
    Conflict(String),
    /// 500 - 内部错误（仅记录日志，不返回给客户端）
    Internal(String),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
            details: None,
        }
    }

    /// 带详细信息的 400（如逐项校验错误）
    pub fn bad_request_with(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::BadRequest {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::Validation(errors) => {
                ApiError::bad_request_with("Validation failed", serde_json::json!(errors))
            }
            DeployError::Credential(msg) | DeployError::Decryption(msg) => {
                ApiError::bad_request(msg)
            }
            DeployError::AlreadyRunning(id) => {
                ApiError::conflict(format!("Deployment '{}' is already running", id))
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

// serde 的类型错误会带出原始字符串值，回显前抹掉
static QUOTED_VALUE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""(?:[^"\\]|\\.)*""#).unwrap());

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let reason = QUOTED_VALUE
            .replace_all(&rejection.body_text(), "\"***\"")
            .into_owned();
        tracing::debug!(status = %rejection.status(), "Rejected request body: {}", reason);
        ApiError::bad_request_with("Invalid request body", serde_json::json!([reason]))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new("unauthorized", "Invalid or missing API key"),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("not_found", format!("{} not found", resource)),
            ),
            ApiError::BadRequest { message, details } => {
                let mut body = ErrorResponse::new("bad_request", message);
                if let Some(details) = details {
                    body = body.with_details(details);
                }
                (StatusCode::BAD_REQUEST, body)
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, ErrorResponse::new("conflict", msg)),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error while handling request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("internal_error", "Internal server error"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest { message, .. } => write!(f, "Bad request: {}", message),
            ApiError::Conflict(m) => write!(f, "Conflict: {}", m),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;
