//! SSH 连接测试 API
//!
//! 包含 /ssh/test, /ssh/test-batch 端点

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::env::constants::MAX_BATCH_SIZE;
use crate::domain::ssh::{BatchSummary, ConnectionTestResult, RemoteSystemInfo, SshConfigParams};
use crate::error::{ApiError, ApiResult};
use crate::middleware::{ApiJson, RequireApiKey};
use crate::services::ssh::SshConnector;
use crate::state::AppState;

/// 单机测试成功响应
#[derive(Debug, Serialize)]
struct TestSuccess {
    success: bool,
    data: TestSuccessData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TestSuccessData {
    message: String,
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_info: Option<RemoteSystemInfo>,
    connection_time: u64,
}

/// 单机测试失败响应（HTTP 400）
#[derive(Debug, Serialize)]
struct TestFailure {
    success: bool,
    error: String,
    details: serde_json::Value,
}

/// 批量测试请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTestRequest {
    #[serde(default)]
    pub server_ids: Vec<String>,
}

/// 批量测试中单台主机的结果
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTestResult {
    pub server_id: String,
    pub connected: bool,
    pub message: String,
    /// 测试耗时（毫秒）
    pub test_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_info: Option<RemoteSystemInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ServerTestResult {
    fn from_test(server_id: String, result: ConnectionTestResult) -> Self {
        let message = if result.connected {
            "Connected".to_string()
        } else {
            "Connection failed".to_string()
        };
        Self {
            server_id,
            connected: result.connected,
            message,
            test_time: result.connection_time,
            system_info: result.system_info,
            error_code: result.error_code,
            error_message: result.error,
        }
    }

    fn not_found(server_id: String) -> Self {
        let error_message = format!("Server '{}' is not in the host inventory", server_id);
        Self {
            server_id,
            connected: false,
            message: "Connection failed".to_string(),
            test_time: 0,
            system_info: None,
            error_code: Some("HOST_NOT_FOUND".to_string()),
            error_message: Some(error_message),
        }
    }
}

/// 批量测试响应
#[derive(Debug, Serialize)]
pub struct BatchTestResponse {
    pub success: bool,
    pub results: Vec<ServerTestResult>,
    pub summary: BatchSummary,
}

/// 创建 SSH 路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ssh/test", post(test_connection))
        .route("/ssh/test-batch", post(test_batch))
}

/// 测试单台主机连接
///
/// POST /ssh/test
/// 需要 API Key
async fn test_connection(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    ApiJson(params): ApiJson<SshConfigParams>,
) -> ApiResult<Response> {
    let config = SshConnector::create_config(&params);
    let validation = SshConnector::validate(&config);
    if !validation.valid {
        return Err(ApiError::bad_request_with(
            "Validation failed",
            serde_json::json!(validation.errors),
        ));
    }

    let result = state
        .connector
        .test_connection(&config, state.connector.timeout())
        .await;

    if result.connected {
        return Ok(Json(TestSuccess {
            success: true,
            data: TestSuccessData {
                message: format!("Connected to {}", config.address()),
                connected: true,
                system_info: result.system_info,
                connection_time: result.connection_time,
            },
        })
        .into_response());
    }

    let failure = TestFailure {
        success: false,
        error: result
            .error
            .unwrap_or_else(|| "Connection failed".to_string()),
        details: serde_json::json!({
            "errorCode": result.error_code,
            "connectionTime": result.connection_time,
        }),
    };
    Ok((StatusCode::BAD_REQUEST, Json(failure)).into_response())
}

/// 批量测试
///
/// POST /ssh/test-batch
/// 需要 API Key
async fn test_batch(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<BatchTestRequest>,
) -> ApiResult<Json<BatchTestResponse>> {
    let ids = request.server_ids;
    if ids.is_empty() {
        return Err(ApiError::bad_request("serverIds must not be empty"));
    }
    if ids.len() > MAX_BATCH_SIZE {
        return Err(ApiError::bad_request(format!(
            "At most {} servers can be tested at once (got {})",
            MAX_BATCH_SIZE,
            ids.len()
        )));
    }

    let mut resolved = Vec::with_capacity(ids.len());
    for id in &ids {
        resolved.push(state.hosts.resolve(id).await);
    }
    let configs: Vec<_> = resolved.iter().flatten().cloned().collect();

    let mut tested = if configs.is_empty() {
        Vec::new()
    } else {
        state
            .connector
            .test_batch(&configs, MAX_BATCH_SIZE)
            .await?
            .results
    }
    .into_iter();

    let results: Vec<ServerTestResult> = ids
        .into_iter()
        .zip(resolved)
        .map(|(id, config)| match config.and_then(|_| tested.next()) {
            Some(result) => ServerTestResult::from_test(id, result),
            None => ServerTestResult::not_found(id),
        })
        .collect();

    let success = results.iter().filter(|r| r.connected).count();
    tracing::info!(
        total = results.len(),
        success,
        "Batch SSH connection test finished"
    );

    Ok(Json(BatchTestResponse {
        success: true,
        summary: BatchSummary {
            total: results.len(),
            success,
            failure: results.len() - success,
        },
        results,
    }))
}
