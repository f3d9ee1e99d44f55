//! 部署 API
//!
//! 包含 /deployments, /deployments/run, /deployments/:id/logs/stream 端点

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Serialize;
use serde_json::Value;
use std::{convert::Infallible, sync::Arc};
use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::credential::GitCredential;
use crate::domain::deploy::DeploymentConfig;
use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::middleware::{ApiJson, RequireApiKey};
use crate::state::AppState;

/// 触发部署响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub deployment_id: String,
    pub status: &'static str,
    pub stream_url: String,
}

/// 运行中的部署
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveResponse {
    pub deployment_ids: Vec<String>,
    pub total: usize,
}

/// 创建部署路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deployments", get(list_active).post(start_deployment))
        .route("/deployments/run", post(run_deployment))
        .route("/deployments/:id/logs/stream", get(stream_logs))
}

/// 把请求体解析为部署配置
///
/// - 未指定 `timeout` 时使用服务配置的默认值
/// - 未指定 `deploymentId` 时生成一个
/// - `gitCredentials` 可以是 `{"encrypted": "v1:..."}`，经 vault 解密
fn build_config(state: &AppState, mut body: Value) -> ApiResult<DeploymentConfig> {
    let obj = body
        .as_object_mut()
        .ok_or_else(|| ApiError::bad_request("Request body must be a JSON object"))?;

    obj.entry("timeout")
        .or_insert_with(|| Value::from(state.config.deploy_timeout.as_secs()));
    obj.entry("deploymentId")
        .or_insert_with(|| Value::from(uuid::Uuid::new_v4().to_string()));

    let encrypted = obj
        .get("gitCredentials")
        .and_then(|c| c.get("encrypted"))
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(stored) = encrypted {
        let credential: GitCredential = state.vault.decrypt(&stored)?;
        let plain = serde_json::to_value(credential)
            .map_err(|e| ApiError::internal(format!("Failed to re-encode credential: {}", e)))?;
        obj.insert("gitCredentials".to_string(), plain);
    }

    let config: DeploymentConfig = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid deployment request: {}", e)))?;

    let errors = config.validate();
    if !errors.is_empty() {
        return Err(ApiError::bad_request_with(
            "Validation failed",
            serde_json::json!(errors),
        ));
    }
    Ok(config)
}

/// 列出运行中的部署
///
/// GET /deployments
/// 需要 API Key
async fn list_active(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> Json<ActiveResponse> {
    let deployment_ids = state.registry.active_ids();
    Json(ActiveResponse {
        total: deployment_ids.len(),
        deployment_ids,
    })
}

/// 后台执行部署
///
/// POST /deployments
/// 需要 API Key
///
/// 返回 202；通过 streamUrl 订阅实时日志
async fn start_deployment(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<Value>,
) -> ApiResult<impl IntoResponse> {
    let config = build_config(&state, body)?;
    let guard = state.registry.try_acquire(&config.deployment_id)?;
    let deployment_id = config.deployment_id.clone();

    // 先建通道，客户端拿到 202 后即可订阅
    state.log_hub.create(&deployment_id).await;

    let task_state = state.clone();
    tokio::spawn(async move {
        let cancel = task_state.shutdown.child_token();
        let result = task_state
            .executor
            .execute_reserved(&config, guard, cancel)
            .await;
        tracing::info!(
            deployment_id = %result.deployment_id,
            success = result.success,
            duration_ms = result.duration.as_millis() as u64,
            "Background deployment finished"
        );
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            stream_url: format!("/deployments/{}/logs/stream", deployment_id),
            deployment_id,
            status: "running",
        }),
    ))
}

/// 同步执行部署，返回完整结果
///
/// POST /deployments/run
/// 需要 API Key
async fn run_deployment(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<Value>,
) -> ApiResult<Response> {
    let config = build_config(&state, body)?;
    let result = state
        .executor
        .execute_with_cancel(&config, state.shutdown.child_token())
        .await;

    if result.error_kind == Some(ErrorKind::Conflict) {
        return Err(ApiError::conflict(format!(
            "Deployment '{}' is already running",
            config.deployment_id
        )));
    }
    Ok(Json(result).into_response())
}

/// SSE 实时日志流
///
/// GET /deployments/:id/logs/stream
/// 无需认证
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let mut rx = state
        .log_hub
        .subscribe(&deployment_id)
        .await
        .ok_or_else(|| {
            ApiError::not_found(format!(
                "Deployment '{}' (unknown or already completed)",
                deployment_id
            ))
        })?;

    let state_clone = state.clone();
    let id_clone = deployment_id.clone();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(entry) => {
                    let json = serde_json::to_string(&entry).unwrap_or_default();
                    yield Ok(Event::default().data(json));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(deployment_id = %id_clone, lagged = n, "Log subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // 发送结束事件
                    let success = state_clone.log_hub.outcome(&id_clone).await;
                    yield Ok(Event::default().event("complete").data(
                        serde_json::json!({ "success": success }).to_string()
                    ));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_response_shape() {
        let body = serde_json::to_value(StartResponse {
            deployment_id: "d-1".into(),
            status: "running",
            stream_url: "/deployments/d-1/logs/stream".into(),
        })
        .unwrap();
        assert_eq!(body["deploymentId"], "d-1");
        assert_eq!(body["streamUrl"], "/deployments/d-1/logs/stream");
    }
}
