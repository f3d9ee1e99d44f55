//! 健康检查 API
//!
//! GET /health

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::services::deploy::StatsSnapshot;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    active_deployments: usize,
    active_deployment_ids: Vec<String>,
    executor: StatsSnapshot,
    /// 凭据密钥为启动时临时生成
    vault_ephemeral: bool,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_check))
}

/// 健康检查 - 返回状态、版本、运行时间等信息
///
/// GET /health
/// 无需认证
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let active_deployment_ids = state.registry.active_ids();

    Json(HealthResponse {
        status: "ok",
        service: "xjp-ops-deploy",
        version: VERSION,
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: state.uptime_secs(),
        active_deployments: active_deployment_ids.len(),
        active_deployment_ids,
        executor: state.executor.stats(),
        vault_ephemeral: state.vault.is_ephemeral(),
    })
}
