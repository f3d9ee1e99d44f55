//! API 模块
//!
//! HTTP handlers 和路由组装

pub mod credentials;
pub mod deploy;
pub mod git;
pub mod health;
pub mod ssh;

use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// 构建完整的 API 路由
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .merge(health::router())
        // SSH
        .merge(ssh::router())
        // Git
        .merge(git::router())
        // Credential vault
        .merge(credentials::router())
        // Deployments
        .merge(deploy::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
