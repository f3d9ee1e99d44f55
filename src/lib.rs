//! XJP Ops Deploy - 远程部署执行流水线
//!
//! 拉取代码、本地构建、SSH 远程部署、健康检查、清理；
//! 附带凭据加密、连接测试与输出分类，以及一层薄的 HTTP 接口

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod middleware;
pub mod services;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crate::config::env::{constants::VERSION, EnvConfig};
use crate::state::AppState;

/// 已完成日志通道的保留时长（小时）
const LOG_RETENTION_HOURS: i64 = 1;

/// 初始化日志，默认 info，可由 RUST_LOG 覆盖
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 重复初始化（如测试中）时忽略
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 启动 HTTP 服务，直到收到 Ctrl+C
pub async fn run_server(config: EnvConfig) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.workspace_root)
        .await
        .with_context(|| {
            format!(
                "Failed to create workspace root {}",
                config.workspace_root.display()
            )
        })?;

    let port = config.port;
    let state = Arc::new(AppState::new(config)?);
    let app = api::router(state.clone());

    // 定期清理已完成的日志通道
    let hub = state.log_hub.clone();
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => hub.cleanup_expired(LOG_RETENTION_HOURS).await,
            }
        }
    });

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(version = VERSION, addr = %listener.local_addr()?, "xjp-ops-deploy listening");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            tracing::info!("Shutting down, cancelling running deployments");
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    // 等待后台部署完成清理
    for _ in 0..50 {
        if state.registry.active_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tracing::info!("Server shut down gracefully");
    Ok(())
}
