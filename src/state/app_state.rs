//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::env::EnvConfig;
use crate::services::deploy::{DeploymentExecutor, ExecutorDeps};
use crate::services::ssh::{RemoteTransport, SshConnector};
use crate::services::vault::CredentialVault;

use super::hosts::{HostInventory, StaticHostInventory};
use super::log_hub::LogHub;
use super::registry::DeploymentRegistry;

/// 应用状态
///
/// 所有协作者在启动时显式构造，关闭由 `shutdown` 令牌驱动
pub struct AppState {
    // ========== 核心配置 ==========
    /// API 密钥（用于验证请求）
    pub api_key: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,

    // ========== 核心组件 ==========
    /// 凭据加密
    pub vault: CredentialVault,
    /// SSH 连接器
    pub connector: Arc<SshConnector>,
    /// 主机清单
    pub hosts: Arc<dyn HostInventory>,
    /// 单飞注册表
    pub registry: Arc<DeploymentRegistry>,
    /// 日志中心
    pub log_hub: Arc<LogHub>,
    /// 部署执行器
    pub executor: Arc<DeploymentExecutor>,

    /// 关闭信号，后台部署在关闭时被取消
    pub shutdown: CancellationToken,
}

impl AppState {
    /// 从环境配置创建应用状态
    pub fn new(config: EnvConfig) -> anyhow::Result<Self> {
        let hosts = match &config.hosts_file {
            Some(path) => StaticHostInventory::from_file(path)?,
            None => {
                tracing::warn!("OPS_HOSTS_FILE not set, host inventory is empty");
                StaticHostInventory::new()
            }
        };

        tracing::info!(
            api_key_len = config.api_key.len(),
            port = config.port,
            workspace_root = %config.workspace_root.display(),
            host_count = hosts.len(),
            deploy_timeout_secs = config.deploy_timeout.as_secs(),
            "Loaded configuration"
        );

        let connector = Arc::new(SshConnector::new(config.ssh_timeout));
        let transport: Arc<dyn RemoteTransport> = connector.clone();
        Ok(Self::with_parts(config, Arc::new(hosts), connector, transport))
    }

    /// 以给定的主机清单与远程传输组装状态
    pub fn with_parts(
        config: EnvConfig,
        hosts: Arc<dyn HostInventory>,
        connector: Arc<SshConnector>,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        let vault = CredentialVault::from_secret(config.vault_secret.as_deref());
        let registry = DeploymentRegistry::new();
        let log_hub = Arc::new(LogHub::new());

        let executor = Arc::new(DeploymentExecutor::new(ExecutorDeps {
            transport,
            hosts: Arc::clone(&hosts),
            registry: Arc::clone(&registry),
            log_hub: Some(Arc::clone(&log_hub)),
            workspace_root: config.workspace_root.clone(),
            staging_dir: config.remote_staging_dir.clone(),
            ssh_timeout: config.ssh_timeout,
        }));

        Self {
            api_key: config.api_key.clone(),
            started_at: Utc::now(),
            vault,
            connector,
            hosts,
            registry,
            log_hub,
            executor,
            shutdown: CancellationToken::new(),
            config,
        }
    }

    /// 运行时长（秒）
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
