//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use self::constants::{DEFAULT_DEPLOY_TIMEOUT_SECS, DEFAULT_SSH_TIMEOUT_SECS};

/// 环境配置
#[derive(Clone)]
pub struct EnvConfig {
    /// API 密钥
    pub api_key: String,
    /// 服务监听端口
    pub port: u16,
    /// 凭据加密密钥（未配置时启动生成临时密钥）
    pub vault_secret: Option<String>,
    /// 本地工作目录根路径
    pub workspace_root: PathBuf,
    /// 主机清单文件（JSON）
    pub hosts_file: Option<PathBuf>,
    /// 默认部署超时
    pub deploy_timeout: Duration,
    /// SSH 连接测试超时
    pub ssh_timeout: Duration,
    /// 传输模式下远程解包根目录
    pub remote_staging_dir: String,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let api_key = load_with_fallback("OPS_API_KEY", "API_KEY")
            .unwrap_or_else(|| "change-me-in-production".to_string());
        if env::var("API_KEY").is_ok() && env::var("OPS_API_KEY").is_err() {
            warn!("Deprecated environment variable API_KEY detected. Please use OPS_API_KEY");
        }

        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(9880);

        let vault_secret =
            load_with_fallback("OPS_VAULT_KEY", "ENCRYPTION_KEY").filter(|s| !s.trim().is_empty());

        let workspace_root = env::var("OPS_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join("xjp-ops-deploy"));

        let hosts_file = env::var("OPS_HOSTS_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let deploy_timeout = Duration::from_secs(parse_u64(
            "OPS_DEPLOY_TIMEOUT_SECS",
            DEFAULT_DEPLOY_TIMEOUT_SECS,
        ));
        let ssh_timeout =
            Duration::from_secs(parse_u64("OPS_SSH_TIMEOUT_SECS", DEFAULT_SSH_TIMEOUT_SECS));

        let remote_staging_dir =
            env::var("OPS_REMOTE_STAGING_DIR").unwrap_or_else(|_| "/tmp/xjp-deploy".to_string());

        Self {
            api_key,
            port,
            vault_secret,
            workspace_root,
            hosts_file,
            deploy_timeout,
            ssh_timeout,
            remote_staging_dir,
        }
    }
}

impl std::fmt::Debug for EnvConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvConfig")
            .field("port", &self.port)
            .field("vault_secret", &self.vault_secret.as_ref().map(|_| "***"))
            .field("workspace_root", &self.workspace_root)
            .field("hosts_file", &self.hosts_file)
            .field("deploy_timeout", &self.deploy_timeout)
            .field("ssh_timeout", &self.ssh_timeout)
            .field("remote_staging_dir", &self.remote_staging_dir)
            .finish_non_exhaustive()
    }
}

fn parse_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

/// 常量
pub mod constants {
    /// 默认部署超时（秒）
    pub const DEFAULT_DEPLOY_TIMEOUT_SECS: u64 = 600; // 10 分钟

    /// SSH 连接测试默认超时（秒）
    pub const DEFAULT_SSH_TIMEOUT_SECS: u64 = 10;

    /// 批量连接测试上限
    pub const MAX_BATCH_SIZE: usize = 10;

    /// 单次 git 子进程超时（秒）
    pub const GIT_TIMEOUT_SECS: u64 = 120;

    /// 本地文件系统操作超时（秒）
    pub const FS_TIMEOUT_SECS: u64 = 30;

    /// 部署后健康检查超时（秒）
    pub const HEALTH_CHECK_TIMEOUT_SECS: u64 = 30;

    /// 日志广播通道容量
    pub const LOG_CHANNEL_CAPACITY: usize = 512;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
