//! SSH 连接器
//!
//! - `create_config` / `validate`：规范化并校验原始输入
//! - `test_connection`：单次连接测试，失败以结构化结果返回，不返回错误
//! - `test_batch`：批量测试，超过上限时不发起任何连接
//! - `execute`：执行一条远程命令，结束后无条件断开

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use super::client::{ConnectError, SshSession};
use super::transport::{RemoteSession, RemoteTransport};
use crate::config::env::constants::DEFAULT_SSH_TIMEOUT_SECS;
use crate::domain::credential::scrub_secrets;
use crate::domain::ssh::{
    BatchSummary, BatchTestReport, CommandOutput, ConnectionTestResult, RemoteSystemInfo,
    SshConfig, SshConfigParams, SshValidation,
};
use crate::error::DeployError;

/// 连接成功后采集主机信息的只读命令
const INTROSPECT_COMMAND: &str = "echo \"os=$(uname -s)\"; \
     echo \"kernel=$(uname -r)\"; \
     echo \"hostname=$(hostname)\"; \
     echo \"uptime=$(uptime -p 2>/dev/null || uptime)\"; \
     echo \"memory=$(free -m 2>/dev/null | awk '/^Mem:/{print $3\"MB/\"$2\"MB\"}')\"";

pub struct SshConnector {
    timeout: Duration,
    attempts: AtomicUsize,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_SSH_TIMEOUT_SECS))
    }
}

impl SshConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            attempts: AtomicUsize::new(0),
        }
    }

    /// 默认连接测试超时
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 已发起的连接次数
    pub fn connection_attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    /// 规范化原始输入
    ///
    /// 主机优先取 `host`，其次 `ip`、`hostname`；端口缺省为 22，
    /// 越界端口规范化为 0 交由 [`validate`](Self::validate) 报告
    pub fn create_config(params: &SshConfigParams) -> SshConfig {
        let clean = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let host = clean(&params.host)
            .or_else(|| clean(&params.ip))
            .or_else(|| clean(&params.hostname))
            .unwrap_or_default();
        let port = match params.port {
            None => 22,
            Some(p) => u16::try_from(p).unwrap_or(0),
        };

        SshConfig {
            host,
            port,
            username: clean(&params.username).unwrap_or_default(),
            // 密码不裁剪空白
            password: params.password.clone().filter(|p| !p.is_empty()),
            private_key_path: clean(&params.key_path),
        }
    }

    /// 校验配置，返回全部违规项
    pub fn validate(config: &SshConfig) -> SshValidation {
        let mut errors = Vec::new();

        if config.host.is_empty() {
            errors.push("host is required (hostname or ip)".to_string());
        } else if config.host.chars().any(char::is_whitespace) {
            errors.push("host must not contain whitespace".to_string());
        }
        if config.port == 0 {
            errors.push("port must be between 1 and 65535".to_string());
        }
        if config.username.is_empty() {
            errors.push("username is required".to_string());
        }
        if config.password.is_none() && config.private_key_path.is_none() {
            errors.push("password or keyPath is required".to_string());
        }

        SshValidation {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// 测试连接
    ///
    /// 连接、认证、信息采集整体受 `timeout` 约束。任何失败都体现在返回值中
    pub async fn test_connection(&self, config: &SshConfig, timeout: Duration) -> ConnectionTestResult {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;
        let secrets = config.secrets();

        let validation = Self::validate(config);
        if !validation.valid {
            return failure(validation.errors.join("; "), "VALIDATION_ERROR", elapsed_ms());
        }

        self.attempts.fetch_add(1, Ordering::Relaxed);
        let probe = async {
            let mut session = SshSession::connect(config).await?;
            let info = session.exec(INTROSPECT_COMMAND, timeout).await;
            session.close().await;
            Ok::<_, ConnectError>(info.ok().map(|out| parse_system_info(&out.stdout)))
        };

        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(system_info)) => {
                info!(address = %config.address(), "SSH connection test succeeded");
                ConnectionTestResult {
                    success: true,
                    connected: true,
                    system_info,
                    connection_time: elapsed_ms(),
                    error: None,
                    error_code: None,
                }
            }
            Ok(Err(e)) => {
                warn!(address = %config.address(), code = e.code(), "SSH connection test failed");
                failure(scrub_secrets(&e.to_string(), &secrets), e.code(), elapsed_ms())
            }
            Err(_) => {
                warn!(address = %config.address(), "SSH connection test timed out");
                failure(
                    format!("Connection timed out after {}s", timeout.as_secs()),
                    "CONNECTION_TIMEOUT",
                    elapsed_ms(),
                )
            }
        }
    }

    /// 批量测试
    ///
    /// 空列表或超过 `max` 时直接返回校验错误，不发起连接。
    /// 各主机独立测试，单个失败不影响其余
    pub async fn test_batch(
        &self,
        configs: &[SshConfig],
        max: usize,
    ) -> Result<BatchTestReport, DeployError> {
        if configs.is_empty() {
            return Err(DeployError::validation("At least one server is required"));
        }
        if configs.len() > max {
            return Err(DeployError::validation(format!(
                "At most {} servers can be tested at once (got {})",
                max,
                configs.len()
            )));
        }

        let results = join_all(configs.iter().map(|c| self.test_connection(c, self.timeout))).await;
        let success = results.iter().filter(|r| r.connected).count();

        Ok(BatchTestReport {
            summary: BatchSummary {
                total: results.len(),
                success,
                failure: results.len() - success,
            },
            results,
        })
    }

    /// 执行一条远程命令，会话在返回前关闭
    pub async fn execute(
        &self,
        config: &SshConfig,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, DeployError> {
        let mut session = self.open(config, timeout).await?;
        let result = session.exec(command, timeout).await;
        session.close().await;
        result
    }
}

#[async_trait]
impl RemoteTransport for SshConnector {
    async fn open(
        &self,
        config: &SshConfig,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, DeployError> {
        let validation = Self::validate(config);
        if !validation.valid {
            return Err(DeployError::Validation(validation.errors));
        }

        self.attempts.fetch_add(1, Ordering::Relaxed);
        let session = tokio::time::timeout(timeout, SshSession::connect(config))
            .await
            .map_err(|_| {
                DeployError::Connection(format!(
                    "Connection to {} timed out after {}s",
                    config.address(),
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| {
                let err: DeployError = e.into();
                match err {
                    DeployError::Connection(m) => {
                        DeployError::Connection(scrub_secrets(&m, &config.secrets()))
                    }
                    other => other,
                }
            })?;
        Ok(Box::new(session))
    }
}

fn failure(error: String, code: &str, connection_time: u64) -> ConnectionTestResult {
    ConnectionTestResult {
        success: false,
        connected: false,
        system_info: None,
        connection_time,
        error: Some(error),
        error_code: Some(code.to_string()),
    }
}

/// 解析 `key=value` 形式的采集输出
fn parse_system_info(stdout: &str) -> RemoteSystemInfo {
    let mut info = RemoteSystemInfo::default();
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let value = Some(value.to_string());
        match key.trim() {
            "os" => info.os = value,
            "kernel" => info.kernel = value,
            "hostname" => info.hostname = value,
            "uptime" => info.uptime = value,
            "memory" => info.memory = value,
            _ => {}
        }
    }
    info
}
