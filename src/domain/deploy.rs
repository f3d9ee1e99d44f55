//! 部署相关领域模型

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::env::constants::DEFAULT_DEPLOY_TIMEOUT_SECS;
use crate::domain::credential::GitCredential;
use crate::error::ErrorKind;

/// 流水线阶段，顺序固定
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeployStage {
    Init,
    PrepareWorkdir,
    PullCode,
    BuildLocal,
    DeployRemote,
    Verify,
    Cleanup,
}

impl DeployStage {
    /// Cleanup 之前按顺序执行的阶段
    pub const PIPELINE: [DeployStage; 5] = [
        DeployStage::PrepareWorkdir,
        DeployStage::PullCode,
        DeployStage::BuildLocal,
        DeployStage::DeployRemote,
        DeployStage::Verify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStage::Init => "Init",
            DeployStage::PrepareWorkdir => "PrepareWorkdir",
            DeployStage::PullCode => "PullCode",
            DeployStage::BuildLocal => "BuildLocal",
            DeployStage::DeployRemote => "DeployRemote",
            DeployStage::Verify => "Verify",
            DeployStage::Cleanup => "Cleanup",
        }
    }

    /// 显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            DeployStage::Init => "Init",
            DeployStage::PrepareWorkdir => "Prepare Workdir",
            DeployStage::PullCode => "Pull Code",
            DeployStage::BuildLocal => "Build",
            DeployStage::DeployRemote => "Deploy",
            DeployStage::Verify => "Verify",
            DeployStage::Cleanup => "Cleanup",
        }
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    /// 失败但按策略降级继续
    Recovered,
}

/// 阶段执行记录
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub stage: DeployStage,
    pub display_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    pub message: Option<String>,
}

impl StageRecord {
    /// 创建待执行阶段并立即开始
    pub fn start(stage: DeployStage) -> Self {
        Self {
            stage,
            display_name: stage.display_name().to_string(),
            started_at: Some(Utc::now()),
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Running,
            message: None,
        }
    }

    /// 结束阶段
    pub fn finish(&mut self, status: StageStatus, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = status;
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }
}

/// 日志级别
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Success => "success",
        }
    }
}

/// 部署日志条目（仅在单次运行中产生，核心不持久化）
#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<DeployStage>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>, stage: Option<DeployStage>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            stage,
        }
    }
}

/// 部署后的健康检查
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheck {
    /// 执行命令（`remote = true` 时在目标主机上执行）
    Command {
        command: String,
        #[serde(default = "default_true")]
        remote: bool,
    },
    /// 探测 HTTP(S) URL
    Url {
        url: String,
        #[serde(default, rename = "expectStatus")]
        expect_status: Option<u16>,
    },
}

/// 一次部署的完整描述
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    pub deployment_id: String,
    pub host_id: String,
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub git_credentials: Option<GitCredential>,
    #[serde(default)]
    pub build_script: Option<String>,
    #[serde(default)]
    pub deploy_script: Option<String>,
    #[serde(default)]
    pub use_remote_project: bool,
    #[serde(default)]
    pub remote_project_path: Option<String>,
    /// 远程项目模式下是否先 git pull
    #[serde(default = "default_true")]
    pub pull_remote: bool,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

impl DeploymentConfig {
    /// 以默认值创建配置
    pub fn new(deployment_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            host_id: host_id.into(),
            repository_url: None,
            branch: default_branch(),
            git_credentials: None,
            build_script: None,
            deploy_script: None,
            use_remote_project: false,
            remote_project_path: None,
            pull_remote: true,
            environment: HashMap::new(),
            health_check: None,
            timeout: default_timeout(),
        }
    }

    /// 校验不变量，返回全部违规项
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.deployment_id.trim().is_empty() {
            errors.push("deploymentId is required".to_string());
        }
        if self.host_id.trim().is_empty() && self.deploy_script.is_some() {
            errors.push("hostId is required when deployScript is set".to_string());
        }
        if self.use_remote_project {
            match self.remote_project_path.as_deref().map(str::trim) {
                Some(p) if p.starts_with('/') && p.len() > 1 => {}
                Some(p) if !p.is_empty() => {
                    errors.push("remoteProjectPath must be an absolute path".to_string());
                }
                _ => errors.push(
                    "remoteProjectPath is required when useRemoteProject is true".to_string(),
                ),
            }
        }
        if self.timeout.is_zero() {
            errors.push("timeout must be greater than zero".to_string());
        }
        if let Some(url) = self.repository_url.as_deref() {
            if url.trim().is_empty() {
                errors.push("repositoryUrl must not be empty when set".to_string());
            }
        }
        if let Some(cred) = &self.git_credentials {
            errors.extend(cred.validate());
        }
        for key in self.environment.keys() {
            if !is_valid_env_name(key) {
                errors.push(format!("environment variable name '{}' is invalid", key));
            }
        }

        errors
    }

    /// 所有需要从日志中清除的秘密
    pub fn secrets(&self) -> Vec<&str> {
        self.git_credentials
            .as_ref()
            .map(|c| c.secrets())
            .unwrap_or_default()
    }
}

/// 环境变量名需是合法的 shell 标识符
pub fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 部署结果，运行结束时创建一次
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResult {
    pub deployment_id: String,
    pub success: bool,
    pub logs: Vec<LogEntry>,
    #[serde(with = "duration_millis", rename = "durationMs")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub stages: Vec<StageRecord>,
}

impl DeploymentResult {
    /// 指定阶段、级别的日志
    pub fn logs_for(&self, stage: DeployStage, level: LogLevel) -> Vec<&LogEntry> {
        self.logs
            .iter()
            .filter(|e| e.stage == Some(stage) && e.level == level)
            .collect()
    }

    pub fn stage_record(&self, stage: DeployStage) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(DEFAULT_DEPLOY_TIMEOUT_SECS)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
