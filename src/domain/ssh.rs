//! SSH 连接相关领域模型

use serde::{Deserialize, Serialize};

/// 规范化后的 SSH 连接配置
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
}

impl SshConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn secrets(&self) -> Vec<&str> {
        self.password.as_deref().into_iter().collect()
    }
}

impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key_path", &self.private_key_path)
            .finish()
    }
}

/// 原始输入（来自表单或主机清单），未规范化
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfigParams {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    /// 保留原始值以便报告越界端口
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, alias = "privateKeyPath")]
    pub key_path: Option<String>,
}

/// 校验结果
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SshValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// 远程主机信息（连接测试时采集）
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSystemInfo {
    pub os: Option<String>,
    pub kernel: Option<String>,
    pub hostname: Option<String>,
    pub uptime: Option<String>,
    pub memory: Option<String>,
}

/// 单次连接测试结果，永不以错误形式返回
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResult {
    pub success: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_info: Option<RemoteSystemInfo>,
    /// 连接耗时（毫秒）
    pub connection_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// 批量测试汇总
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
}

/// 批量测试结果
#[derive(Clone, Debug, Serialize)]
pub struct BatchTestReport {
    pub results: Vec<ConnectionTestResult>,
    pub summary: BatchSummary,
}

/// 远程命令输出
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
