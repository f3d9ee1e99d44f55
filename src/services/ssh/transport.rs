//! 远程传输抽象
//!
//! 部署执行器只依赖这两个 trait，生产实现为 [`super::SshConnector`]，
//! 测试中可替换为内存实现。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::ssh::{CommandOutput, SshConfig};
use crate::error::DeployError;

/// 建立远程会话
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// 连接并完成认证，整个过程受 `timeout` 约束
    async fn open(
        &self,
        config: &SshConfig,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, DeployError>;
}

/// 已认证的远程会话
#[async_trait]
pub trait RemoteSession: Send {
    /// 执行一条命令（通常是一段完整脚本）
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, DeployError>;

    /// 把 `data` 写入远程文件 `path`，父目录不存在时创建
    async fn upload(&mut self, path: &str, data: &[u8], timeout: Duration)
        -> Result<(), DeployError>;

    /// 断开连接，可重复调用
    async fn close(&mut self);
}
