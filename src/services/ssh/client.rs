//! russh 客户端会话

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::{ChannelMsg, Disconnect};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::transport::RemoteSession;
use crate::domain::ssh::{CommandOutput, SshConfig};
use crate::error::DeployError;
use crate::infra::command::shell_quote;

/// 连接阶段失败原因，`code()` 用于连接测试结果中的 errorCode
#[derive(Debug, Error)]
pub(crate) enum ConnectError {
    #[error("Host unreachable: {0}")]
    Unreachable(String),
    #[error("Connection refused by {0}")]
    Refused(String),
    #[error("Authentication failed for user '{0}'")]
    AuthRejected(String),
    #[error("Failed to load private key: {0}")]
    Key(String),
    #[error("No password or private key configured")]
    NoCredentials,
    #[error("SSH handshake failed: {0}")]
    Protocol(String),
}

impl ConnectError {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            ConnectError::Unreachable(_) => "HOST_UNREACHABLE",
            ConnectError::Refused(_) => "CONNECTION_REFUSED",
            ConnectError::AuthRejected(_) => "AUTH_FAILED",
            ConnectError::Key(_) | ConnectError::NoCredentials => "CREDENTIAL_ERROR",
            ConnectError::Protocol(_) => "CONNECTION_FAILED",
        }
    }

    fn from_russh(err: russh::Error, address: &str) -> Self {
        let text = err.to_string();
        let lower = text.to_lowercase();
        if lower.contains("refused") {
            ConnectError::Refused(address.to_string())
        } else if lower.contains("lookup")
            || lower.contains("resolve")
            || lower.contains("unreachable")
            || lower.contains("no route")
            || lower.contains("not known")
        {
            ConnectError::Unreachable(text)
        } else {
            ConnectError::Protocol(text)
        }
    }
}

impl From<ConnectError> for DeployError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::Key(_) | ConnectError::NoCredentials => {
                DeployError::Credential(err.to_string())
            }
            other => DeployError::Connection(other.to_string()),
        }
    }
}

/// russh 回调处理
pub(crate) struct ClientHandler {
    host: String,
    port: u16,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        // 部署目标由运维清单维护，不做 known_hosts 校验
        let _ = server_public_key;
        debug!(host = %self.host, port = self.port, "Accepting server host key");
        Ok(true)
    }
}

/// 已认证的 SSH 会话
pub struct SshSession {
    handle: Option<client::Handle<ClientHandler>>,
    address: String,
}

impl SshSession {
    /// 建立 TCP 连接、完成握手与认证
    ///
    /// 有私钥时优先使用私钥，被拒绝且配置了密码时回退到密码认证
    pub(crate) async fn connect(config: &SshConfig) -> Result<Self, ConnectError> {
        let address = config.address();
        info!(address = %address, username = %config.username, "Connecting to SSH server");

        let ssh_config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        let handler = ClientHandler {
            host: config.host.clone(),
            port: config.port,
        };

        let mut handle = client::connect(
            Arc::new(ssh_config),
            (config.host.as_str(), config.port),
            handler,
        )
        .await
        .map_err(|e| ConnectError::from_russh(e, &address))?;

        debug!(address = %address, "SSH handshake completed");

        let mut authenticated = false;
        if let Some(key_path) = config.private_key_path.as_deref() {
            let key = russh::keys::load_secret_key(key_path, None)
                .map_err(|e| ConnectError::Key(format!("{}: {}", key_path, e)))?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            authenticated = handle
                .authenticate_publickey(&config.username, key_with_hash)
                .await
                .map_err(|e| ConnectError::Protocol(e.to_string()))?
                .success();
            if !authenticated {
                warn!(address = %address, "Public key rejected by server");
            }
        }
        if !authenticated {
            match config.password.as_deref() {
                Some(password) => {
                    authenticated = handle
                        .authenticate_password(&config.username, password)
                        .await
                        .map_err(|e| ConnectError::Protocol(e.to_string()))?
                        .success();
                }
                None if config.private_key_path.is_none() => {
                    return Err(ConnectError::NoCredentials)
                }
                None => {}
            }
        }
        if !authenticated {
            return Err(ConnectError::AuthRejected(config.username.clone()));
        }

        info!(address = %address, "SSH authentication successful");
        Ok(Self {
            handle: Some(handle),
            address,
        })
    }

    async fn run(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, DeployError> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| DeployError::Connection("SSH session is closed".to_string()))?;
        let channel_err = |e: russh::Error| DeployError::Connection(format!("SSH channel error: {}", e));

        let mut channel = handle.channel_open_session().await.map_err(channel_err)?;
        channel.exec(true, command).await.map_err(channel_err)?;
        if let Some(data) = stdin {
            channel.data(data).await.map_err(channel_err)?;
            channel.eof().await.map_err(channel_err)?;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    stderr.extend_from_slice(format!("killed by signal {:?}\n", signal_name).as_bytes());
                    exit_code.get_or_insert(-1);
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(CommandOutput {
            exit_code: exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, DeployError> {
        debug!(address = %self.address, "Executing remote command");
        tokio::time::timeout(timeout, self.run(command, None))
            .await
            .map_err(|_| {
                DeployError::Connection(format!(
                    "Remote command timed out after {}s",
                    timeout.as_secs()
                ))
            })?
    }

    async fn upload(&mut self, path: &str, data: &[u8], timeout: Duration) -> Result<(), DeployError> {
        let dir = path.rsplit_once('/').map(|(d, _)| d).filter(|d| !d.is_empty()).unwrap_or("/");
        let command = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(dir),
            shell_quote(path)
        );
        debug!(address = %self.address, path, bytes = data.len(), "Uploading to remote host");

        let output = tokio::time::timeout(timeout, self.run(&command, Some(data)))
            .await
            .map_err(|_| {
                DeployError::Connection(format!("Upload timed out after {}s", timeout.as_secs()))
            })??;
        if !output.success() {
            return Err(DeployError::Connection(format!(
                "Upload to {} failed (exit code {}): {}",
                path,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
            {
                debug!(address = %self.address, "SSH disconnect error: {}", e);
            }
            debug!(address = %self.address, "SSH session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ConnectError::Refused("h:22".into()).code(), "CONNECTION_REFUSED");
        assert_eq!(ConnectError::AuthRejected("root".into()).code(), "AUTH_FAILED");
        assert_eq!(ConnectError::NoCredentials.code(), "CREDENTIAL_ERROR");
    }

    #[test]
    fn test_error_taxonomy() {
        let err: DeployError = ConnectError::Key("bad".into()).into();
        assert!(matches!(err, DeployError::Credential(_)));
        let err: DeployError = ConnectError::AuthRejected("root".into()).into();
        assert!(matches!(err, DeployError::Connection(_)));
        assert!(err.to_string().contains("root"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let config = SshConfig {
            host: "127.0.0.1".into(),
            port: 1,
            username: "root".into(),
            password: Some("pw".into()),
            private_key_path: None,
        };
        let err = SshSession::connect(&config).await.err().unwrap();
        assert_eq!(err.code(), "CONNECTION_REFUSED");
    }
}
