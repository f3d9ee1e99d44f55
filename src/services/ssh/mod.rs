//! SSH 客户端模块
//!
//! 连接配置校验、连接测试、远程命令执行

mod client;
mod connector;
mod transport;

pub use client::SshSession;
pub use connector::SshConnector;
pub use transport::{RemoteSession, RemoteTransport};
