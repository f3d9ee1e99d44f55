//! 主机清单
//!
//! `hostId` / `serverIds` 解析为 SSH 连接配置

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::ssh::{SshConfig, SshConfigParams};
use crate::services::ssh::SshConnector;

/// 主机解析
#[async_trait]
pub trait HostInventory: Send + Sync {
    async fn resolve(&self, host_id: &str) -> Option<SshConfig>;
}

/// 清单文件中的一项
#[derive(Debug, Deserialize)]
struct HostEntry {
    id: String,
    #[serde(flatten)]
    params: SshConfigParams,
}

/// 启动时从 JSON 文件加载的静态清单
#[derive(Default)]
pub struct StaticHostInventory {
    hosts: HashMap<String, SshConfig>,
}

impl StaticHostInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加载 `[{"id": "...", "hostname": "...", "port": 22, "username": "...", ...}]`
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read host inventory {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid host inventory {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let entries: Vec<HostEntry> = serde_json::from_str(raw)?;
        let mut inventory = Self::new();
        for entry in entries {
            let config = SshConnector::create_config(&entry.params);
            let validation = SshConnector::validate(&config);
            if !validation.valid {
                tracing::warn!(
                    host_id = %entry.id,
                    errors = ?validation.errors,
                    "Host inventory entry is incomplete"
                );
            }
            inventory.insert(entry.id, config);
        }
        Ok(inventory)
    }

    pub fn insert(&mut self, id: impl Into<String>, config: SshConfig) {
        self.hosts.insert(id.into(), config);
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[async_trait]
impl HostInventory for StaticHostInventory {
    async fn resolve(&self, host_id: &str) -> Option<SshConfig> {
        self.hosts.get(host_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_from_json() {
        let inventory = StaticHostInventory::from_json(
            r#"[
                {"id": "web-1", "hostname": "web-1.internal", "username": "deploy", "password": "pw"},
                {"id": "db-1", "ip": " 10.0.0.9 ", "port": 2222, "username": "ops", "keyPath": "/keys/ops"}
            ]"#,
        )
        .unwrap();
        assert_eq!(inventory.len(), 2);

        let web = inventory.resolve("web-1").await.unwrap();
        assert_eq!(web.port, 22);
        assert_eq!(web.password.as_deref(), Some("pw"));

        let db = inventory.resolve("db-1").await.unwrap();
        assert_eq!(db.host, "10.0.0.9");
        assert_eq!(db.port, 2222);
        assert_eq!(db.private_key_path.as_deref(), Some("/keys/ops"));

        assert!(inventory.resolve("missing").await.is_none());
    }

    #[test]
    fn test_invalid_json() {
        assert!(StaticHostInventory::from_json("{").is_err());
    }
}
