//! 部署单飞注册表
//!
//! 同一 deploymentId 同时只允许一个运行；`try_acquire` 返回的守卫在 drop 时释放

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::DeployError;

#[derive(Default)]
pub struct DeploymentRegistry {
    active: Mutex<HashSet<String>>,
}

impl DeploymentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 占用 `id`，已被占用时返回 `AlreadyRunning`
    pub fn try_acquire(self: &Arc<Self>, id: &str) -> Result<DeploymentGuard, DeployError> {
        let mut active = self.active.lock();
        if !active.insert(id.to_string()) {
            return Err(DeployError::AlreadyRunning(id.to_string()));
        }
        tracing::debug!(deployment_id = %id, "Deployment registered");
        Ok(DeploymentGuard {
            registry: Arc::clone(self),
            id: id.to_string(),
        })
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.active.lock().contains(id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// 运行中的部署 ID（已排序）
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().iter().cloned().collect();
        ids.sort();
        ids
    }
}

/// 运行占用守卫
pub struct DeploymentGuard {
    registry: Arc<DeploymentRegistry>,
    id: String,
}

impl DeploymentGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for DeploymentGuard {
    fn drop(&mut self) {
        self.registry.active.lock().remove(&self.id);
        tracing::debug!(deployment_id = %self.id, "Deployment released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight() {
        let registry = DeploymentRegistry::new();
        let guard = registry.try_acquire("d-1").unwrap();
        assert!(registry.is_running("d-1"));
        assert!(matches!(
            registry.try_acquire("d-1"),
            Err(DeployError::AlreadyRunning(_))
        ));

        // 不同 ID 互不影响
        let _other = registry.try_acquire("d-2").unwrap();
        assert_eq!(registry.active_ids(), vec!["d-1", "d-2"]);

        drop(guard);
        assert!(!registry.is_running("d-1"));
        assert!(registry.try_acquire("d-1").is_ok());
    }
}
