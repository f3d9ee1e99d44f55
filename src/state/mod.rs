//! 运行时状态模块
//!
//! 管理应用状态、单飞注册表、日志通道和主机清单

pub mod app_state;
pub mod hosts;
pub mod log_hub;
pub mod registry;

pub use app_state::AppState;
pub use hosts::{HostInventory, StaticHostInventory};
pub use log_hub::LogHub;
pub use registry::{DeploymentGuard, DeploymentRegistry};
