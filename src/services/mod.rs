//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod deploy;
pub mod git;
pub mod log_classifier;
pub mod ssh;
pub mod vault;
