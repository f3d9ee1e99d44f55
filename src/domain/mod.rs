//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod credential;
pub mod deploy;
pub mod git;
pub mod ssh;

// Re-exports for convenience
pub use credential::{scrub_secrets, AuthType, GitCredential, GitPlatform};
pub use deploy::{
    DeployStage, DeploymentConfig, DeploymentResult, HealthCheck, LogEntry, LogLevel,
    StageRecord, StageStatus,
};
pub use git::{ProjectType, RepositoryValidation, ValidateOptions};
pub use ssh::{
    BatchSummary, BatchTestReport, CommandOutput, ConnectionTestResult, RemoteSystemInfo,
    SshConfig, SshConfigParams, SshValidation,
};
