//! 部署执行器
//!
//! 按固定顺序驱动一次部署运行：
//! Init → PrepareWorkdir → PullCode → BuildLocal → DeployRemote → Verify → Cleanup
//!
//! 阶段失败的处理方式由 [`stages::failure_policy`] 统一声明；
//! 无论成功、失败、超时还是取消，Cleanup 都恰好执行一次。

pub mod context;
pub mod stages;
pub mod transfer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::deploy::{
    DeployStage, DeploymentConfig, DeploymentResult, LogEntry, LogLevel, StageStatus,
};
use crate::error::DeployError;
use crate::services::ssh::RemoteTransport;
use crate::state::hosts::HostInventory;
use crate::state::log_hub::LogHub;
use crate::state::registry::{DeploymentGuard, DeploymentRegistry};

pub use context::{LogSink, RunContext};
pub use stages::{failure_policy, FailurePolicy, StageOutcome};
use transfer::sanitize_id;

/// 执行器依赖，由调用方构造并持有
pub struct ExecutorDeps {
    pub transport: Arc<dyn RemoteTransport>,
    pub hosts: Arc<dyn HostInventory>,
    pub registry: Arc<DeploymentRegistry>,
    /// 实时日志广播（可选）
    pub log_hub: Option<Arc<LogHub>>,
    /// 本地工作目录的父目录
    pub workspace_root: PathBuf,
    /// 传输模式下远程解包根目录
    pub staging_dir: String,
    /// 建立 SSH 会话的超时
    pub ssh_timeout: Duration,
}

/// 运行计数
#[derive(Default)]
pub struct ExecutorStats {
    runs: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cleanups: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub cleanups: u64,
}

impl ExecutorStats {
    fn record_run(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, success: bool) {
        let counter = if success {
            &self.successes
        } else {
            &self.failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
        }
    }
}

/// 部署执行器
///
/// 不持有跨运行的可变状态（计数器除外），可在多个任务间共享
pub struct DeploymentExecutor {
    deps: ExecutorDeps,
    stats: ExecutorStats,
}

impl DeploymentExecutor {
    pub fn new(deps: ExecutorDeps) -> Self {
        Self {
            deps,
            stats: ExecutorStats::default(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn registry(&self) -> &Arc<DeploymentRegistry> {
        &self.deps.registry
    }

    /// 执行一次部署
    pub async fn execute(&self, config: &DeploymentConfig) -> DeploymentResult {
        self.execute_with_cancel(config, CancellationToken::new())
            .await
    }

    /// 执行一次部署，`cancel` 触发时终止当前阶段并进入 Cleanup
    pub async fn execute_with_cancel(
        &self,
        config: &DeploymentConfig,
        cancel: CancellationToken,
    ) -> DeploymentResult {
        let started = Instant::now();
        self.stats.record_run();

        let errors = config.validate();
        if !errors.is_empty() {
            return self.reject(config, started, DeployError::Validation(errors));
        }

        match self.deps.registry.try_acquire(&config.deployment_id) {
            Ok(guard) => self.run(config, guard, cancel, started).await,
            Err(e) => self.reject(config, started, e),
        }
    }

    /// 以调用方预先占用的 ID 执行（HTTP 层需要在返回 202 前占用）
    pub async fn execute_reserved(
        &self,
        config: &DeploymentConfig,
        guard: DeploymentGuard,
        cancel: CancellationToken,
    ) -> DeploymentResult {
        let started = Instant::now();
        self.stats.record_run();

        let errors = config.validate();
        if !errors.is_empty() {
            return self.reject(config, started, DeployError::Validation(errors));
        }
        self.run(config, guard, cancel, started).await
    }

    /// 未进入任何阶段即结束
    fn reject(
        &self,
        config: &DeploymentConfig,
        started: Instant,
        err: DeployError,
    ) -> DeploymentResult {
        let sink = LogSink::new(
            config.secrets().into_iter().map(String::from).collect(),
            None,
        );
        let message = sink.scrub(&err.to_string());
        warn!(deployment_id = %config.deployment_id, "Deployment rejected: {}", message);
        self.stats.record_outcome(false);

        DeploymentResult {
            deployment_id: config.deployment_id.clone(),
            success: false,
            logs: vec![LogEntry::new(LogLevel::Error, message.clone(), None)],
            duration: started.elapsed(),
            error: Some(message),
            error_kind: Some(err.kind()),
            stages: Vec::new(),
        }
    }

    async fn run(
        &self,
        config: &DeploymentConfig,
        guard: DeploymentGuard,
        cancel: CancellationToken,
        started: Instant,
    ) -> DeploymentResult {
        let deployment_id = config.deployment_id.clone();

        let live = match &self.deps.log_hub {
            Some(hub) => Some(hub.create(&deployment_id).await),
            None => None,
        };
        let logs = LogSink::new(
            config.secrets().into_iter().map(String::from).collect(),
            live,
        );

        let suffix = Uuid::new_v4().simple().to_string();
        let workdir = self.deps.workspace_root.join(format!(
            "{}-{}",
            sanitize_id(&deployment_id),
            &suffix[..8]
        ));

        // 子令牌：超时只影响本次运行，不回传给调用方
        let run_cancel = cancel.child_token();
        let mut ctx = RunContext::new(deployment_id.clone(), workdir, run_cancel.clone(), logs);

        ctx.begin(DeployStage::Init);
        ctx.logs.info(
            DeployStage::Init,
            format!(
                "Starting deployment {} (host: {}, timeout: {}s)",
                deployment_id,
                if config.host_id.is_empty() { "-" } else { config.host_id.as_str() },
                config.timeout.as_secs()
            ),
        );
        ctx.finish(DeployStage::Init, StageStatus::Success, None);
        info!(deployment_id = %deployment_id, host_id = %config.host_id, "Deployment started");

        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = spawn_timeout(
            deployment_id.clone(),
            config.timeout,
            run_cancel,
            Arc::clone(&timed_out),
        );

        let outcome = self.run_pipeline(&mut ctx, config).await;
        timer.abort();

        let outcome = match outcome {
            Err(DeployError::Cancelled) if timed_out.load(Ordering::SeqCst) => {
                Err(DeployError::Timeout(config.timeout))
            }
            other => other,
        };
        if let Err(e @ (DeployError::Timeout(_) | DeployError::Cancelled)) = &outcome {
            ctx.logs.log(LogLevel::Error, e.to_string(), None);
        }

        self.cleanup(&mut ctx).await;

        let duration = started.elapsed();
        let (error, error_kind) = match &outcome {
            Ok(()) => {
                ctx.logs.log(
                    LogLevel::Success,
                    format!("Deployment finished in {:.1}s", duration.as_secs_f64()),
                    None,
                );
                (None, None)
            }
            Err(e) => (Some(ctx.logs.scrub(&e.to_string())), Some(e.kind())),
        };
        let success = outcome.is_ok();

        self.stats.record_outcome(success);
        drop(guard);
        if let Some(hub) = &self.deps.log_hub {
            hub.finish(&deployment_id, success).await;
        }

        match &error {
            None => info!(
                deployment_id = %deployment_id,
                duration_ms = duration.as_millis() as u64,
                "Deployment succeeded"
            ),
            Some(message) => error!(
                deployment_id = %deployment_id,
                duration_ms = duration.as_millis() as u64,
                "Deployment failed: {}",
                message
            ),
        }

        let (logs, stages) = ctx.into_parts();
        DeploymentResult {
            deployment_id,
            success,
            logs,
            duration,
            error,
            error_kind,
            stages,
        }
    }

    async fn run_pipeline(
        &self,
        ctx: &mut RunContext,
        config: &DeploymentConfig,
    ) -> Result<(), DeployError> {
        for stage in DeployStage::PIPELINE {
            if ctx.cancel.is_cancelled() {
                return Err(DeployError::Cancelled);
            }

            ctx.begin(stage);
            let err = match self.run_stage(stage, ctx, config).await {
                Ok(StageOutcome::Completed(message)) => {
                    ctx.finish(stage, StageStatus::Success, message);
                    continue;
                }
                Ok(StageOutcome::Skipped(reason)) => {
                    ctx.logs.info(stage, &reason);
                    ctx.finish(stage, StageStatus::Skipped, Some(reason));
                    continue;
                }
                Err(DeployError::Cancelled) => {
                    ctx.finish(stage, StageStatus::Failed, Some("Cancelled".to_string()));
                    return Err(DeployError::Cancelled);
                }
                Err(err) => err,
            };

            let message = err.to_string();
            match failure_policy(stage) {
                FailurePolicy::Fatal => {
                    ctx.logs.error(stage, &message);
                    ctx.finish(stage, StageStatus::Failed, Some(message));
                    return Err(err);
                }
                FailurePolicy::Recoverable => {
                    ctx.logs.error(stage, &message);
                    if let Err(recovery) = self.recover(stage, ctx).await {
                        let detail = recovery.to_string();
                        ctx.logs.error(stage, &detail);
                        ctx.finish(stage, StageStatus::Failed, Some(detail));
                        return Err(recovery);
                    }
                    ctx.finish(stage, StageStatus::Recovered, Some(message));
                }
                FailurePolicy::Advisory => {
                    ctx.logs.warning(stage, &message);
                    ctx.finish(stage, StageStatus::Failed, Some(message));
                }
            }
        }
        Ok(())
    }
}

/// 运行超时计时器，到期后设置标记并取消运行
fn spawn_timeout(
    deployment_id: String,
    timeout: Duration,
    cancel: CancellationToken,
    fired: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        error!(deployment_id = %deployment_id, "Deployment timed out after {}s", timeout.as_secs());
        fired.store(true, Ordering::SeqCst);
        cancel.cancel();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::credential::GitCredential;
    use crate::domain::deploy::HealthCheck;
    use crate::domain::ssh::{CommandOutput, SshConfig};
    use crate::error::ErrorKind;
    use crate::services::ssh::RemoteSession;
    use crate::state::hosts::StaticHostInventory;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy, PartialEq)]
    enum Behavior {
        Ok,
        RefuseAuth,
        Hang,
        Exit(i32),
    }

    #[derive(Default)]
    struct Recorder {
        opened: AtomicUsize,
        closed: AtomicUsize,
        commands: Mutex<Vec<String>>,
        uploads: Mutex<Vec<(String, usize)>>,
    }

    struct FakeTransport {
        behavior: Behavior,
        recorder: Arc<Recorder>,
    }

    struct FakeSession {
        behavior: Behavior,
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl RemoteTransport for FakeTransport {
        async fn open(
            &self,
            config: &SshConfig,
            _timeout: Duration,
        ) -> Result<Box<dyn RemoteSession>, DeployError> {
            self.recorder.opened.fetch_add(1, Ordering::SeqCst);
            if self.behavior == Behavior::RefuseAuth {
                return Err(DeployError::Connection(format!(
                    "Authentication failed for {}@{}",
                    config.username,
                    config.address()
                )));
            }
            Ok(Box::new(FakeSession {
                behavior: self.behavior,
                recorder: Arc::clone(&self.recorder),
            }))
        }
    }

    #[async_trait]
    impl RemoteSession for FakeSession {
        async fn exec(&mut self, command: &str, _timeout: Duration) -> Result<CommandOutput, DeployError> {
            self.recorder.commands.lock().push(command.to_string());
            match self.behavior {
                Behavior::Hang => std::future::pending().await,
                Behavior::Exit(code) => Ok(CommandOutput {
                    exit_code: code,
                    stdout: String::new(),
                    stderr: "Error: unit failed to start\n".to_string(),
                }),
                _ => Ok(CommandOutput {
                    exit_code: 0,
                    stdout: "ok\n".to_string(),
                    stderr: String::new(),
                }),
            }
        }

        async fn upload(&mut self, path: &str, data: &[u8], _timeout: Duration) -> Result<(), DeployError> {
            self.recorder.uploads.lock().push((path.to_string(), data.len()));
            Ok(())
        }

        async fn close(&mut self) {
            self.recorder.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        executor: DeploymentExecutor,
        recorder: Arc<Recorder>,
        registry: Arc<DeploymentRegistry>,
        workspace: tempfile::TempDir,
    }

    fn harness(behavior: Behavior) -> Harness {
        let recorder = Arc::new(Recorder::default());
        let registry = DeploymentRegistry::new();
        let workspace = tempfile::tempdir().unwrap();

        let mut hosts = StaticHostInventory::new();
        hosts.insert(
            "web-1",
            SshConfig {
                host: "10.0.0.5".into(),
                port: 22,
                username: "deploy".into(),
                password: Some("hunter2".into()),
                private_key_path: None,
            },
        );

        let executor = DeploymentExecutor::new(ExecutorDeps {
            transport: Arc::new(FakeTransport {
                behavior,
                recorder: Arc::clone(&recorder),
            }),
            hosts: Arc::new(hosts),
            registry: Arc::clone(&registry),
            log_hub: None,
            workspace_root: workspace.path().to_path_buf(),
            staging_dir: "/tmp/xjp-deploy".into(),
            ssh_timeout: Duration::from_secs(5),
        });

        Harness {
            executor,
            recorder,
            registry,
            workspace,
        }
    }

    fn workspace_is_empty(h: &Harness) -> bool {
        std::fs::read_dir(h.workspace.path()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_unreachable_repository_is_recoverable() {
        let h = harness(Behavior::Ok);
        let mut config = DeploymentConfig::new("run-1", "web-1");
        config.repository_url = Some("https://bad.invalid/x.git".into());
        config.deploy_script = Some("echo ok".into());

        let result = h.executor.execute(&config).await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.logs_for(DeployStage::PullCode, LogLevel::Error).len(), 1);
        assert_eq!(
            result.logs_for(DeployStage::DeployRemote, LogLevel::Success).len(),
            1
        );
        assert_eq!(
            result.stage_record(DeployStage::PullCode).unwrap().status,
            StageStatus::Recovered
        );

        // 空目录仍然打包上传
        let uploads = h.recorder.uploads.lock().clone();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "/tmp/xjp-deploy/run-1/artifact.tar.gz");
        assert_eq!(h.recorder.closed.load(Ordering::SeqCst), 1);
        assert!(workspace_is_empty(&h));
    }

    #[tokio::test]
    async fn test_remote_project_auth_refused() {
        let h = harness(Behavior::RefuseAuth);
        let mut config = DeploymentConfig::new("run-2", "web-1");
        config.use_remote_project = true;
        config.remote_project_path = Some("/opt/app".into());
        config.deploy_script = Some("systemctl restart app".into());

        let result = h.executor.execute(&config).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Connection));
        assert!(result.error.as_deref().unwrap().contains("Authentication failed"));
        assert_eq!(
            result.stage_record(DeployStage::DeployRemote).unwrap().status,
            StageStatus::Failed
        );
        assert!(result.stage_record(DeployStage::Verify).is_none());
        assert!(result
            .logs
            .iter()
            .any(|e| e.stage == Some(DeployStage::Cleanup)));
        assert_eq!(h.executor.stats().cleanups, 1);
        assert_eq!(h.executor.stats().failures, 1);
        assert!(!h.registry.is_running("run-2"));
    }

    #[tokio::test]
    async fn test_remote_project_script_payload() {
        let h = harness(Behavior::Ok);
        let mut config = DeploymentConfig::new("run-3", "web-1");
        config.use_remote_project = true;
        config.remote_project_path = Some("/opt/app".into());
        config.deploy_script = Some("systemctl restart app".into());

        let result = h.executor.execute(&config).await;
        assert!(result.success);

        let commands = h.recorder.commands.lock().clone();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("sh -c '"));
        assert!(commands[0].contains("cd '\\''/opt/app'\\''"));
        assert!(h.recorder.uploads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_no_deploy_script_skips_remote() {
        let h = harness(Behavior::Ok);
        let config = DeploymentConfig::new("run-4", "web-1");

        let result = h.executor.execute(&config).await;

        assert!(result.success);
        assert_eq!(
            result.stage_record(DeployStage::DeployRemote).unwrap().status,
            StageStatus::Skipped
        );
        assert_eq!(h.recorder.opened.load(Ordering::SeqCst), 0);
        assert_eq!(h.executor.stats().cleanups, 1);
    }

    #[tokio::test]
    async fn test_validation_failure_runs_no_stages() {
        let h = harness(Behavior::Ok);
        let mut config = DeploymentConfig::new("run-5", "web-1");
        config.use_remote_project = true;

        let result = h.executor.execute(&config).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Validation));
        assert!(result.stages.is_empty());
        assert_eq!(h.executor.stats().cleanups, 0);
    }

    #[tokio::test]
    async fn test_build_failure_is_fatal() {
        let h = harness(Behavior::Ok);
        let mut config = DeploymentConfig::new("run-6", "web-1");
        config.build_script = Some("echo building; exit 3".into());
        config.deploy_script = Some("echo ok".into());

        let result = h.executor.execute(&config).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Stage));
        assert!(result.error.as_deref().unwrap().contains("code 3"));
        assert!(result.stage_record(DeployStage::DeployRemote).is_none());
        assert!(result.stage_record(DeployStage::Cleanup).is_some());
        assert_eq!(h.recorder.opened.load(Ordering::SeqCst), 0);
        assert!(workspace_is_empty(&h));
    }

    #[tokio::test]
    async fn test_build_sees_environment() {
        let h = harness(Behavior::Ok);
        let mut config = DeploymentConfig::new("run-7", "");
        config
            .environment
            .insert("APP_MODE".into(), "production".into());
        config.build_script = Some("test \"$APP_MODE\" = production && test \"$DEPLOYMENT_ID\" = run-7".into());

        let result = h.executor.execute(&config).await;
        assert!(result.success, "error: {:?}", result.error);
    }

    #[tokio::test]
    async fn test_build_background_process_does_not_outlive_timeout() {
        let h = harness(Behavior::Ok);
        let mut config = DeploymentConfig::new("run-7b", "");
        config.build_script = Some("sleep 15 & echo started".into());
        config.timeout = Duration::from_secs(1);

        let started = Instant::now();
        let result = h.executor.execute(&config).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(
            result.stage_record(DeployStage::BuildLocal).unwrap().status,
            StageStatus::Success
        );
        assert_eq!(h.executor.stats().cleanups, 1);
    }

    #[tokio::test]
    async fn test_remote_exit_code_is_fatal() {
        let h = harness(Behavior::Exit(1));
        let mut config = DeploymentConfig::new("run-8", "web-1");
        config.deploy_script = Some("./start.sh".into());

        let result = h.executor.execute(&config).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Stage));
        assert!(!result
            .logs_for(DeployStage::DeployRemote, LogLevel::Error)
            .is_empty());
        assert_eq!(h.recorder.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_health_check_is_advisory() {
        let h = harness(Behavior::Ok);
        let mut config = DeploymentConfig::new("run-9", "web-1");
        config.health_check = Some(HealthCheck::Command {
            command: "exit 1".into(),
            remote: false,
        });

        let result = h.executor.execute(&config).await;

        assert!(result.success);
        assert_eq!(
            result.stage_record(DeployStage::Verify).unwrap().status,
            StageStatus::Failed
        );
        assert_eq!(result.logs_for(DeployStage::Verify, LogLevel::Warning).len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_still_cleans_up() {
        let h = harness(Behavior::Hang);
        let mut config = DeploymentConfig::new("run-10", "web-1");
        config.deploy_script = Some("sleep 3600".into());
        config.timeout = Duration::from_millis(300);

        let started = Instant::now();
        let result = h.executor.execute(&config).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(h.executor.stats().cleanups, 1);
        assert_eq!(h.recorder.closed.load(Ordering::SeqCst), 1);
        assert!(workspace_is_empty(&h));
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let h = harness(Behavior::Hang);
        let mut config = DeploymentConfig::new("run-11", "web-1");
        config.deploy_script = Some("sleep 3600".into());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = h.executor.execute_with_cancel(&config, cancel).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(h.executor.stats().cleanups, 1);
    }

    #[tokio::test]
    async fn test_single_flight_per_id() {
        let h = harness(Behavior::Ok);
        let _held = h.registry.try_acquire("run-12").unwrap();

        let result = h
            .executor
            .execute(&DeploymentConfig::new("run-12", "web-1"))
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Conflict));
        assert!(result.stages.is_empty());
    }

    #[tokio::test]
    async fn test_credentials_never_logged() {
        let h = harness(Behavior::Ok);
        let mut config = DeploymentConfig::new("run-13", "web-1");
        config.repository_url = Some("https://bad.invalid/x.git".into());
        config.git_credentials = Some(GitCredential::Token {
            token: "ghp_topsecret123".into(),
            username: None,
        });

        let result = h.executor.execute(&config).await;

        assert!(result.success);
        assert!(result
            .logs
            .iter()
            .all(|e| !e.message.contains("ghp_topsecret123")));
    }

    #[tokio::test]
    async fn test_log_hub_receives_entries() {
        let mut h = harness(Behavior::Ok);
        let hub = Arc::new(LogHub::new());
        h.executor.deps.log_hub = Some(Arc::clone(&hub));
        let mut rx = hub.create("run-14").await.subscribe();

        let result = h
            .executor
            .execute(&DeploymentConfig::new("run-14", "web-1"))
            .await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.stage, Some(DeployStage::Init));
        assert_eq!(hub.outcome("run-14").await, Some(result.success));
    }
}
