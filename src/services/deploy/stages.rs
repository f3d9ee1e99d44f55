//! 阶段实现与失败策略
//!
//! 每个阶段的失败处理在 [`failure_policy`] 中集中声明，执行器只按策略分派

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::context::RunContext;
use super::transfer::{
    package, remote_dir, remote_project_script, script_env, sh_command, transfer_script,
    ARTIFACT_NAME,
};
use super::DeploymentExecutor;
use crate::config::env::constants::{FS_TIMEOUT_SECS, HEALTH_CHECK_TIMEOUT_SECS};
use crate::domain::deploy::{DeployStage, DeploymentConfig, HealthCheck, StageStatus};
use crate::domain::ssh::CommandOutput;
use crate::error::DeployError;
use crate::infra::command::{CommandError, CommandRunner, OutputLine};
use crate::services::git::CloneRequest;

/// 阶段失败时的处理方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// 终止流水线，转入 Cleanup
    Fatal,
    /// 记录 error 日志，执行补救后继续
    Recoverable,
    /// 记录 warning 日志后继续，不影响运行结果
    Advisory,
}

pub fn failure_policy(stage: DeployStage) -> FailurePolicy {
    match stage {
        DeployStage::PullCode => FailurePolicy::Recoverable,
        DeployStage::Verify => FailurePolicy::Advisory,
        _ => FailurePolicy::Fatal,
    }
}

/// 阶段正常结束的结果
#[derive(Debug)]
pub enum StageOutcome {
    Completed(Option<String>),
    Skipped(String),
}

/// 等待 `fut`，取消令牌触发时立即返回 `Cancelled`（`fut` 随之 drop）
pub(super) async fn guarded<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, DeployError>>,
) -> Result<T, DeployError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeployError::Cancelled),
        result = fut => result,
    }
}

/// 本地文件系统操作，受 FS_TIMEOUT_SECS 约束
async fn fs_op<T>(
    stage: DeployStage,
    what: &str,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T, DeployError> {
    match tokio::time::timeout(Duration::from_secs(FS_TIMEOUT_SECS), fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DeployError::stage(stage, format!("Failed to {}: {}", what, e))),
        Err(_) => Err(DeployError::stage(
            stage,
            format!("Timed out after {}s trying to {}", FS_TIMEOUT_SECS, what),
        )),
    }
}

fn command_error(stage: DeployStage, err: CommandError) -> DeployError {
    match err {
        CommandError::Cancelled => DeployError::Cancelled,
        CommandError::Timeout(d) => DeployError::Timeout(d),
        other => DeployError::stage(stage, other.to_string()),
    }
}

fn exit_code_str(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none (killed by signal)".to_string())
}

impl DeploymentExecutor {
    pub(super) async fn run_stage(
        &self,
        stage: DeployStage,
        ctx: &mut RunContext,
        config: &DeploymentConfig,
    ) -> Result<StageOutcome, DeployError> {
        match stage {
            DeployStage::PrepareWorkdir => self.prepare_workdir(ctx).await,
            DeployStage::PullCode => self.pull_code(ctx, config).await,
            DeployStage::BuildLocal => self.build_local(ctx, config).await,
            DeployStage::DeployRemote => self.deploy_remote(ctx, config).await,
            DeployStage::Verify => self.verify(ctx, config).await,
            DeployStage::Init | DeployStage::Cleanup => Ok(StageOutcome::Completed(None)),
        }
    }

    /// 可恢复阶段失败后的补救
    pub(super) async fn recover(&self, stage: DeployStage, ctx: &mut RunContext) -> Result<(), DeployError> {
        if stage != DeployStage::PullCode {
            return Ok(());
        }

        // 清掉可能残留的半成品克隆，换成空目录继续
        let code_dir = ctx.code_dir.clone();
        fs_op(stage, "reset code directory", async {
            match tokio::fs::remove_dir_all(&code_dir).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
            tokio::fs::create_dir_all(&code_dir).await
        })
        .await?;

        ctx.logs.warning(
            stage,
            "Continuing with an empty code directory; later stages run without repository contents",
        );
        warn!(
            deployment_id = %ctx.deployment_id,
            "Code checkout failed, continuing with empty payload"
        );
        Ok(())
    }

    async fn prepare_workdir(&self, ctx: &mut RunContext) -> Result<StageOutcome, DeployError> {
        let stage = DeployStage::PrepareWorkdir;
        let code_dir = ctx.code_dir.clone();
        fs_op(stage, "create working directory", tokio::fs::create_dir_all(&code_dir)).await?;

        ctx.logs
            .info(stage, format!("Working directory: {}", ctx.workdir.display()));
        Ok(StageOutcome::Completed(None))
    }

    async fn pull_code(
        &self,
        ctx: &mut RunContext,
        config: &DeploymentConfig,
    ) -> Result<StageOutcome, DeployError> {
        let stage = DeployStage::PullCode;
        let Some(url) = config.repository_url.as_deref() else {
            return Ok(StageOutcome::Skipped(
                "No repository configured, skipping code checkout".to_string(),
            ));
        };

        ctx.logs
            .info(stage, format!("Cloning {} (branch {})", url, config.branch));

        let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
        let sink = ctx.logs.clone();
        let drain = async move {
            while let Some(line) = rx.recv().await {
                sink.output(stage, &line);
            }
        };
        let request = CloneRequest {
            url,
            branch: &config.branch,
            credentials: config.git_credentials.as_ref(),
            dest: &ctx.code_dir,
            timeout: config.timeout,
        };
        let (result, ()) = tokio::join!(ctx.git.clone_into(request, tx, ctx.cancel.clone()), drain);
        result?;

        Ok(StageOutcome::Completed(Some(format!(
            "Checked out {}",
            config.branch
        ))))
    }

    async fn build_local(
        &self,
        ctx: &mut RunContext,
        config: &DeploymentConfig,
    ) -> Result<StageOutcome, DeployError> {
        let stage = DeployStage::BuildLocal;
        let Some(script) = config.build_script.as_deref() else {
            return Ok(StageOutcome::Skipped(
                "No build script configured, skipping local build".to_string(),
            ));
        };

        ctx.logs.info(stage, "Running build script");
        let envs: HashMap<String, String> = script_env(config).into_iter().collect();

        let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
        let sink = ctx.logs.clone();
        let drain = async move {
            while let Some(line) = rx.recv().await {
                sink.output(stage, &line);
            }
        };
        let run = CommandRunner::run_shell_with_streaming(
            script,
            &ctx.code_dir,
            &envs,
            tx,
            ctx.cancel.clone(),
            config.timeout,
        );
        let (result, ()) = tokio::join!(run, drain);

        let result = result.map_err(|e| command_error(stage, e))?;
        if !result.success() {
            return Err(DeployError::stage(
                stage,
                format!(
                    "Build script exited with code {}",
                    exit_code_str(result.exit_code)
                ),
            ));
        }

        ctx.logs.success(stage, "Build finished");
        Ok(StageOutcome::Completed(None))
    }

    /// 解析目标主机并打开会话，会话保存在上下文中供 Verify 复用、Cleanup 关闭
    async fn ensure_session(
        &self,
        ctx: &mut RunContext,
        config: &DeploymentConfig,
        stage: DeployStage,
    ) -> Result<(), DeployError> {
        if ctx.session.is_some() {
            return Ok(());
        }

        let ssh = self
            .deps
            .hosts
            .resolve(&config.host_id)
            .await
            .ok_or_else(|| DeployError::validation(format!("Host '{}' not found", config.host_id)))?;
        ctx.logs.add_secrets(ssh.secrets());
        ctx.logs.info(
            stage,
            format!("Connecting to {}@{}", ssh.username, ssh.address()),
        );

        let session = guarded(
            &ctx.cancel,
            self.deps.transport.open(&ssh, self.deps.ssh_timeout),
        )
        .await?;
        ctx.session = Some(session);
        Ok(())
    }

    async fn remote_exec(
        &self,
        ctx: &mut RunContext,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, DeployError> {
        let session = ctx
            .session
            .as_mut()
            .ok_or_else(|| DeployError::Connection("No remote session".to_string()))?;
        guarded(&ctx.cancel, session.exec(command, timeout)).await
    }

    async fn deploy_remote(
        &self,
        ctx: &mut RunContext,
        config: &DeploymentConfig,
    ) -> Result<StageOutcome, DeployError> {
        let stage = DeployStage::DeployRemote;
        let Some(deploy_script) = config.deploy_script.as_deref() else {
            return Ok(StageOutcome::Skipped(
                "No deploy script configured, skipping remote deployment".to_string(),
            ));
        };

        self.ensure_session(ctx, config, stage).await?;

        let script = if config.use_remote_project {
            ctx.logs.info(
                stage,
                format!(
                    "Deploying in remote project {}",
                    config.remote_project_path.as_deref().unwrap_or_default()
                ),
            );
            remote_project_script(config, deploy_script)
        } else {
            let code_dir = ctx.code_dir.clone();
            let archive = guarded(&ctx.cancel, async move {
                tokio::task::spawn_blocking(move || package(&code_dir))
                    .await
                    .map_err(|e| DeployError::stage(stage, format!("Packaging task failed: {}", e)))?
            })
            .await?;

            let dir = remote_dir(&self.deps.staging_dir, &config.deployment_id);
            let artifact = format!("{}/{}", dir, ARTIFACT_NAME);
            let session = ctx
                .session
                .as_mut()
                .ok_or_else(|| DeployError::Connection("No remote session".to_string()))?;
            guarded(&ctx.cancel, session.upload(&artifact, &archive, config.timeout)).await?;
            ctx.logs.info(
                stage,
                format!("Uploaded artifact ({} bytes) to {}", archive.len(), artifact),
            );
            transfer_script(config, &dir, deploy_script)
        };

        ctx.logs.info(stage, "Running deploy script");
        let output = self
            .remote_exec(ctx, &sh_command(&script), config.timeout)
            .await?;

        for line in output.stdout.lines() {
            ctx.logs.output(stage, &OutputLine::stdout(line));
        }
        for line in output.stderr.lines() {
            ctx.logs.output(stage, &OutputLine::stderr(line));
        }

        if !output.success() {
            return Err(DeployError::stage(
                stage,
                format!("Deploy script exited with code {}", output.exit_code),
            ));
        }

        ctx.logs.success(stage, "Deploy script finished (exit code 0)");
        Ok(StageOutcome::Completed(None))
    }

    async fn verify(
        &self,
        ctx: &mut RunContext,
        config: &DeploymentConfig,
    ) -> Result<StageOutcome, DeployError> {
        let stage = DeployStage::Verify;
        let Some(check) = config.health_check.as_ref() else {
            return Ok(StageOutcome::Skipped("No health check configured".to_string()));
        };
        let timeout = Duration::from_secs(HEALTH_CHECK_TIMEOUT_SECS);

        match check {
            HealthCheck::Command {
                command,
                remote: true,
            } => {
                self.ensure_session(ctx, config, stage).await?;
                ctx.logs.info(stage, format!("Running remote health check: {}", command));
                let output = self.remote_exec(ctx, &sh_command(command), timeout).await?;
                if !output.success() {
                    let detail = output.stderr.lines().next().unwrap_or_default().trim().to_string();
                    return Err(DeployError::stage(
                        stage,
                        format!(
                            "Health check command exited with code {} {}",
                            output.exit_code, detail
                        )
                        .trim_end()
                        .to_string(),
                    ));
                }
            }
            HealthCheck::Command {
                command,
                remote: false,
            } => {
                ctx.logs.info(stage, format!("Running local health check: {}", command));
                let envs: HashMap<String, String> = script_env(config).into_iter().collect();
                let code_dir = &ctx.code_dir;
                let output = guarded(&ctx.cancel, async {
                    CommandRunner::run_simple("sh", &["-c", command], code_dir, &envs, timeout)
                        .await
                        .map_err(|e| command_error(stage, e))
                })
                .await?;
                if !output.status.success() {
                    return Err(DeployError::stage(
                        stage,
                        format!(
                            "Health check command exited with code {}",
                            exit_code_str(output.status.code())
                        ),
                    ));
                }
            }
            HealthCheck::Url { url, expect_status } => {
                ctx.logs.info(stage, format!("Probing {}", url));
                let client = reqwest::Client::builder()
                    .timeout(timeout)
                    .build()
                    .map_err(|e| DeployError::stage(stage, e.to_string()))?;
                let response = guarded(&ctx.cancel, async {
                    client
                        .get(url)
                        .send()
                        .await
                        .map_err(|e| DeployError::Connection(format!("Health check request failed: {}", e)))
                })
                .await?;

                let status = response.status();
                let healthy = match expect_status {
                    Some(expected) => status.as_u16() == *expected,
                    None => status.is_success(),
                };
                if !healthy {
                    return Err(DeployError::stage(
                        stage,
                        format!("Health check returned HTTP {}", status.as_u16()),
                    ));
                }
            }
        }

        ctx.logs.success(stage, "Health check passed");
        Ok(StageOutcome::Completed(None))
    }

    /// 关闭远程会话、删除本地临时文件。每次运行恰好执行一次，自身错误只记录不上抛
    pub(super) async fn cleanup(&self, ctx: &mut RunContext) {
        let stage = DeployStage::Cleanup;
        if !ctx.mark_cleaned() {
            return;
        }
        ctx.begin(stage);

        let mut problems = Vec::new();
        if let Some(mut session) = ctx.session.take() {
            if tokio::time::timeout(Duration::from_secs(FS_TIMEOUT_SECS), session.close())
                .await
                .is_err()
            {
                problems.push("Timed out closing remote session".to_string());
            }
        }

        ctx.git.cleanup();

        let workdir = ctx.workdir.clone();
        let removed = fs_op(stage, "remove working directory", async {
            match tokio::fs::remove_dir_all(&workdir).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        })
        .await;
        if let Err(e) = removed {
            problems.push(e.to_string());
        }

        for problem in &problems {
            ctx.logs.warning(stage, problem);
            warn!(deployment_id = %ctx.deployment_id, "Cleanup problem: {}", problem);
        }
        ctx.logs.info(stage, "Cleanup finished");

        let status = if problems.is_empty() {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        ctx.finish(stage, status, problems.into_iter().next());
        self.stats.record_cleanup();
        info!(deployment_id = %ctx.deployment_id, "Cleanup completed");
    }
}
