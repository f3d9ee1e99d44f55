//! 部署上下文
//!
//! 单次运行独占的状态：工作目录、远程会话、Git 临时文件、日志与阶段记录

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::domain::credential::scrub_secrets;
use crate::domain::deploy::{DeployStage, LogEntry, LogLevel, StageRecord, StageStatus};
use crate::infra::command::OutputLine;
use crate::services::git::GitOperations;
use crate::services::log_classifier::classify;
use crate::services::ssh::RemoteSession;

/// 日志收集器
///
/// 可克隆，供流式输出的读取任务与阶段逻辑同时写入；
/// 写入前统一清除凭据
#[derive(Clone)]
pub struct LogSink {
    entries: Arc<Mutex<Vec<LogEntry>>>,
    live: Option<broadcast::Sender<LogEntry>>,
    secrets: Arc<Mutex<Vec<String>>>,
}

impl LogSink {
    pub fn new(secrets: Vec<String>, live: Option<broadcast::Sender<LogEntry>>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            live,
            secrets: Arc::new(Mutex::new(secrets)),
        }
    }

    /// 运行中才得知的秘密（如主机密码）
    pub fn add_secrets<'a>(&self, secrets: impl IntoIterator<Item = &'a str>) {
        let mut known = self.secrets.lock();
        for secret in secrets {
            if !known.iter().any(|s| s == secret) {
                known.push(secret.to_string());
            }
        }
    }

    pub fn scrub(&self, message: &str) -> String {
        let known = self.secrets.lock();
        let secrets: Vec<&str> = known.iter().map(String::as_str).collect();
        scrub_secrets(message, &secrets)
    }

    /// 追加一条日志
    pub fn log(&self, level: LogLevel, message: impl AsRef<str>, stage: Option<DeployStage>) {
        let entry = LogEntry::new(level, self.scrub(message.as_ref()), stage);
        if let Some(tx) = &self.live {
            let _ = tx.send(entry.clone());
        }
        self.entries.lock().push(entry);
    }

    pub fn info(&self, stage: DeployStage, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message, Some(stage));
    }

    pub fn warning(&self, stage: DeployStage, message: impl AsRef<str>) {
        self.log(LogLevel::Warning, message, Some(stage));
    }

    pub fn error(&self, stage: DeployStage, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message, Some(stage));
    }

    pub fn success(&self, stage: DeployStage, message: impl AsRef<str>) {
        self.log(LogLevel::Success, message, Some(stage));
    }

    /// 子进程 / 远程输出，按分类器定级；空行丢弃
    pub fn output(&self, stage: DeployStage, line: &OutputLine) {
        let content = line.content.trim_end();
        if content.trim().is_empty() {
            return;
        }
        let level = classify(content, line.stream).level;
        self.log(level, content, Some(stage));
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }
}

/// 单次部署运行上下文
pub struct RunContext {
    pub deployment_id: String,
    pub cancel: CancellationToken,
    pub logs: LogSink,
    /// 本地工作目录（PrepareWorkdir 创建，Cleanup 删除）
    pub workdir: PathBuf,
    /// 代码目录 `<workdir>/code`
    pub code_dir: PathBuf,
    /// DeployRemote / Verify 共用的远程会话
    pub session: Option<Box<dyn RemoteSession>>,
    pub git: GitOperations,
    stages: Vec<StageRecord>,
    cleaned: bool,
}

impl RunContext {
    pub fn new(
        deployment_id: String,
        workdir: PathBuf,
        cancel: CancellationToken,
        logs: LogSink,
    ) -> Self {
        let code_dir = workdir.join("code");
        Self {
            deployment_id,
            cancel,
            logs,
            workdir,
            code_dir,
            session: None,
            git: GitOperations::new(),
            stages: Vec::new(),
            cleaned: false,
        }
    }

    /// 进入阶段
    pub fn begin(&mut self, stage: DeployStage) {
        debug_assert!(
            self.stages.iter().all(|r| r.stage != stage),
            "stage entered twice"
        );
        tracing::info!(deployment_id = %self.deployment_id, stage = %stage, "Stage started");
        self.stages.push(StageRecord::start(stage));
    }

    /// 结束阶段
    pub fn finish(&mut self, stage: DeployStage, status: StageStatus, message: Option<String>) {
        let message = message.map(|m| self.logs.scrub(&m));
        if let Some(record) = self.stages.iter_mut().rev().find(|r| r.stage == stage) {
            record.finish(status, message);
            tracing::info!(
                deployment_id = %self.deployment_id,
                stage = %stage,
                status = ?status,
                duration_ms = record.duration_ms,
                "Stage finished"
            );
        }
    }

    /// 标记清理已执行，返回此前是否未执行过
    pub fn mark_cleaned(&mut self) -> bool {
        !std::mem::replace(&mut self.cleaned, true)
    }

    #[cfg(test)]
    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn into_parts(self) -> (Vec<LogEntry>, Vec<StageRecord>) {
        (self.logs.snapshot(), self.stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_scrubs_and_classifies() {
        let sink = LogSink::new(vec!["s3cret".to_string()], None);
        sink.info(DeployStage::PullCode, "using token s3cret");
        sink.output(
            DeployStage::PullCode,
            &OutputLine::stderr("Receiving objects: 42% (42/100)"),
        );
        sink.output(DeployStage::PullCode, &OutputLine::stderr("   "));

        let entries = sink.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "using token ***");
        assert_eq!(entries[1].level, LogLevel::Info);

        sink.add_secrets(["hunter2"]);
        sink.error(DeployStage::DeployRemote, "auth hunter2 rejected");
        assert_eq!(sink.snapshot()[2].message, "auth *** rejected");
    }

    #[tokio::test]
    async fn test_sink_broadcasts() {
        let (tx, mut rx) = broadcast::channel(8);
        let sink = LogSink::new(Vec::new(), Some(tx));
        sink.success(DeployStage::DeployRemote, "done");
        assert_eq!(rx.recv().await.unwrap().message, "done");
    }

    #[test]
    fn test_stage_records() {
        let dir = std::env::temp_dir().join("ctx-test");
        let mut ctx = RunContext::new(
            "d".into(),
            dir.clone(),
            CancellationToken::new(),
            LogSink::new(Vec::new(), None),
        );
        assert_eq!(ctx.code_dir, dir.join("code"));

        ctx.begin(DeployStage::PrepareWorkdir);
        ctx.finish(DeployStage::PrepareWorkdir, StageStatus::Success, None);
        assert_eq!(ctx.stages()[0].status, StageStatus::Success);

        assert!(ctx.mark_cleaned());
        assert!(!ctx.mark_cleaned());
    }
}
