//! 命令执行器
//!
//! 提供统一的本地子进程执行接口，支持：
//! - 实时日志流式输出
//! - 超时控制
//! - 取消支持（终止整个进程组）
//! - stdout/stderr 分离

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 输出流
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// 子进程输出的一行
#[derive(Clone, Debug)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
}

impl OutputLine {
    pub fn stdout(content: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            content: content.into(),
        }
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            content: content.into(),
        }
    }
}

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    /// 命令启动失败
    #[error("Failed to spawn command: {0}")]
    SpawnFailed(std::io::Error),
    /// 命令超时
    #[error("Command timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    /// 命令被取消
    #[error("Command was cancelled")]
    Cancelled,
    /// 等待命令完成失败
    #[error("Failed to wait for command: {0}")]
    WaitFailed(std::io::Error),
}

/// 命令执行结果
#[derive(Debug)]
pub struct CommandResult {
    /// 退出码（被信号终止时为 None）
    pub exit_code: Option<i32>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl CommandRunner {
    fn build(program: &str, args: &[&str], work_dir: &Path, envs: &HashMap<String, String>) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(work_dir)
            .envs(envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // 子进程成为进程组组长，取消时可整组终止
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// 执行命令并流式输出日志
    ///
    /// 每行输出发送到 `log_tx`；返回时所有读取任务都已结束，`log_tx` 的克隆已全部释放。
    /// 超时与取消同样约束读取阶段：进程退出后仍持有管道的后台进程不会拖住调用方
    pub async fn run_with_streaming(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        envs: &HashMap<String, String>,
        log_tx: mpsc::UnboundedSender<OutputLine>,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        let deadline = Instant::now() + timeout;
        let mut child = Self::build(program, args, work_dir, envs)
            .spawn()
            .map_err(CommandError::SpawnFailed)?;
        // wait() 之后 child.id() 为 None，先记下进程组 id
        let pgid = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // 启动 stdout 读取任务
        let stdout_tx = log_tx.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = stdout_tx.send(OutputLine::stdout(line));
                }
            }
        });

        // 启动 stderr 读取任务
        let stderr_tx = log_tx;
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = stderr_tx.send(OutputLine::stderr(line));
                }
            }
        });

        let stdout_abort = stdout_task.abort_handle();
        let stderr_abort = stderr_task.abort_handle();
        let mut readers = Box::pin(async move {
            let _ = stdout_task.await;
            let _ = stderr_task.await;
        });

        // 等待命令完成，支持超时和取消
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(program, "Command cancelled, killing process group");
                terminate(&mut child).await;
                Err(CommandError::Cancelled)
            }
            _ = tokio::time::sleep_until(deadline) => {
                error!(program, "Command timed out after {:?}", timeout);
                terminate(&mut child).await;
                Err(CommandError::Timeout(timeout))
            }
            status = child.wait() => {
                // 组长已退出，清掉留在同一进程组里的后台进程
                kill_group(pgid);
                status
                    .map(|s| CommandResult { exit_code: s.code() })
                    .map_err(CommandError::WaitFailed)
            }
        };

        if result.is_err() {
            stdout_abort.abort();
            stderr_abort.abort();
        }

        // 脱离进程组的孙进程仍可能持有管道，读取阶段同样受超时与取消约束
        let stalled = tokio::select! {
            biased;
            _ = &mut readers => None,
            _ = cancel.cancelled() => Some(CommandError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Some(CommandError::Timeout(timeout)),
        };
        if let Some(err) = stalled {
            if result.is_ok() {
                warn!(program, "Output pipes still open after exit, dropping readers");
            }
            kill_group(pgid);
            stdout_abort.abort();
            stderr_abort.abort();
            readers.await;
            if result.is_ok() {
                return Err(err);
            }
        }

        result
    }

    /// 执行 shell 脚本
    ///
    /// 使用 sh -c 执行命令字符串
    pub async fn run_shell_with_streaming(
        script: &str,
        work_dir: &Path,
        envs: &HashMap<String, String>,
        log_tx: mpsc::UnboundedSender<OutputLine>,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        Self::run_with_streaming("sh", &["-c", script], work_dir, envs, log_tx, cancel, timeout)
            .await
    }

    /// 执行简单命令（无流式输出）
    ///
    /// 用于不需要实时日志的场景（如 git ls-remote）
    pub async fn run_simple(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        envs: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<std::process::Output, CommandError> {
        let child = Self::build(program, args, work_dir, envs)
            .spawn()
            .map_err(CommandError::SpawnFailed)?;

        // 超时后 future 被丢弃，kill_on_drop 终止子进程
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(CommandError::WaitFailed),
            Err(_) => Err(CommandError::Timeout(timeout)),
        }
    }
}

/// POSIX sh 单引号转义
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// 向进程组发送 SIGKILL；组内已无进程时忽略
fn kill_group(pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pgid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, "killpg failed (process group may be gone): {}", e);
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

/// 终止子进程所在进程组，再兜底 kill 子进程本身
async fn terminate(child: &mut Child) {
    kill_group(child.id());
    if let Err(e) = child.kill().await {
        debug!("Failed to kill child process: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn collect(mut rx: mpsc::UnboundedReceiver<OutputLine>) -> Vec<OutputLine> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[tokio::test]
    async fn test_run_simple_success() {
        let output = CommandRunner::run_simple(
            "echo",
            &["hello"],
            &PathBuf::from("/tmp"),
            &HashMap::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }

    #[tokio::test]
    async fn test_run_simple_not_found() {
        let result = CommandRunner::run_simple(
            "nonexistent_command_12345",
            &[],
            &PathBuf::from("/tmp"),
            &HashMap::new(),
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(CommandError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_streaming_separates_streams_and_env() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut envs = HashMap::new();
        envs.insert("GREETING".to_string(), "hi".to_string());

        let result = CommandRunner::run_shell_with_streaming(
            "echo $GREETING; echo oops 1>&2; exit 3",
            &PathBuf::from("/tmp"),
            &envs,
            tx,
            CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert!(!result.success());
        let lines = collect(rx);
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stdout && l.content == "hi"));
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stderr && l.content == "oops"));
    }

    #[tokio::test]
    async fn test_streaming_timeout_kills_process() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let started = std::time::Instant::now();
        let result = CommandRunner::run_shell_with_streaming(
            "sleep 30",
            &PathBuf::from("/tmp"),
            &HashMap::new(),
            tx,
            CancellationToken::new(),
            Duration::from_millis(200),
        )
        .await;

        assert!(matches!(result, Err(CommandError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_streaming_cancel() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = CommandRunner::run_shell_with_streaming(
            "sleep 30",
            &PathBuf::from("/tmp"),
            &HashMap::new(),
            tx,
            cancel,
            Duration::from_secs(30),
        )
        .await;

        assert!(matches!(result, Err(CommandError::Cancelled)));
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_streaming() {
        let (tx, rx) = mpsc::unbounded_channel();
        let started = std::time::Instant::now();
        let result = CommandRunner::run_shell_with_streaming(
            "sleep 15 & echo started",
            &PathBuf::from("/tmp"),
            &HashMap::new(),
            tx,
            CancellationToken::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(collect(rx).iter().any(|l| l.content == "started"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_detached_child_is_bounded_by_timeout() {
        // setsid 让后台进程脱离进程组，只能靠超时放弃读取
        let has_setsid = CommandRunner::run_simple(
            "sh",
            &["-c", "command -v setsid"],
            &PathBuf::from("/tmp"),
            &HashMap::new(),
            Duration::from_secs(5),
        )
        .await;
        if !matches!(has_setsid, Ok(ref o) if o.status.success()) {
            return;
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        let started = std::time::Instant::now();
        let result = CommandRunner::run_shell_with_streaming(
            "setsid sleep 15 & echo started",
            &PathBuf::from("/tmp"),
            &HashMap::new(),
            tx,
            CancellationToken::new(),
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(result, Err(CommandError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
