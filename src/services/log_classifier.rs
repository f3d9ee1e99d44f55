//! 子进程输出分类
//!
//! 有序的 `(pattern, level, stage)` 规则表，按顺序匹配，首条命中即返回。
//! [`RULES`] 的顺序属于契约：增删或移动规则时递增 [`RULES_VERSION`]。

use std::sync::LazyLock;

use regex::Regex;

use crate::domain::deploy::{DeployStage, LogLevel};
use crate::infra::command::OutputStream;

pub const RULES_VERSION: u32 = 2;

/// 规则表中的一行
pub struct Rule {
    pub name: &'static str,
    pub pattern: &'static str,
    pub level: LogLevel,
    pub stage: Option<DeployStage>,
}

const fn rule(
    name: &'static str,
    pattern: &'static str,
    level: LogLevel,
    stage: Option<DeployStage>,
) -> Rule {
    Rule {
        name,
        pattern,
        level,
        stage,
    }
}

use DeployStage::{BuildLocal, DeployRemote, PullCode};
use LogLevel::{Error, Info, Success, Warning};

pub static RULES: &[Rule] = &[
    // 失败词汇
    rule("fatal", r"(?i)\bfatal:", Error, None),
    rule("auth_failed", r"(?i)authentication failed", Error, None),
    rule("repo_not_found", r"(?i)repository not found", Error, Some(PullCode)),
    rule("resolve_host", r"(?i)could not resolve host", Error, None),
    rule("permission_denied", r"(?i)permission denied", Error, None),
    rule("connection_refused", r"(?i)connection refused", Error, None),
    rule("timeout", r"(?i)timed? ?out\b", Error, None),
    rule("error_prefix", r"(?i)^\s*(remote:\s*)?(error(\[\w+\])?|err!)[: ]", Error, None),
    // 成功词汇
    rule("success_word", r"(?i)\b(successfully|succeeded)\b", Success, None),
    rule("build_finished", r"(?i)^\s*finished\b.*\btarget", Success, Some(BuildLocal)),
    // 警告
    rule("warning_prefix", r"(?i)^\s*(warning|warn)\b[:\[ ]", Warning, None),
    rule("deprecated", r"(?i)\bdeprecat(ed|ion)\b", Warning, None),
    // git 进度与状态输出
    rule("git_from", r"^From\s+\S+", Info, Some(PullCode)),
    rule("git_cloning", r"^Cloning into\b", Info, Some(PullCode)),
    rule(
        "git_progress",
        r"^(remote: )?(Enumerating|Counting|Compressing|Receiving|Resolving|Updating files|Unpacking)\b.*",
        Info,
        Some(PullCode),
    ),
    rule("git_up_to_date", r"(?i)already up[ -]to[ -]date", Info, Some(PullCode)),
    rule("git_fast_forward", r"^\s*Fast-forward\b", Info, Some(PullCode)),
    rule(
        "git_branch_switch",
        r"^(Switched to|Already on|Your branch is|HEAD is now at|Note: switching to)\b",
        Info,
        Some(PullCode),
    ),
    rule("git_ref_update", r"^\s*[*+-]?\s*\[(new branch|new tag)\]|^\s+[0-9a-f]{7,}\.\.[0-9a-f]{7,}\s", Info, Some(PullCode)),
    rule("git_hint", r"^hint:", Info, Some(PullCode)),
    rule("git_remote", r"^remote:", Info, Some(PullCode)),
    // 构建工具写到 stderr 的常规输出
    rule(
        "build_progress",
        r"^\s*(Compiling|Downloading|Downloaded|Updating|Building|Installing|Fetching|Checking)\b",
        Info,
        Some(BuildLocal),
    ),
    rule("npm_notice", r"^npm (notice|http|timing)\b", Info, Some(BuildLocal)),
    rule("service_restart", r"(?i)\b(restarting|reloading|starting)\b.*\bservice\b", Info, Some(DeployRemote)),
];

struct CompiledRule {
    regex: Regex,
    level: LogLevel,
    stage: Option<DeployStage>,
    name: &'static str,
}

static COMPILED: LazyLock<Vec<CompiledRule>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|r| CompiledRule {
            regex: Regex::new(r.pattern).expect("classifier pattern must compile"),
            level: r.level,
            stage: r.stage,
            name: r.name,
        })
        .collect()
});

/// 单行分类结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    pub level: LogLevel,
    pub stage: Option<DeployStage>,
    /// 命中的规则名；走流默认值时为 `None`
    pub rule: Option<&'static str>,
}

/// 为一行子进程或网络输出打级别标签
///
/// 未命中任何规则时：stderr 为 `error`，stdout 为 `info`
pub fn classify(line: &str, stream: OutputStream) -> Classification {
    let trimmed = line.trim_end();
    if let Some(hit) = COMPILED.iter().find(|r| r.regex.is_match(trimmed)) {
        return Classification {
            level: hit.level,
            stage: hit.stage,
            rule: Some(hit.name),
        };
    }

    let level = match stream {
        OutputStream::Stderr if !trimmed.trim().is_empty() => LogLevel::Error,
        _ => LogLevel::Info,
    };
    Classification {
        level,
        stage: None,
        rule: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(line: &str, stream: OutputStream) -> LogLevel {
        classify(line, stream).level
    }

    #[test]
    fn test_rule_order_is_stable() {
        let names: Vec<&str> = RULES.iter().map(|r| r.name).collect();
        assert_eq!(RULES_VERSION, 2);
        assert_eq!(
            names,
            vec![
                "fatal",
                "auth_failed",
                "repo_not_found",
                "resolve_host",
                "permission_denied",
                "connection_refused",
                "timeout",
                "error_prefix",
                "success_word",
                "build_finished",
                "warning_prefix",
                "deprecated",
                "git_from",
                "git_cloning",
                "git_progress",
                "git_up_to_date",
                "git_fast_forward",
                "git_branch_switch",
                "git_ref_update",
                "git_hint",
                "git_remote",
                "build_progress",
                "npm_notice",
                "service_restart",
            ]
        );
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(COMPILED.len(), RULES.len());
    }

    #[test]
    fn test_git_chatter_on_stderr_is_info() {
        let err = OutputStream::Stderr;
        assert_eq!(level("From http://git.example/repo", err), LogLevel::Info);
        assert_eq!(level("Receiving objects: 42% (42/100)", err), LogLevel::Info);
        assert_eq!(
            level("Resolving deltas: 100% (10/10), done.", err),
            LogLevel::Info
        );
        assert_eq!(level("Already up to date.", err), LogLevel::Info);
        assert_eq!(level("Fast-forward", err), LogLevel::Info);
        assert_eq!(level("Switched to branch 'main'", err), LogLevel::Info);
        assert_eq!(level("hint: Using 'master' as the name", err), LogLevel::Info);
        assert_eq!(level("Cloning into 'code'...", err), LogLevel::Info);
    }

    #[test]
    fn test_failure_vocabulary_is_error() {
        let out = OutputStream::Stdout;
        assert_eq!(level("fatal: repository not found", out), LogLevel::Error);
        assert_eq!(level("Authentication failed", out), LogLevel::Error);
        assert_eq!(
            level("fatal: unable to access: Could not resolve host: bad.invalid", out),
            LogLevel::Error
        );
        assert_eq!(level("ssh: connect to host x port 22: Connection timed out", out), LogLevel::Error);
    }

    #[test]
    fn test_first_match_wins() {
        // "remote: Repository not found." 同时匹配 repo_not_found 与 git_remote，失败规则在前
        let c = classify("remote: Repository not found.", OutputStream::Stderr);
        assert_eq!(c.level, LogLevel::Error);
        assert_eq!(c.rule, Some("repo_not_found"));

        // warning_prefix 先于 deprecated
        let c = classify("warning: option is deprecated", OutputStream::Stderr);
        assert_eq!(c.rule, Some("warning_prefix"));

        // 远端转发的失败信息先于 git_remote 命中
        let c = classify("remote: fatal: unable to access repository", OutputStream::Stderr);
        assert_eq!(c.level, LogLevel::Error);
        assert_eq!(c.rule, Some("fatal"));

        let c = classify("remote: error: GH007: Your push would publish a private email", OutputStream::Stderr);
        assert_eq!(c.level, LogLevel::Error);
        assert_eq!(c.rule, Some("error_prefix"));

        // 普通的 remote: 输出仍是 info
        let c = classify("remote: Total 3 (delta 0), reused 0", OutputStream::Stderr);
        assert_eq!(c.rule, Some("git_remote"));
        assert_eq!(c.level, LogLevel::Info);
    }

    #[test]
    fn test_stream_defaults() {
        assert_eq!(level("some random text", OutputStream::Stderr), LogLevel::Error);
        assert_eq!(level("some random text", OutputStream::Stdout), LogLevel::Info);
        assert_eq!(level("   ", OutputStream::Stderr), LogLevel::Info);
        assert_eq!(level("ok", OutputStream::Stdout), LogLevel::Info);
    }

    #[test]
    fn test_stage_tags() {
        let c = classify("Receiving objects: 42% (42/100)", OutputStream::Stderr);
        assert_eq!(c.stage, Some(DeployStage::PullCode));
        let c = classify("   Compiling serde v1.0.0", OutputStream::Stderr);
        assert_eq!(c.stage, Some(DeployStage::BuildLocal));
        assert_eq!(c.level, LogLevel::Info);
    }

    #[test]
    fn test_success_and_warning() {
        assert_eq!(
            level("Deployed successfully", OutputStream::Stdout),
            LogLevel::Success
        );
        assert_eq!(
            level("warning: unused variable", OutputStream::Stderr),
            LogLevel::Warning
        );
    }
}
