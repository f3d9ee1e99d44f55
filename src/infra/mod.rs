//! 基础设施模块
//!
//! 封装外部依赖（本地子进程执行）

pub mod command;

pub use command::{shell_quote, CommandError, CommandResult, CommandRunner, OutputLine, OutputStream};
