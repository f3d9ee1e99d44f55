//! 产物打包与远程脚本组装
//!
//! 工作目录在内存中打成 `tar.gz`（不含 `.git`），经 exec 通道写入
//! `<staging>/<id>/artifact.tar.gz`，再由部署脚本解压到 `<staging>/<id>/app`

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::domain::deploy::{DeployStage, DeploymentConfig};
use crate::error::DeployError;
use crate::infra::command::shell_quote;

pub const ARTIFACT_NAME: &str = "artifact.tar.gz";
pub const APP_DIR: &str = "app";

/// 部署 id 用于路径时只保留 `[A-Za-z0-9_-]`
pub fn sanitize_id(id: &str) -> String {
    let clean: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if clean.is_empty() {
        "_".to_string()
    } else {
        clean
    }
}

/// 导出给构建与部署脚本的环境变量，按名称排序
pub fn script_env(config: &DeploymentConfig) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = config
        .environment
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.insert("DEPLOYMENT_ID".to_string(), config.deployment_id.clone());
    env.insert("DEPLOY_BRANCH".to_string(), config.branch.clone());
    env
}

fn export_lines(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(k, v)| format!("export {}={}\n", k, shell_quote(v)))
        .collect()
}

/// 单次部署在远程暂存目录下的工作目录
pub fn remote_dir(staging_root: &str, deployment_id: &str) -> String {
    format!(
        "{}/{}",
        staging_root.trim_end_matches('/'),
        sanitize_id(deployment_id)
    )
}

/// 远程项目模式脚本：原地更新代码后执行部署
pub fn remote_project_script(config: &DeploymentConfig, deploy_script: &str) -> String {
    let path = config.remote_project_path.as_deref().unwrap_or("/");
    let mut script = String::from("set -e\n");
    script.push_str(&format!("cd {}\n", shell_quote(path)));
    if config.pull_remote {
        script.push_str(&format!(
            "if [ -d .git ]; then\n  git pull --ff-only origin {} || echo 'warning: git pull failed, deploying current checkout' >&2\nfi\n",
            shell_quote(&config.branch)
        ));
    }
    script.push_str(&export_lines(&script_env(config)));
    script.push_str(deploy_script);
    script.push('\n');
    script
}

/// 传输模式脚本：解压上传的产物，在 `app` 中执行部署
pub fn transfer_script(config: &DeploymentConfig, remote_dir: &str, deploy_script: &str) -> String {
    let app_dir = format!("{}/{}", remote_dir, APP_DIR);
    let mut script = String::from("set -e\n");
    script.push_str(&format!("cd {}\n", shell_quote(remote_dir)));
    script.push_str(&format!(
        "rm -rf {app} && mkdir -p {app}\n",
        app = shell_quote(APP_DIR)
    ));
    script.push_str(&format!(
        "tar -xzf {} -C {}\n",
        shell_quote(ARTIFACT_NAME),
        shell_quote(APP_DIR)
    ));
    script.push_str(&format!("rm -f {}\n", shell_quote(ARTIFACT_NAME)));
    script.push_str(&format!("cd {}\n", shell_quote(&app_dir)));

    let mut env = script_env(config);
    env.insert("DEPLOY_DIR".to_string(), app_dir);
    script.push_str(&export_lines(&env));
    script.push_str(deploy_script);
    script.push('\n');
    script
}

/// 包装为远程 shell 执行的命令
pub fn sh_command(script: &str) -> String {
    format!("sh -c {}", shell_quote(script))
}

/// 将 `dir` 打包为 gzip 压缩的 tar，跳过 `.git`
///
/// 阻塞操作，需在 `spawn_blocking` 中调用
pub fn package(dir: &Path) -> Result<Vec<u8>, DeployError> {
    let err = |e: std::io::Error| {
        DeployError::stage(DeployStage::DeployRemote, format!("Failed to package artifact: {}", e))
    };

    let encoder = GzEncoder::new(Vec::new(), Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    append_tree(&mut builder, dir, Path::new("")).map_err(err)?;

    let mut encoder = builder.into_inner().map_err(err)?;
    encoder.flush().map_err(err)?;
    encoder.finish().map_err(err)
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    rel: &Path,
) -> std::io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(root.join(rel))?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let rel_path = rel.join(&name);
        let full_path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            builder.append_dir(&rel_path, &full_path)?;
            append_tree(builder, root, &rel_path)?;
        } else {
            builder.append_path_with_name(&full_path, &rel_path)?;
        }
    }
    Ok(())
}
