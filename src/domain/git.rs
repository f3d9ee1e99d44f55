//! Git 仓库校验相关领域模型

use serde::{Deserialize, Serialize};

use crate::domain::credential::{AuthType, GitCredential, GitPlatform};

/// 仓库校验选项
#[derive(Clone, Debug, Default)]
pub struct ValidateOptions {
    pub credentials: Option<GitCredential>,
    pub platform: GitPlatform,
    pub auth_type: Option<AuthType>,
    /// 是否额外探测项目类型（需要一次无 blob 的浅克隆）
    pub detect_project_type: bool,
}

/// 仓库校验结果
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryValidation {
    pub accessible: bool,
    pub branches: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_type: Option<ProjectType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RepositoryValidation {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            accessible: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// 通过根目录文件推断的项目类型
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Rust,
    Node,
    Go,
    Java,
    Python,
    Php,
    Docker,
    Static,
}

impl ProjectType {
    /// 标记文件优先级由上至下
    const MARKERS: &'static [(&'static str, ProjectType)] = &[
        ("Cargo.toml", ProjectType::Rust),
        ("package.json", ProjectType::Node),
        ("go.mod", ProjectType::Go),
        ("pom.xml", ProjectType::Java),
        ("build.gradle", ProjectType::Java),
        ("requirements.txt", ProjectType::Python),
        ("pyproject.toml", ProjectType::Python),
        ("composer.json", ProjectType::Php),
        ("Dockerfile", ProjectType::Docker),
        ("index.html", ProjectType::Static),
    ];

    pub fn detect<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let names: Vec<&str> = names.into_iter().map(str::trim).collect();
        Self::MARKERS
            .iter()
            .find(|(marker, _)| names.contains(marker))
            .map(|(_, kind)| *kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_project_type_priority() {
        assert_eq!(
            ProjectType::detect(["Dockerfile", "package.json", "README.md"]),
            Some(ProjectType::Node)
        );
        assert_eq!(ProjectType::detect(["Dockerfile"]), Some(ProjectType::Docker));
        assert_eq!(ProjectType::detect(["README.md"]), None);
    }

    #[test]
    fn test_failed_validation() {
        let v = RepositoryValidation::failed("boom");
        assert!(!v.accessible);
        assert!(v.branches.is_empty());
        assert_eq!(v.error.as_deref(), Some("boom"));
    }
}
