//! Git 凭据测试 API
//!
//! POST /git/test-credentials

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::credential::{scrub_secrets, AuthType, GitCredential, GitPlatform};
use crate::domain::git::{ProjectType, ValidateOptions};
use crate::error::{ApiError, ApiResult};
use crate::middleware::{ApiJson, RequireApiKey};
use crate::services::git::{suggestions_for, GitOperations};
use crate::state::AppState;

/// 凭据测试请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TestCredentialsRequest {
    pub platform: GitPlatform,
    pub auth_type: AuthType,
    pub credentials: RawCredentials,
    #[serde(default)]
    pub test_repository: Option<String>,
}

/// 表单提交的凭据字段，按 `authType` 组装为 [`GitCredential`]
#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawCredentials {
    token: Option<String>,
    username: Option<String>,
    password: Option<String>,
    email: Option<String>,
    private_key: Option<String>,
    public_key: Option<String>,
    passphrase: Option<String>,
}

impl std::fmt::Debug for RawCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl RawCredentials {
    /// 组装凭据；缺失字段逐项列出
    pub fn into_credential(self, auth_type: AuthType) -> Result<GitCredential, Vec<String>> {
        let mut missing = Vec::new();
        let mut require = |field: &str, value: &Option<String>| {
            let v = present(value);
            if v.is_none() {
                missing.push(format!(
                    "credentials.{} is required for {} auth",
                    field,
                    auth_type.as_str()
                ));
            }
            v.unwrap_or_default()
        };

        let credential = match auth_type {
            AuthType::Token => GitCredential::Token {
                token: require("token", &self.token),
                username: present(&self.username),
            },
            AuthType::SshKey => GitCredential::SshKey {
                private_key: require("privateKey", &self.private_key),
                public_key: present(&self.public_key).unwrap_or_default(),
                passphrase: present(&self.passphrase),
            },
            AuthType::UsernamePassword => GitCredential::UsernamePassword {
                username: require("username", &self.username),
                password: require("password", &self.password),
                email: present(&self.email),
            },
        };

        if missing.is_empty() {
            Ok(credential)
        } else {
            Err(missing)
        }
    }
}

/// 测试成功
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TestCredentialsResponse {
    success: bool,
    /// 是否实际连接了仓库（未提供 testRepository 时只做格式校验）
    tested: bool,
    accessible: bool,
    branches: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    default_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_type: Option<ProjectType>,
}

/// 测试失败（HTTP 400）
#[derive(Debug, Serialize)]
struct TestCredentialsFailure {
    success: bool,
    error: String,
    suggestions: Vec<String>,
}

/// 创建 Git 路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/git/test-credentials", post(test_credentials))
}

/// 测试 Git 凭据
///
/// POST /git/test-credentials
/// 需要 API Key
async fn test_credentials(
    _auth: RequireApiKey,
    State(_state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<TestCredentialsRequest>,
) -> ApiResult<Response> {
    let credential = request
        .credentials
        .into_credential(request.auth_type)
        .map_err(|missing| ApiError::bad_request_with("Validation failed", serde_json::json!(missing)))?;

    let Some(repository) = request.test_repository.filter(|r| !r.trim().is_empty()) else {
        return Ok(Json(TestCredentialsResponse {
            success: true,
            tested: false,
            accessible: false,
            branches: Vec::new(),
            default_branch: None,
            project_type: None,
        })
        .into_response());
    };

    let options = ValidateOptions {
        credentials: Some(credential.clone()),
        platform: request.platform,
        auth_type: Some(request.auth_type),
        detect_project_type: true,
    };
    let mut git = GitOperations::new();
    let validation = git.validate_repository(&repository, &options).await;
    git.cleanup();

    if validation.accessible {
        tracing::info!(
            platform = ?request.platform,
            branches = validation.branches.len(),
            "Git credential test succeeded"
        );
        return Ok(Json(TestCredentialsResponse {
            success: true,
            tested: true,
            accessible: true,
            branches: validation.branches,
            default_branch: validation.default_branch,
            project_type: validation.project_type,
        })
        .into_response());
    }

    let error = scrub_secrets(
        validation.error.as_deref().unwrap_or("Repository is not accessible"),
        &credential.secrets(),
    );
    tracing::warn!(platform = ?request.platform, "Git credential test failed: {}", error);
    let failure = TestCredentialsFailure {
        success: false,
        suggestions: suggestions_for(&error),
        error,
    };
    Ok((StatusCode::BAD_REQUEST, Json(failure)).into_response())
}
