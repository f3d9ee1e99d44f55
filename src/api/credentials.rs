//! 凭据加密 API
//!
//! 包含 /credentials/encrypt, /credentials/validate 端点

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::middleware::{ApiJson, RequireApiKey};
use crate::services::vault::{CredentialVault, VaultFormat};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct EncryptRequest {
    /// 任意 JSON 值（凭据对象、密码字符串等）
    pub value: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct EncryptResponse {
    pub ciphertext: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub ciphertext: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
    pub format: &'static str,
    pub needs_migration: bool,
}

/// 创建凭据路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/credentials/encrypt", post(encrypt))
        .route("/credentials/validate", post(validate))
}

/// 加密
///
/// POST /credentials/encrypt
/// 需要 API Key
async fn encrypt(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<EncryptRequest>,
) -> ApiResult<Json<EncryptResponse>> {
    if request.value.is_null() {
        return Err(ApiError::bad_request("value is required"));
    }
    let ciphertext = state.vault.encrypt(&request.value)?;
    Ok(Json(EncryptResponse { ciphertext }))
}

/// 校验密文能否用当前密钥解密
///
/// POST /credentials/validate
/// 需要 API Key
async fn validate(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<ValidateRequest>,
) -> ApiResult<Json<ValidateResponse>> {
    let format = match VaultFormat::detect(&request.ciphertext) {
        VaultFormat::V1 => "v1",
        VaultFormat::LegacyColon => "legacy_colon",
        VaultFormat::LegacyConcat => "legacy_concat",
        VaultFormat::Unknown => "unknown",
    };

    Ok(Json(ValidateResponse {
        valid: state.vault.validate(&request.ciphertext),
        format,
        needs_migration: CredentialVault::needs_migration(&request.ciphertext),
    }))
}
