//! 凭据保险库
//!
//! 使用 ChaCha20-Poly1305（256 位密钥，96 位 nonce）加密静态存储的凭据。
//!
//! 存储格式（版本 1）：
//!
//! ```text
//! v1:<hex(nonce[12] || ciphertext || tag[16])>
//! ```
//!
//! 每次加密都生成新的随机 nonce，同一值两次加密结果不同。
//! 截断或翻转任意字节都会导致 Poly1305 校验失败，不会解出被篡改的明文。

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::DeployError;

const VERSION_PREFIX: &str = "v1:";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// 存储值的编码格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VaultFormat {
    /// `v1:` + hex(nonce ‖ ciphertext ‖ tag)
    V1,
    /// 无版本标记的 `iv_hex:ciphertext_hex`
    LegacyColon,
    /// 无版本标记的 `iv_hex‖ciphertext_hex`，IV 为 16 字节
    LegacyConcat,
    Unknown,
}

impl VaultFormat {
    pub fn detect(stored: &str) -> Self {
        let stored = stored.trim();
        if stored.starts_with(VERSION_PREFIX) {
            return VaultFormat::V1;
        }
        let is_hex = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit());
        if let Some((iv, body)) = stored.split_once(':') {
            if iv.len() == 32 && is_hex(iv) && is_hex(body) {
                return VaultFormat::LegacyColon;
            }
            return VaultFormat::Unknown;
        }
        // 16 字节 IV（32 个 hex 字符）后至少跟一个 AES 块
        if stored.len() >= 64 && stored.len() % 2 == 0 && is_hex(stored) {
            return VaultFormat::LegacyConcat;
        }
        VaultFormat::Unknown
    }
}

pub struct CredentialVault {
    key: Zeroizing<[u8; KEY_LEN]>,
    ephemeral: bool,
}

impl CredentialVault {
    /// 由配置的密钥构建
    ///
    /// 64 个 hex 字符直接作为原始密钥，其他字符串取 SHA-256。
    /// 未配置时随机生成密钥，重启后已存储的密文全部无法解密
    pub fn from_secret(secret: Option<&str>) -> Self {
        match secret.map(str::trim).filter(|s| !s.is_empty()) {
            Some(secret) => Self {
                key: derive_key(secret),
                ephemeral: false,
            },
            None => {
                warn!(
                    "No vault key configured (OPS_VAULT_KEY); generated a random key. \
                     Encrypted credentials will not survive a restart. Do not use this in production."
                );
                let mut key = Zeroizing::new([0u8; KEY_LEN]);
                rand::rngs::OsRng.fill_bytes(&mut *key);
                Self {
                    key,
                    ephemeral: true,
                }
            }
        }
    }

    /// 密钥是否为启动时随机生成
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key[..]))
    }

    /// 序列化为 JSON 后加密
    pub fn encrypt<T: Serialize>(&self, value: &T) -> Result<String, DeployError> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(value)
                .map_err(|e| DeployError::Credential(format!("Failed to serialize secret: {}", e)))?,
        );

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| DeployError::Credential("Encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", VERSION_PREFIX, hex::encode(blob)))
    }

    /// 解密并反序列化
    pub fn decrypt<T: DeserializeOwned>(&self, stored: &str) -> Result<T, DeployError> {
        let stored = stored.trim();
        let encoded = match VaultFormat::detect(stored) {
            VaultFormat::V1 => &stored[VERSION_PREFIX.len()..],
            VaultFormat::LegacyColon | VaultFormat::LegacyConcat => {
                return Err(DeployError::Decryption(
                    "legacy untagged format; re-encrypt the value to migrate".to_string(),
                ))
            }
            VaultFormat::Unknown => {
                return Err(DeployError::Decryption("unrecognized format".to_string()))
            }
        };

        let blob = hex::decode(encoded)
            .map_err(|_| DeployError::Decryption("malformed hex payload".to_string()))?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(DeployError::Decryption("payload is truncated".to_string()));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            self.cipher()
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| {
                    DeployError::Decryption(
                        "authentication tag mismatch (wrong key or tampered data)".to_string(),
                    )
                })?,
        );

        serde_json::from_slice(&plaintext)
            .map_err(|e| {
                DeployError::Decryption(format!(
                    "payload does not match the expected shape (line {}, column {})",
                    e.line(),
                    e.column()
                ))
            })
    }

    /// 能否用当前密钥解密，不抛错
    pub fn validate(&self, stored: &str) -> bool {
        self.decrypt::<serde_json::Value>(stored).is_ok()
    }

    /// 是否为需要迁移的旧格式
    pub fn needs_migration(stored: &str) -> bool {
        matches!(
            VaultFormat::detect(stored),
            VaultFormat::LegacyColon | VaultFormat::LegacyConcat
        )
    }
}

fn derive_key(secret: &str) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    if secret.len() == KEY_LEN * 2 {
        if let Ok(raw) = hex::decode(secret) {
            key.copy_from_slice(&raw);
            return key;
        }
    }
    key.copy_from_slice(&Sha256::digest(secret.as_bytes()));
    key
}
