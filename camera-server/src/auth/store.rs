// 用户凭据存储
//
// 内存中以 DashMap 保存，可选持久化到 JSON 文件。
// 密码以 SHA-256(salt || password) 存储，salt 每个用户随机生成。

use super::AuthError;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// 凭据记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub username: String,
    pub salt: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl CredentialRecord {
    fn new(username: &str, password: &str) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt = general_purpose::STANDARD.encode(salt);

        Self {
            username: username.to_string(),
            password_hash: hash_password(&salt, password),
            salt,
            created_at: Utc::now(),
        }
    }

    fn matches(&self, password: &str) -> bool {
        let candidate = hash_password(&self.salt, password);
        constant_time_eq(candidate.as_bytes(), self.password_hash.as_bytes())
    }
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub struct CredentialStore {
    users: DashMap<String, CredentialRecord>,
    path: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl CredentialStore {
    /// 仅内存存储
    pub fn in_memory() -> Self {
        Self {
            users: DashMap::new(),
            path: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// 从文件加载，文件不存在时从空存储开始
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AuthError> {
        let path = path.into();
        let users = DashMap::new();

        match tokio::fs::read(&path).await {
            Ok(content) => {
                let records: Vec<CredentialRecord> = serde_json::from_slice(&content)
                    .map_err(|e| AuthError::Store(format!("{}: {}", path.display(), e)))?;
                for record in records {
                    users.insert(record.username.clone(), record);
                }
                info!("Loaded {} users from {}", users.len(), path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("User store {} does not exist yet, starting empty", path.display());
            }
            Err(e) => return Err(AuthError::Store(format!("{}: {}", path.display(), e))),
        }

        Ok(Self {
            users,
            path: Some(path),
            persist_lock: Mutex::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// 注册新用户
    pub async fn register(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        match self.users.entry(username.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(AuthError::UserExists),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(CredentialRecord::new(username, password));
            }
        }

        if let Err(e) = self.persist().await {
            // 持久化失败则回滚
            self.users.remove(username);
            return Err(e);
        }

        info!("User registered: {}", username);
        Ok(())
    }

    /// 校验用户名和密码
    pub fn verify(&self, username: &str, password: &str) -> Result<(), AuthError> {
        match self.users.get(username.trim()) {
            Some(record) if record.matches(password) => Ok(()),
            Some(_) => {
                warn!("Failed login for user {}", username);
                Err(AuthError::InvalidCredentials)
            }
            None => Err(AuthError::InvalidCredentials),
        }
    }

    async fn persist(&self) -> Result<(), AuthError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = self.persist_lock.lock().await;

        let mut records: Vec<CredentialRecord> =
            self.users.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.username.cmp(&b.username));

        let content = serde_json::to_vec_pretty(&records)
            .map_err(|e| AuthError::Store(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| AuthError::Store(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| AuthError::Store(format!("{}: {}", path.display(), e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_verify() {
        let store = CredentialStore::in_memory();
        store.register("alice", "pw1").await.unwrap();

        assert!(store.verify("alice", "pw1").is_ok());
        assert!(matches!(
            store.verify("alice", "wrong"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            store.verify("bob", "pw1"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_fields() {
        let store = CredentialStore::in_memory();
        store.register("alice", "pw1").await.unwrap();

        assert!(matches!(
            store.register("alice", "pw2").await,
            Err(AuthError::UserExists)
        ));
        assert!(matches!(
            store.register("", "pw").await,
            Err(AuthError::MissingCredentials)
        ));
        assert!(matches!(
            store.register("carol", "").await,
            Err(AuthError::MissingCredentials)
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_same_password_gets_different_hashes() {
        let store = CredentialStore::in_memory();
        store.register("a", "same").await.unwrap();
        store.register("b", "same").await.unwrap();

        let a = store.users.get("a").unwrap().password_hash.clone();
        let b = store.users.get("b").unwrap().password_hash.clone();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_persisted_users_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        let store = CredentialStore::open(&path).await.unwrap();
        assert!(store.is_empty());
        store.register("alice", "pw1").await.unwrap();

        let reloaded = CredentialStore::open(&path).await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.verify("alice", "pw1").is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        assert!(matches!(
            CredentialStore::open(&path).await,
            Err(AuthError::Store(_))
        ));
    }
}
