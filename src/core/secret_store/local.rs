//! File-backed secret store for development, rehearsals, and tests.
//!
//! All secrets live in one TOML file (mode 0600) next to a flock sidecar. Every
//! mutation is load, change, atomic replace, under the exclusive lock. Values are
//! stored in plain text: protect the file like the secrets it holds. The async
//! trait methods do their locking and file I/O on tokio's blocking pool.

use super::{SecretStore, StoreError};
use crate::constants::{
    MAX_DEPRECATED_VERSIONS, MAX_SECRET_SIZE, STAGE_CURRENT, STAGE_PREVIOUS, STORE_FILE_MODE,
};
use crate::core::file_lock::FileLock;
use crate::models::secret::{SecretMetadata, SecretValue};
use crate::util::fs as store_fs;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    secrets: BTreeMap<String, StoredSecret>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSecret {
    #[serde(default)]
    rotation_enabled: bool,
    created_at: DateTime<Utc>,
    #[serde(default)]
    versions: Vec<StoredVersion>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredVersion {
    id: String,
    secret_string: String,
    #[serde(default)]
    stages: Vec<String>,
    created_at: DateTime<Utc>,
}

impl StoredSecret {
    fn position(&self, version_id: &str) -> Option<usize> {
        self.versions.iter().position(|v| v.id == version_id)
    }

    fn holder(&self, stage: &str) -> Option<usize> {
        self.versions
            .iter()
            .position(|v| v.stages.iter().any(|s| s == stage))
    }

    fn detach(&mut self, stage: &str) {
        for version in &mut self.versions {
            version.stages.retain(|s| s != stage);
        }
    }

    /// Attach `stage` to version `idx`, taking it from whichever version holds it.
    /// Losing AWSCURRENT hands AWSPREVIOUS to the version that lost it.
    fn attach(&mut self, stage: &str, idx: usize) {
        let old_holder = self.holder(stage);
        self.detach(stage);
        if stage == STAGE_CURRENT {
            if let Some(old) = old_holder.filter(|old| *old != idx) {
                self.detach(STAGE_PREVIOUS);
                self.versions[old].stages.push(STAGE_PREVIOUS.to_string());
            }
        }
        self.versions[idx].stages.push(stage.to_string());
    }

    /// Drop the oldest unlabeled versions beyond the retention limit.
    fn prune(&mut self) {
        let unlabeled = self.versions.iter().filter(|v| v.stages.is_empty()).count();
        let mut excess = unlabeled.saturating_sub(MAX_DEPRECATED_VERSIONS);
        if excess == 0 {
            return;
        }
        self.versions.sort_by_key(|v| v.created_at);
        self.versions.retain(|v| {
            if excess > 0 && v.stages.is_empty() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    fn metadata(&self, name: &str) -> SecretMetadata {
        SecretMetadata {
            name: Some(name.to_string()),
            rotation_enabled: self.rotation_enabled,
            versions: self
                .versions
                .iter()
                .map(|v| (v.id.clone(), v.stages.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalSecretStore {
    path: PathBuf,
}

impl LocalSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn load(&self) -> Result<StoreFile, StoreError> {
        if !self.path.exists() {
            return Ok(StoreFile::default());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;
        toml::from_str(&content).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn save(&self, file: &StoreFile) -> Result<(), StoreError> {
        let content = toml::to_string_pretty(file).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            reason: format!("serialize: {}", e),
        })?;
        store_fs::write_atomic(&self.path, content.as_bytes(), STORE_FILE_MODE)
            .map_err(|e| self.io_err(e))
    }

    fn lock(&self) -> Result<FileLock, StoreError> {
        store_fs::ensure_parent_dir(&self.path).map_err(|e| self.io_err(e))?;
        FileLock::acquire(&self.path).map_err(|e| self.io_err(e))
    }

    fn read<R>(&self, f: impl FnOnce(&StoreFile) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let _lock = self.lock()?;
        let file = self.load()?;
        f(&file)
    }

    fn modify<R>(
        &self,
        f: impl FnOnce(&mut StoreFile) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let _lock = self.lock()?;
        let mut file = self.load()?;
        let out = f(&mut file)?;
        self.save(&file)?;
        Ok(out)
    }

    /// Seed a new secret whose first version is AWSCURRENT. Returns the version id.
    pub fn create_secret(
        &self,
        secret_id: &str,
        secret_string: &str,
        rotation_enabled: bool,
    ) -> Result<String, StoreError> {
        check_size(secret_id, secret_string)?;
        let version_id = uuid::Uuid::new_v4().to_string();
        self.modify(|file| {
            if file.secrets.contains_key(secret_id) {
                return Err(StoreError::InvalidRequest {
                    secret_id: secret_id.to_string(),
                    reason: "already exists".into(),
                });
            }
            let now = Utc::now();
            file.secrets.insert(
                secret_id.to_string(),
                StoredSecret {
                    rotation_enabled,
                    created_at: now,
                    versions: vec![StoredVersion {
                        id: version_id.clone(),
                        secret_string: secret_string.to_string(),
                        stages: vec![STAGE_CURRENT.to_string()],
                        created_at: now,
                    }],
                },
            );
            Ok(version_id.clone())
        })
    }

    pub fn set_rotation_enabled(&self, secret_id: &str, enabled: bool) -> Result<(), StoreError> {
        self.modify(|file| {
            secret_mut(file, secret_id)?.rotation_enabled = enabled;
            Ok(())
        })
    }

    pub fn list_secrets(&self) -> Result<Vec<String>, StoreError> {
        self.read(|file| Ok(file.secrets.keys().cloned().collect()))
    }
}

fn check_size(secret_id: &str, secret_string: &str) -> Result<(), StoreError> {
    if secret_string.len() > MAX_SECRET_SIZE {
        return Err(StoreError::InvalidRequest {
            secret_id: secret_id.to_string(),
            reason: format!(
                "secret string is {} bytes, max {}",
                secret_string.len(),
                MAX_SECRET_SIZE
            ),
        });
    }
    Ok(())
}

fn not_found(secret_id: &str, what: impl Into<String>) -> StoreError {
    StoreError::NotFound {
        secret_id: secret_id.to_string(),
        what: what.into(),
    }
}

fn secret_ref<'a>(file: &'a StoreFile, secret_id: &str) -> Result<&'a StoredSecret, StoreError> {
    file.secrets
        .get(secret_id)
        .ok_or_else(|| not_found(secret_id, "secret"))
}

fn secret_mut<'a>(
    file: &'a mut StoreFile,
    secret_id: &str,
) -> Result<&'a mut StoredSecret, StoreError> {
    file.secrets
        .get_mut(secret_id)
        .ok_or_else(|| not_found(secret_id, "secret"))
}

impl LocalSecretStore {
    fn describe_now(&self, secret_id: &str) -> Result<SecretMetadata, StoreError> {
        self.read(|file| Ok(secret_ref(file, secret_id)?.metadata(secret_id)))
    }

    fn value_now(
        &self,
        secret_id: &str,
        version_id: Option<&str>,
        stage: Option<&str>,
    ) -> Result<SecretValue, StoreError> {
        self.read(|file| {
            let secret = secret_ref(file, secret_id)?;
            let idx = match (version_id, stage) {
                (Some(id), stage) => {
                    let idx = secret
                        .position(id)
                        .ok_or_else(|| not_found(secret_id, format!("version {}", id)))?;
                    if let Some(stage) = stage {
                        if !secret.versions[idx].stages.iter().any(|s| s == stage) {
                            return Err(not_found(
                                secret_id,
                                format!("version {} with stage {}", id, stage),
                            ));
                        }
                    }
                    idx
                }
                (None, stage) => {
                    let stage = stage.unwrap_or(STAGE_CURRENT);
                    secret
                        .holder(stage)
                        .ok_or_else(|| not_found(secret_id, format!("stage {}", stage)))?
                }
            };
            let version = &secret.versions[idx];
            Ok(SecretValue {
                version_id: version.id.clone(),
                secret_string: Zeroizing::new(version.secret_string.clone()),
            })
        })
    }

    fn put_now(
        &self,
        secret_id: &str,
        token: &str,
        secret_string: &str,
        stages: &[&str],
    ) -> Result<(), StoreError> {
        check_size(secret_id, secret_string)?;
        self.modify(|file| {
            let secret = secret_mut(file, secret_id)?;
            if let Some(idx) = secret.position(token) {
                if secret.versions[idx].secret_string == secret_string {
                    return Ok(());
                }
                return Err(StoreError::InvalidRequest {
                    secret_id: secret_id.to_string(),
                    reason: format!("version {} already exists with a different value", token),
                });
            }
            secret.versions.push(StoredVersion {
                id: token.to_string(),
                secret_string: secret_string.to_string(),
                stages: Vec::new(),
                created_at: Utc::now(),
            });
            let idx = secret.versions.len() - 1;
            let stages: &[&str] = if stages.is_empty() {
                &[STAGE_CURRENT]
            } else {
                stages
            };
            for stage in stages {
                secret.attach(stage, idx);
            }
            secret.prune();
            Ok(())
        })
    }

    fn update_stage_now(
        &self,
        secret_id: &str,
        stage: &str,
        move_to: Option<&str>,
        remove_from: Option<&str>,
    ) -> Result<(), StoreError> {
        self.modify(|file| {
            let secret = secret_mut(file, secret_id)?;
            let invalid = |reason: String| StoreError::InvalidRequest {
                secret_id: secret_id.to_string(),
                reason,
            };

            let holder = secret.holder(stage).map(|idx| secret.versions[idx].id.clone());
            if let Some(remove_from) = remove_from {
                if secret.position(remove_from).is_none() {
                    return Err(not_found(secret_id, format!("version {}", remove_from)));
                }
                if holder.as_deref() != Some(remove_from) {
                    return Err(invalid(format!(
                        "stage {} is not attached to version {}",
                        stage, remove_from
                    )));
                }
            }

            match move_to {
                Some(move_to) => {
                    let idx = secret
                        .position(move_to)
                        .ok_or_else(|| not_found(secret_id, format!("version {}", move_to)))?;
                    if let Some(holder) = holder.as_deref() {
                        if holder != move_to && remove_from.is_none() {
                            return Err(invalid(format!(
                                "stage {} is attached to version {}; remove_from is required",
                                stage, holder
                            )));
                        }
                    }
                    secret.attach(stage, idx);
                }
                None => {
                    if stage == STAGE_CURRENT {
                        return Err(invalid(format!("cannot detach {} without a target", stage)));
                    }
                    if remove_from.is_some() {
                        secret.detach(stage);
                    }
                }
            }
            secret.prune();
            Ok(())
        })
    }
}

/// Runs `f` on the blocking pool; the lock and file I/O must not stall the runtime.
async fn off_runtime<R, F>(store: &LocalSecretStore, f: F) -> Result<R, StoreError>
where
    R: Send + 'static,
    F: FnOnce(&LocalSecretStore) -> Result<R, StoreError> + Send + 'static,
{
    let owned = store.clone();
    tokio::task::spawn_blocking(move || f(&owned))
        .await
        .map_err(|e| store.io_err(std::io::Error::other(e)))?
}

#[async_trait]
impl SecretStore for LocalSecretStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn describe_secret(&self, secret_id: &str) -> Result<SecretMetadata, StoreError> {
        let secret_id = secret_id.to_string();
        off_runtime(self, move |store| store.describe_now(&secret_id)).await
    }

    async fn get_secret_value(
        &self,
        secret_id: &str,
        version_id: Option<&str>,
        stage: Option<&str>,
    ) -> Result<SecretValue, StoreError> {
        let secret_id = secret_id.to_string();
        let version_id = version_id.map(str::to_string);
        let stage = stage.map(str::to_string);
        off_runtime(self, move |store| {
            store.value_now(&secret_id, version_id.as_deref(), stage.as_deref())
        })
        .await
    }

    async fn put_secret_value(
        &self,
        secret_id: &str,
        token: &str,
        secret_string: &str,
        stages: &[&str],
    ) -> Result<(), StoreError> {
        let secret_id = secret_id.to_string();
        let token = token.to_string();
        let secret_string = Zeroizing::new(secret_string.to_string());
        let stages: Vec<String> = stages.iter().map(|s| s.to_string()).collect();
        off_runtime(self, move |store| {
            let stages: Vec<&str> = stages.iter().map(String::as_str).collect();
            store.put_now(&secret_id, &token, &secret_string, &stages)
        })
        .await
    }

    async fn update_version_stage(
        &self,
        secret_id: &str,
        stage: &str,
        move_to: Option<&str>,
        remove_from: Option<&str>,
    ) -> Result<(), StoreError> {
        let secret_id = secret_id.to_string();
        let stage = stage.to_string();
        let move_to = move_to.map(str::to_string);
        let remove_from = remove_from.map(str::to_string);
        off_runtime(self, move |store| {
            store.update_stage_now(&secret_id, &stage, move_to.as_deref(), remove_from.as_deref())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::STAGE_PENDING;
    use tempfile::TempDir;

    fn store() -> (TempDir, LocalSecretStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalSecretStore::new(dir.path().join("secrets.toml"));
        (dir, store)
    }

    const SECRET: &str = r#"{"username":"ETL_USER","password":"old-password"}"#;

    #[tokio::test]
    async fn test_create_and_read_current() {
        let (_dir, store) = store();
        let v1 = store.create_secret("snowflake/etl", SECRET, true).unwrap();
        let value = store.get_secret_value("snowflake/etl", None, None).await.unwrap();
        assert_eq!(value.version_id, v1);
        assert_eq!(value.secret_string.as_str(), SECRET);

        let meta = store.describe_secret("snowflake/etl").await.unwrap();
        assert!(meta.rotation_enabled);
        assert_eq!(meta.current_version(), Some(v1.as_str()));
    }

    #[tokio::test]
    async fn test_create_twice_rejected() {
        let (_dir, store) = store();
        store.create_secret("s", SECRET, true).unwrap();
        assert!(store.create_secret("s", SECRET, true).is_err());
    }

    #[tokio::test]
    async fn test_missing_secret_is_not_found() {
        let (_dir, store) = store();
        let err = store.describe_secret("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_pending_lookup_requires_stage() {
        let (_dir, store) = store();
        store.create_secret("s", SECRET, true).unwrap();
        let err = store
            .get_secret_value("s", Some("t1"), Some(STAGE_PENDING))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        store
            .put_secret_value("s", "t1", "{}", &[STAGE_PENDING])
            .await
            .unwrap();
        let value = store
            .get_secret_value("s", Some("t1"), Some(STAGE_PENDING))
            .await
            .unwrap();
        assert_eq!(value.version_id, "t1");
        assert!(store
            .get_secret_value("s", Some("t1"), Some(STAGE_CURRENT))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_put_is_idempotent_per_token() {
        let (_dir, store) = store();
        store.create_secret("s", SECRET, true).unwrap();
        store.put_secret_value("s", "t1", "a", &[STAGE_PENDING]).await.unwrap();
        store.put_secret_value("s", "t1", "a", &[STAGE_PENDING]).await.unwrap();
        assert!(store
            .put_secret_value("s", "t1", "b", &[STAGE_PENDING])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_moving_current_marks_previous() {
        let (_dir, store) = store();
        let v1 = store.create_secret("s", SECRET, true).unwrap();
        store.put_secret_value("s", "t1", "new", &[STAGE_PENDING]).await.unwrap();
        store
            .update_version_stage("s", STAGE_CURRENT, Some("t1"), Some(&v1))
            .await
            .unwrap();

        let meta = store.describe_secret("s").await.unwrap();
        assert_eq!(meta.current_version(), Some("t1"));
        assert_eq!(meta.previous_version(), Some(v1.as_str()));
        assert!(meta.has_stage("t1", STAGE_PENDING));

        store
            .update_version_stage("s", STAGE_PENDING, None, Some("t1"))
            .await
            .unwrap();
        let meta = store.describe_secret("s").await.unwrap();
        assert!(meta.pending_versions().is_empty());
    }

    #[tokio::test]
    async fn test_moving_current_back_swaps_previous() {
        let (_dir, store) = store();
        let v1 = store.create_secret("s", SECRET, true).unwrap();
        store.put_secret_value("s", "t1", "new", &[STAGE_CURRENT]).await.unwrap();
        store
            .update_version_stage("s", STAGE_CURRENT, Some(&v1), Some("t1"))
            .await
            .unwrap();
        let meta = store.describe_secret("s").await.unwrap();
        assert_eq!(meta.current_version(), Some(v1.as_str()));
        assert_eq!(meta.previous_version(), Some("t1"));
        assert_eq!(meta.versions_with_stage(STAGE_PREVIOUS).len(), 1);
    }

    #[tokio::test]
    async fn test_move_requires_remove_from_when_attached_elsewhere() {
        let (_dir, store) = store();
        store.create_secret("s", SECRET, true).unwrap();
        store.put_secret_value("s", "t1", "new", &[STAGE_PENDING]).await.unwrap();
        let err = store
            .update_version_stage("s", STAGE_CURRENT, Some("t1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_remove_from_wrong_version_rejected() {
        let (_dir, store) = store();
        store.create_secret("s", SECRET, true).unwrap();
        store.put_secret_value("s", "t1", "new", &[STAGE_PENDING]).await.unwrap();
        let err = store
            .update_version_stage("s", STAGE_CURRENT, Some("t1"), Some("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_unlabeled_versions_pruned() {
        let (_dir, store) = store();
        let mut current = store.create_secret("s", SECRET, true).unwrap();
        for i in 0..(MAX_DEPRECATED_VERSIONS + 5) {
            let token = format!("t{}", i);
            store
                .put_secret_value("s", &token, &format!("v{}", i), &[STAGE_PENDING])
                .await
                .unwrap();
            store
                .update_version_stage("s", STAGE_CURRENT, Some(&token), Some(&current))
                .await
                .unwrap();
            store
                .update_version_stage("s", STAGE_PENDING, None, Some(&token))
                .await
                .unwrap();
            current = token;
        }
        let meta = store.describe_secret("s").await.unwrap();
        let unlabeled = meta.versions.values().filter(|s| s.is_empty()).count();
        assert_eq!(unlabeled, MAX_DEPRECATED_VERSIONS);
        assert_eq!(meta.current_version(), Some(current.as_str()));
    }

    #[tokio::test]
    async fn test_rotation_flag_and_listing() {
        let (_dir, store) = store();
        store.create_secret("b", SECRET, true).unwrap();
        store.create_secret("a", SECRET, false).unwrap();
        assert_eq!(store.list_secrets().unwrap(), vec!["a", "b"]);
        store.set_rotation_enabled("a", true).unwrap();
        assert!(store.describe_secret("a").await.unwrap().rotation_enabled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_serialize() {
        let (_dir, store) = store();
        store.create_secret("s", SECRET, true).unwrap();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .put_secret_value("s", &format!("t{}", i), &format!("v{}", i), &[])
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let meta = store.describe_secret("s").await.unwrap();
        assert_eq!(meta.versions.len(), 9);
        assert_eq!(meta.versions_with_stage(STAGE_CURRENT).len(), 1);
        assert_eq!(meta.versions_with_stage(STAGE_PREVIOUS).len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_reported() {
        let (_dir, store) = store();
        fs::write(store.path(), "secrets = 12\n[").unwrap();
        let err = store.describe_secret("s").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
