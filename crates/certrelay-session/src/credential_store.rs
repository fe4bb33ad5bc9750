//! Persisted authentication state for the messaging session.
//!
//! [`FileCredentialStore`] keeps a multi-file layout under one directory:
//! `creds.json` for device credentials and one JSON file per signal key.
//! Saves merge: key ids absent from a snapshot keep their files, and a `null`
//! value removes the key.
//! Deleting the directory forces a fresh pairing on the next connect.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use certrelay_core::write_json_atomic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::messaging_client::AuthState;

const CREDS_FILE_NAME: &str = "creds.json";
const KEY_FILE_PREFIX: &str = "key-";

/// Loads and saves the authentication state of the messaging session.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<AuthState>;

    async fn save(&self, state: &AuthState) -> Result<()>;

    /// Human-readable location used in operator-facing log lines.
    fn location(&self) -> String;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKeyFile {
    id: String,
    value: Value,
}

#[derive(Debug, Clone)]
/// Directory-backed credential store.
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        self.dir.as_path()
    }

    /// Deletes every persisted credential. Returns false when nothing existed.
    pub fn clear(&self) -> Result<bool> {
        if !self.dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&self.dir)
            .with_context(|| format!("failed to remove {}", self.dir.display()))?;
        Ok(true)
    }

    fn load_blocking(dir: &Path) -> Result<AuthState> {
        if !dir.exists() {
            return Ok(AuthState::default());
        }

        let mut state = AuthState::default();
        let creds_path = dir.join(CREDS_FILE_NAME);
        if creds_path.is_file() {
            let raw = std::fs::read_to_string(&creds_path)
                .with_context(|| format!("failed to read {}", creds_path.display()))?;
            let creds = serde_json::from_str::<Value>(&raw)
                .with_context(|| format!("failed to parse {}", creds_path.display()))?;
            state.creds = Some(creds);
        }

        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to list {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
            let path = entry.path();
            if !is_key_file(&path) {
                continue;
            }
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let stored = serde_json::from_str::<StoredKeyFile>(&raw)
                .with_context(|| format!("failed to parse key file {}", path.display()))?;
            state.keys.insert(stored.id, stored.value);
        }
        Ok(state)
    }

    fn save_blocking(dir: &Path, state: &AuthState) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        if let Some(creds) = &state.creds {
            write_json_atomic(&dir.join(CREDS_FILE_NAME), creds)?;
        }

        for (id, value) in &state.keys {
            let path = dir.join(key_file_name(id));
            if value.is_null() {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                    Err(error) => {
                        return Err(error)
                            .with_context(|| format!("failed to remove key {}", path.display()))
                    }
                }
                continue;
            }
            let stored = StoredKeyFile {
                id: id.clone(),
                value: value.clone(),
            };
            write_json_atomic(&path, &stored)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<AuthState> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || Self::load_blocking(&dir))
            .await
            .context("credential load task failed")?
    }

    async fn save(&self, state: &AuthState) -> Result<()> {
        let dir = self.dir.clone();
        let state = state.clone();
        tokio::task::spawn_blocking(move || Self::save_blocking(&dir, &state))
            .await
            .context("credential save task failed")?
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Percent-escapes every byte outside `[A-Za-z0-9._-]` so distinct ids never share a file.
fn key_file_name(id: &str) -> String {
    let mut encoded = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("{KEY_FILE_PREFIX}{encoded}.json")
}

fn is_key_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(KEY_FILE_PREFIX) && name.ends_with(".json"))
}

/// Sequential background writer for credential snapshots.
///
/// Snapshots are queued without awaiting the write, so the connection event
/// loop never blocks on disk I/O; writes land in submission order.
pub(crate) struct CredentialWriter {
    tx: mpsc::UnboundedSender<AuthState>,
    task: JoinHandle<()>,
}

impl CredentialWriter {
    pub(crate) fn spawn(store: Arc<dyn CredentialStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuthState>();
        let task = tokio::spawn(async move {
            while let Some(state) = rx.recv().await {
                match store.save(&state).await {
                    Ok(()) => debug!(location = %store.location(), "persisted credential update"),
                    Err(error) => warn!(
                        location = %store.location(),
                        error = %format!("{error:#}"),
                        "failed to persist credential update"
                    ),
                }
            }
        });
        Self { tx, task }
    }

    pub(crate) fn submit(&self, state: AuthState) {
        if self.tx.send(state).is_err() {
            warn!("credential writer stopped; dropping credential update");
        }
    }

    /// Flushes queued snapshots and stops the writer.
    pub(crate) async fn finish(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::bridge_client::parse_bridge_event_frame;
    use crate::messaging_client::ConnectionEvent;

    fn sample_state() -> AuthState {
        let mut keys = BTreeMap::new();
        keys.insert("pre-key:1".to_string(), json!({"public": "AAA"}));
        keys.insert("session/15551234567.0".to_string(), json!({"chain": 3}));
        AuthState {
            creds: Some(json!({"registered": true, "me": {"id": "15550001111:7"}})),
            keys,
        }
    }

    #[tokio::test]
    async fn unit_load_missing_directory_returns_empty_state() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = FileCredentialStore::new(tempdir.path().join("auth"));
        let state = store.load().await.expect("load");
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn functional_save_then_load_preserves_creds_and_keys_with_unsafe_ids() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = FileCredentialStore::new(tempdir.path().join("auth"));
        let state = sample_state();
        store.save(&state).await.expect("save");

        assert!(tempdir.path().join("auth").join("creds.json").is_file());
        assert!(tempdir
            .path()
            .join("auth")
            .join("key-session%2F15551234567.0.json")
            .is_file());

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn functional_null_key_value_removes_persisted_key() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = FileCredentialStore::new(tempdir.path().join("auth"));
        store.save(&sample_state()).await.expect("first save");

        let mut removal = BTreeMap::new();
        removal.insert("pre-key:1".to_string(), Value::Null);
        removal.insert("never-stored".to_string(), Value::Null);
        store
            .save(&AuthState { creds: None, keys: removal })
            .await
            .expect("removal save");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.keys.len(), 1);
        assert!(loaded.keys.contains_key("session/15551234567.0"));
        assert!(!tempdir
            .path()
            .join("auth")
            .join("key-pre-key%3A1.json")
            .exists());
    }

    #[tokio::test]
    async fn regression_creds_only_update_keeps_persisted_keys() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = FileCredentialStore::new(tempdir.path().join("auth"));
        store.save(&sample_state()).await.expect("initial save");

        let events = parse_bridge_event_frame(
            r#"{"type":"creds.update","creds":{"registered":true,"nextPreKeyId":2}}"#,
        )
        .expect("parse creds-only frame");
        let [ConnectionEvent::CredentialsUpdated(update)] = events.as_slice() else {
            panic!("expected a single credentials update, got {events:?}");
        };
        store.save(update).await.expect("creds-only save");

        let loaded = store.load().await.expect("load");
        assert_eq!(
            loaded.creds,
            Some(json!({"registered": true, "nextPreKeyId": 2}))
        );
        assert_eq!(loaded.keys, sample_state().keys);
    }

    #[tokio::test]
    async fn regression_key_ids_differing_only_in_punctuation_do_not_collide() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = FileCredentialStore::new(tempdir.path().join("auth"));
        let mut keys = BTreeMap::new();
        keys.insert("pre-key:1".to_string(), json!({"slot": "colon"}));
        keys.insert("pre-key/1".to_string(), json!({"slot": "slash"}));
        keys.insert("pre-key_1".to_string(), json!({"slot": "underscore"}));
        keys.insert("pre-key%3A1".to_string(), json!({"slot": "percent"}));
        let state = AuthState { creds: None, keys };
        store.save(&state).await.expect("save");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.keys, state.keys);
    }

    #[test]
    fn unit_key_file_name_escapes_reserved_bytes() {
        assert_eq!(key_file_name("pre-key.1_a"), "key-pre-key.1_a.json");
        assert_eq!(key_file_name("pre-key:1"), "key-pre-key%3A1.json");
        assert_eq!(key_file_name("pre-key/1"), "key-pre-key%2F1.json");
        assert_eq!(key_file_name("100%"), "key-100%25.json");
        assert_eq!(key_file_name("é"), "key-%C3%A9.json");
    }

    #[tokio::test]
    async fn regression_load_reports_corrupt_creds_file() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let dir = tempdir.path().join("auth");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("creds.json"), "{not json").expect("write");
        let store = FileCredentialStore::new(&dir);
        let error = store.load().await.expect_err("corrupt creds");
        assert!(format!("{error:#}").contains("failed to parse"));
    }

    #[test]
    fn unit_clear_removes_directory_and_reports_absence() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let dir = tempdir.path().join("auth");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("creds.json"), "{}").expect("write");
        let store = FileCredentialStore::new(&dir);
        assert!(store.clear().expect("clear"));
        assert!(!dir.exists());
        assert!(!store.clear().expect("clear again"));
    }

    #[tokio::test]
    async fn functional_writer_persists_snapshots_in_submission_order() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FileCredentialStore::new(tempdir.path().join("auth")));
        let writer = CredentialWriter::spawn(store.clone());
        for step in 0..5 {
            writer.submit(AuthState {
                creds: Some(json!({"step": step})),
                keys: BTreeMap::from([(format!("pre-key:{step}"), json!({"step": step}))]),
            });
        }
        writer.finish().await;

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.creds, Some(json!({"step": 4})));
        assert_eq!(loaded.keys.len(), 5);
    }
}
