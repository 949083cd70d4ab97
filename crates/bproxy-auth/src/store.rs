use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use crate::credential::Credential;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("accounts directory {dir}: {source}")]
    Io {
        dir: String,
        #[source]
        source: std::io::Error,
    },
    #[error("credential file {path} could not be written: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// On-disk credential record: `{ id, email, token: { ... } }`.
/// Only the `token` object is rewritten on refresh.
#[derive(Debug, Serialize, Deserialize)]
struct CredentialFile {
    id: String,
    email: String,
    token: TokenRecord,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenRecord {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: i64,
    expiry_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
}

/// Loads and persists per-account credential files. One JSON file per
/// account; writes are atomic (temp file + rename in the same directory).
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads every credential file in the directory. A missing directory is
    /// created and treated as empty. Files that fail to parse are logged and
    /// skipped so one corrupt record cannot take the pool down.
    pub fn load_all(&self) -> Result<Vec<Credential>, StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            dir: self.dir.display().to_string(),
            source,
        })?;
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            dir: self.dir.display().to_string(),
            source,
        })?;

        let mut credentials = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                dir: self.dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match self.read_one(&path) {
                Ok(credential) => credentials.push(credential),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable credential file");
                }
            }
        }
        credentials.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(credentials)
    }

    fn read_one(&self, path: &Path) -> Result<Credential, Box<dyn std::error::Error>> {
        let raw = fs::read_to_string(path)?;
        let file: CredentialFile = serde_json::from_str(&raw)?;
        Ok(Credential {
            id: file.id,
            email: file.email,
            access_token: file.token.access_token,
            refresh_token: file.token.refresh_token,
            expires_at: file.token.expiry_timestamp,
            project_id: file.token.project_id,
            storage_path: path.to_path_buf(),
        })
    }

    /// Writes a brand-new credential record. The file is named after the
    /// credential id; the returned credential carries the storage path.
    pub fn create(&self, credential: &Credential) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            dir: self.dir.display().to_string(),
            source,
        })?;
        let path = self.dir.join(format!("{}.json", credential.id));
        let file = CredentialFile {
            id: credential.id.clone(),
            email: credential.email.clone(),
            token: TokenRecord {
                access_token: credential.access_token.clone(),
                refresh_token: credential.refresh_token.clone(),
                expires_in: 0,
                expiry_timestamp: credential.expires_at,
                project_id: credential.project_id.clone(),
            },
        };
        let body = serde_json::to_string_pretty(&file).unwrap_or_default();
        self.write_atomic(&path, body.as_bytes())?;
        Ok(path)
    }

    /// Rewrites only the token fields of an existing record: read, merge into
    /// the parsed document, write back. Sibling fields the current schema
    /// does not know about survive untouched.
    pub fn persist(&self, credential: &Credential) -> Result<(), StoreError> {
        let path = if credential.storage_path.as_os_str().is_empty() {
            self.dir.join(format!("{}.json", credential.id))
        } else {
            credential.storage_path.clone()
        };

        // A missing, unparseable, or non-object document is replaced by a
        // fresh root; anything else is merged in place.
        let mut doc: JsonValue = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .filter(JsonValue::is_object)
            .unwrap_or_else(|| {
                json!({
                    "id": credential.id,
                    "email": credential.email,
                })
            });

        let token = doc.as_object_mut().map(|root| {
            let token = root.entry("token").or_insert_with(|| json!({}));
            if !token.is_object() {
                *token = json!({});
            }
            token
        });
        if let Some(JsonValue::Object(token)) = token {
            token.insert("access_token".to_string(), json!(credential.access_token));
            token.insert("refresh_token".to_string(), json!(credential.refresh_token));
            token.insert("expiry_timestamp".to_string(), json!(credential.expires_at));
            if let Some(project_id) = credential.project_id.as_deref() {
                token.insert("project_id".to_string(), json!(project_id));
            }
        }

        let body = serde_json::to_string_pretty(&doc).unwrap_or_default();
        self.write_atomic(&path, body.as_bytes())
    }

    fn write_atomic(&self, path: &Path, body: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("json.tmp");
        let write = fs::write(&tmp, body).and_then(|_| fs::rename(&tmp, path));
        write.map_err(|source| StoreError::Write {
            path: path.display().to_string(),
            source,
        })
    }
}
