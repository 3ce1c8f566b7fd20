use crate::config::ArtifactConfig;
use reqwest::blocking::Client;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const UPLOAD_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("The resource already exists: {0}")]
    AlreadyExists(String),
    #[error("Invalid artifact name: {0}")]
    InvalidName(String),
    #[error("artifact io error: {0}")]
    Io(String),
    #[error("Failed to upload report: {status} {body}")]
    Upstream { status: u16, body: String },
    #[error("artifact transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Write-once blob storage for rendered reports.
pub trait ArtifactStore: Send + Sync {
    /// Stores the object and returns its public URL. Existing objects are never replaced.
    fn put(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<String, ArtifactError>;
    fn public_url(&self, name: &str) -> String;
    fn get(&self, name: &str) -> Result<Option<StoredArtifact>, ArtifactError>;
}

pub fn from_config(config: &ArtifactConfig) -> Result<Arc<dyn ArtifactStore>, ArtifactError> {
    match config {
        ArtifactConfig::Fs {
            dir,
            public_base_url,
        } => Ok(Arc::new(FsArtifactStore::new(dir.clone(), public_base_url.clone())?)),
        ArtifactConfig::Http {
            storage_url,
            bucket,
            service_key,
        } => Ok(Arc::new(HttpArtifactStore::new(
            storage_url.clone(),
            bucket.clone(),
            service_key.clone(),
        )?)),
    }
}

fn validate_name(name: &str) -> Result<(), ArtifactError> {
    let ok = !name.is_empty()
        && name.len() <= 200
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(ArtifactError::InvalidName(name.to_string()))
    }
}

pub fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("txt") => "text/plain; charset=utf-8",
        Some("html") => "text/html; charset=utf-8",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Local directory store; objects are served back by the HTTP server.
pub struct FsArtifactStore {
    dir: PathBuf,
    public_base_url: String,
}

impl FsArtifactStore {
    pub fn new(dir: PathBuf, public_base_url: String) -> Result<Self, ArtifactError> {
        fs::create_dir_all(&dir).map_err(|e| {
            ArtifactError::Io(format!("Failed to create {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, name: &str, bytes: &[u8], _content_type: &str) -> Result<String, ArtifactError> {
        validate_name(name)?;
        let path = self.dir.join(name);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(ArtifactError::AlreadyExists(name.to_string()))
            }
            Err(e) => return Err(ArtifactError::Io(format!("Failed to create {name}: {e}"))),
        };
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| ArtifactError::Io(format!("Failed to write {name}: {e}")))?;
        Ok(self.public_url(name))
    }

    fn public_url(&self, name: &str) -> String {
        format!("{}/reports/{}", self.public_base_url, name)
    }

    fn get(&self, name: &str) -> Result<Option<StoredArtifact>, ArtifactError> {
        validate_name(name)?;
        match fs::read(self.dir.join(name)) {
            Ok(bytes) => Ok(Some(StoredArtifact {
                bytes,
                content_type: content_type_for(name).to_string(),
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ArtifactError::Io(format!("Failed to read {name}: {e}"))),
        }
    }
}

/// Object-storage store speaking the `/object/<bucket>/<name>` convention.
pub struct HttpArtifactStore {
    client: Client,
    storage_url: String,
    bucket: String,
    service_key: String,
}

impl HttpArtifactStore {
    pub fn new(storage_url: String, bucket: String, service_key: String) -> Result<Self, ArtifactError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .build()
            .map_err(|e| ArtifactError::Transport(format!("Could not initialize HTTP client: {e}")))?;
        Ok(Self {
            client,
            storage_url: storage_url.trim_end_matches('/').to_string(),
            bucket,
            service_key,
        })
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}/object/{}/{}", self.storage_url, self.bucket, name)
    }
}

impl ArtifactStore for HttpArtifactStore {
    fn put(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<String, ArtifactError> {
        validate_name(name)?;
        let response = self
            .client
            .post(self.object_url(name))
            .bearer_auth(&self.service_key)
            .header("content-type", content_type)
            .header("cache-control", "max-age=3600")
            .header("x-upsert", "false")
            .body(bytes.to_vec())
            .send()
            .map_err(|e| ArtifactError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 409 {
            return Err(ArtifactError::AlreadyExists(name.to_string()));
        }
        if !status.is_success() {
            return Err(ArtifactError::Upstream {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        Ok(self.public_url(name))
    }

    fn public_url(&self, name: &str) -> String {
        format!(
            "{}/object/public/{}/{}",
            self.storage_url, self.bucket, name
        )
    }

    fn get(&self, name: &str) -> Result<Option<StoredArtifact>, ArtifactError> {
        validate_name(name)?;
        let response = self
            .client
            .get(self.public_url(name))
            .send()
            .map_err(|e| ArtifactError::Transport(e.to_string()))?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ArtifactError::Upstream {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| content_type_for(name).to_string());
        let bytes = response
            .bytes()
            .map_err(|e| ArtifactError::Transport(e.to_string()))?;
        Ok(Some(StoredArtifact {
            bytes: bytes.to_vec(),
            content_type,
        }))
    }
}
