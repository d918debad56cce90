use std::{
    fs::Permissions,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};

use super::crypto::CertKeyPair;
use crate::error::{ClassifyError, FailureKind};

pub const CERT_FILE_NAME: &str = "tls.crt";
pub const KEY_FILE_NAME: &str = "tls.key";
const FILE_MODE: u32 = 0o600;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read {}", path.display()))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to open {} for writing", path.display()))]
    CreateFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write {}", path.display()))]
    WriteFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to restrict permissions of {}", path.display()))]
    SetPermissions {
        source: std::io::Error,
        path: PathBuf,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ClassifyError for Error {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Error::ReadFile { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                FailureKind::NotFound
            }
            Error::ReadFile { .. } => FailureKind::Fatal,
            Error::CreateFile { .. } => FailureKind::Fatal,
            Error::WriteFile { .. } => FailureKind::Fatal,
            Error::SetPermissions { .. } => FailureKind::Fatal,
        }
    }
}

/// Persistence for the serving certificate that the webhook server picks up.
#[async_trait]
pub trait ServerCertStorage: Send + Sync {
    /// Fails if either half of the pair is missing.
    async fn load(&self) -> Result<CertKeyPair>;
    async fn save(&self, pair: &CertKeyPair) -> Result<()>;
}

/// Stores the pair as `tls.crt` and `tls.key` in the operator's certificate mount.
#[derive(Debug, Clone)]
pub struct FsServerCertStorage {
    cert_dir: PathBuf,
}

impl FsServerCertStorage {
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
        }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(CERT_FILE_NAME)
    }

    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(KEY_FILE_NAME)
    }
}

async fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)
        .await
        .context(CreateFileSnafu { path })?;
    file.write_all(contents)
        .await
        .context(WriteFileSnafu { path })?;
    // tokio finishes writes in the background unless flushed
    file.flush().await.context(WriteFileSnafu { path })?;
    // `mode` only applies when the file is created, older files may have been looser
    tokio::fs::set_permissions(path, Permissions::from_mode(FILE_MODE))
        .await
        .context(SetPermissionsSnafu { path })
}

#[async_trait]
impl ServerCertStorage for FsServerCertStorage {
    async fn load(&self) -> Result<CertKeyPair> {
        let cert_path = self.cert_path();
        let cert_pem = tokio::fs::read(&cert_path)
            .await
            .context(ReadFileSnafu { path: cert_path })?;
        let key_path = self.key_path();
        let key_pem = tokio::fs::read(&key_path)
            .await
            .context(ReadFileSnafu { path: key_path })?;
        Ok(CertKeyPair { cert_pem, key_pem })
    }

    async fn save(&self, pair: &CertKeyPair) -> Result<()> {
        write_private_file(&self.cert_path(), &pair.cert_pem).await?;
        write_private_file(&self.key_path(), &pair.key_pem).await
    }
}
