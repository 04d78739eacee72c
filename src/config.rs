//! Configuration file and environment overrides.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archive::{ArchiveVault, CompressionLevel};
use crate::fs::remote::{GdriveAuth, OpendalStore, RetryPolicy};
use crate::fs::types::{ContainerScope, ALL_CONTAINERS};
use crate::sync::throttle::BandwidthLimit;
use crate::sync::SyncConfig;

const STATE_FILE_NAME: &str = "sync_metadata.json";

/// A blob store, selected by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Azblob {
        #[serde(default)]
        account_name: String,
        #[serde(default)]
        account_key: String,
        #[serde(default)]
        endpoint: Option<String>,
        /// Containers served by this account. Required for `ALL`.
        #[serde(default)]
        containers: Vec<String>,
    },
    S3 {
        bucket: String,
        #[serde(default = "default_region")]
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
    },
    Gcs {
        bucket: String,
        #[serde(default)]
        credential_path: Option<String>,
    },
    Gdrive(GdriveConfig),
    Fs {
        root: PathBuf,
    },
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Google Drive over OAuth. Inline tokens win over the token files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GdriveConfig {
    /// Folder whose subfolders act as containers.
    #[serde(default = "default_gdrive_root")]
    pub root: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Saved OAuth token (`token.json`).
    #[serde(default)]
    pub token_path: Option<PathBuf>,
    /// OAuth client secrets (`credentials.json`) as downloaded from the console.
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
}

fn default_gdrive_root() -> String {
    "/".to_string()
}

#[derive(Debug, Default, Deserialize)]
struct TokenFile {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientFile {
    #[serde(default)]
    installed: Option<ClientSecrets>,
    #[serde(default)]
    web: Option<ClientSecrets>,
}

#[derive(Debug, Deserialize)]
struct ClientSecrets {
    client_id: String,
    client_secret: String,
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw = std::fs::read(path)
        .with_context(|| format!("Failed to read {}: {}", what, path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse {}: {}", what, path.display()))
}

impl GdriveConfig {
    /// Resolve credentials. A refresh token is preferred over an access token.
    pub fn auth(&self) -> Result<GdriveAuth> {
        let token: TokenFile = match &self.token_path {
            Some(path) => read_json(path, "Google token file")?,
            None => TokenFile::default(),
        };

        let Some(refresh_token) = self.refresh_token.clone().or(token.refresh_token) else {
            let access_token = self
                .access_token
                .clone()
                .or(token.access_token)
                .context("Google Drive needs an access_token or a refresh_token")?;
            return Ok(GdriveAuth::AccessToken(access_token));
        };

        let client = match &self.credentials_path {
            Some(path) => {
                let file: ClientFile = read_json(path, "Google credentials file")?;
                file.installed.or(file.web)
            }
            None => None,
        };
        let client_id = self
            .client_id
            .clone()
            .or_else(|| client.as_ref().map(|c| c.client_id.clone()))
            .context("Google Drive refresh_token needs a client_id")?;
        let client_secret = self
            .client_secret
            .clone()
            .or_else(|| client.as_ref().map(|c| c.client_secret.clone()))
            .context("Google Drive refresh_token needs a client_secret")?;

        Ok(GdriveAuth::RefreshToken {
            refresh_token,
            client_id,
            client_secret,
        })
    }
}

impl StoreConfig {
    /// Whether `ALL` can be resolved against this store.
    pub fn can_enumerate(&self) -> bool {
        match self {
            Self::Azblob { containers, .. } => !containers.is_empty(),
            _ => true,
        }
    }

    /// Build the store. `extra` names containers that must be reachable
    /// even if they are not in the configured list.
    pub fn build(&self, retry: &RetryPolicy, extra: &[String]) -> Result<OpendalStore> {
        match self {
            Self::Azblob {
                account_name,
                account_key,
                endpoint,
                containers,
            } => {
                if account_name.is_empty() || account_key.is_empty() {
                    bail!("Azure storage account configuration is incomplete");
                }
                let mut containers = containers.clone();
                for name in extra {
                    if !containers.contains(name) {
                        containers.push(name.clone());
                    }
                }
                OpendalStore::new_azblob(
                    account_name,
                    account_key,
                    endpoint.as_deref(),
                    &containers,
                    retry,
                )
            }
            Self::S3 {
                bucket,
                region,
                endpoint,
                access_key_id,
                secret_access_key,
            } => {
                let credentials = match (access_key_id, secret_access_key) {
                    (Some(key), Some(secret)) => Some((key.as_str(), secret.as_str())),
                    _ => None,
                };
                OpendalStore::new_s3(bucket, region, endpoint.as_deref(), credentials, retry)
            }
            Self::Gcs {
                bucket,
                credential_path,
            } => OpendalStore::new_gcs(bucket, credential_path.as_deref(), retry),
            Self::Gdrive(drive) => OpendalStore::new_gdrive(&drive.root, &drive.auth()?, retry),
            Self::Fs { root } => OpendalStore::new_fs(&root.to_string_lossy(), retry),
        }
    }

    fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>) {
        match self {
            Self::Azblob {
                account_name,
                account_key,
                ..
            } => {
                if let Some(v) = env("AZURE_ACCOUNT_NAME") {
                    *account_name = v;
                }
                if let Some(v) = env("AZURE_ACCOUNT_KEY") {
                    *account_key = v;
                }
            }
            Self::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => {
                if let Some(v) = env("AWS_ACCESS_KEY_ID") {
                    *access_key_id = Some(v);
                }
                if let Some(v) = env("AWS_SECRET_ACCESS_KEY") {
                    *secret_access_key = Some(v);
                }
            }
            Self::Gcs { credential_path, .. } => {
                if credential_path.is_none() {
                    *credential_path = env("GOOGLE_APPLICATION_CREDENTIALS");
                }
            }
            Self::Gdrive(drive) => {
                if drive.token_path.is_none() {
                    drive.token_path = env("GOOGLE_TOKEN_PATH").map(PathBuf::from);
                }
                if drive.credentials_path.is_none() {
                    drive.credentials_path = env("GOOGLE_CREDENTIALS_PATH").map(PathBuf::from);
                }
            }
            Self::Fs { .. } => {}
        }
    }
}

/// Retry settings in whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub try_timeout_secs: u64,
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            try_timeout_secs: policy.try_timeout.as_secs(),
            min_delay_secs: policy.min_delay.as_secs(),
            max_delay_secs: policy.max_delay.as_secs(),
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            try_timeout: Duration::from_secs(self.try_timeout_secs),
            min_delay: Duration::from_secs(self.min_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Local root; each container gets a subdirectory.
    pub backup_path: PathBuf,
    /// Defaults to `sync_metadata.json` inside `backup_path`.
    pub state_path: Option<PathBuf>,
    /// A container name, or `ALL`.
    pub container: String,
    pub fetch_concurrency: usize,
    pub container_concurrency: usize,
    pub max_in_flight: usize,
    /// 0 disables throttling.
    pub max_bytes_per_second: u64,
    pub verify_checksums: bool,
    /// Cancel a pass that runs longer than this. 0 disables the deadline.
    pub pass_timeout_secs: u64,
    pub retry: RetrySection,
}

impl Default for SyncSection {
    fn default() -> Self {
        let engine = SyncConfig::default();
        Self {
            backup_path: PathBuf::from("backups"),
            state_path: None,
            container: ALL_CONTAINERS.to_string(),
            fetch_concurrency: engine.fetch_concurrency,
            container_concurrency: engine.container_concurrency,
            max_in_flight: engine.max_in_flight,
            max_bytes_per_second: 0,
            verify_checksums: true,
            pass_timeout_secs: 0,
            retry: RetrySection::default(),
        }
    }
}

impl SyncSection {
    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| self.backup_path.join(STATE_FILE_NAME))
    }

    pub fn scope(&self) -> ContainerScope {
        ContainerScope::parse(&self.container)
    }

    pub fn pass_timeout(&self) -> Option<Duration> {
        (self.pass_timeout_secs > 0).then(|| Duration::from_secs(self.pass_timeout_secs))
    }

    pub fn engine_config(&self) -> SyncConfig {
        SyncConfig {
            scope: self.scope(),
            fetch_concurrency: self.fetch_concurrency,
            container_concurrency: self.container_concurrency,
            max_in_flight: self.max_in_flight,
            bandwidth_limit: BandwidthLimit::new(self.max_bytes_per_second),
            verify: self.verify_checksums,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSection {
    /// Where archives are kept. Archiving is disabled without it.
    pub store: Option<StoreConfig>,
    /// Container (or top-level prefix) of `store` holding the archives.
    pub container: String,
    /// Folder below `container`.
    pub folder: String,
    pub temp_dir: PathBuf,
    /// Archives older than this are deleted. 0 keeps everything.
    pub retention_days: u32,
    pub compression_level: u8,
}

impl Default for ArchiveSection {
    fn default() -> Self {
        Self {
            store: None,
            container: "backups".to_string(),
            folder: String::new(),
            temp_dir: std::env::temp_dir().join("blobvault"),
            retention_days: 7,
            compression_level: CompressionLevel::default().value(),
        }
    }
}

impl ArchiveSection {
    pub fn vault(&self, retry: &RetryPolicy) -> Result<ArchiveVault> {
        let store = self
            .store
            .as_ref()
            .context("No [archive] store configured")?;
        let built = store.build(retry, std::slice::from_ref(&self.container))?;
        let (op, prefix) = built.container_operator(&self.container)?;
        Ok(ArchiveVault::with_prefix(op, &prefix, &self.folder))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreSection {
    /// Store receiving restored objects; defaults to `[source]`.
    pub target: Option<StoreConfig>,
    pub temp_dir: PathBuf,
    pub replace_existing: bool,
    pub upload_concurrency: usize,
}

impl Default for RestoreSection {
    fn default() -> Self {
        Self {
            target: None,
            temp_dir: std::env::temp_dir().join("blobvault-restore"),
            replace_existing: false,
            upload_concurrency: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub interval_secs: u64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            interval_secs: 24 * 60 * 60,
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub source: StoreConfig,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub archive: ArchiveSection,
    #[serde(default)]
    pub restore: RestoreSection,
    #[serde(default)]
    pub daemon: DaemonSection,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Default config location: `<config dir>/blobvault/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Config directory not found")?;
    Ok(dir.join("blobvault").join("config.toml"))
}

impl Config {
    /// Read a config file and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_overrides(&|name| std::env::var(name).ok().filter(|v| !v.is_empty()))?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Config> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment-style overrides. `env` returns a variable's value.
    pub fn apply_overrides(&mut self, env: &dyn Fn(&str) -> Option<String>) -> Result<()> {
        self.source.apply_env(env);
        if let Some(store) = self.archive.store.as_mut() {
            store.apply_env(env);
        }
        if let Some(target) = self.restore.target.as_mut() {
            target.apply_env(env);
        }

        if let Some(v) = env("BLOBVAULT_CONTAINER").or_else(|| env("AZURE_CONTAINER_NAME")) {
            self.sync.container = v;
        }
        if let Some(v) = env("MAX_CONCURRENT_OPERATIONS") {
            self.sync.fetch_concurrency = v
                .trim()
                .parse()
                .with_context(|| format!("MAX_CONCURRENT_OPERATIONS is not a number: {}", v))?;
        }
        if let Some(v) = env("BACKUP_PATH") {
            self.sync.backup_path = PathBuf::from(v);
        }
        if let Some(v) = env("BACKUP_RETENTION_DAYS") {
            self.archive.retention_days = v
                .trim()
                .parse()
                .with_context(|| format!("BACKUP_RETENTION_DAYS is not a number: {}", v))?;
        }
        if let Some(v) = env("LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    /// Reject settings a pass could not run with.
    pub fn validate(&self) -> Result<()> {
        self.sync.engine_config().validate()?;
        if self.sync.container.trim().is_empty() {
            bail!("container name must not be empty");
        }
        if self.sync.scope().is_all() && !self.source.can_enumerate() {
            bail!(
                "container scope {} needs a `containers` list for this store",
                ALL_CONTAINERS
            );
        }
        if self.restore.upload_concurrency == 0 {
            bail!("upload concurrency must be at least 1");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.sync.retry.policy()
    }

    /// The configured source store.
    pub fn source_store(&self) -> Result<OpendalStore> {
        let extra = match self.sync.scope() {
            ContainerScope::Single(name) => vec![name],
            ContainerScope::All => Vec::new(),
        };
        self.source.build(&self.retry_policy(), &extra)
    }

    /// The restore target, falling back to the source store.
    pub fn restore_store(&self, containers: &[String]) -> Result<OpendalStore> {
        let target = self.restore.target.as_ref().unwrap_or(&self.source);
        target.build(&self.retry_policy(), containers)
    }

    pub fn compression_level(&self) -> CompressionLevel {
        CompressionLevel::new(self.archive.compression_level)
    }
}
