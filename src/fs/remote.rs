use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use opendal::layers::{RetryLayer, TimeoutLayer};
use opendal::{services, Entry, Operator};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use crate::fs::backend::{BackendType, ObjectStore};
use crate::fs::local::parse_md5;
use crate::fs::types::{ObjectBody, RemoteObject};

/// Exponential-backoff policy applied to every store request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first one.
    pub max_attempts: usize,
    /// Upper bound for a single attempt.
    pub try_timeout: Duration,
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Cap for any single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            try_timeout: Duration::from_secs(120),
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wrap an operator so each attempt is timed out and failed attempts are retried.
    pub fn apply(&self, operator: Operator) -> Operator {
        operator
            .layer(
                TimeoutLayer::new()
                    .with_timeout(self.try_timeout)
                    .with_io_timeout(self.try_timeout),
            )
            .layer(
                RetryLayer::new()
                    .with_max_times(self.max_attempts.saturating_sub(1))
                    .with_min_delay(self.min_delay)
                    .with_max_delay(self.max_delay)
                    .with_jitter(),
            )
    }
}

/// How a Google Drive store authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GdriveAuth {
    /// A fixed token. It is never refreshed, so it must outlive the run.
    AccessToken(String),
    /// An OAuth refresh token with the client it was issued to.
    RefreshToken {
        refresh_token: String,
        client_id: String,
        client_secret: String,
    },
}

enum Layout {
    /// Containers are top-level directories of one operator (S3, GCS, Drive, local).
    Prefixed(Operator),
    /// One operator per configured container (Azure Blob).
    PerContainer(BTreeMap<String, Operator>),
}

/// Object store backed by OpenDAL operators.
pub struct OpendalStore {
    layout: Layout,
    backend: BackendType,
}

impl OpendalStore {
    /// Azure Blob Storage with shared-key credentials.
    ///
    /// OpenDAL cannot enumerate the containers of an account, so the
    /// containers this store serves must be named up front.
    pub fn new_azblob(
        account_name: &str,
        account_key: &str,
        endpoint: Option<&str>,
        containers: &[String],
        retry: &RetryPolicy,
    ) -> Result<Self> {
        let endpoint = endpoint
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", account_name));

        let mut operators = BTreeMap::new();
        for container in containers {
            let builder = services::Azblob::default()
                .container(container)
                .endpoint(&endpoint)
                .account_name(account_name)
                .account_key(account_key);
            let operator = Operator::new(builder)
                .with_context(|| format!("Failed to configure Azure container {}", container))?
                .finish();
            operators.insert(container.clone(), retry.apply(operator));
        }

        Ok(Self {
            layout: Layout::PerContainer(operators),
            backend: BackendType::Azblob {
                account: account_name.to_string(),
            },
        })
    }

    /// S3 or S3-compatible storage. Credentials fall back to the AWS chain when absent.
    pub fn new_s3(
        bucket: &str,
        region: &str,
        endpoint: Option<&str>,
        credentials: Option<(&str, &str)>,
        retry: &RetryPolicy,
    ) -> Result<Self> {
        let mut builder = services::S3::default().bucket(bucket).region(region);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint(endpoint);
        }
        if let Some((access_key, secret_key)) = credentials {
            builder = builder
                .access_key_id(access_key)
                .secret_access_key(secret_key);
        }

        let operator = Operator::new(builder)
            .context("Failed to configure S3 store")?
            .finish();

        Ok(Self {
            layout: Layout::Prefixed(retry.apply(operator)),
            backend: BackendType::S3 {
                bucket: bucket.to_string(),
                region: region.to_string(),
            },
        })
    }

    /// Google Cloud Storage. Uses Application Default Credentials without a key file.
    pub fn new_gcs(bucket: &str, credential_path: Option<&str>, retry: &RetryPolicy) -> Result<Self> {
        let mut builder = services::Gcs::default().bucket(bucket);
        if let Some(path) = credential_path {
            builder = builder.credential_path(path);
        }

        let operator = Operator::new(builder)
            .context("Failed to configure GCS store")?
            .finish();

        Ok(Self {
            layout: Layout::Prefixed(retry.apply(operator)),
            backend: BackendType::Gcs {
                bucket: bucket.to_string(),
            },
        })
    }

    /// Google Drive. Containers are the folders directly below `root`.
    pub fn new_gdrive(root: &str, auth: &GdriveAuth, retry: &RetryPolicy) -> Result<Self> {
        let builder = services::Gdrive::default().root(root);
        let builder = match auth {
            GdriveAuth::AccessToken(token) => builder.access_token(token),
            GdriveAuth::RefreshToken {
                refresh_token,
                client_id,
                client_secret,
            } => builder
                .refresh_token(refresh_token)
                .client_id(client_id)
                .client_secret(client_secret),
        };

        let operator = Operator::new(builder)
            .context("Failed to configure Google Drive store")?
            .finish();

        Ok(Self {
            layout: Layout::Prefixed(retry.apply(operator)),
            backend: BackendType::Gdrive {
                root: root.to_string(),
            },
        })
    }

    /// Local directory whose subdirectories act as containers.
    pub fn new_fs(root: &str, retry: &RetryPolicy) -> Result<Self> {
        let builder = services::Fs::default().root(root);
        let operator = Operator::new(builder)
            .with_context(|| format!("Failed to open local store at {}", root))?
            .finish();

        Ok(Self {
            layout: Layout::Prefixed(retry.apply(operator)),
            backend: BackendType::Fs {
                root: root.to_string(),
            },
        })
    }

    /// Operator and listing directory for a container.
    fn container_dir(&self, container: &str) -> Result<(&Operator, String)> {
        match &self.layout {
            Layout::Prefixed(op) => Ok((op, format!("{}/", container.trim_matches('/')))),
            Layout::PerContainer(ops) => ops
                .get(container)
                .map(|op| (op, String::new()))
                .ok_or_else(|| anyhow!("Container {} is not configured for this store", container)),
        }
    }

    /// Operator and path prefix of a container, for streaming access outside the trait.
    pub fn container_operator(&self, container: &str) -> Result<(Operator, String)> {
        let (op, dir) = self.container_dir(container)?;
        Ok((op.clone(), dir))
    }

    fn object_path(&self, container: &str, key: &str) -> Result<(&Operator, String)> {
        let (op, dir) = self.container_dir(container)?;
        Ok((op, format!("{}{}", dir, key)))
    }

    async fn remote_object(
        op: &Operator,
        container: &str,
        dir: &str,
        entry: Entry,
    ) -> Result<Option<RemoteObject>> {
        let path = entry.path().to_string();
        let mut meta = entry.metadata().clone();
        if !meta.mode().is_file() {
            return Ok(None);
        }

        // Some services only return names from list calls
        if meta.last_modified().is_none() {
            meta = op
                .stat(&path)
                .await
                .with_context(|| format!("Failed to stat {}", path))?;
        }

        let key = path.strip_prefix(dir).unwrap_or(&path).to_string();
        // ETags are not MD5s in general (multipart uploads, SSE-KMS/SSE-C)
        let content_md5 = meta.content_md5().and_then(parse_md5);
        let hash = meta
            .content_md5()
            .or(meta.etag())
            .map(|h| h.trim_matches('"').to_string())
            .unwrap_or_default();

        Ok(Some(RemoteObject {
            container: container.to_string(),
            key,
            last_modified: meta.last_modified().and_then(|t| parse_store_time(&t)),
            content_hash: hash,
            content_md5,
            size: meta.content_length(),
        }))
    }
}

/// Part size for uploads, so no file is ever held in memory whole.
pub(crate) const UPLOAD_CHUNK: usize = 8 * 1024 * 1024;

/// Stream a local file to `path` in `chunk`-sized parts. Returns the byte count.
///
/// A failed part aborts the writer so no partial object is left behind.
pub(crate) async fn upload_file(op: &Operator, path: &str, local: &Path, chunk: usize) -> Result<u64> {
    let mut file = tokio::fs::File::open(local)
        .await
        .with_context(|| format!("Failed to open {}", local.display()))?;
    let mut writer = op
        .writer_with(path)
        .chunk(chunk)
        .await
        .with_context(|| format!("Failed to start upload of {}", path))?;

    let mut size = 0u64;
    let mut buf = vec![0u8; chunk];
    loop {
        let n = match file.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                let _ = writer.abort().await;
                return Err(e).with_context(|| format!("Failed to read {}", local.display()));
            }
        };
        if n == 0 {
            break;
        }
        if let Err(e) = writer.write(buf[..n].to_vec()).await {
            let _ = writer.abort().await;
            return Err(e).with_context(|| format!("Failed to upload {}", path));
        }
        size += n as u64;
    }
    writer
        .close()
        .await
        .with_context(|| format!("Failed to finish upload of {}", path))?;
    Ok(size)
}

/// Store timestamps are normalized through their textual form.
fn parse_store_time(value: &impl std::fmt::Display) -> Option<DateTime<Utc>> {
    let text = value.to_string();
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f UTC")
                .ok()
                .map(|n| n.and_utc())
        })
}

#[async_trait]
impl ObjectStore for OpendalStore {
    async fn list_containers(&self) -> Result<Vec<String>> {
        match &self.layout {
            Layout::PerContainer(ops) => Ok(ops.keys().cloned().collect()),
            Layout::Prefixed(op) => {
                let entries = op.list("/").await.context("Failed to list containers")?;
                let mut names: Vec<String> = entries
                    .into_iter()
                    .filter(|e| e.metadata().mode().is_dir())
                    .map(|e| e.path().trim_matches('/').to_string())
                    .filter(|name| !name.is_empty())
                    .collect();
                names.sort();
                Ok(names)
            }
        }
    }

    fn list_objects<'a>(&'a self, container: &'a str) -> BoxStream<'a, Result<RemoteObject>> {
        let (op, dir) = match self.container_dir(container) {
            Ok(target) => target,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let list_dir = if dir.is_empty() { "/".to_string() } else { dir.clone() };

        stream::once(async move {
            op.lister_with(&list_dir)
                .recursive(true)
                .await
                .with_context(|| format!("Failed to list container {}", container))
        })
        .map_ok(|lister| {
            lister.map_err(|e| anyhow::Error::new(e).context("Failed to read listing page"))
        })
        .try_flatten()
        .try_filter_map(move |entry| {
            let dir = dir.clone();
            async move { Self::remote_object(op, container, &dir, entry).await }
        })
        .boxed()
    }

    async fn fetch(&self, container: &str, key: &str) -> Result<ObjectBody> {
        let (op, path) = self.object_path(container, key)?;
        let reader = op
            .reader(&path)
            .await
            .with_context(|| format!("Failed to open {}", self.display_path(container, key)))?;
        let stream = reader
            .into_bytes_stream(..)
            .await
            .with_context(|| format!("Failed to read {}", self.display_path(container, key)))?;

        Ok(ObjectBody {
            stream: stream.boxed(),
            size: None,
        })
    }

    async fn put_file(&self, container: &str, key: &str, local: &Path) -> Result<u64> {
        let (op, path) = self.object_path(container, key)?;
        upload_file(op, &path, local, UPLOAD_CHUNK)
            .await
            .with_context(|| format!("Failed to upload {}", self.display_path(container, key)))
    }

    async fn delete_prefix(&self, container: &str, prefix: &str) -> Result<()> {
        let keys: Vec<String> = self
            .list_objects(container)
            .try_filter(|obj| futures::future::ready(obj.key.starts_with(prefix)))
            .map_ok(|obj| obj.key)
            .try_collect()
            .await?;

        for key in keys {
            let (op, path) = self.object_path(container, &key)?;
            op.delete(&path)
                .await
                .with_context(|| format!("Failed to delete {}", self.display_path(container, &key)))?;
        }
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        self.backend.clone()
    }

    fn display_path(&self, container: &str, key: &str) -> String {
        match &self.backend {
            BackendType::Azblob { account } => format!("azblob://{}/{}/{}", account, container, key),
            BackendType::S3 { bucket, .. } => format!("s3://{}/{}/{}", bucket, container, key),
            BackendType::Gcs { bucket } => format!("gs://{}/{}/{}", bucket, container, key),
            BackendType::Gdrive { root } => match root.trim_matches('/') {
                "" => format!("gdrive://{}/{}", container, key),
                root => format!("gdrive://{}/{}/{}", root, container, key),
            },
            BackendType::Fs { root } => format!("{}/{}/{}", root.trim_end_matches('/'), container, key),
            BackendType::Memory => format!("{}/{}", container, key),
        }
    }
}
