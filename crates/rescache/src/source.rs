//! # Resource Sources
//!
//! The upstream side of the cache: anything that can open a byte stream for
//! a resource identifier. The engine treats openers as opaque capabilities
//! handed in by the caller.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode, header};
use rustls::ClientConfig;
use rustls::crypto::aws_lc_rs;
use rustls_platform_verifier::BuilderVerifierExt;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

use crate::error::{CacheError, CacheResult};

/// Stream of upstream chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = CacheResult<Bytes>> + Send>>;

/// An opened upstream resource together with what the source knows about it
pub struct OpenedResource {
    pub stream: ByteStream,
    /// Declared length, if the source knows it
    pub size_hint: Option<u64>,
    pub mime_type: Option<String>,
    pub resource_name: Option<String>,
    /// Reference to the describing metadata record
    pub metacard_ref: Option<String>,
}

impl OpenedResource {
    pub fn new(stream: impl Stream<Item = CacheResult<Bytes>> + Send + 'static) -> Self {
        Self {
            stream: Box::pin(stream),
            size_hint: None,
            mime_type: None,
            resource_name: None,
            metacard_ref: None,
        }
    }

    /// A resource that is already fully in memory.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let len = data.len() as u64;
        Self::new(stream::once(async move { Ok(data) })).with_size_hint(len)
    }

    pub fn with_size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_resource_name(mut self, name: impl Into<String>) -> Self {
        self.resource_name = Some(name.into());
        self
    }

    pub fn with_metacard_ref(mut self, metacard_ref: impl Into<String>) -> Self {
        self.metacard_ref = Some(metacard_ref.into());
        self
    }
}

impl fmt::Debug for OpenedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedResource")
            .field("size_hint", &self.size_hint)
            .field("mime_type", &self.mime_type)
            .field("resource_name", &self.resource_name)
            .field("metacard_ref", &self.metacard_ref)
            .finish_non_exhaustive()
    }
}

/// Opens the upstream byte stream of a resource.
///
/// Implementations report a missing resource as
/// [`CacheError::ResourceNotFound`] and any other failure as
/// [`CacheError::SourceUnavailable`]. Retrying is up to the implementation.
#[async_trait]
pub trait SourceOpener: Send + Sync {
    async fn open(&self, resource_id: &str) -> CacheResult<OpenedResource>;
}

#[async_trait]
impl<T: SourceOpener + ?Sized> SourceOpener for Arc<T> {
    async fn open(&self, resource_id: &str) -> CacheResult<OpenedResource> {
        (**self).open(resource_id).await
    }
}

/// Serves files below a root directory.
#[derive(Debug, Clone)]
pub struct FileSourceOpener {
    root: PathBuf,
    chunk_size: usize,
}

impl FileSourceOpener {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: 64 * 1024,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn resolve_path(&self, resource_id: &str) -> Option<PathBuf> {
        let relative = Path::new(resource_id);
        let confined = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        confined.then(|| self.root.join(relative))
    }
}

#[async_trait]
impl SourceOpener for FileSourceOpener {
    async fn open(&self, resource_id: &str) -> CacheResult<OpenedResource> {
        let path = self
            .resolve_path(resource_id)
            .ok_or_else(|| CacheError::ResourceNotFound(resource_id.to_string()))?;

        let file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CacheError::ResourceNotFound(resource_id.to_string()),
            _ => CacheError::SourceUnavailable(format!("{}: {e}", path.display())),
        })?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| CacheError::SourceUnavailable(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(CacheError::ResourceNotFound(resource_id.to_string()));
        }

        debug!(path = %path.display(), size = meta.len(), "Opened local resource");
        let stream = ReaderStream::with_capacity(file, self.chunk_size)
            .map(|chunk| chunk.map_err(|e| CacheError::SourceUnavailable(e.to_string())));

        let mut opened = OpenedResource::new(stream).with_size_hint(meta.len());
        if let Some(name) = path.file_name() {
            opened = opened.with_resource_name(name.to_string_lossy());
        }
        if let Some(mime) = guess_mime_type(&path) {
            opened = opened.with_mime_type(mime);
        }
        Ok(opened)
    }
}

fn guess_mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "pdf" => "application/pdf",
        "json" => "application/json",
        "xml" => "application/xml",
        "zip" => "application/zip",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "nitf" | "ntf" => "application/octet-stream",
        _ => return None,
    };
    Some(mime)
}

/// Create a reqwest Client suitable for resource downloads
pub fn create_client(timeout: Duration, connect_timeout: Duration) -> CacheResult<Client> {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CacheError::Config(format!("TLS protocol versions: {e}")))?
        .with_platform_verifier()
        .map_err(|e| CacheError::Config(format!("platform certificate verifier: {e}")))?
        .with_no_client_auth();

    let mut builder = Client::builder()
        .user_agent(concat!("rescache/", env!("CARGO_PKG_VERSION")))
        .pool_max_idle_per_host(5)
        .use_preconfigured_tls(tls_config);
    if !timeout.is_zero() {
        builder = builder.timeout(timeout);
    }
    if !connect_timeout.is_zero() {
        builder = builder.connect_timeout(connect_timeout);
    }
    builder
        .build()
        .map_err(|e| CacheError::Config(format!("failed to build HTTP client: {e}")))
}

/// Fetches resources over HTTP(S).
///
/// With a base URL, resource ids are joined onto it; otherwise each id must
/// be an absolute URL.
#[derive(Debug, Clone)]
pub struct HttpSourceOpener {
    client: Client,
    base_url: Option<Url>,
}

impl HttpSourceOpener {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    fn resource_url(&self, resource_id: &str) -> CacheResult<Url> {
        let parsed = match &self.base_url {
            Some(base) => base.join(resource_id),
            None => Url::parse(resource_id),
        };
        parsed.map_err(|e| CacheError::ResourceNotFound(format!("{resource_id}: {e}")))
    }
}

#[async_trait]
impl SourceOpener for HttpSourceOpener {
    async fn open(&self, resource_id: &str) -> CacheResult<OpenedResource> {
        let url = self.resource_url(resource_id)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| CacheError::SourceUnavailable(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(CacheError::ResourceNotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(CacheError::SourceUnavailable(format!(
                "{url}: server returned status code {status}"
            )));
        }

        let header_str = |name: header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        let mime_type = header_str(header::CONTENT_TYPE);
        let resource_name = header_str(header::CONTENT_DISPOSITION)
            .as_deref()
            .and_then(parse_content_disposition)
            .or_else(|| {
                url.path_segments()
                    .and_then(|mut s| s.next_back())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
            });
        let size_hint = response.content_length();

        debug!(url = %url, size = ?size_hint, mime = ?mime_type, "Opened HTTP resource");
        let stream = response.bytes_stream().map(|chunk| chunk.map_err(CacheError::from));
        let mut opened = OpenedResource::new(stream);
        opened.size_hint = size_hint;
        opened.mime_type = mime_type;
        opened.resource_name = resource_name;
        Ok(opened)
    }
}

/// Extract the file name from a `Content-Disposition` header value.
pub fn parse_content_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';').map(str::trim) {
        if let Some(ext) = part.strip_prefix("filename*=") {
            // RFC 5987: charset'lang'value
            let name = ext.splitn(3, '\'').nth(2).unwrap_or(ext);
            if !name.is_empty() {
                return Some(name.trim_matches('"').to_string());
            }
        } else if let Some(name) = part.strip_prefix("filename=") {
            let name = name.trim_matches('"');
            if !name.is_empty() {
                plain = Some(name.to_string());
            }
        }
    }
    plain
}

/// Named set of source openers owned by the caller.
#[derive(Default)]
pub struct SourceRegistry {
    sources: RwLock<HashMap<String, Arc<dyn SourceOpener>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `opener` under `source_id`, returning the opener it replaced.
    pub fn register_source(
        &self,
        source_id: impl Into<String>,
        opener: Arc<dyn SourceOpener>,
    ) -> Option<Arc<dyn SourceOpener>> {
        let source_id = source_id.into();
        debug!(source_id = %source_id, "Registered source");
        self.sources.write().insert(source_id, opener)
    }

    pub fn unregister_source(&self, source_id: &str) -> Option<Arc<dyn SourceOpener>> {
        debug!(source_id, "Unregistered source");
        self.sources.write().remove(source_id)
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn SourceOpener>> {
        self.sources.read().get(source_id).cloned()
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.source_ids())
            .finish()
    }
}
