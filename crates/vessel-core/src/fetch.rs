//! Download-and-unpack of artifact tarballs.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;
use url::Url;

const USER_AGENT: &str = concat!("vessel/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("download cancelled")]
    Cancelled,
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported url scheme '{scheme}' in {url}")]
    UnsupportedScheme { url: String, scheme: String },
    #[error("failed to fetch {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected status {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("sha256 mismatch for {url} (expected {expected}, got {actual})")]
    Checksum {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("failed to unpack {}: {reason}", .archive.display())]
    Unpack { archive: PathBuf, reason: String },
    #[error("i/o error while fetching {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: io::Error,
    },
}

/// Shared flag that aborts in-flight downloads and unpacks.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), FetchError> {
        if self.is_cancelled() {
            Err(FetchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Retrieves a tarball and unpacks it into an existing directory.
pub trait Fetcher: Send + Sync {
    /// Fetch `url`, check its sha256 when one is given, and unpack the
    /// archive into `dest`.
    fn fetch_and_unpack(&self, url: &str, sha256: Option<&str>, dest: &Path)
        -> Result<(), FetchError>;
}

/// `http(s)://` and `file://` fetcher backed by a blocking reqwest client.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: Client,
    cancel: CancelFlag,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client()?,
            cancel: CancelFlag::new(),
        })
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    fn open(&self, url: &str) -> Result<Box<dyn Read>, FetchError> {
        let parsed = Url::parse(url).map_err(|err| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        match parsed.scheme() {
            "http" | "https" => {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .map_err(|source| FetchError::Http {
                        url: url.to_string(),
                        source,
                    })?;
                let status = response.status();
                if !status.is_success() {
                    return Err(FetchError::Status {
                        url: url.to_string(),
                        status: status.as_u16(),
                    });
                }
                Ok(Box::new(response))
            }
            "file" => {
                let path = parsed.to_file_path().map_err(|()| FetchError::InvalidUrl {
                    url: url.to_string(),
                    reason: "not a local path".to_string(),
                })?;
                let file = File::open(&path).map_err(|source| FetchError::Io {
                    url: url.to_string(),
                    source,
                })?;
                Ok(Box::new(file))
            }
            other => Err(FetchError::UnsupportedScheme {
                url: url.to_string(),
                scheme: other.to_string(),
            }),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch_and_unpack(
        &self,
        url: &str,
        sha256: Option<&str>,
        dest: &Path,
    ) -> Result<(), FetchError> {
        self.cancel.check()?;
        let io_err = |source| FetchError::Io {
            url: url.to_string(),
            source,
        };
        let scratch = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(scratch).map_err(io_err)?;

        let mut reader = self.open(url)?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut buffer = [0u8; 64 * 1024];
        loop {
            self.cancel.check()?;
            let read = reader.read(&mut buffer).map_err(io_err)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            tmp.write_all(&buffer[..read]).map_err(io_err)?;
            written += read as u64;
        }

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = sha256 {
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(FetchError::Checksum {
                    url: url.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        debug!(url, bytes = written, sha256 = %actual, "downloaded artifact tarball");

        tmp.flush().map_err(io_err)?;
        unpack_tarball(tmp.path(), dest, &self.cancel)
    }
}

/// Unpack a tar archive, gzip-compressed or not, into `dest`. Entries that
/// would land outside `dest` are rejected.
pub fn unpack_tarball(archive: &Path, dest: &Path, cancel: &CancelFlag) -> Result<(), FetchError> {
    let unpack_err = |reason: String| FetchError::Unpack {
        archive: archive.to_path_buf(),
        reason,
    };
    let mut file = File::open(archive).map_err(|err| unpack_err(err.to_string()))?;
    let mut magic = [0u8; 2];
    let compressed = match file.read_exact(&mut magic) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(err) => return Err(unpack_err(err.to_string())),
    };
    file.seek(SeekFrom::Start(0))
        .map_err(|err| unpack_err(err.to_string()))?;
    let reader: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);
    let entries = tar.entries().map_err(|err| unpack_err(err.to_string()))?;
    for entry in entries {
        cancel.check()?;
        let mut entry = entry.map_err(|err| unpack_err(err.to_string()))?;
        let entry_path = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let inside = entry
            .unpack_in(dest)
            .map_err(|err| unpack_err(format!("{entry_path}: {err}")))?;
        if !inside {
            return Err(unpack_err(format!(
                "entry {entry_path} escapes the destination"
            )));
        }
    }
    Ok(())
}

fn http_client() -> anyhow::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .no_proxy()
        .build()
        .context("failed to build http client")
}
