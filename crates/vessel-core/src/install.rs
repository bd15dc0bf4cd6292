//! Resolves manifest entries to installed artifacts, downloading them when
//! missing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::config::{Config, UnpackVerification, ENV_IGNORE_HASHES};
use crate::error::{is_cancelled, ArtifactError, SourceFailure};
use crate::fetch::{FetchError, Fetcher};
use crate::hash::ArtifactHash;
use crate::manifest::{Entry, ManifestManager, QueryOptions, SelectOptions};
use crate::overrides::OverrideTable;
use crate::platform::Platform;
use crate::store::ArtifactStore;
use crate::tree_hash::GitTreeHasher;
use crate::usage::UsageLog;

/// Lookup options for [`Installer::ensure_installed`].
pub type InstallOptions = QueryOptions;

/// Result of a single download attempt that did not fail fatally.
enum Attempt {
    Installed,
    Transport(String),
}

#[derive(Clone)]
pub struct Installer {
    store: ArtifactStore,
    manifests: ManifestManager,
    fetcher: Arc<dyn Fetcher>,
    pkg_server: Option<String>,
    ignore_hashes: bool,
    unpack_verification: UnpackVerification,
}

impl Installer {
    #[must_use]
    pub fn new(store: ArtifactStore, manifests: ManifestManager, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            store,
            manifests,
            fetcher,
            pkg_server: None,
            ignore_hashes: false,
            unpack_verification: UnpackVerification::platform_default(),
        }
    }

    /// Wire up the store, manifests and overrides described by `config`.
    pub fn from_config(config: &Config, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let overrides = Arc::new(OverrideTable::load(&config.depots)?);
        let store = ArtifactStore::new(
            config.depots.clone(),
            Arc::new(GitTreeHasher),
            overrides.clone(),
        )?;
        let usage = config.primary_depot().map(|depot| UsageLog::for_depot(depot));
        let manifests = ManifestManager::new(overrides, usage);
        Ok(Self::new(store, manifests, fetcher)
            .with_pkg_server(config.pkg_server.clone())
            .with_ignore_hashes(config.ignore_hashes)
            .with_unpack_verification(config.unpack_verification))
    }

    #[must_use]
    pub fn with_pkg_server(mut self, pkg_server: Option<String>) -> Self {
        self.pkg_server = pkg_server.map(|s| s.trim_end_matches('/').to_string());
        self
    }

    #[must_use]
    pub fn with_ignore_hashes(mut self, ignore_hashes: bool) -> Self {
        self.ignore_hashes = ignore_hashes;
        self
    }

    #[must_use]
    pub fn with_unpack_verification(mut self, verification: UnpackVerification) -> Self {
        self.unpack_verification = verification;
        self
    }

    #[must_use]
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    #[must_use]
    pub fn manifests(&self) -> &ManifestManager {
        &self.manifests
    }

    /// Install the artifact bound to `name` for the requested platform and
    /// return its path.
    pub fn ensure_installed(
        &self,
        name: &str,
        manifest_path: &Path,
        options: &InstallOptions,
    ) -> Result<PathBuf> {
        let Some(entry) = self.manifests.meta(name, manifest_path, options)? else {
            return Err(ArtifactError::NotFound {
                name: name.to_string(),
                manifest: manifest_path.to_path_buf(),
                platform: Some(options.platform.clone()),
            }
            .into());
        };
        self.ensure_entry_installed(name, &entry, manifest_path, &options.platform)
    }

    /// Install an already-resolved entry: the mirror first, then each
    /// download source in order.
    ///
    /// Transport failures move on to the next source. A source whose content
    /// does not hash to the entry's hash fails the whole request with
    /// [`ArtifactError::HashMismatch`].
    pub fn ensure_entry_installed(
        &self,
        name: &str,
        entry: &Entry,
        manifest_path: &Path,
        platform: &Platform,
    ) -> Result<PathBuf> {
        let hash = &entry.hash;
        if self.store.overrides().lookup(hash).is_some() || self.store.exists(hash) {
            return Ok(self.store.path(hash, true));
        }

        let mut failures = Vec::new();
        if let Some(server) = &self.pkg_server {
            let url = format!("{server}/artifact/{hash}");
            match self.try_download(hash, &url, None) {
                Ok(Attempt::Installed) => return Ok(self.store.path(hash, true)),
                Ok(Attempt::Transport(reason)) => {
                    warn!(name, %hash, url = %url, %reason, "mirror download failed");
                    failures.push(SourceFailure { url, reason });
                }
                Err(err) if aborts_install(&err) => return Err(err),
                Err(err) => {
                    warn!(name, %hash, url = %url, error = %err, "mirror download rejected");
                    failures.push(SourceFailure {
                        url,
                        reason: err.to_string(),
                    });
                }
            }
        }

        if entry.downloads.is_empty() {
            return Err(ArtifactError::NoDownloadSource {
                name: name.to_string(),
                hash: *hash,
            }
            .into());
        }

        for source in &entry.downloads {
            match self.try_download(hash, &source.url, Some(&source.sha256)) {
                Ok(Attempt::Installed) => return Ok(self.store.path(hash, true)),
                Ok(Attempt::Transport(reason)) => {
                    warn!(name, %hash, url = %source.url, %reason, "download source failed");
                    failures.push(SourceFailure {
                        url: source.url.clone(),
                        reason,
                    });
                }
                Err(err) if aborts_install(&err) => return Err(err),
                Err(err) => {
                    warn!(name, %hash, url = %source.url, error = %err, "download source rejected");
                    failures.push(SourceFailure {
                        url: source.url.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        debug!(name, manifest = %manifest_path.display(), "every download source failed");
        Err(ArtifactError::DownloadsExhausted {
            name: name.to_string(),
            hash: *hash,
            platform: entry.platform.as_ref().map(|_| platform.clone()),
            failures,
        }
        .into())
    }

    /// Download `url` and install it as `hash`.
    ///
    /// Returns `Ok(false)` when the transfer itself failed; content that does
    /// not hash to `hash` is an error unless hash checks are disabled.
    pub fn download_artifact(
        &self,
        hash: &ArtifactHash,
        url: &str,
        tarball_sha256: Option<&str>,
    ) -> Result<bool> {
        match self.try_download(hash, url, tarball_sha256)? {
            Attempt::Installed => Ok(true),
            Attempt::Transport(reason) => {
                warn!(%hash, url, %reason, "artifact download failed");
                Ok(false)
            }
        }
    }

    /// Install every eager entry (or every entry with `include_lazy`) that
    /// applies to the requested platform.
    pub fn ensure_all_installed(
        &self,
        manifest_path: &Path,
        options: &SelectOptions,
    ) -> Result<BTreeMap<String, PathBuf>> {
        let mut installed = BTreeMap::new();
        for (name, entry) in self.manifests.select_downloadable(manifest_path, options)? {
            let path = self.ensure_entry_installed(&name, &entry, manifest_path, &options.platform)?;
            installed.insert(name, path);
        }
        Ok(installed)
    }

    fn try_download(
        &self,
        hash: &ArtifactHash,
        url: &str,
        tarball_sha256: Option<&str>,
    ) -> Result<Attempt> {
        if self.store.exists(hash) {
            return Ok(Attempt::Installed);
        }
        info!(%hash, url, "downloading artifact");
        let staged = match self.store.stage(|dir| {
            self.fetcher
                .fetch_and_unpack(url, tarball_sha256, dir)
                .map_err(anyhow::Error::from)
        }) {
            Ok(staged) => staged,
            Err(err) if is_cancelled(&err) => return Err(ArtifactError::Cancelled.into()),
            Err(err) => {
                return match err.downcast::<FetchError>() {
                    Ok(fetch) => Ok(Attempt::Transport(fetch.to_string())),
                    Err(other) => Err(other),
                };
            }
        };

        match self.unpack_verification {
            UnpackVerification::TrustExpected => {
                warn!(%hash, url, "tree hash verification skipped; trusting manifest hash");
            }
            UnpackVerification::Verify => {
                let actual = self.store.tree_hash(staged.path())?;
                if actual != *hash {
                    if !self.ignore_hashes {
                        return Err(ArtifactError::HashMismatch {
                            expected: *hash,
                            actual,
                        }
                        .into());
                    }
                    error!(
                        expected = %hash,
                        %actual,
                        url,
                        "tree hash mismatch; installing under the expected hash because {ENV_IGNORE_HASHES}=1"
                    );
                }
            }
        }
        let path = self.store.commit(staged, hash)?;
        info!(%hash, path = %path.display(), "artifact installed");
        Ok(Attempt::Installed)
    }
}

/// Cancellation and content that hashes to something else end the request
/// instead of moving on to the next source.
fn aborts_install(err: &anyhow::Error) -> bool {
    is_cancelled(err)
        || matches!(
            err.downcast_ref::<ArtifactError>(),
            Some(ArtifactError::HashMismatch { .. })
        )
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("store", &self.store)
            .field("pkg_server", &self.pkg_server)
            .field("ignore_hashes", &self.ignore_hashes)
            .field("unpack_verification", &self.unpack_verification)
            .finish_non_exhaustive()
    }
}
