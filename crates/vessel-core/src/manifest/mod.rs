//! Artifact manifests: TOML files mapping names to content hashes, optionally
//! per platform, with the download sources for each entry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ArtifactError;
use crate::hash::ArtifactHash;
use crate::overrides::OverrideResolver;
use crate::platform::Platform;
use crate::usage::UsageLog;

mod io;

pub use io::{load_manifest, load_manifest_or_default, write_manifest};

/// Manifest names searched by [`find_artifacts_toml`], in precedence order.
pub const MANIFEST_NAMES: [&str; 2] = ["VesselArtifacts.toml", "Artifacts.toml"];

/// A tarball an entry can be installed from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DownloadSource {
    pub url: String,
    /// Hex sha256 of the tarball.
    pub sha256: String,
}

impl DownloadSource {
    #[must_use]
    pub fn new(url: impl Into<String>, sha256: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sha256: sha256.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub hash: ArtifactHash,
    pub lazy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    pub downloads: Vec<DownloadSource>,
}

impl Entry {
    #[must_use]
    pub fn new(hash: ArtifactHash) -> Self {
        Self {
            hash,
            lazy: false,
            platform: None,
            downloads: Vec::new(),
        }
    }
}

/// What a manifest name maps to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Binding {
    /// One entry used on every platform.
    Single(Entry),
    /// Platform-qualified entries, at most one per platform.
    Multi(Vec<Entry>),
}

impl Binding {
    /// The entry that applies to `platform`, if any.
    #[must_use]
    pub fn select(&self, platform: &Platform) -> Option<&Entry> {
        match self {
            Self::Single(entry) => Some(entry),
            Self::Multi(entries) => entries.iter().find(|entry| {
                entry
                    .platform
                    .as_ref()
                    .is_some_and(|candidate| candidate.matches(platform))
            }),
        }
    }

    fn entries_mut(&mut self) -> &mut [Entry] {
        match self {
            Self::Single(entry) => std::slice::from_mut(entry),
            Self::Multi(entries) => entries,
        }
    }
}

/// Decoded manifest, ordered by name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    bindings: BTreeMap<String, Binding>,
}

impl Manifest {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, binding: Binding) -> Option<Binding> {
        self.bindings.insert(name.into(), binding)
    }

    pub fn remove(&mut self, name: &str) -> Option<Binding> {
        self.bindings.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Binding)> {
        self.bindings.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct BindOptions {
    pub platform: Option<Platform>,
    pub downloads: Vec<DownloadSource>,
    pub lazy: bool,
    pub force: bool,
}

/// Lookup parameters shared by [`ManifestManager::meta`] and friends.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub platform: Platform,
    /// Package whose name-scoped overrides apply.
    pub pkg_context: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            platform: Platform::host(),
            pkg_context: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SelectOptions {
    pub platform: Platform,
    pub include_lazy: bool,
    pub pkg_context: Option<String>,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            platform: Platform::host(),
            include_lazy: false,
            pkg_context: None,
        }
    }
}

/// Reads and rewrites manifests, applying name overrides on the way out.
#[derive(Clone)]
pub struct ManifestManager {
    overrides: Arc<dyn OverrideResolver>,
    usage: Option<UsageLog>,
}

impl ManifestManager {
    #[must_use]
    pub fn new(overrides: Arc<dyn OverrideResolver>, usage: Option<UsageLog>) -> Self {
        Self { overrides, usage }
    }

    /// Write a mapping for `name`, creating the manifest if needed.
    ///
    /// Without `force`, an existing mapping for the same name (or the same
    /// platform within a multi-mapping) is an error. With `force`, binding a
    /// platform-qualified entry over an unqualified one (or the reverse)
    /// replaces the previous value entirely.
    pub fn bind(
        &self,
        manifest_path: &Path,
        name: &str,
        hash: ArtifactHash,
        options: BindOptions,
    ) -> Result<()> {
        let mut manifest = load_manifest_or_default(manifest_path)?;
        let BindOptions {
            platform,
            downloads,
            lazy,
            force,
        } = options;
        let entry = Entry {
            hash,
            lazy,
            platform: platform.clone(),
            downloads,
        };
        let already_bound = || ArtifactError::AlreadyBound {
            name: name.to_string(),
            manifest: manifest_path.to_path_buf(),
            platform: platform.clone(),
        };

        let binding = match (manifest.remove(name), &platform) {
            (None, None) => Binding::Single(entry),
            (None, Some(_)) => Binding::Multi(vec![entry]),
            (Some(_), _) if !force && platform.is_none() => return Err(already_bound().into()),
            (Some(_), None) => Binding::Single(entry),
            (Some(Binding::Single(_)), Some(_)) => {
                if !force {
                    return Err(already_bound().into());
                }
                Binding::Multi(vec![entry])
            }
            (Some(Binding::Multi(mut entries)), Some(target)) => {
                let clashes = entries
                    .iter()
                    .any(|existing| existing.platform.as_ref() == Some(target));
                if clashes && !force {
                    return Err(already_bound().into());
                }
                entries.retain(|existing| existing.platform.as_ref() != Some(target));
                entries.push(entry);
                Binding::Multi(entries)
            }
        };
        manifest.insert(name, binding);
        write_manifest(manifest_path, &manifest)?;
        debug!(name, %hash, manifest = %manifest_path.display(), "artifact bound");
        self.record_usage(manifest_path);
        Ok(())
    }

    /// Remove the mapping for `name`, or only its entry for `platform`.
    /// Absent names are not an error.
    pub fn unbind(
        &self,
        manifest_path: &Path,
        name: &str,
        platform: Option<&Platform>,
    ) -> Result<()> {
        if !manifest_path.exists() {
            return Ok(());
        }
        let mut manifest = load_manifest_or_default(manifest_path)?;
        let Some(binding) = manifest.remove(name) else {
            return Ok(());
        };
        match (binding, platform) {
            (_, None) => {}
            (Binding::Multi(mut entries), Some(target)) => {
                entries.retain(|entry| entry.platform.as_ref() != Some(target));
                if !entries.is_empty() {
                    manifest.insert(name, Binding::Multi(entries));
                }
            }
            (single @ Binding::Single(_), Some(_)) => {
                manifest.insert(name, single);
            }
        }
        write_manifest(manifest_path, &manifest)?;
        debug!(name, manifest = %manifest_path.display(), "artifact unbound");
        Ok(())
    }

    /// Entry for `name` applicable to the requested platform. A missing
    /// manifest file binds nothing.
    pub fn meta(
        &self,
        name: &str,
        manifest_path: &Path,
        options: &QueryOptions,
    ) -> Result<Option<Entry>> {
        let manifest = load_manifest_or_default(manifest_path)?;
        Ok(manifest.get(name).and_then(|binding| {
            self.resolve(name, binding, &options.platform, options.pkg_context.as_deref())
        }))
    }

    /// Tree hash bound to `name` for the requested platform.
    pub fn artifact_hash(
        &self,
        name: &str,
        manifest_path: &Path,
        options: &QueryOptions,
    ) -> Result<Option<ArtifactHash>> {
        Ok(self
            .meta(name, manifest_path, options)?
            .map(|entry| entry.hash))
    }

    /// Every applicable entry, skipping lazy ones unless asked for.
    pub fn select_downloadable(
        &self,
        manifest_path: &Path,
        options: &SelectOptions,
    ) -> Result<BTreeMap<String, Entry>> {
        let manifest = load_manifest_or_default(manifest_path)?;
        let mut selected = BTreeMap::new();
        for (name, binding) in manifest.iter() {
            let Some(entry) = self.resolve(
                name,
                binding,
                &options.platform,
                options.pkg_context.as_deref(),
            ) else {
                continue;
            };
            if entry.lazy && !options.include_lazy {
                continue;
            }
            selected.insert(name.clone(), entry);
        }
        Ok(selected)
    }

    /// Hashes of [`Self::select_downloadable`], in name order.
    pub fn extract_all_hashes(
        &self,
        manifest_path: &Path,
        options: &SelectOptions,
    ) -> Result<Vec<ArtifactHash>> {
        Ok(self
            .select_downloadable(manifest_path, options)?
            .into_values()
            .map(|entry| entry.hash)
            .collect())
    }

    fn resolve(
        &self,
        name: &str,
        binding: &Binding,
        platform: &Platform,
        pkg_context: Option<&str>,
    ) -> Option<Entry> {
        let mut binding = binding.clone();
        if let Some(context) = pkg_context {
            for entry in binding.entries_mut() {
                if let Some(target) = self.overrides.redirect_name(context, name, &entry.hash) {
                    debug!(name, from = %entry.hash, to = %target, "applying name override");
                    entry.hash = target;
                }
            }
        }
        binding.select(platform).cloned()
    }

    fn record_usage(&self, manifest_path: &Path) {
        if let Some(usage) = &self.usage {
            if let Err(err) = usage.record(manifest_path) {
                warn!(%err, log = %usage.path().display(), "failed to record manifest usage");
            }
        }
    }
}

impl std::fmt::Debug for ManifestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestManager")
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

/// Walk up from `start` looking for a manifest; `VesselArtifacts.toml`
/// wins over `Artifacts.toml` in the same directory.
#[must_use]
pub fn find_artifacts_toml(start: &Path) -> Option<PathBuf> {
    let mut current = if start.is_file() {
        start.parent()?.to_path_buf()
    } else {
        start.to_path_buf()
    };
    loop {
        for name in MANIFEST_NAMES {
            let candidate = current.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        if !current.pop() {
            return None;
        }
    }
}
