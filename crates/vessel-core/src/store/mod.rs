//! Content-addressed artifact store spread over an ordered list of depots.
//!
//! Layout: `<depot>/artifacts/<40-hex tree hash>/...`. The first depot is
//! the only one written to; the rest are searched read-only.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use crate::error::ArtifactError;
use crate::fs::{make_read_only_recursive, remove_dir_all_writable, StagingDir};
use crate::hash::ArtifactHash;
use crate::overrides::{OverrideResolver, Redirect};
use crate::tree_hash::TreeHasher;

mod archive;

pub use archive::sha256_file;

pub const ARTIFACTS_DIR: &str = "artifacts";

/// A populated directory waiting to be moved into the store.
pub struct StagedArtifact {
    dir: StagingDir,
}

impl StagedArtifact {
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

#[derive(Clone)]
pub struct ArtifactStore {
    depots: Vec<PathBuf>,
    hasher: Arc<dyn TreeHasher>,
    overrides: Arc<dyn OverrideResolver>,
}

impl ArtifactStore {
    /// Build a store over `depots`; the first entry is the writable primary.
    pub fn new(
        depots: Vec<PathBuf>,
        hasher: Arc<dyn TreeHasher>,
        overrides: Arc<dyn OverrideResolver>,
    ) -> Result<Self> {
        if depots.is_empty() {
            return Err(anyhow!("at least one depot is required"));
        }
        Ok(Self {
            depots,
            hasher,
            overrides,
        })
    }

    #[must_use]
    pub fn depots(&self) -> &[PathBuf] {
        &self.depots
    }

    #[must_use]
    pub fn overrides(&self) -> &Arc<dyn OverrideResolver> {
        &self.overrides
    }

    /// `<primary depot>/artifacts`.
    #[must_use]
    pub fn primary_root(&self) -> PathBuf {
        artifacts_root(&self.depots[0])
    }

    pub fn tree_hash(&self, path: &Path) -> Result<ArtifactHash> {
        self.hasher.tree_hash(path)
    }

    /// Populate a fresh directory with `builder`, hash it, and move it into
    /// place. Identical content that is already installed is not an error.
    pub fn create<F>(&self, builder: F) -> Result<ArtifactHash>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let staged = self.stage(builder)?;
        let hash = self.tree_hash(staged.path())?;
        self.commit(staged, &hash)?;
        Ok(hash)
    }

    /// Run `builder` against a staging directory under the primary depot.
    /// The directory is removed again if `builder` fails.
    pub fn stage<F>(&self, builder: F) -> Result<StagedArtifact>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let dir = StagingDir::new_in(&self.primary_root())?;
        builder(dir.path())?;
        Ok(StagedArtifact { dir })
    }

    /// Move a staged directory to `<primary>/artifacts/<hash>` without
    /// checking its content, then harden it read-only.
    pub fn commit(&self, staged: StagedArtifact, hash: &ArtifactHash) -> Result<PathBuf> {
        if let Some(existing) = self.installed_path(hash) {
            debug!(%hash, "artifact already present; discarding staged copy");
            return Ok(existing);
        }
        let dest = self.primary_root().join(hash.to_hex());
        if let Err(err) = fs::rename(staged.path(), &dest) {
            if dest.is_dir() {
                debug!(%hash, "lost creation race; keeping existing artifact");
                return Ok(dest);
            }
            return Err(err).with_context(|| {
                format!(
                    "failed to move artifact into place ({} -> {})",
                    staged.path().display(),
                    dest.display()
                )
            });
        }
        if let Err(err) = make_read_only_recursive(&dest) {
            warn!(%hash, %err, "unable to mark artifact read-only");
        }
        debug!(%hash, path = %dest.display(), "artifact created");
        Ok(dest)
    }

    /// Raw existence check across all depots. Overrides are not consulted.
    #[must_use]
    pub fn exists(&self, hash: &ArtifactHash) -> bool {
        self.installed_path(hash).is_some()
    }

    /// Where `hash` lives, honoring overrides when asked. Falls back to the
    /// would-be location in the primary depot.
    #[must_use]
    pub fn path(&self, hash: &ArtifactHash, honor_overrides: bool) -> PathBuf {
        if honor_overrides {
            match self.overrides.lookup(hash) {
                Some(Redirect::Path(path)) => return path,
                Some(Redirect::Hash(target)) => return self.path(&target, false),
                None => {}
            }
        }
        self.installed_path(hash)
            .unwrap_or_else(|| self.primary_root().join(hash.to_hex()))
    }

    /// Recompute the tree hash of an installed artifact.
    pub fn verify(&self, hash: &ArtifactHash, honor_overrides: bool) -> Result<bool> {
        if honor_overrides && self.overrides.lookup(hash).is_some() {
            return Ok(true);
        }
        let Some(path) = self.installed_path(hash) else {
            return Ok(false);
        };
        let actual = self.tree_hash(&path)?;
        if actual != *hash {
            warn!(expected = %hash, %actual, path = %path.display(), "artifact failed verification");
        }
        Ok(actual == *hash)
    }

    /// Delete `hash` from every depot. Overridden artifacts are left alone.
    pub fn remove(&self, hash: &ArtifactHash) -> Result<()> {
        if self.overrides.lookup(hash).is_some() {
            debug!(%hash, "artifact is overridden; not removing");
            return Ok(());
        }
        for depot in &self.depots {
            let path = artifacts_root(depot).join(hash.to_hex());
            match fs::symlink_metadata(&path) {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(path = %path.display(), %err, "unable to inspect artifact for removal");
                    continue;
                }
            }
            match remove_dir_all_writable(&path) {
                Ok(()) => debug!(%hash, path = %path.display(), "artifact removed"),
                Err(err) => warn!(path = %path.display(), %err, "failed to remove artifact"),
            }
        }
        Ok(())
    }

    /// Package an artifact into a gzip tarball at `dest` and return the
    /// tarball's sha256.
    pub fn archive(
        &self,
        hash: &ArtifactHash,
        dest: &Path,
        honor_overrides: bool,
    ) -> Result<String> {
        if self.overrides.lookup(hash).is_some() && !honor_overrides {
            return Err(ArtifactError::Overridden { hash: *hash }.into());
        }
        let source = self.path(hash, honor_overrides);
        if !source.is_dir() {
            return Err(ArtifactError::NotInstalled { hash: *hash }.into());
        }
        archive::write_tarball(&source, dest)?;
        let sha256 = sha256_file(dest)?;
        debug!(%hash, dest = %dest.display(), %sha256, "artifact archived");
        Ok(sha256)
    }

    /// Hashes installed in any depot, sorted and deduplicated.
    pub fn list_installed(&self) -> Result<Vec<ArtifactHash>> {
        let mut found = Vec::new();
        for depot in &self.depots {
            let root = artifacts_root(depot);
            let entries = match fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to list {}", root.display()))
                }
            };
            for entry in entries {
                let entry = entry?;
                let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                if let Ok(hash) = name.parse::<ArtifactHash>() {
                    found.push(hash);
                }
            }
        }
        found.sort();
        found.dedup();
        Ok(found)
    }

    fn installed_path(&self, hash: &ArtifactHash) -> Option<PathBuf> {
        let name = hash.to_hex();
        self.depots
            .iter()
            .map(|depot| artifacts_root(depot).join(&name))
            .find(|path| path.is_dir())
    }
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("depots", &self.depots)
            .finish_non_exhaustive()
    }
}

/// `<depot>/artifacts`.
#[must_use]
pub fn artifacts_root(depot: &Path) -> PathBuf {
    depot.join(ARTIFACTS_DIR)
}
