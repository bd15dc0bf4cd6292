//! Override redirects that make a hash (or a package-scoped name) resolve to
//! externally supplied content.
//!
//! Each depot may carry `artifacts/Overrides.toml`:
//!
//! ```toml
//! # hash -> absolute path or another hash
//! 78f35e74ff113f02274ce60dab6e92b4546ef806 = "/opt/local/libfoo"
//!
//! # package context -> name -> path or hash
//! [my-package]
//! libfoo = "683942669b4639019be7631caa28c38f3e1d7d0a"
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use toml_edit::{DocumentMut, Item};
use tracing::{debug, warn};

use crate::hash::ArtifactHash;

pub const OVERRIDES_FILENAME: &str = "Overrides.toml";

/// Where an overridden artifact actually lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Redirect {
    Path(PathBuf),
    Hash(ArtifactHash),
}

/// Depot-scoped override table consulted by the store and manifest layers.
pub trait OverrideResolver: Send + Sync {
    fn lookup(&self, hash: &ArtifactHash) -> Option<Redirect>;

    /// Apply a package-scoped override for `name`, whose manifest entry has
    /// `hash`. Returns the replacement hash when the manifest entry should be
    /// rewritten. Path overrides are recorded against `hash` so later
    /// `lookup` calls see them.
    fn redirect_name(
        &self,
        _pkg_context: &str,
        _name: &str,
        _hash: &ArtifactHash,
    ) -> Option<ArtifactHash> {
        None
    }
}

/// Resolver that never redirects.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOverrides;

impl OverrideResolver for NoOverrides {
    fn lookup(&self, _hash: &ArtifactHash) -> Option<Redirect> {
        None
    }
}

#[derive(Debug, Default)]
pub struct OverrideTable {
    by_hash: RwLock<HashMap<ArtifactHash, Redirect>>,
    by_name: HashMap<(String, String), Redirect>,
}

impl OverrideTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `Overrides.toml` from every depot. Earlier depots take precedence.
    pub fn load(depots: &[PathBuf]) -> Result<Self> {
        let mut table = Self::new();
        for depot in depots.iter().rev() {
            let path = depot.join("artifacts").join(OVERRIDES_FILENAME);
            if !path.is_file() {
                continue;
            }
            table.merge_file(&path)?;
        }
        Ok(table)
    }

    pub fn insert_hash(&mut self, hash: ArtifactHash, redirect: Redirect) {
        self.by_hash
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(hash, redirect);
    }

    pub fn insert_name(&mut self, pkg_context: &str, name: &str, redirect: Redirect) {
        self.by_name
            .insert((pkg_context.to_string(), name.to_string()), redirect);
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let doc: DocumentMut = contents
            .parse()
            .with_context(|| format!("failed to parse {}", path.display()))?;
        for (key, item) in doc.iter() {
            if ArtifactHash::is_hex_hash(key) {
                let Ok(hash) = key.parse::<ArtifactHash>() else {
                    continue;
                };
                match parse_redirect(item) {
                    Some(redirect) => self.insert_hash(hash, redirect),
                    None => warn!(file = %path.display(), key, "ignoring invalid hash override"),
                }
                continue;
            }
            let Some(names) = item.as_table_like() else {
                warn!(file = %path.display(), key, "ignoring override entry that is neither a hash nor a table");
                continue;
            };
            for (name, value) in names.iter() {
                match parse_redirect(value) {
                    Some(redirect) => self.insert_name(key, name, redirect),
                    None => warn!(
                        file = %path.display(),
                        context = key,
                        name,
                        "ignoring invalid name override"
                    ),
                }
            }
        }
        debug!(file = %path.display(), "loaded artifact overrides");
        Ok(())
    }
}

fn parse_redirect(item: &Item) -> Option<Redirect> {
    let raw = item.as_str()?.trim();
    if ArtifactHash::is_hex_hash(raw) {
        return raw.parse().ok().map(Redirect::Hash);
    }
    let path = PathBuf::from(raw);
    if raw.is_empty() || !path.is_absolute() {
        return None;
    }
    Some(Redirect::Path(path))
}

impl OverrideResolver for OverrideTable {
    fn lookup(&self, hash: &ArtifactHash) -> Option<Redirect> {
        self.by_hash
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(hash)
            .cloned()
    }

    fn redirect_name(
        &self,
        pkg_context: &str,
        name: &str,
        hash: &ArtifactHash,
    ) -> Option<ArtifactHash> {
        match self
            .by_name
            .get(&(pkg_context.to_string(), name.to_string()))?
        {
            Redirect::Hash(target) => Some(*target),
            Redirect::Path(path) => {
                self.by_hash
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .insert(*hash, Redirect::Path(path.clone()));
                None
            }
        }
    }
}
