use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

pub const ENV_DEPOT_PATH: &str = "VESSEL_DEPOT_PATH";
pub const ENV_PKG_SERVER: &str = "VESSEL_PKG_SERVER";
pub const ENV_IGNORE_HASHES: &str = "VESSEL_IGNORE_HASHES";
pub const ENV_VERIFY_UNPACK: &str = "VESSEL_VERIFY_UNPACK";

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn flag_is_enabled(&self, key: &str) -> bool {
        matches!(self.vars.get(key).map(String::as_str), Some("1"))
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Whether unpacked downloads are re-hashed before entering the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackVerification {
    /// Recompute the tree hash and reject mismatches.
    Verify,
    /// Trust the manifest hash. Used where the filesystem cannot express the
    /// executable bits the tree hash depends on.
    TrustExpected,
}

impl UnpackVerification {
    #[must_use]
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Self::TrustExpected
        } else {
            Self::Verify
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub depots: Vec<PathBuf>,
    pub pkg_server: Option<String>,
    pub ignore_hashes: bool,
    pub unpack_verification: UnpackVerification,
}

impl Config {
    /// Builds a configuration snapshot from the current process environment.
    ///
    /// # Errors
    /// Returns an error if no depot is configured and the home directory
    /// cannot be resolved.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let mut depots: Vec<PathBuf> = snapshot
            .var(ENV_DEPOT_PATH)
            .map(|raw| {
                env::split_paths(raw)
                    .filter(|p| !p.as_os_str().is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if depots.is_empty() {
            depots.push(default_depot()?);
        }
        let pkg_server = snapshot
            .var(ENV_PKG_SERVER)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_end_matches('/').to_string());
        let unpack_verification = match snapshot.var(ENV_VERIFY_UNPACK) {
            Some("1") => UnpackVerification::Verify,
            Some("0") => UnpackVerification::TrustExpected,
            _ => UnpackVerification::platform_default(),
        };
        Ok(Self {
            depots,
            pkg_server,
            ignore_hashes: snapshot.flag_is_enabled(ENV_IGNORE_HASHES),
            unpack_verification,
        })
    }

    /// Configuration rooted at explicit depots with every knob at its default.
    #[must_use]
    pub fn with_depots(depots: Vec<PathBuf>) -> Self {
        Self {
            depots,
            pkg_server: None,
            ignore_hashes: false,
            unpack_verification: UnpackVerification::platform_default(),
        }
    }

    #[must_use]
    pub fn primary_depot(&self) -> Option<&PathBuf> {
        self.depots.first()
    }
}

fn default_depot() -> Result<PathBuf> {
    let home = dirs_next::home_dir().context("failed to resolve HOME for the default depot")?;
    Ok(home.join(".vessel"))
}
