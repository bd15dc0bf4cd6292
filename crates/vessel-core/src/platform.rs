use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

pub(crate) const KEY_OS: &str = "os";
pub(crate) const KEY_ARCH: &str = "arch";
pub(crate) const KEY_LIBC: &str = "libc";

/// Target platform descriptor attached to platform-qualified manifest entries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libc: Option<String>,
    /// Extra comparison tags (for example `cxxstring_abi`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Platform {
    #[must_use]
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into().to_ascii_lowercase(),
            arch: arch.into().to_ascii_lowercase(),
            libc: None,
            tags: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_libc(mut self, libc: impl Into<String>) -> Self {
        self.libc = Some(libc.into().to_ascii_lowercase());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Platform of the running process.
    #[must_use]
    pub fn host() -> Self {
        let platform = Self::new(std::env::consts::OS, std::env::consts::ARCH);
        match host_libc() {
            Some(libc) => platform.with_libc(libc),
            None => platform,
        }
    }

    /// Whether this manifest platform applies to `target`.
    ///
    /// `os` and `arch` must agree. `libc` and tags only participate when both
    /// sides declare them.
    #[must_use]
    pub fn matches(&self, target: &Platform) -> bool {
        if self.os != target.os || self.arch != target.arch {
            return false;
        }
        if let (Some(ours), Some(theirs)) = (&self.libc, &target.libc) {
            if ours != theirs {
                return false;
            }
        }
        self.tags.iter().all(|(key, value)| {
            target
                .tags
                .get(key)
                .map_or(true, |other| other == value)
        })
    }

    /// Manifest key/value pairs describing this platform.
    #[must_use]
    pub fn encode(&self) -> BTreeMap<String, String> {
        let mut pairs = self.tags.clone();
        pairs.insert(KEY_OS.to_string(), self.os.clone());
        pairs.insert(KEY_ARCH.to_string(), self.arch.clone());
        if let Some(libc) = &self.libc {
            pairs.insert(KEY_LIBC.to_string(), libc.clone());
        }
        pairs
    }

    /// Rebuild a platform from the string-valued keys of a manifest entry.
    /// Returns `Ok(None)` when the entry carries no platform keys.
    pub fn decode(pairs: &BTreeMap<String, String>) -> Result<Option<Self>> {
        let os = pairs.get(KEY_OS);
        let arch = pairs.get(KEY_ARCH);
        let (os, arch) = match (os, arch) {
            (None, None) => return Ok(None),
            (Some(os), Some(arch)) => (os, arch),
            _ => bail!("platform-qualified entries need both `os` and `arch`"),
        };
        let mut platform = Self::new(os.as_str(), arch.as_str());
        for (key, value) in pairs {
            match key.as_str() {
                KEY_OS | KEY_ARCH => {}
                KEY_LIBC => platform.libc = Some(value.to_ascii_lowercase()),
                _ => {
                    platform.tags.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(Some(platform))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.arch, self.os)?;
        if let Some(libc) = &self.libc {
            write!(f, "-{libc}")?;
        }
        for (key, value) in &self.tags {
            write!(f, "-{key}+{value}")?;
        }
        Ok(())
    }
}

/// Parses the triplet form produced by `Display`, e.g. `x86_64-linux-glibc`.
impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let mut parts = value.split('-');
        let arch = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("platform '{value}' is missing an architecture"))?;
        let os = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("platform '{value}' is missing an operating system"))?;
        let mut platform = Self::new(os, arch);
        for part in parts {
            match part.split_once('+') {
                Some((key, tag)) => {
                    platform.tags.insert(key.to_string(), tag.to_string());
                }
                None if platform.libc.is_none() => platform.libc = Some(part.to_ascii_lowercase()),
                None => bail!("platform '{value}' has an unexpected component '{part}'"),
            }
        }
        Ok(platform)
    }
}

#[cfg(all(target_os = "linux", target_env = "musl"))]
fn host_libc() -> Option<&'static str> {
    Some("musl")
}

#[cfg(all(target_os = "linux", not(target_env = "musl")))]
fn host_libc() -> Option<&'static str> {
    Some("glibc")
}

#[cfg(not(target_os = "linux"))]
fn host_libc() -> Option<&'static str> {
    None
}
