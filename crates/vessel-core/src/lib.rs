//! Content-addressed artifact store, manifest management and installation.
#![deny(clippy::all)]

pub mod config;
pub mod error;
pub mod fetch;
pub(crate) mod fs;
pub mod hash;
pub mod install;
pub mod manifest;
pub mod overrides;
pub mod platform;
pub mod store;
pub mod tree_hash;
pub mod usage;

pub use crate::config::{Config, UnpackVerification};
pub use crate::error::{is_cancelled, ArtifactError, SourceFailure};
pub use crate::fetch::{unpack_tarball, CancelFlag, FetchError, Fetcher, HttpFetcher};
pub use crate::hash::ArtifactHash;
pub use crate::install::{InstallOptions, Installer};
pub use crate::manifest::{
    find_artifacts_toml, load_manifest, write_manifest, BindOptions, Binding, DownloadSource,
    Entry, Manifest, ManifestManager, QueryOptions, SelectOptions,
};
pub use crate::overrides::{NoOverrides, OverrideResolver, OverrideTable, Redirect};
pub use crate::platform::Platform;
pub use crate::store::{artifacts_root, sha256_file, ArtifactStore, StagedArtifact};
pub use crate::tree_hash::{GitTreeHasher, TreeHasher};
pub use crate::usage::UsageLog;
