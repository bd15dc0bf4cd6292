use std::fmt;
use std::path::PathBuf;

use crate::hash::ArtifactHash;
use crate::platform::Platform;

/// Errors surfaced by the artifact store, manifest and installer.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("[VS100] invalid artifact hash '{0}' (expected 40 hex characters)")]
    InvalidHash(String),
    #[error("[VS101] invalid manifest {}: {reason}", .path.display())]
    InvalidManifest { path: PathBuf, reason: String },
    #[error(
        "[VS110] mapping for '{name}'{} already exists in {}; pass force to overwrite",
        describe_platform(.platform.as_ref()),
        .manifest.display()
    )]
    AlreadyBound {
        name: String,
        manifest: PathBuf,
        platform: Option<Platform>,
    },
    #[error(
        "[VS120] artifact '{name}'{} not found in {}",
        describe_platform(.platform.as_ref()),
        .manifest.display()
    )]
    NotFound {
        name: String,
        manifest: PathBuf,
        platform: Option<Platform>,
    },
    #[error("[VS121] artifact {hash} is not installed")]
    NotInstalled { hash: ArtifactHash },
    #[error("[VS122] artifact {hash} is overridden; refusing to operate on it without honoring overrides")]
    Overridden { hash: ArtifactHash },
    #[error("[VS130] tree hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ArtifactHash,
        actual: ArtifactHash,
    },
    #[error("[VS131] artifact '{name}' ({hash}) is not installed and has no download section")]
    NoDownloadSource { name: String, hash: ArtifactHash },
    #[error(
        "[VS132] unable to install artifact '{name}' ({hash}){}:\n{}",
        describe_platform(.platform.as_ref()),
        render_failures(.failures)
    )]
    DownloadsExhausted {
        name: String,
        hash: ArtifactHash,
        platform: Option<Platform>,
        failures: Vec<SourceFailure>,
    },
    #[error("[VS140] artifact download cancelled")]
    Cancelled,
}

impl ArtifactError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidHash(_) => "VS100",
            Self::InvalidManifest { .. } => "VS101",
            Self::AlreadyBound { .. } => "VS110",
            Self::NotFound { .. } => "VS120",
            Self::NotInstalled { .. } => "VS121",
            Self::Overridden { .. } => "VS122",
            Self::HashMismatch { .. } => "VS130",
            Self::NoDownloadSource { .. } => "VS131",
            Self::DownloadsExhausted { .. } => "VS132",
            Self::Cancelled => "VS140",
        }
    }
}

/// Why a single download source failed during installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub url: String,
    pub reason: String,
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.url, self.reason)
    }
}

fn describe_platform(platform: Option<&Platform>) -> String {
    platform.map(|p| format!(" for platform {p}")).unwrap_or_default()
}

fn render_failures(failures: &[SourceFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("  - {failure}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether an `anyhow` chain carries a cancellation.
#[must_use]
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ArtifactError>(),
            Some(ArtifactError::Cancelled)
        ) || matches!(
            cause.downcast_ref::<crate::fetch::FetchError>(),
            Some(crate::fetch::FetchError::Cancelled)
        )
    })
}
