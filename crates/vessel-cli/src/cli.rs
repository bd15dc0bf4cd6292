use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use vessel_core::{ArtifactHash, DownloadSource, Platform};

#[derive(Parser, Debug)]
#[command(
    name = "vessel",
    author,
    version,
    about = "Content-addressed artifact store and installer",
    disable_help_subcommand = true
)]
pub struct VesselCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(long, help = "Emit {status,message,details} JSON envelopes", global = true)]
    pub json: bool,
    #[arg(
        long,
        value_name = "PATH",
        help = "Manifest to operate on (defaults to the nearest Artifacts.toml)",
        global = true
    )]
    pub manifest: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(about = "Bind a name to an artifact hash in the manifest.")]
    Bind(BindArgs),
    #[command(about = "Remove a name (or one platform's entry) from the manifest.")]
    Unbind(UnbindArgs),
    #[command(about = "Show the manifest entry that applies to a platform.")]
    Meta(QueryArgs),
    #[command(about = "Install the artifact bound to a name and print its path.")]
    Install(QueryArgs),
    #[command(name = "install-all", about = "Install every eager artifact in the manifest.")]
    InstallAll(SelectArgs),
    #[command(about = "Recompute an installed artifact's tree hash.")]
    Verify(VerifyArgs),
    #[command(about = "Delete an artifact from every depot.")]
    Remove(HashArgs),
    #[command(about = "Write an installed artifact to a gzip tarball.")]
    Archive(ArchiveArgs),
    #[command(about = "List artifacts installed in the configured depots.")]
    List,
    #[command(about = "Print the hashes a manifest selects for a platform.")]
    Hashes(SelectArgs),
}

#[derive(Args, Debug)]
pub struct PlatformArgs {
    #[arg(
        long,
        value_name = "TRIPLET",
        help = "Target platform such as x86_64-linux-glibc (defaults to the host)"
    )]
    pub platform: Option<Platform>,
}

impl PlatformArgs {
    pub fn resolve(&self) -> Platform {
        self.platform.clone().unwrap_or_else(Platform::host)
    }
}

#[derive(Args, Debug)]
pub struct BindArgs {
    pub name: String,
    pub hash: ArtifactHash,
    #[arg(long, value_name = "TRIPLET", help = "Bind only for this platform")]
    pub platform: Option<Platform>,
    #[arg(
        long = "download",
        value_name = "URL#SHA256",
        value_parser = parse_download,
        help = "Download source and tarball sha256 (repeatable)"
    )]
    pub downloads: Vec<DownloadSource>,
    #[arg(long, help = "Only install on explicit request")]
    pub lazy: bool,
    #[arg(long, help = "Overwrite an existing mapping")]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct UnbindArgs {
    pub name: String,
    #[arg(long, value_name = "TRIPLET", help = "Remove only this platform's entry")]
    pub platform: Option<Platform>,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    pub name: String,
    #[command(flatten)]
    pub platform: PlatformArgs,
    #[arg(long, value_name = "PACKAGE", help = "Apply name overrides scoped to this package")]
    pub pkg_context: Option<String>,
}

#[derive(Args, Debug)]
pub struct SelectArgs {
    #[command(flatten)]
    pub platform: PlatformArgs,
    #[arg(long, help = "Include lazy entries")]
    pub include_lazy: bool,
    #[arg(long, value_name = "PACKAGE", help = "Apply name overrides scoped to this package")]
    pub pkg_context: Option<String>,
}

#[derive(Args, Debug)]
pub struct HashArgs {
    pub hash: ArtifactHash,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    pub hash: ArtifactHash,
    #[arg(long, help = "Treat overridden artifacts as verified")]
    pub honor_overrides: bool,
}

#[derive(Args, Debug)]
pub struct ArchiveArgs {
    pub hash: ArtifactHash,
    pub dest: PathBuf,
    #[arg(long, help = "Archive the override target instead of refusing")]
    pub honor_overrides: bool,
}

fn parse_download(raw: &str) -> Result<DownloadSource, String> {
    let (url, sha256) = raw
        .rsplit_once('#')
        .ok_or_else(|| format!("expected URL#SHA256, got '{raw}'"))?;
    if url.is_empty() {
        return Err("download url is empty".to_string());
    }
    if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("'{sha256}' is not a sha256 hex digest"));
    }
    Ok(DownloadSource::new(url, sha256.to_ascii_lowercase()))
}
