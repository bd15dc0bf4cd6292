use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use vessel_core::{
    find_artifacts_toml, ArtifactError, BindOptions, Config, HttpFetcher, Installer,
    QueryOptions, SelectOptions,
};

use crate::cli::{CommandCli, SelectArgs, VesselCli};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    /// The command ran but reported a negative answer (e.g. failed verification).
    Failed,
}

#[derive(Debug)]
pub struct Outcome {
    pub status: CommandStatus,
    pub message: String,
    pub details: Value,
}

impl Outcome {
    fn ok(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Ok,
            message: message.into(),
            details,
        }
    }
}

pub fn execute(cli: &VesselCli) -> Result<Outcome> {
    let config = Config::from_env()?;
    let installer = Installer::from_config(&config, Arc::new(HttpFetcher::new()?))?;
    let manifest_path = || resolve_manifest(cli.manifest.as_ref());

    match &cli.command {
        CommandCli::Bind(args) => {
            let path = manifest_path()?;
            installer.manifests().bind(
                &path,
                &args.name,
                args.hash,
                BindOptions {
                    platform: args.platform.clone(),
                    downloads: args.downloads.clone(),
                    lazy: args.lazy,
                    force: args.force,
                },
            )?;
            Ok(Outcome::ok(
                format!("bound {} -> {}", args.name, args.hash),
                json!({
                    "manifest": path.display().to_string(),
                    "name": args.name,
                    "hash": args.hash,
                    "platform": args.platform,
                }),
            ))
        }
        CommandCli::Unbind(args) => {
            let path = manifest_path()?;
            installer
                .manifests()
                .unbind(&path, &args.name, args.platform.as_ref())?;
            Ok(Outcome::ok(
                format!("unbound {}", args.name),
                json!({ "manifest": path.display().to_string(), "name": args.name }),
            ))
        }
        CommandCli::Meta(args) => {
            let path = manifest_path()?;
            let options = QueryOptions {
                platform: args.platform.resolve(),
                pkg_context: args.pkg_context.clone(),
            };
            let Some(entry) = installer.manifests().meta(&args.name, &path, &options)? else {
                return Err(ArtifactError::NotFound {
                    name: args.name.clone(),
                    manifest: path,
                    platform: Some(options.platform),
                }
                .into());
            };
            Ok(Outcome::ok(
                format!("{} -> {}", args.name, entry.hash),
                serde_json::to_value(&entry)?,
            ))
        }
        CommandCli::Install(args) => {
            let path = manifest_path()?;
            let options = QueryOptions {
                platform: args.platform.resolve(),
                pkg_context: args.pkg_context.clone(),
            };
            let installed = installer.ensure_installed(&args.name, &path, &options)?;
            Ok(Outcome::ok(
                installed.display().to_string(),
                json!({ "name": args.name, "path": installed.display().to_string() }),
            ))
        }
        CommandCli::InstallAll(args) => {
            let path = manifest_path()?;
            let installed = installer.ensure_all_installed(&path, &select_options(args))?;
            let lines: Vec<String> = installed
                .iter()
                .map(|(name, dir)| format!("{name}: {}", dir.display()))
                .collect();
            let details: serde_json::Map<String, Value> = installed
                .into_iter()
                .map(|(name, dir)| (name, Value::String(dir.display().to_string())))
                .collect();
            Ok(Outcome::ok(lines.join("\n"), Value::Object(details)))
        }
        CommandCli::Verify(args) => {
            let verified = installer.store().verify(&args.hash, args.honor_overrides)?;
            Ok(Outcome {
                status: if verified {
                    CommandStatus::Ok
                } else {
                    CommandStatus::Failed
                },
                message: if verified {
                    format!("{} verified", args.hash)
                } else {
                    format!("{} is missing or does not match its hash", args.hash)
                },
                details: json!({ "hash": args.hash, "verified": verified }),
            })
        }
        CommandCli::Remove(args) => {
            installer.store().remove(&args.hash)?;
            Ok(Outcome::ok(
                format!("removed {}", args.hash),
                json!({ "hash": args.hash }),
            ))
        }
        CommandCli::Archive(args) => {
            let sha256 = installer
                .store()
                .archive(&args.hash, &args.dest, args.honor_overrides)?;
            Ok(Outcome::ok(
                sha256.clone(),
                json!({
                    "hash": args.hash,
                    "tarball": args.dest.display().to_string(),
                    "sha256": sha256,
                }),
            ))
        }
        CommandCli::List => {
            let hashes = installer.store().list_installed()?;
            let lines: Vec<String> = hashes.iter().map(ToString::to_string).collect();
            Ok(Outcome::ok(lines.join("\n"), json!({ "installed": hashes })))
        }
        CommandCli::Hashes(args) => {
            let path = manifest_path()?;
            let hashes = installer
                .manifests()
                .extract_all_hashes(&path, &select_options(args))?;
            let lines: Vec<String> = hashes.iter().map(ToString::to_string).collect();
            Ok(Outcome::ok(lines.join("\n"), json!({ "hashes": hashes })))
        }
    }
}

fn select_options(args: &SelectArgs) -> SelectOptions {
    SelectOptions {
        platform: args.platform.resolve(),
        include_lazy: args.include_lazy,
        pkg_context: args.pkg_context.clone(),
    }
}

/// Explicit `--manifest`, else the nearest manifest above the working
/// directory, else `Artifacts.toml` in the working directory.
fn resolve_manifest(explicit: Option<&PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.clone());
    }
    let cwd = env::current_dir().context("failed to read the working directory")?;
    Ok(find_artifacts_toml(&cwd).unwrap_or_else(|| cwd.join("Artifacts.toml")))
}
