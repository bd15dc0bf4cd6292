use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use tar::Header;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::tree_hash::is_executable;

fn normalize_archive_path(path: &Path) -> Result<String> {
    let normalized = path.to_string_lossy().replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(anyhow!(
            "archive entries must be relative (got {})",
            normalized
        ));
    }
    if normalized.is_empty() {
        return Err(anyhow!("archive entry path is empty"));
    }
    Ok(normalized)
}

/// Write a deterministic gzip tarball of `root` to `dest`, replacing any
/// existing file atomically.
pub(super) fn write_tarball(root: &Path, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp tarball in {}", parent.display()))?;
    let mut file = archive_dir_to_writer(root, tmp)?;
    file.flush()?;
    file.as_file().sync_all()?;
    file.persist(dest)
        .map_err(|err| anyhow!("unable to persist tarball {}: {err}", dest.display()))?;
    Ok(())
}

fn archive_dir_to_writer<W: Write>(root: &Path, writer: W) -> Result<W> {
    let encoder = GzBuilder::new()
        .mtime(0)
        .write(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    for entry in walkdir::WalkDir::new(root).sort_by(|a, b| a.file_name().cmp(b.file_name())) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        let path = entry.path();
        if path == root {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .context("failed to relativize path")?;
        let rel_path = normalize_archive_path(rel)?;
        let metadata = fs::symlink_metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let file_type = metadata.file_type();
        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        let _ = header.set_username("");
        let _ = header.set_groupname("");
        if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, Path::new(&rel_path), std::io::empty())?;
        } else if file_type.is_file() {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(if is_executable(&metadata) {
                0o755
            } else {
                0o644
            });
            header.set_size(metadata.len());
            let file = File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            builder.append_data(&mut header, Path::new(&rel_path), file)?;
        } else if file_type.is_symlink() {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            let target = fs::read_link(path)
                .with_context(|| format!("failed to read symlink target {}", path.display()))?;
            header
                .set_link_name_literal(link_target_bytes(&target)?)
                .with_context(|| {
                    format!(
                        "symlink target {} of {} does not fit in a tar header",
                        target.display(),
                        path.display()
                    )
                })?;
            builder.append_data(&mut header, Path::new(&rel_path), std::io::empty())?;
        } else {
            debug!(path = %path.display(), "skipping special file during archive");
        }
    }
    builder.finish()?;
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Streaming sha256 of a file, hex encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(anyhow!("{} does not exist", path.display()))
        }
        Err(err) => return Err(err).with_context(|| format!("failed to open {}", path.display())),
    };
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 32 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Link targets are stored verbatim; the tree hash covers their exact text.
#[cfg(unix)]
fn link_target_bytes(target: &Path) -> Result<Vec<u8>> {
    use std::os::unix::ffi::OsStrExt;
    Ok(target.as_os_str().as_bytes().to_vec())
}

#[cfg(not(unix))]
fn link_target_bytes(target: &Path) -> Result<Vec<u8>> {
    target
        .to_str()
        .map(|text| text.replace('\\', "/").into_bytes())
        .ok_or_else(|| anyhow!("symlink target {} is not valid unicode", target.display()))
}
