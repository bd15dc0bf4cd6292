//! Git-compatible tree hashing for artifact directories.
//!
//! The hash of a directory equals what `git write-tree` would report for the
//! same content: files are `blob` objects, executables carry mode `100755`,
//! symlinks are blobs of their target text with mode `120000`, and empty
//! subdirectories are skipped because git cannot record them.

use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};

use crate::hash::{ArtifactHash, HASH_LEN};

const MODE_FILE: &str = "100644";
const MODE_EXECUTABLE: &str = "100755";
const MODE_SYMLINK: &str = "120000";
const MODE_TREE: &str = "40000";

/// Fingerprints a directory tree.
pub trait TreeHasher: Send + Sync {
    fn tree_hash(&self, root: &Path) -> Result<ArtifactHash>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GitTreeHasher;

impl TreeHasher for GitTreeHasher {
    fn tree_hash(&self, root: &Path) -> Result<ArtifactHash> {
        let digest = hash_dir(root)?.unwrap_or_else(empty_tree);
        Ok(ArtifactHash::from_bytes(digest))
    }
}

struct TreeEntry {
    name: Vec<u8>,
    mode: &'static str,
    digest: [u8; HASH_LEN],
}

impl TreeEntry {
    /// Git orders directories as if their name ended in `/`.
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.clone();
        if self.mode == MODE_TREE {
            key.push(b'/');
        }
        key
    }
}

fn hash_dir(dir: &Path) -> Result<Option<[u8; HASH_LEN]>> {
    let mut entries = Vec::new();
    let listing =
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?;
    for entry in listing {
        let entry = entry?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let file_type = metadata.file_type();
        let name = name_bytes(&entry.file_name());
        if file_type.is_symlink() {
            let target = fs::read_link(&path)
                .with_context(|| format!("failed to read symlink {}", path.display()))?;
            entries.push(TreeEntry {
                name,
                mode: MODE_SYMLINK,
                digest: hash_object("blob", &name_bytes(target.as_os_str())),
            });
        } else if file_type.is_dir() {
            if let Some(digest) = hash_dir(&path)? {
                entries.push(TreeEntry {
                    name,
                    mode: MODE_TREE,
                    digest,
                });
            }
        } else if file_type.is_file() {
            let mode = if is_executable(&metadata) {
                MODE_EXECUTABLE
            } else {
                MODE_FILE
            };
            entries.push(TreeEntry {
                name,
                mode,
                digest: hash_file(&path, metadata.len())?,
            });
        }
    }
    if entries.is_empty() {
        return Ok(None);
    }
    entries.sort_by_cached_key(TreeEntry::sort_key);

    let mut body = Vec::new();
    for entry in &entries {
        body.extend_from_slice(entry.mode.as_bytes());
        body.push(b' ');
        body.extend_from_slice(&entry.name);
        body.push(0);
        body.extend_from_slice(&entry.digest);
    }
    Ok(Some(hash_object("tree", &body)))
}

fn hash_object(kind: &str, body: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(format!("{kind} {}\0", body.len()).as_bytes());
    hasher.update(body);
    hasher.finalize().into()
}

fn hash_file(path: &Path, len: u64) -> Result<[u8; HASH_LEN]> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            return Err(err).with_context(|| format!("unreadable file {}", path.display()))
        }
        Err(err) => return Err(err).with_context(|| format!("failed to open {}", path.display())),
    };
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {len}\0").as_bytes());
    let mut buf = [0u8; 32 * 1024];
    let mut seen: u64 = 0;
    loop {
        let read = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        seen += read as u64;
        hasher.update(&buf[..read]);
    }
    anyhow::ensure!(
        seen == len,
        "{} changed size while hashing ({len} -> {seen} bytes)",
        path.display()
    );
    Ok(hasher.finalize().into())
}

fn empty_tree() -> [u8; HASH_LEN] {
    hash_object("tree", &[])
}

#[cfg(unix)]
fn name_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn name_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    name.to_string_lossy().replace('\\', "/").into_bytes()
}

/// Git only looks at the owner execute bit.
#[cfg(unix)]
pub(crate) fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
pub(crate) fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hex_of(dir: &Path) -> String {
        GitTreeHasher.tree_hash(dir).unwrap().to_hex()
    }

    #[test]
    fn empty_directory_hashes_to_git_empty_tree() -> Result<()> {
        let temp = tempdir()?;
        assert_eq!(hex_of(temp.path()), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
        Ok(())
    }

    #[test]
    fn single_file_matches_git_write_tree() -> Result<()> {
        // `echo hello > hello.txt && git add . && git write-tree`
        let temp = tempdir()?;
        fs::write(temp.path().join("hello.txt"), b"hello\n")?;
        assert_eq!(hex_of(temp.path()), "aaa96ced2d9a1c8e72c56b253a0e2fe78393feb7");
        Ok(())
    }

    #[test]
    fn empty_subdirectories_do_not_change_the_hash() -> Result<()> {
        let temp = tempdir()?;
        fs::write(temp.path().join("hello.txt"), b"hello\n")?;
        let before = hex_of(temp.path());
        fs::create_dir_all(temp.path().join("empty/nested"))?;
        assert_eq!(hex_of(temp.path()), before);
        Ok(())
    }

    #[test]
    fn directory_sorting_follows_git_rules() -> Result<()> {
        // "a.txt" sorts before "a/" because '.' < '/'.
        let temp = tempdir()?;
        fs::write(temp.path().join("a.txt"), b"x")?;
        fs::create_dir(temp.path().join("a"))?;
        fs::write(temp.path().join("a/b"), b"y")?;
        let first = hex_of(temp.path());

        let other = tempdir()?;
        fs::create_dir(other.path().join("a"))?;
        fs::write(other.path().join("a/b"), b"y")?;
        fs::write(other.path().join("a.txt"), b"x")?;
        assert_eq!(hex_of(other.path()), first);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn executable_bit_changes_the_hash() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let temp = tempdir()?;
        let script = temp.path().join("run.sh");
        fs::write(&script, b"#!/bin/sh\n")?;
        let plain = hex_of(temp.path());
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;
        assert_ne!(hex_of(temp.path()), plain);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn only_owner_execute_bit_marks_executables() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let temp = tempdir()?;
        let script = temp.path().join("f");
        fs::write(&script, b"echo hi\n")?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o654))?;
        assert_eq!(hex_of(temp.path()), "9c1dcbbcf0a1826ed6b68279becc3c23820ef96c");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o744))?;
        assert_eq!(hex_of(temp.path()), "054d87e293c361ace7ddec2ccd2ad5ecb973d762");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn absolute_symlink_hashes_its_target_text() -> Result<()> {
        let temp = tempdir()?;
        std::os::unix::fs::symlink("/usr/lib/libfoo.so", temp.path().join("link"))?;
        assert_eq!(hex_of(temp.path()), "03af29472b1043c93d0de35f88db32069df726ca");
        Ok(())
    }
}
