use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use toml_edit::{ArrayOfTables, DocumentMut, Item, Table, TableLike, Value as TomlValue};
use tracing::debug;

use super::{Binding, DownloadSource, Entry, Manifest};
use crate::error::ArtifactError;
use crate::hash::ArtifactHash;
use crate::platform::Platform;

pub(super) const KEY_HASH: &str = "git-tree-sha1";
pub(super) const KEY_LAZY: &str = "lazy";
pub(super) const KEY_DOWNLOAD: &str = "download";
const KEY_URL: &str = "url";
const KEY_SHA256: &str = "sha256";

/// Read and decode a manifest file.
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_manifest(&contents, path)
}

/// Read a manifest, treating a missing file as empty.
pub fn load_manifest_or_default(path: &Path) -> Result<Manifest> {
    if path.exists() {
        load_manifest(path)
    } else {
        Ok(Manifest::default())
    }
}

pub fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, render_manifest(manifest))
        .with_context(|| format!("failed to write {}", path.display()))
}

pub(crate) fn parse_manifest(contents: &str, path: &Path) -> Result<Manifest> {
    let doc: DocumentMut = contents
        .parse()
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let invalid = |reason: String| ArtifactError::InvalidManifest {
        path: path.to_path_buf(),
        reason,
    };

    let mut manifest = Manifest::default();
    for (name, item) in doc.iter() {
        let binding = if let Some(table) = item.as_table_like() {
            Binding::Single(parse_entry(table).map_err(|e| invalid(format!("[{name}]: {e}")))?)
        } else if let Some(tables) = item.as_array_of_tables() {
            let entries = tables
                .iter()
                .map(|t| parse_entry(t as &dyn TableLike))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| invalid(format!("[[{name}]]: {e}")))?;
            multi_binding(entries).map_err(|e| invalid(format!("[[{name}]]: {e}")))?
        } else if let Some(array) = item.as_array() {
            let mut entries = Vec::new();
            for value in array {
                let table = value
                    .as_inline_table()
                    .ok_or_else(|| invalid(format!("{name}: array elements must be tables")))?;
                entries.push(
                    parse_entry(table as &dyn TableLike)
                        .map_err(|e| invalid(format!("{name}: {e}")))?,
                );
            }
            multi_binding(entries).map_err(|e| invalid(format!("{name}: {e}")))?
        } else {
            return Err(invalid(format!("{name}: expected a table or an array of tables")).into());
        };
        manifest.insert(name, binding);
    }
    Ok(manifest)
}

fn multi_binding(mut entries: Vec<Entry>) -> Result<Binding, String> {
    if entries.len() == 1 && entries[0].platform.is_none() {
        return Ok(Binding::Single(entries.remove(0)));
    }
    if entries.iter().any(|entry| entry.platform.is_none()) {
        return Err("every entry of a multi-mapping must name a platform".to_string());
    }
    Ok(Binding::Multi(entries))
}

fn parse_entry(table: &dyn TableLike) -> Result<Entry, String> {
    let raw_hash = table
        .get(KEY_HASH)
        .ok_or_else(|| format!("missing `{KEY_HASH}`"))?
        .as_str()
        .ok_or_else(|| format!("`{KEY_HASH}` must be a string"))?;
    let hash: ArtifactHash = raw_hash.parse().map_err(|e| format!("{e}"))?;

    let lazy = match table.get(KEY_LAZY) {
        None => false,
        Some(item) => item
            .as_bool()
            .ok_or_else(|| format!("`{KEY_LAZY}` must be a boolean"))?,
    };

    let downloads = match table.get(KEY_DOWNLOAD) {
        None => Vec::new(),
        Some(item) => parse_downloads(item)?,
    };

    let mut platform_pairs = BTreeMap::new();
    for (key, item) in table.iter() {
        if matches!(key, KEY_HASH | KEY_LAZY | KEY_DOWNLOAD) {
            continue;
        }
        match item.as_str() {
            Some(value) => {
                platform_pairs.insert(key.to_string(), value.to_string());
            }
            None => debug!(key, "ignoring non-string manifest key"),
        }
    }
    let platform = Platform::decode(&platform_pairs).map_err(|e| e.to_string())?;

    Ok(Entry {
        hash,
        lazy,
        platform,
        downloads,
    })
}

fn parse_downloads(item: &Item) -> Result<Vec<DownloadSource>, String> {
    let mut tables: Vec<&dyn TableLike> = Vec::new();
    if let Some(array) = item.as_array_of_tables() {
        tables.extend(array.iter().map(|t| t as &dyn TableLike));
    } else if let Some(array) = item.as_array() {
        for value in array {
            let table = value
                .as_inline_table()
                .ok_or_else(|| format!("`{KEY_DOWNLOAD}` elements must be tables"))?;
            tables.push(table as &dyn TableLike);
        }
    } else {
        return Err(format!("`{KEY_DOWNLOAD}` must be an array of tables"));
    }

    tables
        .into_iter()
        .map(|table| {
            let field = |key: &str| {
                table
                    .get(key)
                    .and_then(Item::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| format!("download entries need a string `{key}`"))
            };
            Ok(DownloadSource {
                url: field(KEY_URL)?,
                sha256: field(KEY_SHA256)?,
            })
        })
        .collect()
}

/// Render with names and keys sorted so rewrites produce stable diffs.
pub(crate) fn render_manifest(manifest: &Manifest) -> String {
    let mut doc = DocumentMut::new();
    for (name, binding) in manifest.iter() {
        let item = match binding {
            Binding::Single(entry) => Item::Table(render_entry(entry)),
            Binding::Multi(entries) => {
                let mut tables = ArrayOfTables::new();
                for entry in entries {
                    tables.push(render_entry(entry));
                }
                Item::ArrayOfTables(tables)
            }
        };
        doc.insert(name, item);
    }
    doc.to_string()
}

fn render_entry(entry: &Entry) -> Table {
    let mut fields: BTreeMap<String, Item> = BTreeMap::new();
    fields.insert(
        KEY_HASH.to_string(),
        Item::Value(TomlValue::from(entry.hash.to_hex())),
    );
    if entry.lazy {
        fields.insert(KEY_LAZY.to_string(), Item::Value(TomlValue::from(true)));
    }
    if let Some(platform) = &entry.platform {
        for (key, value) in platform.encode() {
            fields.insert(key, Item::Value(TomlValue::from(value)));
        }
    }
    if !entry.downloads.is_empty() {
        let mut downloads = ArrayOfTables::new();
        for source in &entry.downloads {
            let mut table = Table::new();
            table.insert(KEY_SHA256, Item::Value(TomlValue::from(source.sha256.as_str())));
            table.insert(KEY_URL, Item::Value(TomlValue::from(source.url.as_str())));
            downloads.push(table);
        }
        fields.insert(KEY_DOWNLOAD.to_string(), Item::ArrayOfTables(downloads));
    }

    let mut table = Table::new();
    for (key, item) in fields {
        table.insert(&key, item);
    }
    table
}
