//! Append-only record of which manifests have been written, so external
//! tooling can tell which artifacts are still referenced.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use toml_edit::{ArrayOfTables, DocumentMut, Item, Table, Value as TomlValue};

pub const USAGE_FILENAME: &str = "artifact_usage.toml";

#[derive(Debug, Clone)]
pub struct UsageLog {
    path: PathBuf,
}

impl UsageLog {
    /// Usage log stored under `<depot>/logs`.
    #[must_use]
    pub fn for_depot(depot: &Path) -> Self {
        Self {
            path: depot.join("logs").join(USAGE_FILENAME),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a timestamped record for `manifest`.
    pub fn record(&self, manifest: &Path) -> Result<()> {
        let key = fs::canonicalize(manifest)
            .unwrap_or_else(|_| manifest.to_path_buf())
            .display()
            .to_string();
        let mut doc = if self.path.exists() {
            let contents = fs::read_to_string(&self.path)
                .with_context(|| format!("failed to read {}", self.path.display()))?;
            contents
                .parse::<DocumentMut>()
                .with_context(|| format!("failed to parse {}", self.path.display()))?
        } else {
            DocumentMut::new()
        };

        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("failed to format usage timestamp")?;
        let mut record = Table::new();
        record.insert("time", Item::Value(TomlValue::from(now)));

        match doc.get_mut(&key).and_then(Item::as_array_of_tables_mut) {
            Some(records) => records.push(record),
            None => {
                let mut records = ArrayOfTables::new();
                records.push(record);
                doc.insert(&key, Item::ArrayOfTables(records));
            }
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, doc.to_string())
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    /// Number of records stored for `manifest`.
    #[cfg(test)]
    pub(crate) fn records_for(&self, manifest: &Path) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let key = fs::canonicalize(manifest)
            .unwrap_or_else(|_| manifest.to_path_buf())
            .display()
            .to_string();
        let doc: DocumentMut = fs::read_to_string(&self.path)?
            .parse()
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(doc
            .get(&key)
            .and_then(Item::as_array_of_tables)
            .map_or(0, ArrayOfTables::len))
    }
}
