//! Migration catalog: loading and structural validation.
//!
//! The catalog is the read-only, ordinal-ordered set of units for a run.
//! Validation is purely structural and never touches a database, so it can
//! run on its own for dry runs and CI checks.

pub mod graph;
pub mod parser;

use std::path::Path;

use crate::error::{Error, Result};
use crate::unit::MigrationUnit;

pub use graph::DependencyGraph;

/// Ordered set of migration units.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    units: Vec<MigrationUnit>,
}

impl Catalog {
    /// Build a catalog from units defined in code, ordered by ordinal.
    pub fn from_units(mut units: Vec<MigrationUnit>) -> Self {
        units.sort_by_key(|u| u.ordinal());
        Self { units }
    }

    /// Load every `<digits>_<name>.sql` file in `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::load(dir, format!("cannot read directory: {}", e)))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::load(dir, e.to_string()))?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| Error::load(&path, "file name is not valid UTF-8"))?
                .to_string();
            let ordinal = parser::parse_ordinal(&stem)
                .ok_or_else(|| Error::load(&path, "file name has no numeric prefix"))?;
            files.push((ordinal, stem, path));
        }

        files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let mut units = Vec::with_capacity(files.len());
        for window in files.windows(2) {
            if window[0].0 == window[1].0 {
                return Err(Error::load(
                    &window[1].2,
                    format!(
                        "ordinal {} is also used by {}",
                        window[1].0,
                        window[0].2.display()
                    ),
                ));
            }
        }

        for (ordinal, stem, path) in files {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| Error::load(&path, format!("cannot read file: {}", e)))?;
            let unit = parser::parse_unit(ordinal, &stem, &text, &path)?;
            tracing::debug!(
                unit = %unit.name(),
                ordinal,
                operations = unit.operations().len(),
                "loaded migration unit"
            );
            units.push(unit);
        }

        tracing::info!(directory = %dir.display(), units = units.len(), "catalog loaded");
        Ok(Self { units })
    }

    /// Validate the dependency graph; `baseline` lists pre-existing objects.
    pub fn validate(&self, baseline: &[String]) -> Result<DependencyGraph> {
        let graph = DependencyGraph::build(&self.units, baseline)?;
        tracing::debug!(units = graph.len(), "catalog validated");
        Ok(graph)
    }

    /// Units in ordinal order.
    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    /// Find a unit by its stable name.
    pub fn get(&self, name: &str) -> Option<&MigrationUnit> {
        self.units.iter().find(|u| u.name() == name)
    }

    /// Number of units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the catalog has no units.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
