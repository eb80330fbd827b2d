// Strategy catalog: named strategies stored in the winws root directory

use crate::error::SupervisorError;
use crate::launch::ResourceLayout;
use crate::plan::LaunchPlan;
use crate::rule::StrategyDefinition;
use crate::script::{parse_script, render_script};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Launcher that manages the Windows service; never a strategy
const SERVICE_SCRIPT: &str = "service";

/// Storage format of a catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    Json,
    Script,
}

impl EntryKind {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "json" => Some(EntryKind::Json),
            "bat" | "cmd" => Some(EntryKind::Script),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: String,
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Strategy files in the winws root
///
/// A strategy is stored as `<id>.json`, or as a `<id>.bat` / `<id>.cmd`
/// launcher. When both exist the JSON definition wins.
#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
    executable_name: String,
}

impl Catalog {
    pub fn new(layout: &ResourceLayout) -> Self {
        Self {
            root: layout.root.clone(),
            executable_name: layout.executable_name.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every strategy id with its preferred backing file, sorted by id
    pub fn list(&self) -> Result<Vec<CatalogEntry>> {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("Strategy directory {:?} does not exist", self.root);
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e).context(format!(
                    "Failed to read strategy directory: {:?}",
                    self.root
                ));
            }
        };

        let mut entries: BTreeMap<String, CatalogEntry> = BTreeMap::new();
        for item in dir {
            let item = item.context("Failed to read directory entry")?;
            let path = item.path();
            if !path.is_file() {
                continue;
            }
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            let Some(kind) = EntryKind::from_extension(ext) else {
                continue;
            };
            if stem.eq_ignore_ascii_case(SERVICE_SCRIPT) {
                continue;
            }

            // Json sorts first, and `.bat` beats `.cmd` by name
            let keep_existing = entries
                .get(stem)
                .is_some_and(|existing| (existing.kind, &existing.path) <= (kind, &path));
            if !keep_existing {
                let id = stem.to_string();
                entries.insert(id.clone(), CatalogEntry { id, path, kind });
            }
        }

        Ok(entries.into_values().collect())
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        Ok(self.list()?.into_iter().map(|e| e.id).collect())
    }

    fn entry(&self, id: &str) -> Result<Option<CatalogEntry>> {
        Ok(self.list()?.into_iter().find(|e| e.id == id))
    }

    /// Load and validate a strategy by id
    pub fn resolve(&self, id: &str) -> Result<StrategyDefinition, SupervisorError> {
        validate_id(id)?;

        let entry = self
            .entry(id)
            .map_err(|e| SupervisorError::Config(format!("{:#}", e)))?
            .ok_or_else(|| SupervisorError::UnknownStrategy(id.to_string()))?;

        let text = fs::read_to_string(&entry.path).map_err(|e| {
            SupervisorError::Config(format!("failed to read {:?}: {}", entry.path, e))
        })?;

        let def = match entry.kind {
            EntryKind::Json => {
                let mut def: StrategyDefinition = serde_json::from_str(&text).map_err(|e| {
                    SupervisorError::Config(format!("failed to parse {:?}: {}", entry.path, e))
                })?;
                def.id = id.to_string();
                def
            }
            EntryKind::Script => parse_script(id, &text, &self.executable_name)?,
        };

        def.validate()?;
        log::debug!(
            "Resolved strategy '{}' from {:?} ({} rule(s))",
            id,
            entry.path,
            def.rules.len()
        );
        Ok(def)
    }

    /// Write the definition as `<id>.json`
    pub fn save(&self, def: &StrategyDefinition) -> Result<PathBuf> {
        validate_id(&def.id)?;
        def.validate()?;

        fs::create_dir_all(&self.root).context(format!(
            "Failed to create strategy directory: {:?}",
            self.root
        ))?;

        let path = self.root.join(format!("{}.json", def.id));
        let contents =
            serde_json::to_string_pretty(def).context("Failed to serialize strategy")?;
        fs::write(&path, contents).context(format!("Failed to write strategy file: {:?}", path))?;

        log::info!("Saved strategy '{}' to {:?}", def.id, path);
        Ok(path)
    }

    /// Write the rendered batch launcher as `<id>.bat`
    pub fn write_script(&self, def: &StrategyDefinition, plan: &LaunchPlan) -> Result<PathBuf> {
        validate_id(&def.id)?;

        let path = self.root.join(format!("{}.bat", def.id));
        let script = render_script(def, plan, &self.executable_name);
        fs::write(&path, script).context(format!("Failed to write launcher: {:?}", path))?;

        log::info!("Wrote launcher for '{}' to {:?}", def.id, path);
        Ok(path)
    }

    /// Remove every file backing `id`; false when none existed
    pub fn delete(&self, id: &str) -> Result<bool> {
        validate_id(id)?;

        let mut removed = false;
        for ext in ["json", "bat", "cmd"] {
            let path = self.root.join(format!("{}.{}", id, ext));
            match fs::remove_file(&path) {
                Ok(()) => {
                    log::info!("Deleted {:?}", path);
                    removed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).context(format!("Failed to delete {:?}", path)),
            }
        }
        Ok(removed)
    }
}

/// Ids become file names, so they must stay inside the root
fn validate_id(id: &str) -> Result<(), SupervisorError> {
    let bad = id.trim().is_empty()
        || id.contains(['/', '\\', ':'])
        || id.contains("..")
        || id.eq_ignore_ascii_case(SERVICE_SCRIPT);
    if bad {
        return Err(SupervisorError::Config(format!(
            "invalid strategy id '{}'",
            id
        )));
    }
    Ok(())
}
