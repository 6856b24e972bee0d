//! Per-title patch definitions and selections
//!
//! ```text
//! <dir>/definitions/<serial>.json   { "<repository>": [definition, ...] }
//! <dir>/selections/<serial>.json    { "<patch id>": true | false }
//! ```
//!
//! One file per serial, so writing one title never touches another.

use crate::definition::PatchDefinition;
use cv_core::error::{CatalogError, PatchError};
use cv_core::persist::write_atomic;
use cv_core::title::Serial;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Patch id to enabled flag
pub type Selection = BTreeMap<String, bool>;

/// Definitions per repository name
type RepositoryDefinitions = BTreeMap<String, Vec<PatchDefinition>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct DefinitionsDocument {
    #[serde(default)]
    repositories: RepositoryDefinitions,
}

/// A stored definition with its selection state
#[derive(Debug, Clone)]
pub struct PatchListing {
    pub repository: String,
    pub definition: PatchDefinition,
    pub enabled: bool,
}

/// Patch catalog rooted at a directory
pub struct PatchCatalog {
    dir: PathBuf,
    /// Selections loaded this session
    selections: RwLock<HashMap<Serial, Selection>>,
    writer: Mutex<()>,
}

impl PatchCatalog {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            selections: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn definitions_path(&self, serial: &Serial) -> PathBuf {
        self.dir.join("definitions").join(format!("{}.json", serial))
    }

    fn selections_path(&self, serial: &Serial) -> PathBuf {
        self.dir.join("selections").join(format!("{}.json", serial))
    }

    /// Replace one repository's definitions for a title
    ///
    /// Newly seen ids are added to the selection as disabled; existing
    /// choices are kept, including those for ids no longer offered.
    /// Returns the number of newly seen ids. An unreadable definitions file
    /// is left untouched and reported as `CatalogUnreadable`.
    pub fn store_definitions(
        &self,
        serial: &Serial,
        repository: &str,
        definitions: Vec<PatchDefinition>,
    ) -> Result<usize, PatchError> {
        let _writer = self.writer.lock();

        let mut document = read_json::<DefinitionsDocument>(&self.definitions_path(serial))?
            .unwrap_or_default();
        let ids: Vec<String> = definitions.iter().map(|d| d.id.clone()).collect();
        document
            .repositories
            .insert(repository.to_string(), definitions);
        write_json(&self.definitions_path(serial), &document)?;

        let mut selection = self.selection_locked(serial);
        let mut added = 0;
        for id in ids {
            if !selection.contains_key(&id) {
                selection.insert(id, false);
                added += 1;
            }
        }
        if added > 0 {
            self.write_selection(serial, &selection)?;
        }
        self.selections.write().insert(serial.clone(), selection);

        tracing::info!(
            "Stored patches for {} from {} ({} new)",
            serial,
            repository,
            added
        );
        Ok(added)
    }

    /// All stored definitions for a title, by repository name
    pub fn definitions(&self, serial: &Serial) -> RepositoryDefinitions {
        self.read_definitions(serial)
    }

    fn read_definitions(&self, serial: &Serial) -> RepositoryDefinitions {
        let path = self.definitions_path(serial);
        match read_json::<DefinitionsDocument>(&path) {
            Ok(Some(document)) => document.repositories,
            Ok(None) => RepositoryDefinitions::new(),
            Err(e) => {
                tracing::warn!("{}; ignoring stored patch definitions", e);
                RepositoryDefinitions::new()
            }
        }
    }

    /// Selection for a title
    pub fn load(&self, serial: &Serial) -> Selection {
        if let Some(selection) = self.selections.read().get(serial) {
            return selection.clone();
        }
        let _writer = self.writer.lock();
        let selection = self.selection_locked(serial);
        self.selections
            .write()
            .insert(serial.clone(), selection.clone());
        selection
    }

    /// Cached selection, falling back to disk; caller holds the writer lock
    fn selection_locked(&self, serial: &Serial) -> Selection {
        if let Some(selection) = self.selections.read().get(serial) {
            return selection.clone();
        }
        let path = self.selections_path(serial);
        match read_json::<Selection>(&path) {
            Ok(selection) => selection.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("{}; all patches for {} start disabled", e, serial);
                Selection::new()
            }
        }
    }

    fn write_selection(&self, serial: &Serial, selection: &Selection) -> Result<(), PatchError> {
        write_json(&self.selections_path(serial), selection)
    }

    /// Enable or disable one patch, persisting immediately
    pub fn set_selection(&self, serial: &Serial, id: &str, enabled: bool) -> Result<(), PatchError> {
        let _writer = self.writer.lock();

        let known = self
            .read_definitions(serial)
            .values()
            .flatten()
            .any(|definition| definition.id == id);
        if !known {
            return Err(PatchError::NotFound(format!("{} patch {:?}", serial, id)));
        }

        let mut selection = self.selection_locked(serial);
        selection.insert(id.to_string(), enabled);
        self.write_selection(serial, &selection)?;
        self.selections.write().insert(serial.clone(), selection);

        tracing::info!(
            "Patch {} for {} {}",
            id,
            serial,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Write every selection loaded this session
    pub fn persist(&self) -> Result<(), PatchError> {
        let _writer = self.writer.lock();
        let selections = self.selections.read().clone();
        for (serial, selection) in &selections {
            self.write_selection(serial, selection)?;
        }
        tracing::debug!("Persisted patch selections for {} titles", selections.len());
        Ok(())
    }

    /// Stored definitions with their selection state
    ///
    /// Ordered by repository name, then document order.
    pub fn list(&self, serial: &Serial) -> Vec<PatchListing> {
        let selection = self.load(serial);
        self.definitions(serial)
            .into_iter()
            .flat_map(|(repository, definitions)| {
                let selection = &selection;
                definitions.into_iter().map(move |definition| PatchListing {
                    repository: repository.clone(),
                    enabled: selection.get(&definition.id).copied().unwrap_or(false),
                    definition,
                })
            })
            .collect()
    }

    /// Enabled definitions in application order
    pub fn enabled_definitions(&self, serial: &Serial) -> Vec<PatchDefinition> {
        self.list(serial)
            .into_iter()
            .filter(|listing| listing.enabled)
            .map(|listing| listing.definition)
            .collect()
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, CatalogError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CatalogError::CatalogUnreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| CatalogError::CatalogUnreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PatchError> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| CatalogError::Serialize(e.to_string()))?;
    write_atomic(path, content.as_bytes()).map_err(CatalogError::from)?;
    Ok(())
}
