//! Persistent record of installed content
//!
//! Stored as JSON and replaced atomically on every change (write to a
//! temporary file, then rename over the old one).

use cv_core::error::CatalogError;
use cv_core::persist::write_atomic;
use cv_core::title::{Category, InstalledTitle, Serial, TitleKey, TitleVersion};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Catalog file format revision
pub const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CatalogDocument {
    version: u32,
    #[serde(default)]
    titles: Vec<InstalledTitle>,
}

/// Content catalog
///
/// Readers never block each other; mutations are serialized through a
/// writer lock that covers the whole read-modify-write-persist cycle.
pub struct ContentCatalog {
    path: PathBuf,
    titles: RwLock<BTreeMap<TitleKey, InstalledTitle>>,
    writer: Mutex<()>,
}

impl ContentCatalog {
    /// Load the catalog, starting empty if the file is missing or unreadable
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::try_load(&path) {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::warn!("{}; starting with an empty catalog", e);
                Self::empty(path)
            }
        }
    }

    /// Load the catalog, reporting corruption instead of recovering from it
    ///
    /// A missing file is not an error.
    pub fn try_load(path: &Path) -> Result<Self, CatalogError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No catalog at {}, starting empty", path.display());
                return Ok(Self::empty(path.to_path_buf()));
            }
            Err(e) => {
                return Err(CatalogError::CatalogUnreadable {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };

        let document: CatalogDocument =
            serde_json::from_str(&content).map_err(|e| CatalogError::CatalogUnreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if document.version != CATALOG_VERSION {
            return Err(CatalogError::CatalogUnreadable {
                path: path.to_path_buf(),
                reason: format!("unsupported catalog version {}", document.version),
            });
        }

        let titles = document
            .titles
            .into_iter()
            .map(|title| (title.key(), title))
            .collect::<BTreeMap<_, _>>();

        tracing::info!("Loaded {} catalog records from {}", titles.len(), path.display());

        Ok(Self {
            path: path.to_path_buf(),
            titles: RwLock::new(titles),
            writer: Mutex::new(()),
        })
    }

    fn empty(path: PathBuf) -> Self {
        Self {
            path,
            titles: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current state to disk
    pub fn save(&self) -> Result<(), CatalogError> {
        let _writer = self.writer.lock();
        self.persist()
    }

    fn persist(&self) -> Result<(), CatalogError> {
        let document = CatalogDocument {
            version: CATALOG_VERSION,
            titles: self.titles.read().values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&document)
            .map_err(|e| CatalogError::Serialize(e.to_string()))?;

        write_atomic(&self.path, content.as_bytes())?;
        Ok(())
    }

    /// Insert or replace a record and persist, returning the replaced record
    ///
    /// The in-memory state is rolled back if the write fails.
    pub fn upsert(&self, title: InstalledTitle) -> Result<Option<InstalledTitle>, CatalogError> {
        let _writer = self.writer.lock();
        let key = title.key();
        let previous = self.titles.write().insert(key.clone(), title);

        if let Err(e) = self.persist() {
            let mut titles = self.titles.write();
            match &previous {
                Some(old) => {
                    titles.insert(key, old.clone());
                }
                None => {
                    titles.remove(&key);
                }
            }
            return Err(e);
        }

        tracing::debug!("Catalog record stored for {}", self.path.display());
        Ok(previous)
    }

    /// Remove a record and persist
    pub fn remove(&self, key: &TitleKey) -> Result<Option<InstalledTitle>, CatalogError> {
        let _writer = self.writer.lock();
        let Some(removed) = self.titles.write().remove(key) else {
            return Ok(None);
        };

        if let Err(e) = self.persist() {
            self.titles.write().insert(key.clone(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    pub fn find(&self, key: &TitleKey) -> Option<InstalledTitle> {
        self.titles.read().get(key).cloned()
    }

    /// All records (base, update, DLC, save data) for one serial
    pub fn find_for_serial(&self, serial: &Serial) -> Vec<InstalledTitle> {
        self.titles
            .read()
            .values()
            .filter(|title| &title.serial == serial)
            .cloned()
            .collect()
    }

    /// Every record, ordered by serial then category
    pub fn list(&self) -> Vec<InstalledTitle> {
        self.titles.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.titles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.titles.read().is_empty()
    }

    /// Version the title runs at: the newer of base and update
    pub fn effective_version(&self, serial: &Serial) -> Option<TitleVersion> {
        let titles = self.titles.read();
        [Category::Base, Category::Update]
            .into_iter()
            .filter_map(|category| {
                titles
                    .get(&TitleKey::new(serial.clone(), category, None))
                    .map(|title| title.version.clone())
            })
            .max()
    }
}
