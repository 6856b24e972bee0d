//! Host directory layout for installed content
//!
//! ```text
//! <root>/<serial>                   base game
//! <root>/<serial>-UPDATE            update
//! <root>/addcont/<serial>/<dlc-id>  downloadable content
//! <root>/savedata/<serial>          save data
//! <root>/.staging/                  in-progress installs
//! ```

use cv_core::title::{Category, TitleKey};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Staging and backup directories are unique per process and attempt
static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Staging directory name under the content root
pub const STAGING_DIR: &str = ".staging";

/// Resolves install locations below a content root
#[derive(Debug, Clone)]
pub struct ContentLayout {
    root: PathBuf,
}

impl ContentLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of a title's files
    pub fn install_dir(&self, key: &TitleKey) -> PathBuf {
        let serial = key.serial.as_str();
        match key.category {
            Category::Base => self.root.join(serial),
            Category::Update => self.root.join(format!("{}-UPDATE", serial)),
            Category::Dlc => {
                let dir = self.root.join("addcont").join(serial);
                match &key.dlc_id {
                    Some(id) => dir.join(id),
                    None => dir,
                }
            }
            Category::SaveData => self.root.join("savedata").join(serial),
        }
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Fresh staging directory for one install attempt
    ///
    /// Lives under the content root so the final move is a rename on the
    /// same file system.
    pub fn staging_dir(&self, key: &TitleKey) -> PathBuf {
        self.staging_root().join(self.unique_name(key, "stage"))
    }

    /// Where a replaced install is parked until the new one is committed
    pub fn backup_dir(&self, key: &TitleKey) -> PathBuf {
        self.staging_root().join(self.unique_name(key, "backup"))
    }

    fn unique_name(&self, key: &TitleKey, kind: &str) -> String {
        let n = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut name = format!(
            "{}-{}-{}-{}-{}",
            key.serial,
            key.category.as_str(),
            kind,
            std::process::id(),
            n
        );
        if let Some(id) = &key.dlc_id {
            name.push('-');
            name.push_str(id);
        }
        name
    }

    /// Create the content root and staging directory
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.staging_root())
    }

    /// Remove staging leftovers from interrupted sessions
    ///
    /// Must only run while no install is in flight.
    pub fn clean_staging(&self) -> std::io::Result<usize> {
        let staging = self.staging_root();
        let entries = match std::fs::read_dir(&staging) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
            tracing::debug!("Removed stale staging entry {}", path.display());
            removed += 1;
        }
        if removed > 0 {
            tracing::info!("Cleaned {} stale staging entries", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::title::Serial;

    fn key(category: Category, dlc: Option<&str>) -> TitleKey {
        TitleKey::new(
            Serial::parse("CUSA00001").unwrap(),
            category,
            dlc.map(str::to_string),
        )
    }

    #[test]
    fn test_install_dirs() {
        let layout = ContentLayout::new("/games");
        assert_eq!(
            layout.install_dir(&key(Category::Base, None)),
            PathBuf::from("/games/CUSA00001")
        );
        assert_eq!(
            layout.install_dir(&key(Category::Update, None)),
            PathBuf::from("/games/CUSA00001-UPDATE")
        );
        assert_eq!(
            layout.install_dir(&key(Category::Dlc, Some("SKIN01"))),
            PathBuf::from("/games/addcont/CUSA00001/SKIN01")
        );
        assert_eq!(
            layout.install_dir(&key(Category::SaveData, None)),
            PathBuf::from("/games/savedata/CUSA00001")
        );
    }

    #[test]
    fn test_staging_dirs_are_unique() {
        let layout = ContentLayout::new("/games");
        let k = key(Category::Base, None);
        let a = layout.staging_dir(&k);
        let b = layout.staging_dir(&k);
        assert_ne!(a, b);
        assert!(a.starts_with(layout.staging_root()));
    }

    #[test]
    fn test_clean_staging() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ContentLayout::new(dir.path());
        assert_eq!(layout.clean_staging().unwrap(), 0);

        layout.ensure().unwrap();
        let stale = layout.staging_dir(&key(Category::Base, None));
        std::fs::create_dir_all(stale.join("sub")).unwrap();
        std::fs::write(stale.join("sub/file"), b"x").unwrap();

        assert_eq!(layout.clean_staging().unwrap(), 1);
        assert!(!stale.exists());
    }
}
