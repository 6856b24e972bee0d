//! Package installation
//!
//! Entries are extracted into a private staging directory and moved into
//! the content tree in one rename once every entry has been written, so a
//! failed or cancelled install never touches the previous installation.

use crate::catalog::ContentCatalog;
use crate::layout::ContentLayout;
use crate::registry::InstallRegistry;
use chrono::Utc;
use cv_core::cancel::CancellationToken;
use cv_core::error::{EntryFailure, InstallError, PackageError};
use cv_core::title::{InstalledTitle, TitleKey};
use cv_loader::{CryptoEngine, KeyProvider, PackageEntry, PackageHandle, PackageHeader};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default copy buffer for entry extraction
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Install behaviour switches
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Replace an installed title even if it is newer or equal
    pub force_overwrite: bool,
    /// Replace an installed title of the same version
    pub overwrite_same_version: bool,
    /// Check entry checksums after decryption
    pub verify_checksums: bool,
    pub buffer_size: usize,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            force_overwrite: false,
            overwrite_same_version: false,
            verify_checksums: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Progress after each completed entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallProgress {
    pub entries_completed: u32,
    pub entries_total: u32,
    pub bytes_transferred: u64,
}

impl InstallProgress {
    /// Completion in the range 0.0..=1.0
    pub fn fraction(&self) -> f32 {
        if self.entries_total == 0 {
            1.0
        } else {
            self.entries_completed as f32 / self.entries_total as f32
        }
    }
}

/// Receives install progress
pub trait ProgressSink {
    fn report(&self, progress: InstallProgress);
}

impl<F: Fn(InstallProgress)> ProgressSink for F {
    fn report(&self, progress: InstallProgress) {
        self(progress)
    }
}

/// Discards progress
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: InstallProgress) {}
}

/// Result for one package of a batch
#[derive(Debug)]
pub enum InstallOutcome {
    Installed(InstalledTitle),
    /// Same version already present; nothing was modified
    AlreadyInstalled(InstalledTitle),
    Failed(InstallError),
}

#[derive(Debug)]
pub struct InstallItem {
    pub source: PathBuf,
    pub outcome: InstallOutcome,
}

/// Itemized result of a batch install
#[derive(Debug, Default)]
pub struct InstallReport {
    pub items: Vec<InstallItem>,
}

impl InstallReport {
    pub fn installed(&self) -> impl Iterator<Item = &InstalledTitle> {
        self.items.iter().filter_map(|item| match &item.outcome {
            InstallOutcome::Installed(title) => Some(title),
            _ => None,
        })
    }

    pub fn already_installed(&self) -> impl Iterator<Item = &InstalledTitle> {
        self.items.iter().filter_map(|item| match &item.outcome {
            InstallOutcome::AlreadyInstalled(title) => Some(title),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Path, &InstallError)> {
        self.items.iter().filter_map(|item| match &item.outcome {
            InstallOutcome::Failed(err) => Some((item.source.as_path(), err)),
            _ => None,
        })
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Installs packages into a content layout and records them in the catalog
pub struct Installer {
    layout: ContentLayout,
    catalog: Arc<ContentCatalog>,
    registry: Arc<InstallRegistry>,
    keys: Arc<dyn KeyProvider>,
}

impl Installer {
    pub fn new(layout: ContentLayout, catalog: Arc<ContentCatalog>) -> Self {
        Self {
            layout,
            catalog,
            registry: InstallRegistry::new(),
            keys: Arc::new(CryptoEngine::new()),
        }
    }

    /// Share an in-flight registry with other installers
    pub fn with_registry(mut self, registry: Arc<InstallRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Key provider used for packages opened by path
    pub fn with_keys(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = keys;
        self
    }

    pub fn layout(&self) -> &ContentLayout {
        &self.layout
    }

    pub fn catalog(&self) -> &Arc<ContentCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<InstallRegistry> {
        &self.registry
    }

    /// Open a package file and install it
    pub fn install_file(
        &self,
        path: &Path,
        options: &InstallOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<InstalledTitle, InstallError> {
        let handle = PackageHandle::open_file(path)?.with_keys(Arc::clone(&self.keys));
        self.install(&handle, options, progress, cancel)
    }

    /// Install every package in order, collecting one outcome per package
    ///
    /// Cancellation marks the current and all remaining packages as cancelled.
    pub fn install_many(
        &self,
        paths: &[PathBuf],
        options: &InstallOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> InstallReport {
        let mut report = InstallReport::default();
        for path in paths {
            let outcome = if cancel.is_cancelled() {
                InstallOutcome::Failed(InstallError::Cancelled)
            } else {
                match self.install_file(path, options, progress, cancel) {
                    Ok(title) => InstallOutcome::Installed(title),
                    Err(InstallError::AlreadyInstalled { existing }) => {
                        InstallOutcome::AlreadyInstalled(*existing)
                    }
                    Err(e) => {
                        tracing::warn!("Install of {} failed: {}", path.display(), e);
                        InstallOutcome::Failed(e)
                    }
                }
            };
            report.items.push(InstallItem {
                source: path.clone(),
                outcome,
            });
        }
        report
    }

    /// Install one opened package
    pub fn install<R: Read + Seek + Send>(
        &self,
        handle: &PackageHandle<R>,
        options: &InstallOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<InstalledTitle, InstallError> {
        let header = handle.header();
        let key = header.title_key();
        let _guard = self.registry.try_begin(key.clone())?;

        self.check_existing(&key, header, options)?;

        // Structural problems in the table abort before anything is written
        let entries = handle.entries().collect::<Result<Vec<_>, _>>()?;
        for entry in &entries {
            entry.check_path()?;
        }

        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        self.layout
            .ensure()
            .map_err(|e| InstallError::io(self.layout.staging_root(), e))?;
        let staging = self.layout.staging_dir(&key);
        std::fs::create_dir_all(&staging).map_err(|e| InstallError::io(&staging, e))?;

        tracing::info!(
            "Installing {} version {} ({} entries)",
            key,
            header.version,
            entries.len()
        );

        let bytes = match self.extract_all(handle, &entries, &staging, options, progress, cancel) {
            Ok(bytes) => bytes,
            Err(e) => {
                discard(&staging);
                return Err(e);
            }
        };

        let target = self.layout.install_dir(&key);
        let backup = match self.commit(&key, &staging, &target) {
            Ok(backup) => backup,
            Err(e) => {
                discard(&staging);
                return Err(e);
            }
        };

        let title = InstalledTitle {
            serial: header.serial.clone(),
            category: header.category,
            version: header.version.clone(),
            dlc_id: key.dlc_id.clone(),
            install_path: target.clone(),
            installed_at: Utc::now(),
            entry_count: entries.len() as u32,
            size: bytes,
        };

        if let Err(e) = self.catalog.upsert(title.clone()) {
            tracing::error!("Catalog update failed for {}, rolling back: {}", key, e);
            discard(&target);
            if let Some(backup) = &backup {
                if let Err(restore) = std::fs::rename(backup, &target) {
                    tracing::error!(
                        "Failed to restore {} from {}: {}",
                        target.display(),
                        backup.display(),
                        restore
                    );
                }
            }
            return Err(e.into());
        }

        if let Some(backup) = backup {
            discard(&backup);
        }

        tracing::info!(
            "Installed {} version {} to {} ({} bytes)",
            key,
            title.version,
            target.display(),
            bytes
        );
        Ok(title)
    }

    /// Remove an installed title's files and its catalog record
    pub fn uninstall(&self, key: &TitleKey) -> Result<InstalledTitle, InstallError> {
        let _guard = self.registry.try_begin(key.clone())?;
        let Some(title) = self.catalog.find(key) else {
            return Err(InstallError::NotInstalled(key.to_string()));
        };

        match std::fs::remove_dir_all(&title.install_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("{} was already missing on disk", title.install_path.display());
            }
            Err(e) => return Err(InstallError::io(&title.install_path, e)),
        }
        self.catalog.remove(key)?;

        tracing::info!("Uninstalled {} version {}", key, title.version);
        Ok(title)
    }

    fn check_existing(
        &self,
        key: &TitleKey,
        header: &PackageHeader,
        options: &InstallOptions,
    ) -> Result<(), InstallError> {
        let Some(existing) = self.catalog.find(key) else {
            return Ok(());
        };

        if options.force_overwrite {
            tracing::warn!(
                "Forcing install of {} {} over installed {}",
                key,
                header.version,
                existing.version
            );
            return Ok(());
        }

        match header.version.cmp(&existing.version) {
            Ordering::Greater => Ok(()),
            Ordering::Equal if options.overwrite_same_version => Ok(()),
            Ordering::Equal => Err(InstallError::AlreadyInstalled {
                existing: Box::new(existing),
            }),
            // An older DLC unit is still just "already installed"
            Ordering::Less if !header.category.is_versioned() => {
                Err(InstallError::AlreadyInstalled {
                    existing: Box::new(existing),
                })
            }
            Ordering::Less => Err(InstallError::VersionConflict {
                serial: key.serial.to_string(),
                category: key.category,
                installed: existing.version,
                incoming: header.version.clone(),
            }),
        }
    }

    fn extract_all<R: Read + Seek + Send>(
        &self,
        handle: &PackageHandle<R>,
        entries: &[PackageEntry],
        staging: &Path,
        options: &InstallOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64, InstallError> {
        let mut state = InstallProgress {
            entries_completed: 0,
            entries_total: entries.len() as u32,
            bytes_transferred: 0,
        };
        let mut failures = Vec::new();
        let mut buffer = vec![0u8; options.buffer_size.max(4096)];

        for entry in entries {
            if cancel.is_cancelled() {
                tracing::info!(
                    "Install cancelled after {}/{} entries",
                    state.entries_completed,
                    state.entries_total
                );
                return Err(InstallError::Cancelled);
            }

            let target = staging.join(&entry.path);
            if entry.is_dir() {
                std::fs::create_dir_all(&target).map_err(|e| InstallError::io(&target, e))?;
            } else {
                match extract_entry(handle, entry, &target, options, &mut buffer) {
                    Ok(written) => state.bytes_transferred += written,
                    Err(InstallError::Package(PackageError::DecryptionFailed { path, reason })) => {
                        tracing::warn!("Entry {} failed: {}", path, reason);
                        failures.push(EntryFailure { path, reason });
                    }
                    Err(e) => return Err(e),
                }
            }

            state.entries_completed += 1;
            progress.report(state);
        }

        if !failures.is_empty() {
            return Err(InstallError::CorruptEntries { failures });
        }
        Ok(state.bytes_transferred)
    }

    /// Move the staged tree into place, returning the parked previous install
    fn commit(
        &self,
        key: &TitleKey,
        staging: &Path,
        target: &Path,
    ) -> Result<Option<PathBuf>, InstallError> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| InstallError::io(parent, e))?;
        }

        let backup = if target.exists() {
            let backup = self.layout.backup_dir(key);
            std::fs::rename(target, &backup).map_err(|e| InstallError::io(target, e))?;
            Some(backup)
        } else {
            None
        };

        if let Err(e) = std::fs::rename(staging, target) {
            if let Some(backup) = &backup {
                if let Err(restore) = std::fs::rename(backup, target) {
                    tracing::error!(
                        "Failed to restore {} from {}: {}",
                        target.display(),
                        backup.display(),
                        restore
                    );
                }
            }
            return Err(InstallError::io(target, e));
        }

        Ok(backup)
    }
}

fn extract_entry<R: Read + Seek + Send>(
    handle: &PackageHandle<R>,
    entry: &PackageEntry,
    target: &Path,
    options: &InstallOptions,
    buffer: &mut [u8],
) -> Result<u64, InstallError> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| InstallError::io(parent, e))?;
    }

    let mut reader = handle.read_entry_with(entry, options.verify_checksums)?;
    let file = File::create(target).map_err(|e| InstallError::io(target, e))?;
    let mut writer = BufWriter::new(file);

    let mut written = 0u64;
    loop {
        let n = reader.read(buffer).map_err(PackageError::from_io)?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buffer[..n])
            .map_err(|e| InstallError::io(target, e))?;
        written += n as u64;
    }
    writer.flush().map_err(|e| InstallError::io(target, e))?;

    tracing::trace!("Extracted {} ({} bytes)", entry.path, written);
    Ok(written)
}

fn discard(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        let progress = InstallProgress {
            entries_completed: 1,
            entries_total: 4,
            bytes_transferred: 0,
        };
        assert_eq!(progress.fraction(), 0.25);
        assert_eq!(InstallProgress::default().fraction(), 1.0);
    }

    #[test]
    fn test_default_options() {
        let options = InstallOptions::default();
        assert!(!options.force_overwrite);
        assert!(!options.overwrite_same_version);
        assert!(options.verify_checksums);
    }
}
