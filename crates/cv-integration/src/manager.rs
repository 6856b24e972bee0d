//! Content manager
//!
//! One object per session holding the content catalog, installer, key
//! database and patch catalog.

use crate::task::InstallTask;
use cv_core::cancel::CancellationToken;
use cv_core::config::Config;
use cv_core::error::{CoreError, InstallError, PatchError};
use cv_core::title::{InstalledTitle, Serial, TitleKey, TitleVersion};
use cv_loader::CryptoEngine;
use cv_patch::{
    repository_for_url, ApplyReport, ParseOutcome, ParseWarning, ParseWarningKind, PatchApplier,
    PatchCatalog, PatchListing, PatchSource, PatchTarget,
};
use cv_vfs::{ContentCatalog, ContentLayout, InstallOptions, InstallReport, Installer, NoProgress};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Entry point for front ends
pub struct ContentManager {
    config: Config,
    catalog: Arc<ContentCatalog>,
    installer: Arc<Installer>,
    patches: PatchCatalog,
}

impl ContentManager {
    /// Load catalogs and keys described by `config`
    pub fn open(config: Config) -> Result<Self, CoreError> {
        tracing::info!("Opening content store at {}", config.paths.content_root.display());

        let layout = ContentLayout::new(config.paths.content_root.clone());
        layout.ensure()?;
        // No install can be running yet, so anything staged is left over
        if let Err(e) = layout.clean_staging() {
            tracing::warn!("Failed to clean staging directory: {}", e);
        }

        let mut keys = CryptoEngine::new();
        if config.paths.keys.exists() {
            if let Err(e) = keys.load_keys_from_file(&config.paths.keys) {
                tracing::warn!("Failed to load key database: {}", e);
            }
        }

        let catalog = Arc::new(ContentCatalog::load(config.paths.catalog.clone()));
        let installer =
            Arc::new(Installer::new(layout, Arc::clone(&catalog)).with_keys(Arc::new(keys)));
        let patches = PatchCatalog::open(config.paths.patches.clone());

        Ok(Self {
            config,
            catalog,
            installer,
            patches,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &ContentCatalog {
        &self.catalog
    }

    pub fn patch_catalog(&self) -> &PatchCatalog {
        &self.patches
    }

    /// Install options seeded from configuration
    pub fn install_options(&self) -> InstallOptions {
        InstallOptions {
            verify_checksums: self.config.install.verify_checksums,
            buffer_size: self.config.install.buffer_size,
            ..InstallOptions::default()
        }
    }

    /// Install one package file on the calling thread
    pub fn install_package(
        &self,
        path: &Path,
        options: &InstallOptions,
    ) -> Result<InstalledTitle, InstallError> {
        self.installer
            .install_file(path, options, &NoProgress, &CancellationToken::new())
    }

    /// Install several package files, reporting each outcome
    pub fn install_packages(&self, paths: &[PathBuf], options: &InstallOptions) -> InstallReport {
        self.installer
            .install_many(paths, options, &NoProgress, &CancellationToken::new())
    }

    /// Install a package on a background thread
    pub fn spawn_install(&self, path: impl Into<PathBuf>, options: InstallOptions) -> InstallTask {
        InstallTask::spawn(Arc::clone(&self.installer), path.into(), options)
    }

    pub fn uninstall(&self, key: &TitleKey) -> Result<InstalledTitle, InstallError> {
        self.installer.uninstall(key)
    }

    pub fn list_installed(&self) -> Vec<InstalledTitle> {
        self.catalog.list()
    }

    /// Version a title launches at (newest of base and update)
    pub fn launch_version(&self, serial: &Serial) -> Result<TitleVersion, CoreError> {
        self.catalog
            .effective_version(serial)
            .ok_or_else(|| CoreError::TitleNotInstalled(serial.to_string()))
    }

    fn source_for(&self, repository_url: &str) -> Result<Box<dyn PatchSource>, PatchError> {
        let name = self
            .config
            .patches
            .repositories
            .iter()
            .find(|repo| repo.url == repository_url)
            .map(|repo| repo.name.as_str())
            .unwrap_or(repository_url);
        repository_for_url(
            name,
            repository_url,
            Duration::from_secs(self.config.patches.fetch_timeout_secs),
        )
    }

    /// Download, parse and store a repository's patches for a title
    ///
    /// Definitions targeting another title are dropped with a warning. A
    /// document that is not well-formed is reported but stores nothing.
    pub fn fetch_patch_definitions(
        &self,
        serial: &Serial,
        repository_url: &str,
        cancel: &CancellationToken,
    ) -> Result<ParseOutcome, PatchError> {
        let source = self.source_for(repository_url)?;
        let mut outcome = source.fetch(serial, cancel)?;

        // An unreadable document keeps whatever this repository supplied before
        if outcome
            .warnings
            .iter()
            .any(|w| w.kind == ParseWarningKind::Document)
        {
            tracing::warn!(
                "Patch document from {} is not readable; keeping stored definitions",
                source.name()
            );
            return Ok(outcome);
        }

        let (matching, foreign): (Vec<_>, Vec<_>) = outcome
            .definitions
            .into_iter()
            .partition(|definition| &definition.serial == serial);
        for definition in foreign {
            outcome.warnings.push(ParseWarning {
                kind: ParseWarningKind::InvalidSerial,
                entry: None,
                message: format!(
                    "patch targets {}, not {}; dropped",
                    definition.serial, serial
                ),
                id: Some(definition.id),
            });
        }

        if cancel.is_cancelled() {
            return Err(PatchError::Cancelled);
        }
        self.patches
            .store_definitions(serial, source.name(), matching.clone())?;
        outcome.definitions = matching;
        Ok(outcome)
    }

    /// Fetch from every configured repository
    ///
    /// One failing repository does not stop the others.
    pub fn fetch_all_patch_definitions(
        &self,
        serial: &Serial,
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<ParseOutcome, PatchError>)> {
        self.config
            .patches
            .repositories
            .iter()
            .map(|repo| {
                let result = self.fetch_patch_definitions(serial, &repo.url, cancel);
                if let Err(e) = &result {
                    tracing::warn!("Repository {} failed: {}", repo.name, e);
                }
                (repo.name.clone(), result)
            })
            .collect()
    }

    pub fn list_patches(&self, serial: &Serial) -> Vec<PatchListing> {
        self.patches.list(serial)
    }

    pub fn set_patch_enabled(
        &self,
        serial: &Serial,
        id: &str,
        enabled: bool,
    ) -> Result<(), PatchError> {
        self.patches.set_selection(serial, id, enabled)
    }

    /// Apply every enabled patch for a title to its loaded image
    pub fn apply_patches_for_launch<T: PatchTarget + ?Sized>(
        &self,
        serial: &Serial,
        version: &TitleVersion,
        image: &mut T,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, PatchError> {
        let definitions = self.patches.enabled_definitions(serial);
        tracing::info!(
            "Applying {} enabled patches to {} {}",
            definitions.len(),
            serial,
            version
        );
        PatchApplier::new(serial.clone(), version.clone()).apply(image, &definitions, cancel)
    }
}
