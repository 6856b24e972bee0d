//! Error types for cellvault

use crate::title::{Category, InstalledTitle, TitleVersion};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for cellvault
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Package error: {0}")]
    Package(#[from] PackageError),

    #[error("Install error: {0}")]
    Install(#[from] InstallError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Title not installed: {0}")]
    TitleNotInstalled(String),
}

/// Package container errors
///
/// Everything except `DecryptionFailed` is structural: the container cannot
/// be trusted and the whole package is abandoned.
#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Invalid package format: {0}")]
    InvalidPackageFormat(String),

    #[error("Truncated package: declared {declared} bytes, stream has {actual}")]
    TruncatedPackage { declared: u64, actual: u64 },

    #[error("Decryption failed for {path}: {reason}")]
    DecryptionFailed { path: String, reason: String },

    #[error("Unsafe entry path: {0}")]
    UnsafeEntryPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PackageError {
    /// Structural failures abort the whole package
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::DecryptionFailed { .. })
    }

    /// Recover a package error carried inside an `io::Error` by an entry stream
    pub fn from_io(err: std::io::Error) -> Self {
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<PackageError>())
        {
            match err.into_inner().map(|inner| inner.downcast::<PackageError>()) {
                Some(Ok(package_err)) => *package_err,
                Some(Err(other)) => Self::Io(std::io::Error::other(other)),
                None => Self::Io(std::io::Error::other("unknown entry stream error")),
            }
        } else {
            Self::Io(err)
        }
    }
}

/// Installer errors
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Package error: {0}")]
    Package(#[from] PackageError),

    #[error("Version conflict for {serial} ({category}): installed {installed}, incoming {incoming}")]
    VersionConflict {
        serial: String,
        category: Category,
        installed: TitleVersion,
        incoming: TitleVersion,
    },

    #[error("{} ({}) version {} is already installed", existing.serial, existing.category, existing.version)]
    AlreadyInstalled { existing: Box<InstalledTitle> },

    #[error("An install for {serial} ({category}) is already in progress")]
    InstallInProgress { serial: String, category: Category },

    #[error("{} entries failed verification", failures.len())]
    CorruptEntries { failures: Vec<EntryFailure> },

    #[error("Not installed: {0}")]
    NotInstalled(String),

    #[error("Install cancelled")]
    Cancelled,

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl InstallError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// One entry that could not be extracted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// Catalog persistence errors
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog unreadable at {path}: {reason}")]
    CatalogUnreadable { path: PathBuf, reason: String },

    #[error("Failed to serialize catalog: {0}")]
    Serialize(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Patch subsystem errors
///
/// Per-op and per-definition failures are reported in `ApplyReport`,
/// not through this type.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Failed to fetch patches from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("No patch document for {0}")]
    NotFound(String),

    #[error("Patch operation cancelled")]
    Cancelled,

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Target write failed at 0x{address:x}: {reason}")]
    Target { address: u64, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for cellvault operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PackageError::TruncatedPackage {
            declared: 4096,
            actual: 100,
        };
        assert_eq!(
            format!("{}", err),
            "Truncated package: declared 4096 bytes, stream has 100"
        );

        let err = InstallError::VersionConflict {
            serial: "CUSA00001".to_string(),
            category: Category::Update,
            installed: TitleVersion::parse("1.05").unwrap(),
            incoming: TitleVersion::parse("1.02").unwrap(),
        };
        assert_eq!(
            format!("{}", err),
            "Version conflict for CUSA00001 (update): installed 1.05, incoming 1.02"
        );
    }

    #[test]
    fn test_error_conversion() {
        let pkg_err = PackageError::UnsafeEntryPath("../evil".to_string());
        let install_err: InstallError = pkg_err.into();
        assert!(matches!(install_err, InstallError::Package(_)));

        let core_err: CoreError = install_err.into();
        assert!(matches!(core_err, CoreError::Install(_)));
    }

    #[test]
    fn test_structural_classification() {
        assert!(PackageError::InvalidPackageFormat("bad".into()).is_structural());
        assert!(!PackageError::DecryptionFailed {
            path: "a".into(),
            reason: "b".into()
        }
        .is_structural());
    }

    #[test]
    fn test_package_error_roundtrip_through_io() {
        let io = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            PackageError::DecryptionFailed {
                path: "eboot.bin".into(),
                reason: "checksum mismatch".into(),
            },
        );
        assert!(matches!(
            PackageError::from_io(io),
            PackageError::DecryptionFailed { .. }
        ));

        let plain = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(PackageError::from_io(plain), PackageError::Io(_)));
    }
}
