//! Content storage for cellvault
//!
//! Maps installed titles onto the host file system, records them in a
//! persistent catalog and installs package containers into place.

pub mod catalog;
pub mod install;
pub mod layout;
pub mod registry;

pub use catalog::ContentCatalog;
pub use install::{
    InstallItem, InstallOptions, InstallOutcome, InstallProgress, InstallReport, Installer,
    NoProgress, ProgressSink,
};
pub use layout::ContentLayout;
pub use registry::{InstallGuard, InstallRegistry};
