//! Core types for cellvault
//!
//! This crate provides the foundational types, error handling,
//! configuration, and logging infrastructure shared by the installer
//! and the patch engine.

pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod persist;
pub mod title;

pub use cancel::CancellationToken;
pub use config::Config;
pub use error::{
    CatalogError, CoreError, EntryFailure, InstallError, PackageError, PatchError, Result,
};
pub use title::{Category, InstalledTitle, Serial, TitleKey, TitleVersion};
