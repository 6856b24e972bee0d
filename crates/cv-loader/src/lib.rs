//! Package container loader for cellvault

pub mod builder;
pub mod crypto;
pub mod pkg;

// Re-export main types
pub use builder::PackageBuilder;
pub use crypto::{CryptoEngine, KeyEntry, KeyProvider, KeyType};
pub use pkg::{
    check_dlc_id, check_entry_path, EntryFlags, EntryReader, PackageEntry, PackageHandle,
    PackageHeader, PkgMagic,
};
