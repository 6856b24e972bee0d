//! Integration layer for cellvault
//!
//! Wires the package loader, installer, content catalog and patch engine
//! into the operations front ends call.

pub mod manager;
pub mod task;

pub use manager::ContentManager;
pub use task::{InstallEvent, InstallTask};
