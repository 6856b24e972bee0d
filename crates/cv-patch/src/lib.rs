//! Runtime patch support for cellvault
//!
//! Patch documents are fetched from repositories, parsed into validated
//! definitions, stored per title with an enabled/disabled selection, and
//! applied to a title image at launch.

pub mod applier;
pub mod catalog;
pub mod definition;
pub mod parser;
pub mod source;

pub use applier::{
    ApplyReport, ApplyStatus, DefinitionOutcome, MappedImage, OutOfBoundsPatch, PatchApplier,
    PatchTarget, RejectReason,
};
pub use catalog::{PatchCatalog, PatchListing, Selection};
pub use definition::{PatchDefinition, PatchOp, PatchOpKind, VersionReq};
pub use parser::{parse, ParseOutcome, ParseWarning, ParseWarningKind};
pub use source::{repository_for_url, HttpRepository, LocalRepository, PatchSource};
