//! Patch application
//!
//! Each definition moves through `Validating -> Applying` and ends as
//! `Applied`, `PartiallyApplied` or `Rejected`. Version and serial checks
//! happen before any op of the definition runs. Ops are written in
//! declaration order, definitions in the order given, so overlapping
//! writes resolve to the last one.

use crate::definition::{PatchDefinition, PatchOpKind, VersionReq};
use cv_core::cancel::CancellationToken;
use cv_core::error::PatchError;
use cv_core::title::{Serial, TitleVersion};

/// Writable image a patch is applied to
///
/// Addresses start at [`base_address`](PatchTarget::base_address); live
/// process memory can implement this the same way as an in-memory image.
pub trait PatchTarget {
    /// Address of the first byte
    fn base_address(&self) -> u64 {
        0
    }

    /// Number of addressable bytes
    fn len(&self) -> u64;

    fn write_at(&mut self, address: u64, bytes: &[u8]) -> Result<(), PatchError>;

    /// Whether `len` bytes at `address` fit inside the image
    fn fits(&self, address: u64, len: u64) -> bool {
        address
            .checked_sub(self.base_address())
            .and_then(|offset| offset.checked_add(len))
            .is_some_and(|end| end <= self.len())
    }
}

fn write_slice(image: &mut [u8], base: u64, address: u64, bytes: &[u8]) -> Result<(), PatchError> {
    let start = address
        .checked_sub(base)
        .and_then(|offset| usize::try_from(offset).ok())
        .filter(|start| {
            start
                .checked_add(bytes.len())
                .is_some_and(|end| end <= image.len())
        })
        .ok_or_else(|| PatchError::Target {
            address,
            reason: format!("{} bytes do not fit in a {} byte image", bytes.len(), image.len()),
        })?;
    image[start..start + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

impl PatchTarget for [u8] {
    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }

    fn write_at(&mut self, address: u64, bytes: &[u8]) -> Result<(), PatchError> {
        write_slice(self, 0, address, bytes)
    }
}

impl PatchTarget for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn write_at(&mut self, address: u64, bytes: &[u8]) -> Result<(), PatchError> {
        write_slice(self, 0, address, bytes)
    }
}

/// Image loaded at a base address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedImage {
    pub base_address: u64,
    pub bytes: Vec<u8>,
}

impl MappedImage {
    pub fn new(base_address: u64, bytes: Vec<u8>) -> Self {
        Self {
            base_address,
            bytes,
        }
    }
}

impl PatchTarget for MappedImage {
    fn base_address(&self) -> u64 {
        self.base_address
    }

    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn write_at(&mut self, address: u64, bytes: &[u8]) -> Result<(), PatchError> {
        write_slice(&mut self.bytes, self.base_address, address, bytes)
    }
}

/// Why a definition was not applied at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    VersionMismatch {
        required: VersionReq,
        live: TitleVersion,
    },
    SerialMismatch {
        required: Serial,
        live: Serial,
    },
}

/// Final state of one definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyStatus {
    Applied,
    /// Some ops fell outside the image
    PartiallyApplied,
    Rejected(RejectReason),
}

/// Op that did not fit in the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfBoundsPatch {
    pub definition: String,
    pub op_index: usize,
    pub address: u64,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionOutcome {
    pub id: String,
    pub status: ApplyStatus,
    /// Ops that wrote bytes
    pub applied_ops: usize,
    /// `skip` ops, which write nothing
    pub skip_ops: usize,
    pub out_of_bounds: Vec<OutOfBoundsPatch>,
}

/// Itemized result of one apply run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub definitions: Vec<DefinitionOutcome>,
}

impl ApplyReport {
    /// Ops written across all definitions
    pub fn applied_count(&self) -> usize {
        self.definitions.iter().map(|d| d.applied_ops).sum()
    }

    /// Ops that failed (out of bounds) across all definitions
    pub fn skipped_count(&self) -> usize {
        self.definitions.iter().map(|d| d.out_of_bounds.len()).sum()
    }

    pub fn out_of_bounds(&self) -> impl Iterator<Item = &OutOfBoundsPatch> {
        self.definitions.iter().flat_map(|d| d.out_of_bounds.iter())
    }

    pub fn rejected(&self) -> impl Iterator<Item = (&str, &RejectReason)> {
        self.definitions.iter().filter_map(|d| match &d.status {
            ApplyStatus::Rejected(reason) => Some((d.id.as_str(), reason)),
            _ => None,
        })
    }
}

/// Applies definitions for one running title
#[derive(Debug, Clone)]
pub struct PatchApplier {
    serial: Serial,
    version: TitleVersion,
}

impl PatchApplier {
    pub fn new(serial: Serial, version: TitleVersion) -> Self {
        Self { serial, version }
    }

    fn validate(&self, definition: &PatchDefinition) -> Result<(), RejectReason> {
        if definition.serial != self.serial {
            return Err(RejectReason::SerialMismatch {
                required: definition.serial.clone(),
                live: self.serial.clone(),
            });
        }
        if !definition.version.matches(&self.version) {
            return Err(RejectReason::VersionMismatch {
                required: definition.version.clone(),
                live: self.version.clone(),
            });
        }
        Ok(())
    }

    /// Apply `definitions` in order to `target`
    ///
    /// Cancellation is honoured between ops; ops already written stay written.
    pub fn apply<T: PatchTarget + ?Sized>(
        &self,
        target: &mut T,
        definitions: &[PatchDefinition],
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, PatchError> {
        let mut report = ApplyReport::default();

        for definition in definitions {
            if let Err(reason) = self.validate(definition) {
                tracing::info!("Rejected patch {}: {:?}", definition.id, reason);
                report.definitions.push(DefinitionOutcome {
                    id: definition.id.clone(),
                    status: ApplyStatus::Rejected(reason),
                    applied_ops: 0,
                    skip_ops: 0,
                    out_of_bounds: Vec::new(),
                });
                continue;
            }

            let mut outcome = DefinitionOutcome {
                id: definition.id.clone(),
                status: ApplyStatus::Applied,
                applied_ops: 0,
                skip_ops: 0,
                out_of_bounds: Vec::new(),
            };

            for (op_index, op) in definition.ops.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(PatchError::Cancelled);
                }

                if op.kind == PatchOpKind::Skip {
                    outcome.skip_ops += 1;
                    continue;
                }

                if !target.fits(op.address, op.payload.len() as u64) {
                    tracing::warn!(
                        "Patch {} op #{} at 0x{:x} ({} bytes) is outside the image",
                        definition.id,
                        op_index,
                        op.address,
                        op.payload.len()
                    );
                    outcome.out_of_bounds.push(OutOfBoundsPatch {
                        definition: definition.id.clone(),
                        op_index,
                        address: op.address,
                        len: op.payload.len(),
                    });
                    continue;
                }

                target.write_at(op.address, &op.payload)?;
                outcome.applied_ops += 1;
            }

            if !outcome.out_of_bounds.is_empty() {
                outcome.status = ApplyStatus::PartiallyApplied;
            }
            tracing::debug!(
                "Patch {}: {:?}, {} ops applied",
                definition.id,
                outcome.status,
                outcome.applied_ops
            );
            report.definitions.push(outcome);
        }

        tracing::info!(
            "Applied {} patch ops for {} {} ({} out of bounds, {} definitions rejected)",
            report.applied_count(),
            self.serial,
            self.version,
            report.skipped_count(),
            report.rejected().count()
        );
        Ok(report)
    }
}
