//! Package authoring
//!
//! Used by the `pack` command and by tests that need real containers.

use crate::crypto::{apply_ctr, sha1_digest};
use crate::pkg::{
    check_dlc_id, check_entry_path, EntryFlags, PackageEntry, PackageHeader, PkgMagic,
    PKG_ENTRY_SIZE, PKG_FORMAT_REVISION, PKG_HEADER_SIZE,
};
use cv_core::error::PackageError;
use cv_core::title::{Category, Serial, TitleVersion};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

struct PendingEntry {
    path: String,
    data: Vec<u8>,
    dir: bool,
    encrypt: bool,
    compress: bool,
}

/// Builder for package containers
pub struct PackageBuilder {
    magic: PkgMagic,
    category: Category,
    serial: Serial,
    version: TitleVersion,
    dlc_id: Option<String>,
    key_seed: [u8; 16],
    content_key: Option<[u8; 16]>,
    encrypt: bool,
    compress: bool,
    entries: Vec<PendingEntry>,
}

impl PackageBuilder {
    /// Start a debug package; fails on an invalid serial or version
    pub fn new(serial: &str, version: &str, category: Category) -> Result<Self, PackageError> {
        let serial = Serial::parse(serial).ok_or_else(|| {
            PackageError::InvalidPackageFormat(format!("Invalid serial {:?}", serial))
        })?;
        let version = TitleVersion::parse(version).ok_or_else(|| {
            PackageError::InvalidPackageFormat(format!("Invalid title version {:?}", version))
        })?;

        let mut key_seed = [0u8; 16];
        key_seed.copy_from_slice(&sha1_digest(serial.as_str().as_bytes())[..16]);

        Ok(Self {
            magic: PkgMagic::Debug,
            category,
            serial,
            version,
            dlc_id: None,
            key_seed,
            content_key: None,
            encrypt: true,
            compress: false,
            entries: Vec::new(),
        })
    }

    /// DLC sub-identifier
    pub fn dlc_id(mut self, dlc_id: impl Into<String>) -> Self {
        self.dlc_id = Some(dlc_id.into());
        self
    }

    pub fn key_seed(mut self, seed: [u8; 16]) -> Self {
        self.key_seed = seed;
        self
    }

    /// Produce a retail package encrypted with `content_key`
    pub fn retail(mut self, content_key: [u8; 16]) -> Self {
        self.magic = PkgMagic::Retail;
        self.content_key = Some(content_key);
        self
    }

    /// Encrypt files added after this call
    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Compress files added after this call
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn add_dir(mut self, path: impl Into<String>) -> Self {
        self.entries.push(PendingEntry {
            path: path.into(),
            data: Vec::new(),
            dir: true,
            encrypt: false,
            compress: false,
        });
        self
    }

    pub fn add_file(mut self, path: impl Into<String>, data: Vec<u8>) -> Self {
        self.entries.push(PendingEntry {
            path: path.into(),
            data,
            dir: false,
            encrypt: self.encrypt,
            compress: self.compress,
        });
        self
    }

    /// Add every file and directory below `root`, parents first
    pub fn add_tree(mut self, root: &Path) -> Result<Self, PackageError> {
        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| PackageError::Io(std::io::Error::other(e)))?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| PackageError::Io(std::io::Error::other(e)))?;
            let path = relative
                .to_str()
                .ok_or_else(|| PackageError::UnsafeEntryPath(relative.display().to_string()))?
                .replace('\\', "/");

            if entry.file_type().is_dir() {
                self = self.add_dir(path);
            } else {
                let data = std::fs::read(entry.path())?;
                self = self.add_file(path, data);
            }
        }

        Ok(self)
    }

    fn content_key(&self) -> [u8; 16] {
        self.content_key.unwrap_or(self.key_seed)
    }

    /// Header as it would be written, with empty size fields
    pub fn header_preview(&self) -> PackageHeader {
        PackageHeader {
            magic: self.magic,
            revision: PKG_FORMAT_REVISION,
            category: self.category,
            entry_count: self.entries.len() as u32,
            entry_table_offset: PKG_HEADER_SIZE as u32,
            total_size: 0,
            data_offset: 0,
            data_size: 0,
            serial: self.serial.clone(),
            version: self.version.clone(),
            dlc_id: self.dlc_id.clone(),
            key_seed: self.key_seed,
        }
    }

    /// Encode the package into memory
    pub fn build(&self) -> Result<Vec<u8>, PackageError> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Encode the package into a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<u64, PackageError> {
        match (&self.dlc_id, self.category) {
            (None, Category::Dlc) => {
                return Err(PackageError::InvalidPackageFormat(
                    "DLC package without sub-identifier".to_string(),
                ));
            }
            (Some(id), _) => check_dlc_id(id)?,
            (None, _) => {}
        }

        let key = self.content_key();
        let table_offset = PKG_HEADER_SIZE as u64;
        let names_offset = table_offset + (self.entries.len() * PKG_ENTRY_SIZE) as u64;

        let mut names = Vec::new();
        let mut rows = Vec::with_capacity(self.entries.len());
        let mut data = Vec::new();

        for (index, pending) in self.entries.iter().enumerate() {
            check_entry_path(&pending.path)?;

            let name_offset = names_offset + names.len() as u64;
            names.extend_from_slice(pending.path.as_bytes());

            let mut flags = EntryFlags::empty();
            let mut stored = pending.data.clone();
            if pending.dir {
                flags |= EntryFlags::DIRECTORY;
            } else {
                if pending.compress {
                    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                    encoder.write_all(&stored)?;
                    stored = encoder.finish()?;
                    flags |= EntryFlags::COMPRESSED;
                }
                if pending.encrypt {
                    flags |= EntryFlags::ENCRYPTED;
                }
            }

            let mut iv = [0u8; 16];
            iv.copy_from_slice(&sha1_digest(pending.path.as_bytes())[..16]);
            if flags.contains(EntryFlags::ENCRYPTED) {
                apply_ctr(&key, &iv, &mut stored);
            }

            let entry = PackageEntry {
                index: index as u32,
                path: pending.path.clone(),
                data_offset: data.len() as u64,
                stored_size: stored.len() as u64,
                size: pending.data.len() as u64,
                flags,
                iv,
                checksum: sha1_digest(&pending.data),
            };
            rows.push(entry.to_row(name_offset as u32, pending.path.len() as u32));
            data.extend_from_slice(&stored);

            debug!("Packed {} ({} bytes stored)", entry.path, entry.stored_size);
        }

        let names_end = names_offset + names.len() as u64;
        let data_offset = (names_end + 15) & !15;
        let total_size = data_offset + data.len() as u64;

        let header = PackageHeader {
            total_size,
            data_offset,
            data_size: data.len() as u64,
            ..self.header_preview()
        };

        writer.write_all(&header.to_bytes())?;
        for row in &rows {
            writer.write_all(row)?;
        }
        writer.write_all(&names)?;
        writer.write_all(&vec![0u8; (data_offset - names_end) as usize])?;
        writer.write_all(&data)?;

        Ok(total_size)
    }
}
