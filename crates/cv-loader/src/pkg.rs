//! Package container (.pkg) support
//!
//! This module parses the container header and entry table and exposes
//! entry payloads as decrypting, checksum-verifying byte streams.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! 0x00  header (0x80 bytes)
//! ....  entry table, `entry_count` rows of 0x60 bytes
//! ....  entry names
//! ....  data region (entry payloads)
//! ```

use crate::crypto::{Aes128Ctr, CryptoEngine, KeyProvider};
use bitflags::bitflags;
use ctr::cipher::{KeyIvInit, StreamCipher};
use cv_core::error::PackageError;
use cv_core::title::{Category, Serial, TitleKey, TitleVersion};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Retail package magic
pub const PKG_MAGIC_RETAIL: [u8; 4] = *b"\x7FCNT";

/// Debug/homebrew package magic
pub const PKG_MAGIC_DEBUG: [u8; 4] = *b"\x7FDBG";

/// Current container format revision
pub const PKG_FORMAT_REVISION: u16 = 1;

/// Size of the fixed header
pub const PKG_HEADER_SIZE: usize = 0x80;

/// Size of one entry table row
pub const PKG_ENTRY_SIZE: usize = 0x60;

/// Upper bound on declared entries
pub const MAX_ENTRY_COUNT: u32 = 1_000_000;

/// Upper bound on an entry name
pub const MAX_NAME_SIZE: u32 = 1024;

/// Which key family a package is encrypted with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PkgMagic {
    Retail,
    Debug,
}

impl PkgMagic {
    pub fn from_bytes(magic: &[u8]) -> Option<Self> {
        if magic == PKG_MAGIC_RETAIL {
            Some(Self::Retail)
        } else if magic == PKG_MAGIC_DEBUG {
            Some(Self::Debug)
        } else {
            None
        }
    }

    pub fn bytes(&self) -> [u8; 4] {
        match self {
            Self::Retail => PKG_MAGIC_RETAIL,
            Self::Debug => PKG_MAGIC_DEBUG,
        }
    }
}

bitflags! {
    /// Per-entry storage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// Payload is AES-128-CTR encrypted
        const ENCRYPTED = 0x01;
        /// Payload is zlib compressed (before encryption)
        const COMPRESSED = 0x02;
        /// Entry is a directory, no payload
        const DIRECTORY = 0x04;
    }
}

/// Package header
#[derive(Debug, Clone)]
pub struct PackageHeader {
    /// Magic family
    pub magic: PkgMagic,
    /// Format revision
    pub revision: u16,
    /// Content category
    pub category: Category,
    /// Declared entry count
    pub entry_count: u32,
    /// Entry table offset
    pub entry_table_offset: u32,
    /// Declared total container size
    pub total_size: u64,
    /// Data region offset
    pub data_offset: u64,
    /// Data region size
    pub data_size: u64,
    /// Title serial
    pub serial: Serial,
    /// Title version
    pub version: TitleVersion,
    /// DLC sub-identifier
    pub dlc_id: Option<String>,
    /// Encryption key seed
    pub key_seed: [u8; 16],
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

fn read_ascii(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_string()
}

fn write_ascii(dst: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(dst.len());
    dst[..len].copy_from_slice(&bytes[..len]);
}

fn invalid(msg: impl Into<String>) -> PackageError {
    PackageError::InvalidPackageFormat(msg.into())
}

impl PackageHeader {
    /// Check if data starts with an accepted package magic
    pub fn is_pkg(data: &[u8]) -> bool {
        data.len() >= 4 && PkgMagic::from_bytes(&data[..4]).is_some()
    }

    /// Parse the fixed header
    ///
    /// Only checks the header against itself; sizes are checked against the
    /// stream in [`PackageHandle::open`].
    pub fn parse(data: &[u8]) -> Result<Self, PackageError> {
        if data.len() < PKG_HEADER_SIZE {
            return Err(PackageError::TruncatedPackage {
                declared: PKG_HEADER_SIZE as u64,
                actual: data.len() as u64,
            });
        }

        let magic = PkgMagic::from_bytes(&data[0..4])
            .ok_or_else(|| invalid(format!("Invalid package magic {}", hex::encode(&data[0..4]))))?;

        let revision = read_u16(data, 0x04);
        if revision != PKG_FORMAT_REVISION {
            return Err(invalid(format!("Unsupported format revision {}", revision)));
        }

        let category_tag = read_u16(data, 0x06);
        let category = Category::from_tag(category_tag)
            .ok_or_else(|| invalid(format!("Unknown category tag {}", category_tag)))?;

        let entry_count = read_u32(data, 0x08);
        let entry_table_offset = read_u32(data, 0x0C);
        let total_size = read_u64(data, 0x10);
        let data_offset = read_u64(data, 0x18);
        let data_size = read_u64(data, 0x20);

        let serial_text = read_ascii(&data[0x28..0x38]);
        let serial = Serial::parse(&serial_text)
            .ok_or_else(|| invalid(format!("Invalid serial {:?}", serial_text)))?;

        let version_text = read_ascii(&data[0x38..0x48]);
        let version = TitleVersion::parse(&version_text)
            .ok_or_else(|| invalid(format!("Invalid title version {:?}", version_text)))?;

        let dlc_text = read_ascii(&data[0x48..0x58]);
        let dlc_id = match category {
            Category::Dlc if dlc_text.is_empty() => {
                return Err(invalid("DLC package without sub-identifier"));
            }
            Category::Dlc => {
                check_dlc_id(&dlc_text)?;
                Some(dlc_text)
            }
            _ => None,
        };

        let mut key_seed = [0u8; 16];
        key_seed.copy_from_slice(&data[0x58..0x68]);

        let header = Self {
            magic,
            revision,
            category,
            entry_count,
            entry_table_offset,
            total_size,
            data_offset,
            data_size,
            serial,
            version,
            dlc_id,
            key_seed,
        };
        header.check_layout()?;
        Ok(header)
    }

    /// Internal consistency of declared sizes and offsets
    fn check_layout(&self) -> Result<(), PackageError> {
        if self.entry_count > MAX_ENTRY_COUNT {
            return Err(invalid(format!("Entry count {} too large", self.entry_count)));
        }

        let table_end = self.entry_table_offset as u64 + self.entry_count as u64 * PKG_ENTRY_SIZE as u64;
        if (self.entry_table_offset as usize) < PKG_HEADER_SIZE || table_end > self.total_size {
            return Err(invalid(format!(
                "Entry table 0x{:x}..0x{:x} outside package of {} bytes",
                self.entry_table_offset, table_end, self.total_size
            )));
        }

        let data_end = self
            .data_offset
            .checked_add(self.data_size)
            .ok_or_else(|| invalid("Data region overflows"))?;
        if self.data_offset < PKG_HEADER_SIZE as u64 || data_end > self.total_size {
            return Err(invalid(format!(
                "Data region 0x{:x}..0x{:x} outside package of {} bytes",
                self.data_offset, data_end, self.total_size
            )));
        }

        Ok(())
    }

    /// Serialize the header
    pub fn to_bytes(&self) -> [u8; PKG_HEADER_SIZE] {
        let mut out = [0u8; PKG_HEADER_SIZE];
        out[0x00..0x04].copy_from_slice(&self.magic.bytes());
        out[0x04..0x06].copy_from_slice(&self.revision.to_be_bytes());
        out[0x06..0x08].copy_from_slice(&self.category.tag().to_be_bytes());
        out[0x08..0x0C].copy_from_slice(&self.entry_count.to_be_bytes());
        out[0x0C..0x10].copy_from_slice(&self.entry_table_offset.to_be_bytes());
        out[0x10..0x18].copy_from_slice(&self.total_size.to_be_bytes());
        out[0x18..0x20].copy_from_slice(&self.data_offset.to_be_bytes());
        out[0x20..0x28].copy_from_slice(&self.data_size.to_be_bytes());
        write_ascii(&mut out[0x28..0x38], self.serial.as_str());
        write_ascii(&mut out[0x38..0x48], self.version.as_str());
        if let Some(dlc_id) = &self.dlc_id {
            write_ascii(&mut out[0x48..0x58], dlc_id);
        }
        out[0x58..0x68].copy_from_slice(&self.key_seed);
        out
    }

    /// Catalog key of the content this package installs
    pub fn title_key(&self) -> TitleKey {
        TitleKey::new(self.serial.clone(), self.category, self.dlc_id.clone())
    }
}

/// A DLC sub-identifier names one directory under `addcont/<serial>`
pub fn check_dlc_id(id: &str) -> Result<(), PackageError> {
    let safe = !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if safe {
        Ok(())
    } else {
        Err(PackageError::UnsafeEntryPath(id.to_string()))
    }
}

/// Reject paths that could escape the install root
pub fn check_entry_path(path: &str) -> Result<(), PackageError> {
    let unsafe_path = || PackageError::UnsafeEntryPath(path.to_string());

    if path.is_empty() || path.contains('\0') {
        return Err(unsafe_path());
    }

    // Absolute (unix or windows), UNC and drive-qualified paths
    if path.starts_with('/') || path.starts_with('\\') || path.contains(':') {
        return Err(unsafe_path());
    }

    for component in path.split(['/', '\\']) {
        if component.is_empty() || component == "." || component == ".." {
            return Err(unsafe_path());
        }
    }

    Ok(())
}

/// One row of the entry table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    /// Position in the entry table
    pub index: u32,
    /// Logical path inside the installed tree ('/' separated)
    pub path: String,
    /// Payload offset relative to the data region
    pub data_offset: u64,
    /// Stored (encrypted/compressed) size
    pub stored_size: u64,
    /// Plaintext size
    pub size: u64,
    /// Storage flags
    pub flags: EntryFlags,
    /// AES-CTR IV
    pub iv: [u8; 16],
    /// SHA-1 of the plaintext
    pub checksum: [u8; 20],
}

impl PackageEntry {
    pub fn is_dir(&self) -> bool {
        self.flags.contains(EntryFlags::DIRECTORY)
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(EntryFlags::ENCRYPTED)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags.contains(EntryFlags::COMPRESSED)
    }

    /// Validate path containment
    pub fn check_path(&self) -> Result<(), PackageError> {
        check_entry_path(&self.path)
    }

    /// Serialize the fixed part of the row; `name_offset` and `name_size` locate the path
    pub fn to_row(&self, name_offset: u32, name_size: u32) -> [u8; PKG_ENTRY_SIZE] {
        let mut row = [0u8; PKG_ENTRY_SIZE];
        row[0x00..0x04].copy_from_slice(&name_offset.to_be_bytes());
        row[0x04..0x08].copy_from_slice(&name_size.to_be_bytes());
        row[0x08..0x10].copy_from_slice(&self.data_offset.to_be_bytes());
        row[0x10..0x18].copy_from_slice(&self.stored_size.to_be_bytes());
        row[0x18..0x20].copy_from_slice(&self.size.to_be_bytes());
        row[0x20..0x24].copy_from_slice(&self.flags.bits().to_be_bytes());
        row[0x30..0x40].copy_from_slice(&self.iv);
        row[0x40..0x54].copy_from_slice(&self.checksum);
        row
    }
}

/// Open package: parsed header plus the byte source
///
/// The source sits behind a mutex so entry iteration and entry streams can
/// be interleaved; each read seeks to its own position.
pub struct PackageHandle<R> {
    source: Mutex<R>,
    header: PackageHeader,
    stream_len: u64,
    keys: Arc<dyn KeyProvider>,
}

impl PackageHandle<BufReader<File>> {
    /// Open a package file from disk
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self, PackageError> {
        let file = File::open(path.as_ref())?;
        Self::open(BufReader::new(file))
    }
}

impl<R: Read + Seek> PackageHandle<R> {
    /// Validate the header against the stream and return a handle
    pub fn open(mut source: R) -> Result<Self, PackageError> {
        let stream_len = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(0))?;

        if stream_len < PKG_HEADER_SIZE as u64 {
            // Still report a wrong magic as a format error
            let mut prefix = Vec::new();
            source.by_ref().take(4).read_to_end(&mut prefix)?;
            if prefix.len() == 4 && !PackageHeader::is_pkg(&prefix) {
                return Err(invalid("Invalid package magic"));
            }
            return Err(PackageError::TruncatedPackage {
                declared: PKG_HEADER_SIZE as u64,
                actual: stream_len,
            });
        }

        let mut header_data = [0u8; PKG_HEADER_SIZE];
        source.read_exact(&mut header_data)?;

        if !PackageHeader::is_pkg(&header_data) {
            return Err(invalid(format!(
                "Invalid package magic {}",
                hex::encode(&header_data[0..4])
            )));
        }

        // Compare the declared size with the stream before trusting the rest
        let declared = read_u64(&header_data, 0x10);
        if declared > stream_len {
            return Err(PackageError::TruncatedPackage {
                declared,
                actual: stream_len,
            });
        }

        let header = PackageHeader::parse(&header_data)?;

        info!(
            "Package header: serial={}, version={}, category={}, entries={}, size={}",
            header.serial, header.version, header.category, header.entry_count, header.total_size
        );

        Ok(Self {
            source: Mutex::new(source),
            header,
            stream_len,
            keys: Arc::new(CryptoEngine::new()),
        })
    }

    /// Use a specific key provider for entry decryption
    pub fn with_keys(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = keys;
        self
    }

    /// Get package header
    pub fn header(&self) -> &PackageHeader {
        &self.header
    }

    /// Length of the underlying stream
    pub fn stream_len(&self) -> u64 {
        self.stream_len
    }

    /// Lazily iterate the entry table; every call starts from the first row
    pub fn entries(&self) -> Entries<'_, R> {
        Entries {
            handle: self,
            next: 0,
        }
    }

    /// Read the row at `index`
    pub fn entry(&self, index: u32) -> Result<PackageEntry, PackageError> {
        if index >= self.header.entry_count {
            return Err(invalid(format!("Entry index {} out of range", index)));
        }

        let row_offset = self.header.entry_table_offset as u64 + index as u64 * PKG_ENTRY_SIZE as u64;
        let mut row = [0u8; PKG_ENTRY_SIZE];
        self.read_at(row_offset, &mut row)?;

        let name_offset = read_u32(&row, 0x00) as u64;
        let name_size = read_u32(&row, 0x04);
        if name_size == 0 || name_size > MAX_NAME_SIZE {
            return Err(invalid(format!("Entry {} has invalid name size {}", index, name_size)));
        }
        if name_offset + name_size as u64 > self.header.total_size {
            return Err(invalid(format!("Entry {} name outside package", index)));
        }

        let mut name = vec![0u8; name_size as usize];
        self.read_at(name_offset, &mut name)?;
        let path = read_ascii(&name);

        let flags = EntryFlags::from_bits_truncate(read_u32(&row, 0x20));
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&row[0x30..0x40]);
        let mut checksum = [0u8; 20];
        checksum.copy_from_slice(&row[0x40..0x54]);

        let entry = PackageEntry {
            index,
            path,
            data_offset: read_u64(&row, 0x08),
            stored_size: read_u64(&row, 0x10),
            size: read_u64(&row, 0x18),
            flags,
            iv,
            checksum,
        };

        let data_end = entry
            .data_offset
            .checked_add(entry.stored_size)
            .ok_or_else(|| invalid(format!("Entry {} size overflows", index)))?;
        if data_end > self.header.data_size {
            return Err(invalid(format!(
                "Entry {} ({}) extends beyond data region",
                index, entry.path
            )));
        }

        debug!("Package entry {}: {} (size={})", index, entry.path, entry.size);
        Ok(entry)
    }

    /// Open a decrypting, verifying stream over an entry's payload
    ///
    /// A checksum mismatch surfaces at end of stream as an `io::Error`
    /// carrying [`PackageError::DecryptionFailed`]; other entries stay readable.
    pub fn read_entry(&self, entry: &PackageEntry) -> Result<EntryReader<'_>, PackageError>
    where
        R: Send,
    {
        self.read_entry_with(entry, true)
    }

    /// Like [`read_entry`](Self::read_entry), optionally skipping checksum verification
    pub fn read_entry_with(
        &self,
        entry: &PackageEntry,
        verify: bool,
    ) -> Result<EntryReader<'_>, PackageError>
    where
        R: Send,
    {
        let raw = RawEntryReader {
            handle: self,
            pos: self.header.data_offset + entry.data_offset,
            remaining: if entry.is_dir() { 0 } else { entry.stored_size },
        };

        let mut stream: Box<dyn Read + Send + '_> = Box::new(raw);

        if entry.is_encrypted() && !entry.is_dir() {
            let key = self.keys.entry_key(&self.header)?;
            let cipher = Aes128Ctr::new(&key.into(), &entry.iv.into());
            stream = Box::new(DecryptReader {
                inner: stream,
                cipher,
            });
        }

        if entry.is_compressed() && !entry.is_dir() {
            stream = Box::new(flate2::read::ZlibDecoder::new(stream));
        }

        Ok(EntryReader {
            inner: stream,
            hasher: Sha1::new(),
            path: entry.path.clone(),
            expected_size: if entry.is_dir() { 0 } else { entry.size },
            expected_checksum: entry.checksum,
            verify: verify && !entry.is_dir(),
            read_total: 0,
            finished: false,
        })
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), PackageError> {
        if offset + buf.len() as u64 > self.stream_len {
            return Err(PackageError::TruncatedPackage {
                declared: offset + buf.len() as u64,
                actual: self.stream_len,
            });
        }
        let mut source = self.source.lock();
        source.seek(SeekFrom::Start(offset))?;
        source.read_exact(buf)?;
        Ok(())
    }
}

/// Lazy entry table iterator
pub struct Entries<'a, R> {
    handle: &'a PackageHandle<R>,
    next: u32,
}

impl<R: Read + Seek> Iterator for Entries<'_, R> {
    type Item = Result<PackageEntry, PackageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.handle.header.entry_count {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.handle.entry(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.handle.header.entry_count - self.next) as usize;
        (left, Some(left))
    }
}

/// Bounded reader over stored payload bytes
struct RawEntryReader<'a, R> {
    handle: &'a PackageHandle<R>,
    pos: u64,
    remaining: u64,
}

impl<R: Read + Seek> Read for RawEntryReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = usize::try_from(self.remaining)
            .unwrap_or(usize::MAX)
            .min(buf.len());
        let mut source = self.handle.source.lock();
        source.seek(SeekFrom::Start(self.pos))?;
        let n = source.read(&mut buf[..want])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                PackageError::TruncatedPackage {
                    declared: self.pos + self.remaining,
                    actual: self.pos,
                },
            ));
        }
        self.pos += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Applies the AES-CTR keystream to whatever passes through
struct DecryptReader<'a> {
    inner: Box<dyn Read + Send + 'a>,
    cipher: Aes128Ctr,
}

impl Read for DecryptReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}

/// A corrupt ciphertext usually shows up as a broken zlib stream
fn is_corrupt_stream(err: &std::io::Error) -> bool {
    match err.kind() {
        std::io::ErrorKind::InvalidInput => true,
        std::io::ErrorKind::InvalidData => !err
            .get_ref()
            .is_some_and(|inner| inner.is::<PackageError>()),
        _ => false,
    }
}

/// Plaintext stream of one entry with checksum verification at end of stream
pub struct EntryReader<'a> {
    inner: Box<dyn Read + Send + 'a>,
    hasher: Sha1,
    path: String,
    expected_size: u64,
    expected_checksum: [u8; 20],
    verify: bool,
    read_total: u64,
    finished: bool,
}

impl EntryReader<'_> {
    fn failure(&self, reason: String) -> std::io::Error {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            PackageError::DecryptionFailed {
                path: self.path.clone(),
                reason,
            },
        )
    }

    fn finish(&mut self) -> std::io::Result<()> {
        self.finished = true;
        if !self.verify {
            return Ok(());
        }
        if self.read_total != self.expected_size {
            return Err(self.failure(format!(
                "size mismatch: expected {} bytes, got {}",
                self.expected_size, self.read_total
            )));
        }
        let digest = std::mem::take(&mut self.hasher).finalize();
        if digest.as_slice() != self.expected_checksum {
            return Err(self.failure(format!(
                "checksum mismatch: expected {}, got {}",
                hex::encode(self.expected_checksum),
                hex::encode(digest)
            )));
        }
        Ok(())
    }
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.finished || buf.is_empty() {
            return Ok(0);
        }
        let n = match self.inner.read(buf) {
            Ok(n) => n,
            Err(e) if is_corrupt_stream(&e) => {
                self.finished = true;
                return Err(self.failure(format!("corrupt payload: {}", e)));
            }
            Err(e) => return Err(e),
        };
        if n == 0 {
            self.finish()?;
            return Ok(0);
        }
        self.read_total += n as u64;
        if self.verify {
            self.hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PackageBuilder;
    use std::io::Cursor;

    fn sample_package() -> Vec<u8> {
        PackageBuilder::new("CUSA00001", "1.00", Category::Base)
            .unwrap()
            .add_dir("sce_sys")
            .add_file("sce_sys/param.sfo", b"PARAM".to_vec())
            .add_file("eboot.bin", vec![0xAB; 5000])
            .build()
            .unwrap()
    }

    #[test]
    fn test_pkg_magic() {
        assert!(PackageHeader::is_pkg(b"\x7FCNT...."));
        assert!(PackageHeader::is_pkg(b"\x7FDBG...."));
        assert!(!PackageHeader::is_pkg(b"\x7FPKG...."));
        assert!(!PackageHeader::is_pkg(b"\x7F"));
    }

    #[test]
    fn test_open_reads_header() {
        let handle = PackageHandle::open(Cursor::new(sample_package())).unwrap();
        let header = handle.header();
        assert_eq!(header.serial.as_str(), "CUSA00001");
        assert_eq!(header.version.as_str(), "1.00");
        assert_eq!(header.category, Category::Base);
        assert_eq!(header.entry_count, 3);
        assert_eq!(header.dlc_id, None);
    }

    #[test]
    fn test_bad_magic_is_invalid_format() {
        let mut data = sample_package();
        data[1] = b'X';
        let result = PackageHandle::open(Cursor::new(data));
        assert!(matches!(result, Err(PackageError::InvalidPackageFormat(_))));
    }

    #[test]
    fn test_truncated_stream() {
        let mut data = sample_package();
        data.truncate(data.len() - 10);
        let result = PackageHandle::open(Cursor::new(data));
        assert!(matches!(result, Err(PackageError::TruncatedPackage { .. })));

        let result = PackageHandle::open(Cursor::new(b"\x7FCNT".to_vec()));
        assert!(matches!(result, Err(PackageError::TruncatedPackage { .. })));
    }

    #[test]
    fn test_inconsistent_entry_count() {
        let mut data = sample_package();
        data[0x08..0x0C].copy_from_slice(&5000u32.to_be_bytes());
        let result = PackageHandle::open(Cursor::new(data));
        assert!(matches!(result, Err(PackageError::InvalidPackageFormat(_))));
    }

    #[test]
    fn test_entries_are_restartable() {
        let handle = PackageHandle::open(Cursor::new(sample_package())).unwrap();
        let first: Vec<_> = handle.entries().map(|e| e.unwrap().path).collect();
        let second: Vec<_> = handle.entries().map(|e| e.unwrap().path).collect();
        assert_eq!(first, vec!["sce_sys", "sce_sys/param.sfo", "eboot.bin"]);
        assert_eq!(first, second);
        assert_eq!(handle.entries().size_hint(), (3, Some(3)));
    }

    #[test]
    fn test_read_entry_decrypts() {
        let handle = PackageHandle::open(Cursor::new(sample_package())).unwrap();
        let entry = handle.entries().nth(2).unwrap().unwrap();
        assert!(entry.is_encrypted());

        let mut data = Vec::new();
        handle.read_entry(&entry).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![0xAB; 5000]);
    }

    #[test]
    fn test_raw_read_stops_at_entry_end() {
        let handle = PackageHandle::open(Cursor::new(sample_package())).unwrap();
        let entry = handle.entries().nth(1).unwrap().unwrap();

        let mut reader = handle.read_entry(&entry).unwrap();
        let mut buf = vec![0u8; 1 << 20];
        let mut total = 0;
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 5);
        assert_eq!(&buf[..5], b"PARAM");
    }

    #[test]
    fn test_checksum_mismatch_fails_only_that_entry() {
        let handle = PackageHandle::open(Cursor::new(sample_package())).unwrap();
        let entries: Vec<_> = handle.entries().map(Result::unwrap).collect();

        let mut tampered = entries[2].clone();
        tampered.checksum[0] ^= 0xFF;
        let mut sink = Vec::new();
        let err = handle
            .read_entry(&tampered)
            .unwrap()
            .read_to_end(&mut sink)
            .unwrap_err();
        assert!(matches!(
            PackageError::from_io(err),
            PackageError::DecryptionFailed { .. }
        ));

        // Sibling still reads fine
        let mut sfo = Vec::new();
        handle.read_entry(&entries[1]).unwrap().read_to_end(&mut sfo).unwrap();
        assert_eq!(sfo, b"PARAM");
    }

    #[test]
    fn test_entry_path_safety() {
        assert!(check_entry_path("sce_sys/param.sfo").is_ok());
        assert!(check_entry_path("eboot.bin").is_ok());
        for bad in [
            "",
            "/etc/passwd",
            "\\windows",
            "C:/boot.ini",
            "../escape",
            "a/../../b",
            "a/./b",
            "a//b",
            "dir\\..\\x",
        ] {
            assert!(
                matches!(check_entry_path(bad), Err(PackageError::UnsafeEntryPath(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_header_roundtrip_dlc() {
        let data = PackageBuilder::new("CUSA00001", "1.00", Category::Dlc)
            .unwrap()
            .dlc_id("SKINPACK01")
            .add_file("skin.dat", vec![1, 2, 3])
            .build()
            .unwrap();
        let handle = PackageHandle::open(Cursor::new(data)).unwrap();
        assert_eq!(handle.header().dlc_id.as_deref(), Some("SKINPACK01"));
        assert_eq!(
            handle.header().title_key().to_string(),
            "CUSA00001/dlc/SKINPACK01"
        );
    }

    #[test]
    fn test_dlc_id_must_be_one_plain_component() {
        for good in ["SKINPACK01", "dlc_2", "a-b"] {
            assert!(check_dlc_id(good).is_ok(), "{good:?} should be accepted");
        }
        for bad in ["", ".", "..", "../../../evil", "a/b", "a\\b", "C:x", "a.b"] {
            assert!(
                matches!(check_dlc_id(bad), Err(PackageError::UnsafeEntryPath(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
