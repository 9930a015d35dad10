//! Sysroot archive loader
//!
//! Walks a GNU tar stream block by block and materializes each entry into
//! the VFS as soon as its header is validated. Only regular files and
//! directories are accepted; anything else means the archive was built
//! wrong, and loading stops with `ArchiveFormat`.

use super::VirtualFileSystem;
use crate::error::{RuntimeError, RuntimeResult};
use std::io;
use tar::{EntryType, Header};

const BLOCK_SIZE: usize = 512;

/// GNU tar magic + version field
const GNU_MAGIC: &[u8; 8] = b"ustar  \0";

const MAGIC_RANGE: std::ops::Range<usize> = 257..265;
const TYPEFLAG_OFFSET: usize = 156;

/// One decoded header, alive only until it is materialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Full path, including a ustar prefix when the header has one
    pub path: String,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: u64,
    pub checksum: u32,
    pub typeflag: u8,
    pub link_name: String,
    pub owner_name: String,
    pub group_name: String,
    pub dev_major: u32,
    pub dev_minor: u32,
}

/// Counts of what a load materialized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

/// Text field up to its first NUL
fn text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Informational numeric field; empty or unparsable reads as 0
fn octal_or_zero<T: Default>(field: io::Result<T>) -> T {
    field.unwrap_or_default()
}

fn decode(block: &[u8], offset: usize) -> RuntimeResult<ArchiveEntry> {
    let header = Header::from_byte_slice(block);
    // only the size steers the walk, so only the size must parse
    let size = header.entry_size().map_err(|e| RuntimeError::ArchiveFormat {
        offset,
        reason: e.to_string(),
    })?;

    Ok(ArchiveEntry {
        path: text(&header.path_bytes()),
        mode: octal_or_zero(header.mode()),
        uid: octal_or_zero(header.uid()),
        gid: octal_or_zero(header.gid()),
        size,
        mtime: octal_or_zero(header.mtime()),
        checksum: octal_or_zero(header.cksum()),
        typeflag: block[TYPEFLAG_OFFSET],
        link_name: text(&header.as_old().linkname),
        owner_name: header.username_bytes().map(text).unwrap_or_default(),
        group_name: header.groupname_bytes().map(text).unwrap_or_default(),
        dev_major: octal_or_zero(header.device_major()).unwrap_or(0),
        dev_minor: octal_or_zero(header.device_minor()).unwrap_or(0),
    })
}

/// Streaming loader; the only state kept between entries is the offset
#[derive(Debug, Default)]
pub struct ArchiveLoader {
    offset: usize,
}

impl ArchiveLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current read offset into the archive
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Load every entry of `data` into `vfs`
    pub fn load(&mut self, data: &[u8], vfs: &VirtualFileSystem) -> RuntimeResult<ArchiveSummary> {
        let mut summary = ArchiveSummary::default();

        while let Some(entry) = self.next_header(data)? {
            let header_at = self.offset;
            let content_at = header_at + BLOCK_SIZE;

            match EntryType::new(entry.typeflag) {
                EntryType::Regular => {
                    let size = entry.size as usize;
                    let contents = content_at
                        .checked_add(size)
                        .and_then(|end| data.get(content_at..end))
                        .ok_or_else(|| RuntimeError::ArchiveFormat {
                            offset: header_at,
                            reason: format!(
                                "{} declares {} bytes but the archive ends first",
                                entry.path,
                                size
                            ),
                        })?;
                    vfs.add_file(&entry.path, contents)?;
                    summary.files += 1;
                    summary.bytes += entry.size;
                    self.offset = content_at + size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
                }
                EntryType::Directory => {
                    vfs.add_directory(&entry.path)?;
                    summary.directories += 1;
                    self.offset = content_at;
                }
                _ => {
                    return Err(RuntimeError::ArchiveFormat {
                        offset: header_at,
                        reason: format!(
                            "unsupported type flag '{}' for {}",
                            entry.typeflag.escape_ascii(),
                            entry.path
                        ),
                    });
                }
            }
        }

        Ok(summary)
    }

    /// Decode the header at the current offset, or `None` at end of stream
    fn next_header(&self, data: &[u8]) -> RuntimeResult<Option<ArchiveEntry>> {
        let Some(block) = data.get(self.offset..self.offset + BLOCK_SIZE) else {
            return Ok(None);
        };
        if &block[MAGIC_RANGE] != GNU_MAGIC {
            return Ok(None);
        }
        decode(block, self.offset).map(Some)
    }
}
