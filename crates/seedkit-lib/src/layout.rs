//! Mapping between a descriptor's declared files and the content on disk.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::descriptor::{FileEntry, TorrentDescriptor};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub entry: FileEntry,
    /// Where the file is expected on disk
    pub path: PathBuf,
    /// Offset of the file's first byte in the concatenated torrent data
    pub offset: u64,
}

impl ResolvedFile {
    /// Number of pieces this file's byte range touches.
    pub fn pieces_spanned(&self, piece_length: u64) -> u64 {
        let end = self.offset + self.entry.length;
        end.div_ceil(piece_length) - self.offset / piece_length
    }
}

/// A problem found while comparing a descriptor against disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    Missing { path: PathBuf },
    SizeDiffers { path: PathBuf, expected: u64, actual: u64 },
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mismatch::Missing { path } => write!(f, "{} is missing", path.display()),
            Mismatch::SizeDiffers { path, expected, actual } => {
                write!(f, "{} is {actual} bytes, expected {expected}", path.display())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContentLayout {
    pub files: Vec<ResolvedFile>,
}

impl ContentLayout {
    /// Resolves every declared file below `content_path`.
    ///
    /// `content_path` is the release itself: the file for single-file torrents and the
    /// top-level directory for multi-file ones. A parent directory holding the release is
    /// accepted as well.
    pub fn resolve(descriptor: &TorrentDescriptor, content_path: &Path) -> Result<Self> {
        let name = descriptor.name();
        let root = if descriptor.is_multi_file() {
            let nested = content_path.join(name);
            if !content_path.ends_with(name) && nested.is_dir() {
                nested
            } else {
                content_path.to_path_buf()
            }
        } else if content_path.is_dir() {
            content_path.to_path_buf()
        } else {
            // the file itself, possibly under a different name
            return Ok(ContentLayout {
                files: descriptor
                    .files()?
                    .into_iter()
                    .map(|entry| ResolvedFile {
                        entry,
                        path: content_path.to_path_buf(),
                        offset: 0,
                    })
                    .collect(),
            });
        };

        let mut offset = 0;
        let files = descriptor
            .files()?
            .into_iter()
            .map(|entry| {
                let resolved = ResolvedFile {
                    path: root.join(entry.relative_path()),
                    offset,
                    entry,
                };
                offset += resolved.entry.length;
                resolved
            })
            .collect();
        Ok(ContentLayout { files })
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.entry.length).sum()
    }

    /// Compares every declared file with what's on disk.
    pub fn mismatches(&self) -> Vec<Mismatch> {
        self.files
            .iter()
            .filter_map(|file| match std::fs::metadata(&file.path) {
                Ok(meta) if meta.is_file() && meta.len() == file.entry.length => None,
                Ok(meta) if meta.is_file() => Some(Mismatch::SizeDiffers {
                    path: file.path.clone(),
                    expected: file.entry.length,
                    actual: meta.len(),
                }),
                _ => Some(Mismatch::Missing {
                    path: file.path.clone(),
                }),
            })
            .collect()
    }

    /// Fails with [`Error::Integrity`] on the first mismatch.
    pub fn verify(&self) -> Result<()> {
        match self.mismatches().into_iter().next() {
            Some(mismatch) => Err(Error::Integrity(mismatch.to_string())),
            None => Ok(()),
        }
    }
}

/// Modification time in UNIX seconds, `0` when the platform can't tell.
pub fn mtime_secs(path: &Path) -> Result<i64> {
    let meta = std::fs::metadata(path).map_err(|e| Error::io(path, e))?;
    let secs = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    try_into!(secs, i64)
}
