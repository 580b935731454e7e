//! In-memory `.torrent` descriptor.
//!
//! The descriptor is kept as a generic bencode tree so keys we don't model (e.g. `x_cross_seed`,
//! `libtorrent_resume`) survive a read/write cycle untouched until canonicalization strips them.

use std::path::{Path, PathBuf};

use serde_bencode::{BencodeValue, Dict};
use sha1::{Digest, Sha1};

use crate::error::{Error, IoContext, Result};

pub const INFO: &str = "info";
pub const ANNOUNCE: &str = "announce";
pub const ANNOUNCE_LIST: &str = "announce-list";
pub const COMMENT: &str = "comment";
pub const CREATED_BY: &str = "created by";
pub const CREATION_DATE: &str = "creation date";
pub const ENCODING: &str = "encoding";

pub const NAME: &str = "name";
pub const PIECE_LENGTH: &str = "piece length";
pub const PIECES: &str = "pieces";
pub const PRIVATE: &str = "private";
pub const SOURCE: &str = "source";
pub const FILES: &str = "files";
pub const LENGTH: &str = "length";
pub const PATH: &str = "path";

/// A file declared by the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path components relative to the torrent root.
    /// "dir1/dir2/file.ext" -> ["dir1", "dir2", "file.ext"]
    pub path: Vec<String>,
    /// Length of the file in bytes
    pub length: u64,
}

impl FileEntry {
    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }

    pub fn file_name(&self) -> &str {
        self.path.last().map_or("", String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLayout {
    /// Single File Mode: the torrent name is the file name
    Single { length: u64 },
    /// Multi File Mode: the torrent name is the root directory
    Multi { files: Vec<FileEntry> },
}

/// Everything needed to assemble a fresh descriptor.
#[derive(Debug, Clone)]
pub struct DescriptorParts {
    pub name: String,
    pub piece_length: u64,
    /// Concatenated 20-byte SHA-1 piece hashes
    pub pieces: Vec<u8>,
    pub layout: FileLayout,
    pub private: bool,
    pub source: Option<String>,
    pub announce: String,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    /// UNIX seconds
    pub creation_date: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentDescriptor {
    /// Top-level keys except `info`
    top: Dict,
    info: Dict,
    /// Encoded `info` exactly as read, until the info dictionary is mutated
    raw_info: Option<Vec<u8>>,
}

impl TorrentDescriptor {
    pub fn from_bytes(input: &[u8]) -> Result<Self> {
        let BencodeValue::Dict(mut top) = serde_bencode::from_bytes::<BencodeValue>(input)? else {
            return Err(Error::Validation("descriptor is not a dictionary".to_owned()));
        };
        let info = match top.remove(INFO.as_bytes()) {
            Some(BencodeValue::Dict(info)) => info,
            Some(_) => return Err(Error::Validation("info is not a dictionary".to_owned())),
            None => return Err(Error::Validation("descriptor has no info dictionary".to_owned())),
        };
        let raw_info = serde_bencode::dict_value_span(input, INFO.as_bytes())?.map(|span| input[span].to_vec());
        let descriptor = TorrentDescriptor { top, info, raw_info };
        descriptor.check_shape()?;
        Ok(descriptor)
    }

    pub fn from_parts(parts: DescriptorParts) -> Result<Self> {
        let mut info = Dict::new();
        info.insert(NAME.into(), parts.name.into());
        info.insert(PIECE_LENGTH.into(), try_into!(parts.piece_length, i64)?.into());
        info.insert(PIECES.into(), parts.pieces.into());
        if parts.private {
            info.insert(PRIVATE.into(), 1i64.into());
        }
        if let Some(source) = parts.source {
            info.insert(SOURCE.into(), source.into());
        }
        match parts.layout {
            FileLayout::Single { length } => {
                info.insert(LENGTH.into(), try_into!(length, i64)?.into());
            }
            FileLayout::Multi { files } => {
                let files = files
                    .into_iter()
                    .map(|file| {
                        let mut entry = Dict::new();
                        entry.insert(LENGTH.into(), try_into!(file.length, i64)?.into());
                        entry.insert(
                            PATH.into(),
                            BencodeValue::List(file.path.into_iter().map(BencodeValue::from).collect()),
                        );
                        Ok(BencodeValue::Dict(entry))
                    })
                    .collect::<Result<Vec<_>>>()?;
                info.insert(FILES.into(), BencodeValue::List(files));
            }
        }

        let mut top = Dict::new();
        top.insert(ANNOUNCE.into(), parts.announce.into());
        if let Some(comment) = parts.comment {
            top.insert(COMMENT.into(), comment.into());
        }
        if let Some(created_by) = parts.created_by {
            top.insert(CREATED_BY.into(), created_by.into());
        }
        if let Some(date) = parts.creation_date {
            top.insert(CREATION_DATE.into(), date.into());
        }

        let descriptor = TorrentDescriptor {
            top,
            info,
            raw_info: None,
        };
        descriptor.check_shape()?;
        Ok(descriptor)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await.at_path(path)?;
        Self::from_bytes(&raw)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let raw = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.at_path(parent)?;
        }
        tokio::fs::write(path, raw).await.at_path(path)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut whole = self.top.clone();
        whole.insert(INFO.into(), BencodeValue::Dict(self.info.clone()));
        Ok(serde_bencode::to_bytes(&BencodeValue::Dict(whole))?)
    }

    pub fn info_bytes(&self) -> Result<Vec<u8>> {
        match &self.raw_info {
            Some(raw) => Ok(raw.clone()),
            None => Ok(serde_bencode::to_bytes(&BencodeValue::Dict(self.info.clone()))?),
        }
    }

    pub fn info_hash(&self) -> Result<[u8; 20]> {
        let hasher = Sha1::new_with_prefix(self.info_bytes()?);
        Ok(hasher.finalize().into())
    }

    pub fn info_hash_hex(&self) -> Result<String> {
        Ok(hex::encode(self.info_hash()?))
    }

    /// Validates the fields every other component relies on.
    fn check_shape(&self) -> Result<()> {
        if self.info_value(NAME).and_then(BencodeValue::as_bytes).is_none() {
            return Err(Error::Validation("info.name is missing".to_owned()));
        }
        if self.info_value(PIECE_LENGTH).and_then(BencodeValue::as_int).is_none() {
            return Err(Error::Validation("info.piece length is missing".to_owned()));
        }
        let pieces = self.pieces();
        if pieces.len() % 20 != 0 {
            return Err(Error::Validation(format!(
                "info.pieces length {} is not a multiple of 20",
                pieces.len()
            )));
        }
        self.layout().map(|_| ())
    }

    pub fn top(&self) -> &Dict {
        &self.top
    }

    /// Mutable access to the top-level keys other than `info`.
    pub fn top_mut(&mut self) -> &mut Dict {
        &mut self.top
    }

    pub fn top_value(&self, key: &str) -> Option<&BencodeValue> {
        self.top.get(key.as_bytes())
    }

    pub fn info(&self) -> &Dict {
        &self.info
    }

    /// Mutable access to the info dictionary. Drops the cached raw encoding.
    pub fn info_mut(&mut self) -> &mut Dict {
        self.raw_info = None;
        &mut self.info
    }

    pub fn info_value(&self, key: &str) -> Option<&BencodeValue> {
        self.info.get(key.as_bytes())
    }

    fn top_str(&self, key: &str) -> Option<&str> {
        self.top_value(key).and_then(BencodeValue::as_str)
    }

    pub fn set_top(&mut self, key: &str, value: impl Into<BencodeValue>) {
        self.top.insert(key.into(), value.into());
    }

    pub fn remove_top(&mut self, key: &str) -> Option<BencodeValue> {
        self.top.remove(key.as_bytes())
    }

    pub fn name(&self) -> &str {
        self.info_value(NAME).and_then(BencodeValue::as_str).unwrap_or_default()
    }

    pub fn piece_length(&self) -> i64 {
        self.info_value(PIECE_LENGTH).and_then(BencodeValue::as_int).unwrap_or_default()
    }

    pub fn pieces(&self) -> &[u8] {
        self.info_value(PIECES).and_then(BencodeValue::as_bytes).unwrap_or_default()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces().len() / 20
    }

    pub fn private(&self) -> bool {
        self.info_value(PRIVATE).and_then(BencodeValue::as_int) == Some(1)
    }

    pub fn source(&self) -> Option<&str> {
        self.info_value(SOURCE).and_then(BencodeValue::as_str)
    }

    pub fn announce(&self) -> Option<&str> {
        self.top_str(ANNOUNCE)
    }

    pub fn comment(&self) -> Option<&str> {
        self.top_str(COMMENT)
    }

    pub fn created_by(&self) -> Option<&str> {
        self.top_str(CREATED_BY)
    }

    pub fn creation_date(&self) -> Option<i64> {
        self.top_value(CREATION_DATE).and_then(BencodeValue::as_int)
    }

    pub fn is_multi_file(&self) -> bool {
        self.info_value(FILES).is_some()
    }

    pub fn layout(&self) -> Result<FileLayout> {
        if let Some(files) = self.info_value(FILES) {
            let files = files
                .as_list()
                .ok_or_else(|| Error::Validation("info.files is not a list".to_owned()))?;
            let files = files.iter().map(parse_file_entry).collect::<Result<Vec<_>>>()?;
            return Ok(FileLayout::Multi { files });
        }
        let length = self
            .info_value(LENGTH)
            .and_then(BencodeValue::as_int)
            .ok_or_else(|| Error::Validation("info has neither `files` nor `length`".to_owned()))?;
        Ok(FileLayout::Single {
            length: try_into!(length, u64)?,
        })
    }

    /// Declared files in descriptor order. A single-file torrent yields one entry named after it.
    pub fn files(&self) -> Result<Vec<FileEntry>> {
        Ok(match self.layout()? {
            FileLayout::Single { length } => vec![FileEntry {
                path: vec![self.name().to_owned()],
                length,
            }],
            FileLayout::Multi { files } => files,
        })
    }

    pub fn total_length(&self) -> Result<u64> {
        Ok(self.files()?.iter().map(|f| f.length).sum())
    }
}

fn parse_file_entry(value: &BencodeValue) -> Result<FileEntry> {
    let length = value
        .get(LENGTH)
        .and_then(BencodeValue::as_int)
        .ok_or_else(|| Error::Validation("file entry without a length".to_owned()))?;
    let path = value
        .get(PATH)
        .and_then(BencodeValue::as_list)
        .ok_or_else(|| Error::Validation("file entry without a path".to_owned()))?
        .iter()
        .map(|part| {
            part.as_str()
                .map(str::to_owned)
                .ok_or_else(|| Error::Validation("file path component is not utf-8".to_owned()))
        })
        .collect::<Result<Vec<_>>>()?;
    if path.is_empty() || path.iter().any(|p| p.is_empty() || p == ".." || p == ".") {
        return Err(Error::Validation(format!("unsafe file path {path:?}")));
    }
    Ok(FileEntry {
        path,
        length: try_into!(length, u64)?,
    })
}
