//! BASE descriptors and everything derived from them.
//!
//! A BASE descriptor carries no tracker-specific data: placeholder announce, fixed comment and
//! creator, and an info dictionary reduced to the keys that define the content. Tracker
//! uploads and randomized variants are produced from it without re-hashing.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;
use serde_bencode::BencodeValue;

use crate::descriptor::{
    TorrentDescriptor, ANNOUNCE, ANNOUNCE_LIST, COMMENT, CREATED_BY, CREATION_DATE, ENCODING, FILES, INFO, LENGTH,
    NAME, PIECES, PIECE_LENGTH, PRIVATE, SOURCE,
};
use crate::error::{Error, Result};
use crate::layout::ContentLayout;
use crate::piece_size::KIB;

pub const BASE_NAME: &str = "BASE";
pub const PLACEHOLDER_ANNOUNCE: &str = "https://fake.tracker";
pub const CANONICAL_COMMENT: &str = "Created by seedkit";
pub const CANONICAL_CREATOR: &str = "Created by seedkit";
/// Info key holding a random integer that makes otherwise identical descriptors distinct
pub const ENTROPY: &str = "entropy";

const TOP_LEVEL_KEYS: [&str; 6] = [ANNOUNCE, COMMENT, CREATION_DATE, CREATED_BY, ENCODING, INFO];
const INFO_KEYS: [&str; 5] = [NAME, PIECE_LENGTH, PIECES, PRIVATE, SOURCE];

/// Checks a descriptor against the content it claims to describe.
///
/// Fails with [`Error::Validation`] when `skip_nfo` is set and a `.nfo` is declared, or when
/// `content_path` is given and a declared file is absent or has a different size.
pub fn validate(descriptor: &TorrentDescriptor, content_path: Option<&Path>, skip_nfo: bool) -> Result<()> {
    let files = descriptor.files()?;
    if skip_nfo {
        if let Some(nfo) = files.iter().find(|f| f.file_name().to_lowercase().ends_with(".nfo")) {
            return Err(Error::Validation(format!(
                "declares {} but NFO files are not allowed",
                nfo.relative_path().display()
            )));
        }
    }
    if let Some(content_path) = content_path {
        let layout = ContentLayout::resolve(descriptor, content_path)?;
        if let Some(mismatch) = layout.mismatches().into_iter().next() {
            return Err(Error::Validation(mismatch.to_string()));
        }
    }
    Ok(())
}

/// Pure: reduces `descriptor` to its BASE form.
pub fn canonicalize(descriptor: &TorrentDescriptor, source: &str) -> TorrentDescriptor {
    let mut base = descriptor.clone();

    base.top_mut()
        .retain(|key, _| TOP_LEVEL_KEYS.iter().any(|allowed| allowed.as_bytes() == key.as_slice()));
    base.set_top(ANNOUNCE, PLACEHOLDER_ANNOUNCE);
    base.remove_top(ANNOUNCE_LIST);
    base.set_top(COMMENT, CANONICAL_COMMENT);
    base.set_top(CREATED_BY, CANONICAL_CREATOR);

    let layout_key = if base.is_multi_file() { FILES } else { LENGTH };
    let info = base.info_mut();
    info.retain(|key, _| {
        INFO_KEYS.iter().any(|allowed| allowed.as_bytes() == key.as_slice()) || key.as_slice() == layout_key.as_bytes()
    });
    info.insert(PRIVATE.into(), 1i64.into());
    info.insert(SOURCE.into(), source.into());
    base
}

/// Limits a reused descriptor has to respect, mirroring what trackers accept.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReuseLimits {
    /// User-supplied piece-size ceiling in MiB
    pub user_max_mib: Option<u64>,
    /// Searching for small pieces lifts the 8 MiB rule
    pub prefer_small_pieces: bool,
}

impl ReuseLimits {
    const PIECE_COUNT_AT_4MIB: usize = 5000;
    const PIECE_COUNT_AT_8MIB: usize = 8000;
    const PIECE_COUNT_CEILING: usize = 12000;
    // not quite 4 and 8 MiB, trackers compare against these exact values
    const SMALL_PIECE_BELOW: i64 = 4_294_304;
    const MEDIUM_PIECE_BELOW: i64 = 8_488_608;
    const MIN_PIECE: i64 = 32 * KIB as i64;
    const MAX_FILE_SIZE: u64 = 250 * KIB;

    /// `file_size` is the size of the encoded descriptor.
    pub fn check(&self, descriptor: &TorrentDescriptor, file_size: u64) -> Result<()> {
        let pieces = descriptor.piece_count();
        let piece_length = descriptor.piece_length();
        let allows = |mib: u64| self.user_max_mib.map_or(true, |max| max >= mib);

        let reason = if pieces >= Self::PIECE_COUNT_AT_4MIB && piece_length < Self::SMALL_PIECE_BELOW && allows(4) {
            format!("{pieces} pieces need at least a 4 MiB piece size")
        } else if pieces >= Self::PIECE_COUNT_AT_8MIB
            && piece_length < Self::MEDIUM_PIECE_BELOW
            && allows(8)
            && !self.prefer_small_pieces
        {
            format!("{pieces} pieces need at least an 8 MiB piece size")
        } else if self.user_max_mib.is_none() && pieces >= Self::PIECE_COUNT_CEILING {
            format!("{pieces} pieces is above the {} limit", Self::PIECE_COUNT_CEILING)
        } else if piece_length < Self::MIN_PIECE {
            format!("piece size {piece_length} is too small to reuse")
        } else if self.user_max_mib.is_none() && file_size > Self::MAX_FILE_SIZE {
            format!("descriptor is {} KiB, above 250 KiB", file_size / KIB)
        } else {
            return Ok(());
        };
        Err(Error::Validation(reason))
    }
}

/// Tracker-specific values applied on top of a BASE descriptor.
#[derive(Debug, Clone, Default)]
pub struct TrackerVariant {
    pub announce: Option<String>,
    /// Left empty unless given, so nothing private leaks from a reused descriptor
    pub comment: Option<String>,
    pub source: String,
    pub entropy: bool,
}

fn sanitize_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^0-9a-zA-Z\[\]'\-]+").unwrap_or_else(|e| unreachable!("static regex is valid: {e}")))
}

/// Turns a release name into something safe to use as a file stem.
pub fn sanitize_name(name: &str) -> String {
    sanitize_re().replace_all(name, ".").into_owned()
}

/// Writes BASE and derived descriptors into the work directory.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    work_dir: PathBuf,
    source: String,
}

impl Canonicalizer {
    pub fn new(work_dir: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        Canonicalizer {
            work_dir: work_dir.into(),
            source: source.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn base_path(&self) -> PathBuf {
        self.work_dir.join(format!("{BASE_NAME}.torrent"))
    }

    /// Validates `descriptor` and writes its BASE form to `<work_dir>/BASE.torrent`.
    #[tracing::instrument(err, skip(self, descriptor), fields(name = descriptor.name()))]
    pub async fn write_base(
        &self,
        descriptor: &TorrentDescriptor,
        content_path: Option<&Path>,
        skip_nfo: bool,
    ) -> Result<TorrentDescriptor> {
        validate(descriptor, content_path, skip_nfo)?;
        let base = canonicalize(descriptor, &self.source);
        base.save(&self.base_path()).await?;
        tracing::debug!(info_hash = %base.info_hash_hex()?, "wrote BASE descriptor");
        Ok(base)
    }

    /// Writes `<work_dir>/[<tracker>].torrent` from a BASE descriptor.
    #[tracing::instrument(err, skip(self, base, variant))]
    pub async fn derive_for_tracker(
        &self,
        base: &TorrentDescriptor,
        tracker: &str,
        variant: &TrackerVariant,
    ) -> Result<(PathBuf, TorrentDescriptor)> {
        let mut derived = base.clone();
        derived
            .top_mut()
            .retain(|key, _| TOP_LEVEL_KEYS.iter().any(|allowed| allowed.as_bytes() == key.as_slice()));
        derived.set_top(
            ANNOUNCE,
            variant.announce.as_deref().unwrap_or(PLACEHOLDER_ANNOUNCE).trim(),
        );
        derived.set_top(COMMENT, variant.comment.as_deref().unwrap_or_default());
        derived.info_mut().insert(SOURCE.into(), variant.source.as_str().into());
        if variant.entropy {
            derived.info_mut().insert(ENTROPY.into(), random_entropy().into());
        }

        let path = self.work_dir.join(format!("[{tracker}].torrent"));
        derived.save(&path).await?;
        Ok((path, derived))
    }

    /// Writes `count` copies of `base`, each with its own random `entropy` value.
    #[tracing::instrument(err, skip(self, base))]
    pub async fn randomize(&self, base: &TorrentDescriptor, count: u32, release_name: &str) -> Result<Vec<PathBuf>> {
        let stem = sanitize_name(release_name);
        let mut written = Vec::with_capacity(count as usize);
        for i in 1..=count {
            let mut variant = base.clone();
            variant.info_mut().insert(ENTROPY.into(), random_entropy().into());
            let path = self.work_dir.join(format!("[RAND-{i}]{stem}.torrent"));
            variant.save(&path).await?;
            written.push(path);
        }
        Ok(written)
    }
}

fn random_entropy() -> BencodeValue {
    BencodeValue::Int(rand::thread_rng().gen_range(1..1_000_000))
}
