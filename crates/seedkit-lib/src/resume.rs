//! libtorrent-style fast-resume data, so an added torrent starts seeding without a recheck.

use std::path::{Path, PathBuf};

use serde_bencode::{BencodeValue, Dict};

use crate::descriptor::TorrentDescriptor;
use crate::error::{Error, IoContext, Result};
use crate::layout::{mtime_secs, ContentLayout};
use crate::run_blocking;

pub const RESUME_KEY: &str = "libtorrent_resume";
const TRANSIENT_NAME: &str = "fr.torrent";

/// Resume bookkeeping for one declared file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeEntry {
    pub priority: i64,
    /// UNIX seconds
    pub mtime: i64,
    /// Pieces touched by the file's byte range
    pub completed: u64,
}

impl From<ResumeEntry> for BencodeValue {
    fn from(entry: ResumeEntry) -> Self {
        let mut dict = Dict::new();
        dict.insert(b"priority".to_vec(), entry.priority.into());
        dict.insert(b"mtime".to_vec(), entry.mtime.into());
        dict.insert(
            b"completed".to_vec(),
            i64::try_from(entry.completed).unwrap_or(i64::MAX).into(),
        );
        BencodeValue::Dict(dict)
    }
}

fn checked_piece_length(descriptor: &TorrentDescriptor) -> Result<u64> {
    let piece_length = descriptor.piece_length();
    match u64::try_from(piece_length) {
        Ok(length) if length.is_power_of_two() => Ok(length),
        _ => Err(Error::Integrity(format!("invalid piece length {piece_length}"))),
    }
}

/// Blocking: one entry per declared file, after checking every file's size on disk.
pub fn resume_entries(descriptor: &TorrentDescriptor, content_path: &Path) -> Result<Vec<ResumeEntry>> {
    let piece_length = checked_piece_length(descriptor)?;
    let layout = ContentLayout::resolve(descriptor, content_path)?;
    layout.verify()?;
    layout
        .files
        .iter()
        .map(|file| {
            Ok(ResumeEntry {
                priority: 1,
                mtime: mtime_secs(&file.path)?,
                completed: file.pieces_spanned(piece_length),
            })
        })
        .collect()
}

/// Blocking: `descriptor` with a `libtorrent_resume` dictionary added.
pub fn synthesize(descriptor: &TorrentDescriptor, content_path: &Path) -> Result<TorrentDescriptor> {
    let entries = resume_entries(descriptor, content_path)?;
    let mut resume = Dict::new();
    resume.insert(b"bitfield".to_vec(), try_into!(descriptor.piece_count(), i64)?.into());
    resume.insert(
        b"files".to_vec(),
        BencodeValue::List(entries.into_iter().map(BencodeValue::from).collect()),
    );

    let mut augmented = descriptor.clone();
    augmented.set_top(RESUME_KEY, resume);
    Ok(augmented)
}

/// Adds resume data to the descriptor at `torrent_path`.
///
/// Writes `<stem>-resume.torrent` next to it when the result differs from the input and
/// returns the path of whichever file should be handed to the client.
#[tracing::instrument(err)]
pub async fn write_resume_file(torrent_path: &Path, content_path: &Path) -> Result<PathBuf> {
    let original = tokio::fs::read(torrent_path).await.at_path(torrent_path)?;
    let descriptor = TorrentDescriptor::from_bytes(&original)?;

    let content = content_path.to_path_buf();
    let augmented = run_blocking(move || synthesize(&descriptor, &content)).await?;
    let encoded = augmented.to_bytes()?;
    if encoded == original {
        return Ok(torrent_path.to_path_buf());
    }

    let stem = torrent_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| augmented.name().to_owned());
    let resume_path = torrent_path.with_file_name(format!("{stem}-resume.torrent"));
    tokio::fs::write(&resume_path, &encoded).await.at_path(&resume_path)?;
    tracing::debug!(path = %resume_path.display(), "wrote fast-resume descriptor");
    Ok(resume_path)
}

/// A copy of a descriptor placed next to the content, removed on drop.
#[derive(Debug)]
pub struct TransientCopy {
    path: PathBuf,
}

impl TransientCopy {
    /// Copies `source` to `<dir>/fr.torrent`.
    pub async fn stage(source: &Path, dir: &Path) -> Result<Self> {
        let path = dir.join(TRANSIENT_NAME);
        tokio::fs::copy(source, &path).await.at_path(&path)?;
        Ok(TransientCopy { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransientCopy {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove transient descriptor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::{multi_file, single_file};
    use crate::piece_size::MIB;

    fn write(path: &Path, len: u64) {
        std::fs::create_dir_all(path.parent().expect("path has a parent")).expect("failed to create dirs");
        let file = std::fs::File::create(path).expect("failed to create");
        file.set_len(len).expect("failed to size");
    }

    #[test]
    fn completed_counts_follow_piece_boundaries() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let release = dir.path().join("Pack");
        write(&release.join("a.mkv"), 10 * MIB);
        write(&release.join("b.mkv"), 5 * MIB);

        let descriptor = multi_file("Pack", 4 * MIB, &[("a.mkv", 10 * MIB), ("b.mkv", 5 * MIB)]);
        let entries = resume_entries(&descriptor, &release).expect("failed to compute entries");
        let completed: Vec<u64> = entries.iter().map(|e| e.completed).collect();
        assert_eq!(completed, vec![3, 2]);
        assert!(entries.iter().all(|e| e.priority == 1 && e.mtime > 0));

        let augmented = synthesize(&descriptor, &release).expect("failed to synthesize");
        let resume = augmented.top_value(RESUME_KEY).expect("resume data missing");
        assert_eq!(resume.get("bitfield").and_then(BencodeValue::as_int), Some(4));
        assert_eq!(resume.get("files").and_then(BencodeValue::as_list).map(<[_]>::len), Some(2));
        // resume data lives outside info, the info-hash is unchanged
        assert_eq!(
            augmented.info_hash().expect("hash"),
            descriptor.info_hash().expect("hash")
        );
    }

    #[test]
    fn size_mismatch_is_an_integrity_error() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let release = dir.path().join("Pack");
        write(&release.join("a.mkv"), 100);
        let descriptor = multi_file("Pack", 32768, &[("a.mkv", 101)]);
        assert!(matches!(resume_entries(&descriptor, &release), Err(Error::Integrity(_))));

        let missing = multi_file("Pack", 32768, &[("a.mkv", 100), ("b.mkv", 1)]);
        assert!(matches!(resume_entries(&missing, &release), Err(Error::Integrity(_))));
    }

    #[test]
    fn rejects_bad_piece_lengths() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let file = dir.path().join("movie.mkv");
        write(&file, 100);
        let descriptor = single_file("movie.mkv", 30000, 100);
        assert!(matches!(resume_entries(&descriptor, &file), Err(Error::Integrity(_))));
    }

    #[tokio::test]
    async fn writes_resume_file_and_transient_copy() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let content = dir.path().join("movie.mkv");
        write(&content, 100);
        let torrent = dir.path().join("[BLU].torrent");
        single_file("movie.mkv", 32768, 100)
            .save(&torrent)
            .await
            .expect("failed to save");

        let resume = write_resume_file(&torrent, &content).await.expect("failed to write resume");
        assert_eq!(resume, dir.path().join("[BLU]-resume.torrent"));
        let reloaded = TorrentDescriptor::load(&resume).await.expect("failed to reload");
        assert!(reloaded.top_value(RESUME_KEY).is_some());

        let staging = tempfile::tempdir().expect("failed to create a temp dir");
        let staged_path = {
            let staged = TransientCopy::stage(&resume, staging.path()).await.expect("failed to stage");
            assert!(staged.path().is_file());
            staged.path().to_path_buf()
        };
        assert!(!staged_path.exists());
    }
}
