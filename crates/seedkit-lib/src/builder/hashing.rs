//! In-process SHA-1 piece hashing.

use std::fs::File;
use std::io::Read;
use std::time::Instant;

use sha1::{Digest, Sha1};

use super::progress::{estimate_eta, format_speed, HashProgress, ProgressSink};
use super::selection::SelectedFile;
use crate::error::{Error, IoContext, Result};

const READ_CHUNK: usize = 1 << 20;

/// Streams bytes into fixed-size pieces, emitting one 20-byte digest per piece.
struct PieceHasher {
    piece_length: usize,
    current: Sha1,
    filled: usize,
    pieces: Vec<u8>,
}

impl PieceHasher {
    fn new(piece_length: usize, expected_pieces: usize) -> Self {
        PieceHasher {
            piece_length,
            current: Sha1::new(),
            filled: 0,
            pieces: Vec::with_capacity(expected_pieces * 20),
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (self.piece_length - self.filled).min(data.len());
            self.current.update(&data[..take]);
            self.filled += take;
            data = &data[take..];
            if self.filled == self.piece_length {
                self.finish_piece();
            }
        }
    }

    fn finish_piece(&mut self) {
        let digest = std::mem::replace(&mut self.current, Sha1::new()).finalize();
        self.pieces.extend_from_slice(&digest);
        self.filled = 0;
    }

    fn finish(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.finish_piece();
        }
        self.pieces
    }
}

/// Blocking: hashes the concatenation of `files` in order.
pub fn hash_files(files: &[SelectedFile], piece_length: u64, progress: &ProgressSink) -> Result<Vec<u8>> {
    let total: u64 = files.iter().map(|f| f.length).sum();
    let expected_pieces = try_into!(total.div_ceil(piece_length), usize)?;
    let mut hasher = PieceHasher::new(try_into!(piece_length, usize)?, expected_pieces);

    let started = Instant::now();
    let mut hashed: u64 = 0;
    let mut last_percent = 0u8;
    let mut buf = vec![0u8; READ_CHUNK];

    for file in files {
        let mut handle = File::open(&file.absolute).at_path(&file.absolute)?;
        let mut remaining = file.length;
        while remaining > 0 {
            let want = buf.len().min(try_into!(remaining, usize).unwrap_or(usize::MAX));
            let read = handle.read(&mut buf[..want]).at_path(&file.absolute)?;
            if read == 0 {
                return Err(Error::Integrity(format!(
                    "{} ended {remaining} bytes early while hashing",
                    file.absolute.display()
                )));
            }
            hasher.update(&buf[..read]);
            remaining -= read as u64;
            hashed += read as u64;

            let percent = (hashed * 100 / total.max(1)) as u8;
            if percent != last_percent {
                last_percent = percent;
                let elapsed = started.elapsed();
                progress(&HashProgress {
                    percent,
                    speed: format_speed(hashed, elapsed),
                    eta: estimate_eta(percent, elapsed),
                });
            }
        }
    }

    let pieces = hasher.finish();
    tracing::debug!(pieces = pieces.len() / 20, elapsed = ?started.elapsed(), "hashed content in-process");
    Ok(pieces)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn pieces_span_file_boundaries() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"hello ").expect("failed to write");
        std::fs::write(&b, b"world!").expect("failed to write");

        let files = vec![
            SelectedFile {
                absolute: a,
                relative: vec!["a".to_owned()],
                length: 6,
            },
            SelectedFile {
                absolute: b,
                relative: vec!["b".to_owned()],
                length: 6,
            },
        ];
        let last = Arc::new(AtomicU8::new(0));
        let sink: ProgressSink = {
            let last = Arc::clone(&last);
            Arc::new(move |p: &HashProgress| last.store(p.percent, Ordering::SeqCst))
        };

        let pieces = hash_files(&files, 8, &sink).expect("failed to hash");
        assert_eq!(pieces.len(), 40);
        let first: [u8; 20] = Sha1::digest(b"hello wo").into();
        let second: [u8; 20] = Sha1::digest(b"rld!").into();
        assert_eq!(&pieces[..20], &first);
        assert_eq!(&pieces[20..], &second);
        assert_eq!(last.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn truncated_files_are_an_integrity_error() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let a = dir.path().join("a");
        std::fs::write(&a, b"abc").expect("failed to write");
        let files = vec![SelectedFile {
            absolute: a,
            relative: vec!["a".to_owned()],
            length: 10,
        }];
        let sink: ProgressSink = Arc::new(|_: &HashProgress| {});
        assert!(matches!(hash_files(&files, 8, &sink), Err(Error::Integrity(_))));
    }
}
