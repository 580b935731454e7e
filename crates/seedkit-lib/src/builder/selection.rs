//! Which files of a release end up in a freshly built torrent.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::{Error, Result};

const VIDEO_PATTERNS: [&str; 3] = ["*.mkv", "*.mp4", "*.ts"];
const SAMPLE_PATTERN: &str = "*sample.mkv";
const NFO_PATTERN: &str = "*.nfo";
/// Side files the external tool always skips
pub const SIDE_FILE_PATTERNS: [&str; 10] = [
    "*.nfo", "*.jpg", "*.png", "*.srt", "*.sub", "*.vtt", "*.ssa", "*.ass", "*.txt", "*.xml",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionMode {
    /// Video files only, minus samples. A lone video becomes a single-file torrent
    #[default]
    Auto,
    /// Full disc structure, nothing filtered
    Disc,
    /// Keep the folder even for a single file; only the listed files are hashed
    KeepFolder,
    /// Season packs and the like: exactly the listed files
    Pack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    pub absolute: PathBuf,
    /// Components relative to the torrent root
    pub relative: Vec<String>,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct Selection {
    /// What gets handed to the hasher: a directory, or a file for single-file torrents
    pub root: PathBuf,
    pub name: String,
    pub single_file: bool,
    pub files: Vec<SelectedFile>,
}

impl Selection {
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Re-reads file sizes from disk and compares them with what was hashed.
    pub fn verify_on_disk(&self, expected_total: u64) -> Result<()> {
        let mut actual = 0;
        for file in &self.files {
            actual += std::fs::metadata(&file.absolute)
                .map_err(|e| Error::io(&file.absolute, e))?
                .len();
        }
        if actual != expected_total {
            return Err(Error::Integrity(format!(
                "content under {} is {actual} bytes, torrent declares {expected_total}",
                self.root.display()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SelectionRequest<'a> {
    pub content_path: &'a Path,
    pub mode: SelectionMode,
    /// Files the caller explicitly wants, used by `KeepFolder` and `Pack`
    pub listed_files: &'a [PathBuf],
    pub keep_nfo: bool,
    /// BASE torrents never carry NFOs
    pub is_base: bool,
}

impl<'a> SelectionRequest<'a> {
    pub fn new(content_path: &'a Path) -> Self {
        SelectionRequest {
            content_path,
            mode: SelectionMode::default(),
            listed_files: &[],
            keep_nfo: false,
            is_base: false,
        }
    }
}

fn glob_set(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| Error::InvalidInput(format!("bad glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::InvalidInput(format!("failed to build glob set: {e}")))
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| Error::InvalidInput(format!("{} has no utf-8 file name", path.display())))
}

fn relative_components(root: &Path, path: &Path) -> Result<Vec<String>> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| Error::InvalidInput(format!("{} is outside {}", path.display(), root.display())))?;
    relative
        .components()
        .map(|c| {
            c.as_os_str()
                .to_str()
                .map(str::to_owned)
                .ok_or_else(|| Error::InvalidInput(format!("{} is not valid utf-8", relative.display())))
        })
        .collect()
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Internal(anyhow::anyhow!("failed to walk {}: {e}", root.display())))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Blocking: walks the content directory.
pub fn select_files(request: &SelectionRequest<'_>) -> Result<Selection> {
    let content = request.content_path;
    let metadata = std::fs::metadata(content).map_err(|e| Error::io(content, e))?;

    if metadata.is_file() {
        return single(content, metadata.len());
    }

    let include_nfo = request.keep_nfo && !request.is_base;
    let nfo = glob_set(&[NFO_PATTERN])?;
    let all = walk_files(content)?;

    let chosen: Vec<PathBuf> = match request.mode {
        SelectionMode::Disc => all,
        SelectionMode::KeepFolder | SelectionMode::Pack if !request.listed_files.is_empty() => {
            let listed: HashSet<&Path> = request.listed_files.iter().map(PathBuf::as_path).collect();
            all.into_iter()
                .filter(|path| {
                    listed.contains(path.as_path())
                        || (include_nfo && nfo.is_match(path.file_name().unwrap_or_default()))
                })
                .collect()
        }
        SelectionMode::KeepFolder | SelectionMode::Pack => all,
        SelectionMode::Auto => {
            let videos = glob_set(&VIDEO_PATTERNS)?;
            let sample = glob_set(&[SAMPLE_PATTERN])?;
            let picked: Vec<PathBuf> = all
                .into_iter()
                .filter(|path| {
                    let name = path.file_name().unwrap_or_default().to_string_lossy().to_lowercase();
                    (videos.is_match(&name) && !sample.is_match(&name)) || (include_nfo && nfo.is_match(&name))
                })
                .collect();
            let video_count = picked
                .iter()
                .filter(|path| !nfo.is_match(path.file_name().unwrap_or_default()))
                .count();
            if video_count == 1 && !include_nfo {
                let video = &picked[0];
                let length = std::fs::metadata(video).map_err(|e| Error::io(video, e))?.len();
                return single(video, length);
            }
            picked
        }
    };

    if chosen.is_empty() {
        return Err(Error::InvalidInput(format!(
            "no files selected for hashing under {}",
            content.display()
        )));
    }

    let mut files = chosen
        .iter()
        .map(|path| {
            Ok(SelectedFile {
                relative: relative_components(content, path)?,
                length: std::fs::metadata(path).map_err(|e| Error::io(path, e))?.len(),
                absolute: path.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    files.sort_by(|a, b| a.relative.cmp(&b.relative));

    Ok(Selection {
        root: content.to_path_buf(),
        name: file_name_of(content)?,
        single_file: false,
        files,
    })
}

fn single(path: &Path, length: u64) -> Result<Selection> {
    let name = file_name_of(path)?;
    Ok(Selection {
        root: path.to_path_buf(),
        name: name.clone(),
        single_file: true,
        files: vec![SelectedFile {
            absolute: path.to_path_buf(),
            relative: vec![name],
            length,
        }],
    })
}

/// Comma-separated `--exclude` argument for the external tool.
///
/// Lists every file name not in `keep` that the side-file patterns don't already cover, sorted,
/// followed by the side-file patterns themselves.
pub fn external_exclude_list(root: &Path, keep: &[PathBuf]) -> Result<String> {
    let side_files = glob_set(&SIDE_FILE_PATTERNS)?;
    let keep: HashSet<&Path> = keep.iter().map(PathBuf::as_path).collect();

    let mut excluded: Vec<String> = Vec::new();
    if root.is_dir() {
        for path in walk_files(root)? {
            if keep.contains(path.as_path()) {
                continue;
            }
            let name = file_name_of(&path)?;
            if side_files.is_match(&name) {
                continue;
            }
            excluded.push(name);
        }
    }
    excluded.sort();
    excluded.dedup();
    excluded.extend(SIDE_FILE_PATTERNS.iter().map(|p| (*p).to_owned()));
    Ok(excluded.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str, len: usize) -> PathBuf {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().expect("no parent")).expect("failed to create dirs");
        std::fs::write(&path, vec![1u8; len]).expect("failed to write");
        path
    }

    #[test]
    fn lone_video_becomes_a_single_file_torrent() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let root = dir.path().join("Movie.2020");
        let video = touch(&root, "Movie.2020.mkv", 10);
        touch(&root, "movie-sample.mkv", 3);
        touch(&root, "Movie.2020.nfo", 1);

        let selection = select_files(&SelectionRequest::new(&root)).expect("failed to select");
        assert!(selection.single_file);
        assert_eq!(selection.root, video);
        assert_eq!(selection.name, "Movie.2020.mkv");
        assert_eq!(selection.total_length(), 10);
    }

    #[test]
    fn keep_nfo_adds_nfo_except_for_base() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let root = dir.path().join("Show.S01");
        touch(&root, "e02.mkv", 4);
        touch(&root, "e01.mkv", 4);
        touch(&root, "info.nfo", 1);
        touch(&root, "cover.jpg", 1);

        let with_nfo = select_files(&SelectionRequest {
            keep_nfo: true,
            ..SelectionRequest::new(&root)
        })
        .expect("failed to select");
        let names: Vec<_> = with_nfo.files.iter().map(|f| f.relative.join("/")).collect();
        assert_eq!(names, vec!["e01.mkv", "e02.mkv", "info.nfo"]);

        let base = select_files(&SelectionRequest {
            keep_nfo: true,
            is_base: true,
            ..SelectionRequest::new(&root)
        })
        .expect("failed to select");
        assert_eq!(base.files.len(), 2);
        assert!(!base.single_file);
    }

    #[test]
    fn pack_uses_listed_files_only() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let root = dir.path().join("Pack");
        let a = touch(&root, "a.mkv", 2);
        touch(&root, "b.mkv", 2);
        let c = touch(&root, "extras/c.mkv", 2);

        let selection = select_files(&SelectionRequest {
            mode: SelectionMode::Pack,
            listed_files: &[c, a],
            ..SelectionRequest::new(&root)
        })
        .expect("failed to select");
        let names: Vec<_> = selection.files.iter().map(|f| f.relative.join("/")).collect();
        assert_eq!(names, vec!["a.mkv", "extras/c.mkv"]);
        selection.verify_on_disk(4).expect("sizes should match");
        assert!(matches!(selection.verify_on_disk(5), Err(Error::Integrity(_))));
    }

    #[test]
    fn disc_mode_takes_everything() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let root = dir.path().join("DISC");
        touch(&root, "BDMV/index.bdmv", 1);
        touch(&root, "BDMV/STREAM/00000.m2ts", 5);
        let selection = select_files(&SelectionRequest {
            mode: SelectionMode::Disc,
            ..SelectionRequest::new(&root)
        })
        .expect("failed to select");
        assert_eq!(selection.files.len(), 2);
        assert_eq!(selection.name, "DISC");
    }

    #[test]
    fn exclude_list_for_the_external_tool() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let root = dir.path().join("Rel");
        let keep = touch(&root, "movie.mkv", 1);
        touch(&root, "sample.mkv", 1);
        touch(&root, "a.nfo", 1);
        touch(&root, "Proof/z.mkv", 1);

        let list = external_exclude_list(&root, &[keep]).expect("failed to build the exclude list");
        assert_eq!(
            list,
            "sample.mkv,z.mkv,*.nfo,*.jpg,*.png,*.srt,*.sub,*.vtt,*.ssa,*.ass,*.txt,*.xml"
        );
    }
}
