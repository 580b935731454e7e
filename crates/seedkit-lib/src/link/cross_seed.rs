//! Recreating a foreign descriptor's file layout from local files that may be named or
//! arranged differently.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::{link_file, normalize, LinkMode, LinkPlan, Linker};
use crate::descriptor::TorrentDescriptor;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchQuality {
    NameAndSize,
    Name,
    Size,
    Fallback,
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    name: String,
    size: u64,
    used: bool,
}

/// Local files that could back the foreign descriptor: everything under the release
/// directory, or beside a lone file with that file first. Anything already under the
/// tracker root is ignored.
fn collect_candidates(content: &Path, tracker_root: &Path) -> Result<Vec<Candidate>> {
    let search_root = if content.is_dir() {
        content
    } else {
        content.parent().unwrap_or(content)
    };

    let mut candidates = Vec::new();
    for entry in WalkDir::new(search_root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(search_root).to_path_buf();
            Error::io(path, e.into())
        })?;
        if !entry.file_type().is_file() || entry.path().starts_with(tracker_root) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).map_err(|e| {
            let path = entry.path().to_path_buf();
            Error::io(path, e.into())
        })?;
        candidates.push(Candidate {
            path: entry.path().to_path_buf(),
            name: entry.file_name().to_string_lossy().to_lowercase(),
            size,
            used: false,
        });
    }
    if let Some(own) = candidates.iter().position(|c| c.path == content) {
        let own = candidates.remove(own);
        candidates.insert(0, own);
    }
    Ok(candidates)
}

/// Name and size, then name, then size, then whatever is left. A candidate is used once.
fn pick(candidates: &mut [Candidate], name: &str, size: u64) -> Option<(PathBuf, MatchQuality)> {
    let name = name.to_lowercase();
    let rules: [(MatchQuality, &dyn Fn(&Candidate) -> bool); 4] = [
        (MatchQuality::NameAndSize, &|c| c.name == name && c.size == size),
        (MatchQuality::Name, &|c| c.name == name),
        (MatchQuality::Size, &|c| c.size == size),
        (MatchQuality::Fallback, &|_| true),
    ];
    for (quality, matches) in rules {
        if let Some(candidate) = candidates.iter_mut().find(|c| !c.used && matches(c)) {
            candidate.used = true;
            return Some((candidate.path.clone(), quality));
        }
    }
    None
}

/// Links local content into `plan.tracker_root` so it matches `descriptor`'s layout.
pub(super) fn link_to_layout(
    descriptor: &TorrentDescriptor,
    content: &Path,
    mode: LinkMode,
    hardlink: Linker,
    plan: &mut LinkPlan,
) -> Result<()> {
    let tracker_root = normalize(&plan.tracker_root);
    let name = descriptor.name();
    if name.is_empty() {
        return Err(Error::Validation("cross-seed descriptor has no name".to_owned()));
    }
    let multi_file = descriptor.is_multi_file();
    let files = descriptor.files()?;
    let mut candidates = collect_candidates(content, &tracker_root)?;
    tracing::debug!(files = files.len(), candidates = candidates.len(), "matching cross-seed layout");

    for file in files {
        let destination = if multi_file {
            normalize(&tracker_root.join(name).join(file.relative_path()))
        } else {
            normalize(&tracker_root.join(name))
        };
        if !destination.starts_with(&tracker_root) || destination == tracker_root {
            return Err(Error::Validation(format!(
                "'{}' would land outside {}",
                destination.display(),
                tracker_root.display()
            )));
        }

        let (source, quality) = pick(&mut candidates, file.file_name(), file.length).ok_or_else(|| {
            Error::InvalidInput(format!("no local file left for '{}'", file.relative_path().display()))
        })?;
        if quality == MatchQuality::Fallback {
            tracing::warn!(
                wanted = %file.relative_path().display(),
                using = %source.display(),
                "no file matched by name or size, using the next unused one"
            );
        }
        plan.entries.push(link_file(&source, &destination, mode, hardlink));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::{multi_file, single_file};
    use crate::link::mounts::MountTable;
    use crate::link::{LinkEngine, LinkOutcome, LinkRequest};

    fn write(path: &Path, bytes: &[u8]) {
        std::fs::create_dir_all(path.parent().expect("path has a parent")).expect("failed to create dirs");
        std::fs::write(path, bytes).expect("failed to write");
    }

    fn candidate(name: &str, size: u64) -> Candidate {
        Candidate {
            path: PathBuf::from(format!("/data/{name}")),
            name: name.to_lowercase(),
            size,
            used: false,
        }
    }

    #[test]
    fn cascade_prefers_name_and_size() {
        let mut candidates = vec![
            candidate("Other.mkv", 100),
            candidate("Movie.mkv", 50),
            candidate("movie.mkv", 100),
            candidate("sample.mkv", 7),
        ];
        assert_eq!(
            pick(&mut candidates, "MOVIE.mkv", 100),
            Some((PathBuf::from("/data/movie.mkv"), MatchQuality::NameAndSize))
        );
        assert_eq!(
            pick(&mut candidates, "movie.mkv", 100),
            Some((PathBuf::from("/data/Movie.mkv"), MatchQuality::Name))
        );
        assert_eq!(
            pick(&mut candidates, "renamed.mkv", 100),
            Some((PathBuf::from("/data/Other.mkv"), MatchQuality::Size))
        );
        assert_eq!(
            pick(&mut candidates, "whatever.nfo", 1),
            Some((PathBuf::from("/data/sample.mkv"), MatchQuality::Fallback))
        );
        assert_eq!(pick(&mut candidates, "more.mkv", 1), None);
    }

    #[tokio::test]
    async fn rebuilds_a_renamed_layout() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let release = dir.path().join("data/Show.S01.1080p");
        write(&release.join("show.s01e01.mkv"), &[1u8; 300]);
        write(&release.join("show.s01e02.mkv"), &[2u8; 200]);
        let root = dir.path().join("links");

        let foreign = multi_file(
            "Show S01 1080p",
            32768,
            &[("Season 1/Show.S01E02.mkv", 200), ("Season 1/Show.S01E01.mkv", 300)],
        );
        let engine = LinkEngine::new(LinkMode::Hardlink, vec![root.clone()], false)
            .with_mounts(MountTable::parse("/dev/root / ext4 rw 0 0\n"));
        let request = LinkRequest {
            content_path: release.clone(),
            link_dir_name: "TL".to_owned(),
            cross_seed: Some(foreign),
        };
        let result = engine.link(&request).await.expect("failed to link");

        let layout = root.join("TL/Show S01 1080p/Season 1");
        assert_eq!(result.content_path, root.join("TL/Show S01 1080p"));
        assert_eq!(std::fs::read(layout.join("Show.S01E01.mkv")).expect("linked"), vec![1u8; 300]);
        assert_eq!(std::fs::read(layout.join("Show.S01E02.mkv")).expect("linked"), vec![2u8; 200]);

        let again = engine.link(&request).await.expect("failed to relink");
        let plan = again.plan.expect("plan recorded");
        assert_eq!(plan.entries.len(), 2);
        assert!(plan.entries.iter().all(|e| e.outcome == LinkOutcome::AlreadyPresent));
    }

    #[tokio::test]
    async fn single_file_lands_directly_below_the_root() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let content = dir.path().join("data/Movie.2020.mkv");
        write(&content, &[7u8; 64]);
        // same size and sorted ahead of the release
        write(&dir.path().join("data/Another.2019.mkv"), &[0u8; 64]);
        let root = dir.path().join("links");

        let engine = LinkEngine::new(LinkMode::Hardlink, vec![root.clone()], false)
            .with_mounts(MountTable::parse("/dev/root / ext4 rw 0 0\n"));
        let result = engine
            .link(&LinkRequest {
                content_path: content,
                link_dir_name: "BLU".to_owned(),
                cross_seed: Some(single_file("Movie (2020).mkv", 32768, 64)),
            })
            .await
            .expect("failed to link");
        assert_eq!(std::fs::read(root.join("BLU/Movie (2020).mkv")).expect("linked"), vec![7u8; 64]);
        assert_eq!(result.save_path(), root.join("BLU"));
    }

    #[tokio::test]
    async fn names_escaping_the_root_are_refused() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let content = dir.path().join("data/movie.mkv");
        write(&content, &[0u8; 8]);
        let root = dir.path().join("links");

        let engine = LinkEngine::new(LinkMode::Hardlink, vec![root.clone()], false)
            .with_mounts(MountTable::parse("/dev/root / ext4 rw 0 0\n"));
        let result = engine
            .link(&LinkRequest {
                content_path: content,
                link_dir_name: "BLU".to_owned(),
                cross_seed: Some(single_file("../../escape.mkv", 32768, 8)),
            })
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(!dir.path().join("escape.mkv").exists());
    }
}
