//! Translating local save paths into the paths a remote client sees.

use std::path::{Path, PathBuf};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::link::normalize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedPath {
    /// Forward slashes, trailing slash
    pub path: String,
    /// A local prefix was swapped for a remote one
    pub remapped: bool,
}

/// Pairs of local and remote path prefixes, matched in configuration order.
#[derive(Debug, Clone, Default)]
pub struct PathMap {
    pairs: Vec<(PathBuf, String)>,
}

fn lowercase(path: &Path) -> String {
    normalize(path).to_string_lossy().to_lowercase()
}

fn is_within(path: &Path, prefix: &Path) -> bool {
    PathBuf::from(lowercase(path)).starts_with(lowercase(prefix))
}

fn forward_slashes(path: &str) -> String {
    let mut path = path.replace('\\', "/");
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

impl PathMap {
    /// A local path without a remote counterpart at the same index maps to the first remote path.
    pub fn new(local_paths: &[PathBuf], remote_paths: &[String]) -> Result<Self> {
        if local_paths.is_empty() {
            return Ok(PathMap::default());
        }
        let Some(first_remote) = remote_paths.first() else {
            return Err(Error::Configuration("local_paths are set but remote_paths are empty".to_owned()));
        };
        let pairs = local_paths
            .iter()
            .enumerate()
            .map(|(i, local)| (normalize(local), remote_paths.get(i).unwrap_or(first_remote).clone()))
            .collect();
        Ok(PathMap { pairs })
    }

    pub fn for_client(config: &ClientConfig) -> Result<Self> {
        Self::new(&config.local_paths, &config.remote_paths)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The first pair whose local prefix contains `content_path`, ignoring case.
    fn select(&self, content_path: &Path) -> Option<&(PathBuf, String)> {
        self.pairs.iter().find(|(local, _)| is_within(content_path, local))
    }

    /// Maps `save_path` using the pair chosen for `content_path`.
    pub fn map(&self, content_path: &Path, save_path: &Path) -> MappedPath {
        let save_path = normalize(save_path);
        let unmapped = || MappedPath {
            path: forward_slashes(&save_path.to_string_lossy()),
            remapped: false,
        };

        let Some((local, remote)) = self.select(content_path) else {
            return unmapped();
        };
        if lowercase(local) == lowercase(Path::new(remote)) || !is_within(&save_path, local) {
            return unmapped();
        }

        let relative: Vec<String> = save_path
            .components()
            .skip(local.components().count())
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let mut mapped = remote.trim_end_matches(['/', '\\']).to_owned();
        for component in relative {
            mapped.push('/');
            mapped.push_str(&component);
        }
        MappedPath {
            path: forward_slashes(&mapped),
            remapped: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> PathMap {
        PathMap::new(
            &[PathBuf::from("/mnt/Media"), PathBuf::from("/srv/other/")],
            &["/data".to_owned()],
        )
        .expect("valid mapping")
    }

    #[test]
    fn swaps_the_first_matching_prefix() {
        let mapped = map().map(Path::new("/mnt/media/Movies/Film"), Path::new("/mnt/media/Movies"));
        assert_eq!(
            mapped,
            MappedPath {
                path: "/data/Movies/".to_owned(),
                remapped: true
            }
        );

        // missing remote entries fall back to the first one
        let mapped = map().map(Path::new("/srv/other/x"), Path::new("/srv/other/links/BLU"));
        assert_eq!(mapped.path, "/data/links/BLU/");
    }

    #[test]
    fn leaves_unrelated_paths_alone() {
        let mapped = map().map(Path::new("/home/user/Film"), Path::new("/home/user"));
        assert_eq!(
            mapped,
            MappedPath {
                path: "/home/user/".to_owned(),
                remapped: false
            }
        );
    }

    #[test]
    fn identical_prefixes_are_not_remapped() {
        let map = PathMap::new(&[PathBuf::from("/data")], &["/DATA".to_owned()]).expect("valid mapping");
        assert!(!map.map(Path::new("/data/x"), Path::new("/data")).remapped);
    }

    #[test]
    fn remote_paths_are_required_with_local_paths() {
        assert!(matches!(
            PathMap::new(&[PathBuf::from("/data")], &[]),
            Err(Error::Configuration(_))
        ));
        assert!(PathMap::new(&[], &[]).expect("empty is fine").is_empty());
    }
}
