//! Hardlink and symlink trees that let the same content be seeded from a per-tracker directory.

pub mod cross_seed;
pub mod mounts;

use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use walkdir::WalkDir;

use crate::config::ClientConfig;
use crate::descriptor::TorrentDescriptor;
use crate::error::{Error, IoContext, Result};
use crate::run_blocking;
use mounts::{resolve_root, MountTable};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    #[default]
    None,
    Hardlink,
    Symlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Hardlink,
    Symlink,
    /// Hardlinking failed and the bytes were copied instead
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Created,
    AlreadyPresent,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub kind: LinkKind,
    pub outcome: LinkOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPlan {
    pub tracker_root: PathBuf,
    pub entries: Vec<LinkEntry>,
}

impl LinkPlan {
    fn new(tracker_root: PathBuf) -> Self {
        LinkPlan {
            tracker_root,
            entries: Vec::new(),
        }
    }

    pub fn first_failure(&self) -> Option<&LinkEntry> {
        self.entries
            .iter()
            .find(|entry| matches!(entry.outcome, LinkOutcome::Failed(_)))
    }

    fn into_result(self) -> Result<Self> {
        if let Some(entry) = self.first_failure() {
            if let LinkOutcome::Failed(reason) = &entry.outcome {
                return Err(Error::io(&entry.destination, io::Error::other(reason.clone())));
            }
        }
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub content_path: PathBuf,
    /// Subdirectory below the link root, see [`crate::config::Config::link_dir_name`]
    pub link_dir_name: String,
    /// Lay the content out to match this foreign descriptor instead of linking it as-is
    pub cross_seed: Option<TorrentDescriptor>,
}

#[derive(Debug, Clone)]
pub struct LinkResult {
    /// Where the client should find the content
    pub content_path: PathBuf,
    /// Set when links were made
    pub tracker_root: Option<PathBuf>,
    pub plan: Option<LinkPlan>,
}

impl LinkResult {
    fn unlinked(content_path: &Path) -> Self {
        LinkResult {
            content_path: content_path.to_path_buf(),
            tracker_root: None,
            plan: None,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.tracker_root.is_some()
    }

    /// The directory the client should save into: the tracker root when linked, otherwise
    /// the content's parent.
    pub fn save_path(&self) -> PathBuf {
        if let Some(root) = &self.tracker_root {
            return root.clone();
        }
        self.content_path
            .parent()
            .map_or_else(|| self.content_path.clone(), Path::to_path_buf)
    }
}

type Linker = fn(&Path, &Path) -> io::Result<()>;

#[cfg(unix)]
fn symlink(source: &Path, destination: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, destination)
}

#[cfg(windows)]
fn symlink(source: &Path, destination: &Path) -> io::Result<()> {
    if source.is_dir() {
        std::os::windows::fs::symlink_dir(source, destination)
    } else {
        std::os::windows::fs::symlink_file(source, destination)
    }
}

/// Resolves `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                // `..` at the root stays at the root
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => normalized.push(component),
            },
            other => normalized.push(other),
        }
    }
    normalized
}

fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// Links one file, falling back to a byte copy when a hardlink can't be made.
fn link_file(source: &Path, destination: &Path, mode: LinkMode, hardlink: Linker) -> LinkEntry {
    let intended = match mode {
        LinkMode::Symlink => LinkKind::Symlink,
        _ => LinkKind::Hardlink,
    };
    let entry = |kind, outcome| LinkEntry {
        source: source.to_path_buf(),
        destination: destination.to_path_buf(),
        kind,
        outcome,
    };

    if exists(destination) {
        return entry(intended, LinkOutcome::AlreadyPresent);
    }
    if let Some(parent) = destination.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return entry(intended, LinkOutcome::Failed(format!("creating {}: {e}", parent.display())));
        }
    }

    match intended {
        LinkKind::Symlink => match symlink(source, destination) {
            Ok(()) => entry(LinkKind::Symlink, LinkOutcome::Created),
            Err(e) => entry(LinkKind::Symlink, LinkOutcome::Failed(e.to_string())),
        },
        _ => match hardlink(source, destination) {
            Ok(()) => entry(LinkKind::Hardlink, LinkOutcome::Created),
            Err(link_error) => {
                tracing::debug!(source = %source.display(), error = %link_error, "hardlink failed, copying");
                match std::fs::copy(source, destination) {
                    Ok(_) => entry(LinkKind::Copy, LinkOutcome::Created),
                    Err(e) => entry(
                        LinkKind::Copy,
                        LinkOutcome::Failed(format!("hardlink failed ({link_error}), copy failed ({e})")),
                    ),
                }
            }
        },
    }
}

/// Links `source` to `destination`. Directories are recreated file by file for hardlinks and
/// linked as a whole for symlinks.
fn link_tree(source: &Path, destination: &Path, mode: LinkMode, hardlink: Linker, plan: &mut LinkPlan) -> Result<()> {
    if mode == LinkMode::Symlink || !source.is_dir() {
        plan.entries.push(link_file(source, destination, mode, hardlink));
        return Ok(());
    }

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            Error::io(path, e.into())
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::Internal(anyhow::anyhow!("walked outside the source: {e}")))?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).at_path(&target)?;
        } else {
            plan.entries.push(link_file(entry.path(), &target, mode, hardlink));
        }
    }
    Ok(())
}

/// Turns a content path into links below a per-tracker directory of a configured root.
#[derive(Debug, Clone)]
pub struct LinkEngine {
    mode: LinkMode,
    roots: Vec<PathBuf>,
    allow_fallback: bool,
    mounts: MountTable,
    hardlink: Linker,
}

impl LinkEngine {
    pub fn new(mode: LinkMode, roots: Vec<PathBuf>, allow_fallback: bool) -> Self {
        LinkEngine {
            mode,
            roots,
            allow_fallback,
            mounts: MountTable::default(),
            hardlink: |source, destination| std::fs::hard_link(source, destination),
        }
    }

    /// Engine for a client's linking settings, using the system mount table.
    pub fn for_client(config: &ClientConfig) -> Self {
        Self::new(config.linking, config.linked_folders.clone(), config.allow_fallback).with_mounts(MountTable::load())
    }

    pub fn with_mounts(mut self, mounts: MountTable) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    /// Links the request's content. With `allow_fallback` any failure yields the unlinked path.
    #[tracing::instrument(err, skip(self, request), fields(content = %request.content_path.display()))]
    pub async fn link(&self, request: &LinkRequest) -> Result<LinkResult> {
        if self.mode == LinkMode::None {
            return Ok(LinkResult::unlinked(&request.content_path));
        }

        let engine = self.clone();
        let owned = request.clone();
        match run_blocking(move || engine.link_blocking(&owned)).await {
            Ok(result) => Ok(result),
            Err(e) if self.allow_fallback => {
                tracing::warn!(error = %e, "linking failed, using the original path");
                Ok(LinkResult::unlinked(&request.content_path))
            }
            Err(e) => Err(e),
        }
    }

    fn link_blocking(&self, request: &LinkRequest) -> Result<LinkResult> {
        let source = std::path::absolute(&request.content_path).at_path(&request.content_path)?;
        if !exists(&source) {
            return Err(Error::InvalidInput(format!("{} does not exist", source.display())));
        }
        let root = resolve_root(&source, &self.roots, self.mode, &self.mounts)?;
        let tracker_root = root.join(&request.link_dir_name);
        std::fs::create_dir_all(&tracker_root).at_path(&tracker_root)?;

        let mut plan = LinkPlan::new(tracker_root.clone());
        let content_path = match &request.cross_seed {
            Some(descriptor) => {
                cross_seed::link_to_layout(descriptor, &source, self.mode, self.hardlink, &mut plan)?;
                tracker_root.join(descriptor.name())
            }
            None => {
                let name = source
                    .file_name()
                    .ok_or_else(|| Error::InvalidInput(format!("{} has no file name", source.display())))?;
                let destination = tracker_root.join(name);
                link_tree(&source, &destination, self.mode, self.hardlink, &mut plan)?;
                destination
            }
        };

        let plan = plan.into_result()?;
        let created = plan
            .entries
            .iter()
            .filter(|entry| entry.outcome == LinkOutcome::Created)
            .count();
        tracing::info!(root = %tracker_root.display(), created, total = plan.entries.len(), "linked content");
        Ok(LinkResult {
            content_path,
            tracker_root: Some(tracker_root),
            plan: Some(plan),
        })
    }
}
