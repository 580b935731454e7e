//! Fresh descriptors for content nobody is seeding yet.

pub mod external;
pub mod hashing;
pub mod progress;
pub mod selection;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::canonical::{BASE_NAME, CANONICAL_COMMENT, CANONICAL_CREATOR, PLACEHOLDER_ANNOUNCE};
use crate::config::{HashingConfig, HashingStrategy};
use crate::descriptor::{DescriptorParts, FileEntry, FileLayout, TorrentDescriptor};
use crate::error::Result;
use crate::guard::HashingGuard;
use crate::piece_size::{self, PieceSizePlan, PieceSizeRequest};
use crate::run_blocking;

pub use progress::{log_progress, HashProgress, ProgressSink};
pub use selection::{Selection, SelectionMode};

/// What to hash and how the result should look.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub content_path: PathBuf,
    /// File stem of the output, `BASE` for canonical builds
    pub output_name: String,
    pub mode: SelectionMode,
    pub listed_files: Vec<PathBuf>,
    pub keep_nfo: bool,
    /// Trackers the result is headed to, used for piece-size caps
    pub trackers: Vec<String>,
    /// Announce URL to embed instead of the placeholder
    pub tracker_url: Option<String>,
    /// Add a random `entropy` key so the info-hash differs from any other build
    pub entropy: bool,
    /// Overrides the configured maximum piece size
    pub user_max_mib: Option<u64>,
}

impl BuildRequest {
    pub fn base(content_path: impl Into<PathBuf>) -> Self {
        BuildRequest {
            content_path: content_path.into(),
            output_name: BASE_NAME.to_owned(),
            mode: SelectionMode::default(),
            listed_files: Vec::new(),
            keep_nfo: false,
            trackers: Vec::new(),
            tracker_url: None,
            entropy: false,
            user_max_mib: None,
        }
    }

    pub fn is_base(&self) -> bool {
        self.output_name == BASE_NAME
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub path: PathBuf,
    pub descriptor: TorrentDescriptor,
    pub plan: PieceSizePlan,
    /// Strategy that actually produced the descriptor
    pub strategy: HashingStrategy,
}

#[derive(Clone)]
pub struct TorrentBuilder {
    hashing: HashingConfig,
    work_dir: PathBuf,
    guard: HashingGuard,
    progress: ProgressSink,
}

impl TorrentBuilder {
    pub fn new(hashing: HashingConfig, work_dir: impl Into<PathBuf>, guard: HashingGuard) -> Self {
        TorrentBuilder {
            hashing,
            work_dir: work_dir.into(),
            guard,
            progress: log_progress(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn guard(&self) -> &HashingGuard {
        &self.guard
    }

    /// Hashes the selected content and writes `<work_dir>/<output_name>.torrent`.
    ///
    /// Waits for the process-wide hashing permit first. The external tool is preferred when
    /// configured; any failure there falls back to hashing in-process.
    #[tracing::instrument(err, skip(self, request), fields(content = %request.content_path.display()))]
    pub async fn build(&self, request: &BuildRequest) -> Result<BuildOutcome> {
        let _permit = self.guard.acquire().await?;

        let selection = {
            let content_path = request.content_path.clone();
            let listed_files = request.listed_files.clone();
            let (mode, keep_nfo, is_base) = (request.mode, request.keep_nfo, request.is_base());
            run_blocking(move || {
                selection::select_files(&selection::SelectionRequest {
                    content_path: &content_path,
                    mode,
                    listed_files: &listed_files,
                    keep_nfo,
                    is_base,
                })
            })
            .await?
        };

        let plan = piece_size::plan(&PieceSizeRequest {
            total_size: selection.total_length(),
            user_max_mib: request.user_max_mib.or(self.hashing.max_piece_size_mib),
            trackers: &request.trackers,
            capped_trackers: &self.hashing.capped_trackers,
        })?;
        tracing::info!(
            files = selection.files.len(),
            total = plan.total_size,
            piece_size = plan.piece_size,
            pieces = plan.piece_count(),
            constraint = ?plan.constraint,
            "planned piece size"
        );

        let output = self.work_dir.join(format!("{}.torrent", request.output_name));
        // the external tool can't be told to keep NFOs
        let nfo_forced = request.keep_nfo && !request.is_base();

        if self.hashing.strategy == HashingStrategy::External && !nfo_forced {
            match self.build_external(request, &selection, &plan, &output).await {
                Ok(descriptor) => {
                    return Ok(BuildOutcome {
                        path: output,
                        descriptor,
                        plan,
                        strategy: HashingStrategy::External,
                    })
                }
                Err(e) => tracing::warn!(error = %e, "external hashing failed, falling back to in-process hashing"),
            }
        }

        let descriptor = self.build_in_process(request, selection, &plan, &output).await?;
        Ok(BuildOutcome {
            path: output,
            descriptor,
            plan,
            strategy: HashingStrategy::InProcess,
        })
    }

    async fn build_external(
        &self,
        request: &BuildRequest,
        selection: &Selection,
        plan: &PieceSizePlan,
        output: &Path,
    ) -> Result<TorrentDescriptor> {
        let binary = external::resolve_binary(&self.hashing.tools_dir)?;

        let exclude = if request.mode == SelectionMode::Disc || selection.single_file {
            None
        } else {
            let root = selection.root.clone();
            let keep: Vec<PathBuf> = selection.files.iter().map(|f| f.absolute.clone()).collect();
            Some(run_blocking(move || selection::external_exclude_list(&root, &keep)).await?)
        };

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| crate::Error::io(parent, e))?;
        }

        let invocation = external::ExternalInvocation {
            content: selection.root.clone(),
            output: output.to_path_buf(),
            tracker_url: request.tracker_url.clone(),
            entropy: request.entropy,
            piece_size: plan.piece_size,
            workers: self.hashing.workers,
            exclude,
        };
        external::run(&binary, &invocation, &self.progress).await?;
        TorrentDescriptor::load(output).await
    }

    async fn build_in_process(
        &self,
        request: &BuildRequest,
        selection: Selection,
        plan: &PieceSizePlan,
        output: &Path,
    ) -> Result<TorrentDescriptor> {
        let piece_size = plan.piece_size;
        let progress = self.progress.clone();
        let (selection, pieces) = run_blocking(move || {
            let pieces = hashing::hash_files(&selection.files, piece_size, &progress)?;
            Ok((selection, pieces))
        })
        .await?;

        let layout = if selection.single_file {
            FileLayout::Single {
                length: selection.total_length(),
            }
        } else {
            FileLayout::Multi {
                files: selection
                    .files
                    .iter()
                    .map(|f| FileEntry {
                        path: f.relative.clone(),
                        length: f.length,
                    })
                    .collect(),
            }
        };

        let creation_date = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .and_then(|d| i64::try_from(d.as_secs()).ok());

        let mut descriptor = TorrentDescriptor::from_parts(DescriptorParts {
            name: selection.name.clone(),
            piece_length: piece_size,
            pieces,
            layout,
            private: true,
            source: Some(self.hashing.source.clone()),
            announce: request
                .tracker_url
                .clone()
                .unwrap_or_else(|| PLACEHOLDER_ANNOUNCE.to_owned()),
            comment: Some(CANONICAL_COMMENT.to_owned()),
            created_by: Some(CANONICAL_CREATOR.to_owned()),
            creation_date,
        })?;
        if request.entropy {
            let entropy: i64 = rand::thread_rng().gen_range(0..i64::from(u32::MAX));
            descriptor.info_mut().insert(crate::canonical::ENTROPY.into(), entropy.into());
        }
        descriptor.save(output).await?;

        let expected = descriptor.total_length()?;
        run_blocking(move || selection.verify_on_disk(expected)).await?;

        tracing::info!(path = %output.display(), info_hash = %descriptor.info_hash_hex()?, "wrote torrent");
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::piece_size::KIB;

    fn builder(work_dir: &Path) -> TorrentBuilder {
        let hashing = HashingConfig {
            strategy: HashingStrategy::InProcess,
            ..HashingConfig::default()
        };
        TorrentBuilder::new(hashing, work_dir, HashingGuard::new()).with_progress(Arc::new(|_: &HashProgress| {}))
    }

    fn write(path: &Path, len: usize) {
        std::fs::create_dir_all(path.parent().expect("path has a parent")).expect("failed to create dirs");
        std::fs::write(path, vec![7u8; len]).expect("failed to write");
    }

    #[tokio::test]
    async fn builds_a_multi_file_base_in_process() {
        let content = tempfile::tempdir().expect("failed to create a temp dir");
        let work = tempfile::tempdir().expect("failed to create a temp dir");
        let release = content.path().join("Show.S01");
        write(&release.join("E01.mkv"), 50_000);
        write(&release.join("E02.mkv"), 30_000);
        write(&release.join("E02.nfo"), 10);
        write(&release.join("sample.mkv"), 999);

        let outcome = builder(work.path())
            .build(&BuildRequest::base(&release))
            .await
            .expect("failed to build");

        assert_eq!(outcome.strategy, HashingStrategy::InProcess);
        assert_eq!(outcome.path, work.path().join("BASE.torrent"));
        assert!(outcome.path.is_file());
        let descriptor = outcome.descriptor;
        assert_eq!(descriptor.name(), "Show.S01");
        assert_eq!(descriptor.piece_length(), 32 * KIB as i64);
        assert_eq!(descriptor.total_length().expect("bad layout"), 80_000);
        assert_eq!(descriptor.piece_count(), 3);
        assert!(descriptor.private());
        assert_eq!(descriptor.source(), Some("seedkit"));
        assert_eq!(descriptor.announce(), Some(PLACEHOLDER_ANNOUNCE));

        let reloaded = TorrentDescriptor::load(&outcome.path).await.expect("failed to reload");
        assert_eq!(reloaded.info_hash().expect("hash"), descriptor.info_hash().expect("hash"));
    }

    #[tokio::test]
    async fn lone_video_becomes_single_file() {
        let content = tempfile::tempdir().expect("failed to create a temp dir");
        let work = tempfile::tempdir().expect("failed to create a temp dir");
        let release = content.path().join("Movie.2020");
        write(&release.join("Movie.2020.mkv"), 1000);
        write(&release.join("Movie.2020.nfo"), 10);

        let outcome = builder(work.path())
            .build(&BuildRequest::base(&release))
            .await
            .expect("failed to build");
        assert!(!outcome.descriptor.is_multi_file());
        assert_eq!(outcome.descriptor.name(), "Movie.2020.mkv");
    }

    #[tokio::test]
    async fn entropy_changes_the_info_hash() {
        let content = tempfile::tempdir().expect("failed to create a temp dir");
        let work = tempfile::tempdir().expect("failed to create a temp dir");
        let file = content.path().join("clip.mkv");
        write(&file, 4096);

        let builder = builder(work.path());
        let plain = builder.build(&BuildRequest::base(&file)).await.expect("failed to build");
        let random = builder
            .build(&BuildRequest {
                output_name: "[RAND-1]clip".to_owned(),
                entropy: true,
                ..BuildRequest::base(&file)
            })
            .await
            .expect("failed to build");
        assert_ne!(
            plain.descriptor.info_hash().expect("hash"),
            random.descriptor.info_hash().expect("hash")
        );
        assert_eq!(builder.guard().in_flight(), 0);
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let content = tempfile::tempdir().expect("failed to create a temp dir");
        let work = tempfile::tempdir().expect("failed to create a temp dir");
        let release = content.path().join("Empty");
        write(&release.join("notes.txt"), 5);

        let err = builder(work.path())
            .build(&BuildRequest::base(&release))
            .await
            .expect_err("nothing to hash");
        assert!(matches!(err, crate::Error::InvalidInput(_)));
    }
}
