//! Finding a descriptor for a release in the clients that already seed it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::builder::{BuildRequest, TorrentBuilder};
use crate::canonical::{self, Canonicalizer, ReuseLimits};
use crate::client::{ClientCandidate, RemoteTorrent, TorrentClient, TrackerIds, Validity};
use crate::config::{HashingStrategy, SearchConfig};
use crate::descriptor::TorrentDescriptor;
use crate::error::{IoContext, Result};
use crate::piece_size::MIB;

/// A client to search plus where it keeps its `.torrent` copies.
#[derive(Clone)]
pub struct Backend {
    pub client: Arc<dyn TorrentClient>,
    /// `<storage_dir>/<hash>.torrent` (or `<HASH>.torrent`) is read instead of exporting through the API
    pub storage_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub release_name: String,
    /// Release on disk, every declared file is checked against it
    pub content_path: PathBuf,
    /// For single-file releases: the file name also counts as a name match
    pub file_name: Option<String>,
    /// Info-hashes tried before listing
    pub known_hashes: Vec<String>,
    pub user_max_mib: Option<u64>,
}

impl SearchRequest {
    pub fn new(release_name: impl Into<String>, content_path: impl Into<PathBuf>) -> Self {
        SearchRequest {
            release_name: release_name.into(),
            content_path: content_path.into(),
            file_name: None,
            known_hashes: Vec::new(),
            user_max_mib: None,
        }
    }

    fn matches(&self, torrent: &RemoteTorrent) -> bool {
        let name = torrent.name.to_lowercase();
        name == self.release_name.to_lowercase()
            || self.file_name.as_ref().is_some_and(|file| name == file.to_lowercase())
    }
}

/// A validated, reusable descriptor.
#[derive(Debug, Clone)]
pub struct ReuseMatch {
    pub client: String,
    pub hash: String,
    pub tracker_ids: TrackerIds,
    pub descriptor: TorrentDescriptor,
}

impl ReuseMatch {
    fn piece_length(&self) -> i64 {
        self.descriptor.piece_length()
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub reused: ReuseMatch,
    /// The BASE form written to the work directory
    pub base: TorrentDescriptor,
    pub base_path: PathBuf,
}

/// Where a prepared BASE descriptor came from.
#[derive(Debug, Clone)]
pub enum BaseOrigin {
    Reused {
        client: String,
        hash: String,
        tracker_ids: TrackerIds,
    },
    Built {
        strategy: HashingStrategy,
    },
}

#[derive(Debug, Clone)]
pub struct PreparedBase {
    pub base: TorrentDescriptor,
    pub path: PathBuf,
    pub origin: BaseOrigin,
}

pub struct SearchEngine {
    config: SearchConfig,
    work_dir: PathBuf,
    canonicalizer: Canonicalizer,
    backends: Vec<Backend>,
}

impl SearchEngine {
    pub fn new(config: SearchConfig, canonicalizer: Canonicalizer, backends: Vec<Backend>) -> Self {
        SearchEngine {
            config,
            work_dir: canonicalizer.work_dir().to_path_buf(),
            canonicalizer,
            backends,
        }
    }

    fn ceiling(&self) -> Option<i64> {
        self.config
            .preferred_max_piece_size_mib
            .and_then(|mib| mib.checked_mul(MIB))
            .and_then(|bytes| i64::try_from(bytes).ok())
    }

    /// Searches every backend in order and writes the winner's BASE form.
    ///
    /// Without a piece-size preference the first valid descriptor wins. With one, a descriptor
    /// within the ceiling wins immediately and stops the search; otherwise the smallest valid
    /// piece size seen is used.
    #[tracing::instrument(err, skip(self, request), fields(release = %request.release_name))]
    pub async fn search(&self, request: &SearchRequest) -> Result<Option<SearchOutcome>> {
        let ceiling = self.ceiling();
        let mut satisfied = false;
        let mut best: Option<ReuseMatch> = None;

        for backend in &self.backends {
            if satisfied {
                break;
            }
            let found = match self.search_backend(backend, request, ceiling, &mut satisfied).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(client = backend.client.name(), error = %e, "skipping client");
                    continue;
                }
            };
            let Some(found) = found else {
                continue;
            };
            if ceiling.is_none() {
                best = Some(found);
                break;
            }
            if best.as_ref().map_or(true, |b| found.piece_length() < b.piece_length()) {
                best = Some(found);
            }
        }

        let Some(reused) = best else {
            tracing::info!("no reusable torrent found");
            return Ok(None);
        };
        tracing::info!(client = %reused.client, hash = %reused.hash, ids = ?reused.tracker_ids, "reusing torrent");
        let base = self.canonicalizer.write_base(&reused.descriptor, None, false).await?;
        Ok(Some(SearchOutcome {
            reused,
            base,
            base_path: self.canonicalizer.base_path(),
        }))
    }

    async fn candidates(&self, client: &dyn TorrentClient, request: &SearchRequest) -> Result<Vec<ClientCandidate>> {
        let policy = self.config.retry_policy();
        let mut torrents: Vec<RemoteTorrent> = Vec::new();

        for hash in &request.known_hashes {
            let found = policy.run("torrent info", || client.torrent(hash)).await;
            match found {
                Ok(Some(torrent)) => torrents.push(torrent),
                Ok(None) => tracing::debug!(%hash, "known hash is not loaded in this client"),
                Err(e) => tracing::warn!(%hash, error = %e, "failed to look up known hash"),
            }
        }
        let known = torrents.len();

        let listed = self
            .config
            .list_retry_policy()
            .run("list torrents", || client.list(&request.release_name))
            .await?;
        torrents.extend(
            listed
                .into_iter()
                .filter(|t| request.matches(t) && !request.known_hashes.contains(&t.hash)),
        );

        let mut candidates = Vec::with_capacity(torrents.len());
        let mut known_candidates = 0;
        for (index, torrent) in torrents.into_iter().enumerate() {
            let report = policy.run("tracker report", || client.tracker_report(&torrent)).await;
            match report {
                Ok(report) => {
                    candidates.push(ClientCandidate::new(client.name(), torrent, &report));
                    if index < known {
                        known_candidates += 1;
                    }
                }
                Err(e) => tracing::warn!(hash = %torrent.hash, error = %e, "skipping candidate"),
            }
        }
        // known hashes keep their order, the rest is ranked
        candidates[known_candidates..].sort_by_key(ClientCandidate::sort_key);
        Ok(candidates)
    }

    async fn search_backend(
        &self,
        backend: &Backend,
        request: &SearchRequest,
        ceiling: Option<i64>,
        satisfied: &mut bool,
    ) -> Result<Option<ReuseMatch>> {
        let client = backend.client.as_ref();
        let candidates = self.candidates(client, request).await?;
        tracing::debug!(client = client.name(), count = candidates.len(), "matching torrents");

        let limits = ReuseLimits {
            user_max_mib: request.user_max_mib,
            prefer_small_pieces: ceiling.is_some(),
        };
        let mut best: Option<ReuseMatch> = None;

        for mut candidate in candidates {
            let descriptor = match self.evaluate(backend, &candidate, request, &limits).await {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    tracing::debug!(hash = candidate.hash(), error = %e, "candidate rejected");
                    candidate.validity = Validity::Rejected(e.to_string());
                    continue;
                }
            };
            candidate.validity = Validity::Valid;
            let found = ReuseMatch {
                client: client.name().to_owned(),
                hash: candidate.torrent.hash,
                tracker_ids: candidate.tracker_ids,
                descriptor,
            };

            let Some(ceiling) = ceiling else {
                return Ok(Some(found));
            };
            if found.piece_length() <= ceiling {
                *satisfied = true;
                return Ok(Some(found));
            }
            if best.as_ref().map_or(true, |b| found.piece_length() < b.piece_length()) {
                best = Some(found);
            }
        }
        Ok(best)
    }

    /// Loads a candidate's descriptor and checks it against disk and the reuse limits.
    async fn evaluate(
        &self,
        backend: &Backend,
        candidate: &ClientCandidate,
        request: &SearchRequest,
        limits: &ReuseLimits,
    ) -> Result<TorrentDescriptor> {
        let hash = candidate.hash();
        let (raw, exported) = match &backend.storage_dir {
            Some(dir) => (read_stored(dir, hash).await?, None),
            None => {
                let raw = self
                    .config
                    .retry_policy()
                    .run("export torrent", || backend.client.export(hash))
                    .await?;
                let path = self.work_dir.join(format!("{hash}.torrent"));
                tokio::fs::create_dir_all(&self.work_dir).await.at_path(&self.work_dir)?;
                tokio::fs::write(&path, &raw).await.at_path(&path)?;
                (raw, Some(path))
            }
        };

        let checked = TorrentDescriptor::from_bytes(&raw).and_then(|descriptor| {
            canonical::validate(&descriptor, Some(&request.content_path), self.config.skip_nfo)?;
            limits.check(&descriptor, raw.len() as u64)?;
            Ok(descriptor)
        });
        if checked.is_err() {
            if let Some(path) = exported {
                remove_quietly(&path).await;
            }
        }
        checked
    }

    /// Reuses a descriptor when one is found, otherwise hashes the content.
    pub async fn reuse_or_build(
        &self,
        builder: &TorrentBuilder,
        search: &SearchRequest,
        build: &BuildRequest,
    ) -> Result<PreparedBase> {
        match self.search(search).await {
            Ok(Some(outcome)) => {
                return Ok(PreparedBase {
                    base: outcome.base,
                    path: outcome.base_path,
                    origin: BaseOrigin::Reused {
                        client: outcome.reused.client,
                        hash: outcome.reused.hash,
                        tracker_ids: outcome.reused.tracker_ids,
                    },
                })
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "search failed, hashing instead"),
        }

        let outcome = builder.build(build).await?;
        Ok(PreparedBase {
            base: outcome.descriptor,
            path: outcome.path,
            origin: BaseOrigin::Built {
                strategy: outcome.strategy,
            },
        })
    }
}

/// qBittorrent names stored copies by the lowercase hash, rTorrent by the uppercase one.
async fn read_stored(dir: &Path, hash: &str) -> Result<Vec<u8>> {
    let path = dir.join(format!("{hash}.torrent"));
    match tokio::fs::read(&path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let upper = dir.join(format!("{}.torrent", hash.to_uppercase()));
            tokio::fs::read(&upper).await.at_path(upper)
        }
        other => other.at_path(path),
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!(path = %path.display(), error = %e, "failed to remove rejected torrent");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::tests::{working_report, FakeClient};
    use crate::config::{HashingConfig, SearchConfig};
    use crate::descriptor::tests::multi_file;
    use crate::guard::HashingGuard;

    struct Fixture {
        content: tempfile::TempDir,
        work: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let fixture = Fixture {
                content: tempfile::tempdir().expect("failed to create a temp dir"),
                work: tempfile::tempdir().expect("failed to create a temp dir"),
            };
            let release = fixture.release();
            std::fs::create_dir_all(&release).expect("failed to create the release");
            std::fs::write(release.join("a.mkv"), vec![1u8; 1000]).expect("failed to write");
            fixture
        }

        fn release(&self) -> PathBuf {
            self.content.path().join("Release")
        }

        fn engine(&self, preferred_max_piece_size_mib: Option<u64>, backends: Vec<Backend>) -> SearchEngine {
            let config = SearchConfig {
                preferred_max_piece_size_mib,
                initial_timeout: Duration::from_secs(1),
                list_timeout: Duration::from_secs(1),
                retry_pause: Duration::from_millis(1),
                ..SearchConfig::default()
            };
            SearchEngine::new(config, Canonicalizer::new(self.work.path(), "seedkit"), backends)
        }

        fn request(&self) -> SearchRequest {
            SearchRequest::new("release", self.release())
        }
    }

    fn torrent(hash: &str, name: &str) -> RemoteTorrent {
        RemoteTorrent {
            hash: hash.to_owned(),
            name: name.to_owned(),
            ..RemoteTorrent::default()
        }
    }

    fn backend(client: FakeClient) -> Backend {
        Backend {
            client: Arc::new(client),
            storage_dir: None,
        }
    }

    fn encoded(piece_length: u64, files: &[(&str, u64)]) -> Vec<u8> {
        multi_file("Release", piece_length, files).to_bytes().expect("failed to encode")
    }

    #[tokio::test]
    async fn first_valid_candidate_wins_without_preference() {
        let fixture = Fixture::new();
        let client = FakeClient::named("qb")
            .with_torrent(
                torrent("bad", "Release"),
                working_report("https://aither.cc/announce", "https://aither.cc/torrents/1"),
                encoded(64 * 1024, &[("a.mkv", 1000), ("missing.mkv", 5)]),
            )
            .with_torrent(
                torrent("good", "Release"),
                working_report("https://blutopia.cc/announce", "https://blutopia.cc/torrents/2"),
                encoded(64 * 1024, &[("a.mkv", 1000)]),
            )
            .with_torrent(torrent("other", "Other"), working_report("https://x", ""), Vec::new());

        let engine = fixture.engine(None, vec![backend(client)]);
        let outcome = engine
            .search(&fixture.request())
            .await
            .expect("search failed")
            .expect("should find a torrent");

        assert_eq!(outcome.reused.hash, "good");
        assert_eq!(outcome.reused.tracker_ids.get("blu"), Some(&2));
        assert_eq!(outcome.base_path, fixture.work.path().join("BASE.torrent"));
        assert_eq!(outcome.base.source(), Some("seedkit"));
        // rejected exports are cleaned up, valid ones stay
        assert!(!fixture.work.path().join("bad.torrent").exists());
        assert!(fixture.work.path().join("good.torrent").exists());
    }

    #[tokio::test]
    async fn preference_keeps_smallest_or_stops_early() {
        let fixture = Fixture::new();
        let big = FakeClient::named("big").with_torrent(
            torrent("four", "Release"),
            working_report("https://x", ""),
            encoded(4 * MIB, &[("a.mkv", 1000)]),
        );
        let medium = FakeClient::named("medium").with_torrent(
            torrent("two", "Release"),
            working_report("https://x", ""),
            encoded(2 * MIB, &[("a.mkv", 1000)]),
        );
        let engine = fixture.engine(Some(1), vec![backend(big), backend(medium)]);
        let outcome = engine
            .search(&fixture.request())
            .await
            .expect("search failed")
            .expect("should find a torrent");
        assert_eq!(outcome.reused.hash, "two");

        let small = FakeClient::named("small").with_torrent(
            torrent("one", "Release"),
            working_report("https://x", ""),
            encoded(MIB, &[("a.mkv", 1000)]),
        );
        let never = FakeClient::named("never").with_torrent(
            torrent("half", "Release"),
            working_report("https://x", ""),
            encoded(512 * 1024, &[("a.mkv", 1000)]),
        );
        let engine = fixture.engine(Some(1), vec![backend(small), backend(never)]);
        let outcome = engine
            .search(&fixture.request())
            .await
            .expect("search failed")
            .expect("should find a torrent");
        assert_eq!(outcome.reused.hash, "one");
    }

    #[tokio::test]
    async fn oversized_preference_is_treated_as_none() {
        let fixture = Fixture::new();
        let client = FakeClient::named("qb").with_torrent(
            torrent("only", "Release"),
            working_report("https://x", ""),
            encoded(4 * MIB, &[("a.mkv", 1000)]),
        );
        let engine = fixture.engine(Some(u64::MAX), vec![backend(client)]);
        let outcome = engine
            .search(&fixture.request())
            .await
            .expect("search failed")
            .expect("should find a torrent");
        assert_eq!(outcome.reused.hash, "only");
    }

    #[tokio::test]
    async fn failing_clients_are_skipped() {
        let fixture = Fixture::new();
        let broken = FakeClient {
            fail_list: true,
            ..FakeClient::named("broken")
        };
        let working = FakeClient::named("working").with_torrent(
            torrent("ok", "RELEASE"),
            working_report("https://x", ""),
            encoded(64 * 1024, &[("a.mkv", 1000)]),
        );
        let engine = fixture.engine(None, vec![backend(broken), backend(working)]);
        let outcome = engine
            .search(&fixture.request())
            .await
            .expect("search failed")
            .expect("should find a torrent");
        assert_eq!(outcome.reused.client, "working");
    }

    #[tokio::test]
    async fn known_hashes_are_tried_first() {
        let fixture = Fixture::new();
        let client = FakeClient::named("qb")
            .with_torrent(
                torrent("listed", "Release"),
                working_report("https://aither.cc/announce", "https://aither.cc/torrents/1"),
                encoded(64 * 1024, &[("a.mkv", 1000)]),
            )
            .with_torrent(
                torrent("known", "renamed in client"),
                working_report("https://x", ""),
                encoded(64 * 1024, &[("a.mkv", 1000)]),
            );
        let engine = fixture.engine(None, vec![backend(client)]);
        let request = SearchRequest {
            known_hashes: vec!["known".to_owned()],
            ..fixture.request()
        };
        let outcome = engine
            .search(&request)
            .await
            .expect("search failed")
            .expect("should find a torrent");
        assert_eq!(outcome.reused.hash, "known");
    }

    #[tokio::test]
    async fn storage_dir_misses_are_skipped() {
        let fixture = Fixture::new();
        let storage = tempfile::tempdir().expect("failed to create a temp dir");
        std::fs::write(storage.path().join("stored.torrent"), encoded(64 * 1024, &[("a.mkv", 1000)]))
            .expect("failed to write");
        let client = FakeClient::named("qb")
            .with_torrent(torrent("absent", "Release"), working_report("https://aither.cc/a", "https://aither.cc/torrents/1"), Vec::new())
            .with_torrent(torrent("stored", "Release"), working_report("https://x", ""), Vec::new());
        let engine = fixture.engine(
            None,
            vec![Backend {
                client: Arc::new(client),
                storage_dir: Some(storage.path().to_path_buf()),
            }],
        );
        let outcome = engine
            .search(&fixture.request())
            .await
            .expect("search failed")
            .expect("should find a torrent");
        assert_eq!(outcome.reused.hash, "stored");
    }

    #[tokio::test]
    async fn uppercase_stored_copies_are_found() {
        let fixture = Fixture::new();
        let storage = tempfile::tempdir().expect("failed to create a temp dir");
        std::fs::write(storage.path().join("ABCDEF.torrent"), encoded(64 * 1024, &[("a.mkv", 1000)]))
            .expect("failed to write");
        let client = FakeClient::named("rt").with_torrent(torrent("abcdef", "Release"), working_report("https://x", ""), Vec::new());
        let engine = fixture.engine(
            None,
            vec![Backend {
                client: Arc::new(client),
                storage_dir: Some(storage.path().to_path_buf()),
            }],
        );
        let outcome = engine
            .search(&fixture.request())
            .await
            .expect("search failed")
            .expect("should find a torrent");
        assert_eq!(outcome.reused.hash, "abcdef");
    }

    #[tokio::test]
    async fn falls_through_to_the_builder() {
        let fixture = Fixture::new();
        let client = FakeClient::named("qb").with_torrent(
            torrent("stale", "Release"),
            working_report("https://x", ""),
            encoded(64 * 1024, &[("a.mkv", 1000), ("gone.mkv", 10)]),
        );
        let engine = fixture.engine(None, vec![backend(client)]);
        let hashing = HashingConfig {
            strategy: HashingStrategy::InProcess,
            ..HashingConfig::default()
        };
        let builder = TorrentBuilder::new(hashing, fixture.work.path(), HashingGuard::new())
            .with_progress(Arc::new(|_: &crate::builder::HashProgress| {}));

        let prepared = engine
            .reuse_or_build(&builder, &fixture.request(), &BuildRequest::base(fixture.release()))
            .await
            .expect("should build instead");
        assert!(matches!(
            prepared.origin,
            BaseOrigin::Built {
                strategy: HashingStrategy::InProcess
            }
        ));
        assert_eq!(prepared.base.total_length().expect("bad layout"), 1000);
        assert!(prepared.path.is_file());
    }
}
