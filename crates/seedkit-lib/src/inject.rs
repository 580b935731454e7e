//! Handing a finished descriptor to a client so it starts seeding the local content.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::client::{AddOptions, TorrentClient};
use crate::config::{ClientConfig, Config};
use crate::descriptor::TorrentDescriptor;
use crate::error::{Error, IoContext, Result};
use crate::link::{LinkEngine, LinkRequest, LinkResult};
use crate::path_map::{MappedPath, PathMap};
use crate::resume::{write_resume_file, TransientCopy};
use crate::retry::RetryPolicy;

const PRESENCE_POLLS: u32 = 30;
const PRESENCE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct InjectRequest {
    pub descriptor_path: PathBuf,
    pub content_path: PathBuf,
    /// Short tracker name, e.g. `BLU`
    pub tracker: String,
    pub link_dir_name: String,
    /// Seeding someone else's descriptor: added paused and laid out to match it
    pub cross_seed: bool,
    /// Overrides the client's configured category
    pub category: Option<String>,
    /// Overrides the client's configured tag
    pub tag: Option<String>,
}

impl InjectRequest {
    pub fn new(config: &Config, descriptor_path: impl Into<PathBuf>, content_path: impl Into<PathBuf>, tracker: &str) -> Self {
        InjectRequest {
            descriptor_path: descriptor_path.into(),
            content_path: content_path.into(),
            tracker: tracker.to_owned(),
            link_dir_name: config.link_dir_name(tracker).to_owned(),
            cross_seed: false,
            category: None,
            tag: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InjectOutcome {
    pub hash: String,
    pub save_path: MappedPath,
    pub link: LinkResult,
}

/// A single-file descriptor built from a directory holding one file names that file.
fn effective_content(descriptor: &TorrentDescriptor, content_path: &Path) -> PathBuf {
    if content_path.is_dir() && !descriptor.is_multi_file() {
        content_path.join(descriptor.name())
    } else {
        content_path.to_path_buf()
    }
}

pub struct Injector {
    client: Arc<dyn TorrentClient>,
    config: ClientConfig,
    links: LinkEngine,
    paths: PathMap,
    retry: RetryPolicy,
    poll_interval: Duration,
}

impl Injector {
    pub fn new(client: Arc<dyn TorrentClient>, config: &ClientConfig) -> Result<Self> {
        Ok(Injector {
            client,
            links: LinkEngine::for_client(config),
            paths: PathMap::for_client(config)?,
            config: config.clone(),
            retry: RetryPolicy::default(),
            poll_interval: PRESENCE_INTERVAL,
        })
    }

    pub fn with_link_engine(mut self, links: LinkEngine) -> Self {
        self.links = links;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn category(&self, request: &InjectRequest) -> Option<String> {
        match &self.config.cross_category {
            Some(category) if request.cross_seed => Some(category.clone()),
            _ => request.category.clone().or_else(|| self.config.category.clone()),
        }
    }

    fn tags(&self, request: &InjectRequest) -> Option<String> {
        if let (true, Some(tag)) = (request.cross_seed, &self.config.cross_tag) {
            return Some(tag.clone());
        }
        if request.tag.is_some() {
            return request.tag.clone();
        }
        if self.config.use_tracker_as_tag && !request.tracker.is_empty() {
            return Some(request.tracker.clone());
        }
        self.config.tag.clone()
    }

    /// Links, maps and adds the descriptor, then waits for the client to list it.
    #[tracing::instrument(err, skip(self, request), fields(client = %self.client.name(), tracker = %request.tracker))]
    pub async fn inject(&self, request: &InjectRequest) -> Result<InjectOutcome> {
        let descriptor = TorrentDescriptor::load(&request.descriptor_path).await?;
        let hash = descriptor.info_hash_hex()?;
        let content_path = effective_content(&descriptor, &request.content_path);

        let link = self
            .links
            .link(&LinkRequest {
                content_path: content_path.clone(),
                link_dir_name: request.link_dir_name.clone(),
                cross_seed: request.cross_seed.then(|| descriptor.clone()),
            })
            .await?;
        let local_save_path = link.save_path();
        let save_path = self.paths.map(&content_path, &local_save_path);
        let remote_content = self.paths.map(&content_path, &link.content_path);
        tracing::debug!(local = %local_save_path.display(), remote = %save_path.path, "resolved save path");

        let fast_resume = self.config.fast_resume && self.client.wants_fast_resume();
        if self.config.fast_resume && !fast_resume {
            tracing::debug!("client ignores resume data, adding the plain descriptor");
        }
        let mut staged = None;
        let upload = if fast_resume {
            let resume_path = write_resume_file(&request.descriptor_path, &link.content_path).await?;
            if save_path.remapped {
                let copy = TransientCopy::stage(&resume_path, &local_save_path).await?;
                let path = copy.path().to_path_buf();
                staged = Some(copy);
                path
            } else {
                resume_path
            }
        } else {
            request.descriptor_path.clone()
        };
        let bytes = tokio::fs::read(&upload).await.at_path(&upload)?;
        let file_name = upload
            .file_name()
            .map_or_else(|| format!("{hash}.torrent"), |name| name.to_string_lossy().into_owned());

        let options = AddOptions {
            save_path: save_path.path.clone(),
            content_path: remote_content.path.trim_end_matches('/').to_owned(),
            paused: request.cross_seed,
            skip_checking: true,
            category: self.category(request),
            tags: self.tags(request),
            content_layout: self.config.content_layout.clone(),
            remote_file: staged.as_ref().map(|_| format!("{}{file_name}", save_path.path)),
            file_name,
        };
        self.retry
            .run("add torrent", || self.client.add(bytes.clone(), &options))
            .await?;
        drop(staged);

        self.wait_until_present(&hash).await?;

        if !request.cross_seed {
            if let Err(e) = self.client.resume(&hash).await {
                tracing::warn!(error = %e, "failed to resume the torrent");
            }
            if self.config.super_seed_trackers.iter().any(|t| t == &request.tracker) {
                if let Err(e) = self.client.set_super_seeding(&hash).await {
                    tracing::warn!(error = %e, "failed to enable super-seeding");
                }
            }
        }

        tracing::info!(%hash, save_path = %save_path.path, "torrent added");
        Ok(InjectOutcome { hash, save_path, link })
    }

    async fn wait_until_present(&self, hash: &str) -> Result<()> {
        for _ in 0..PRESENCE_POLLS {
            match self.client.is_present(hash).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => tracing::debug!(error = %e, "presence check failed"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(Error::Api(format!(
            "{hash} was not listed by '{}' after {PRESENCE_POLLS} checks",
            self.client.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::FakeClient;
    use crate::descriptor::tests::{multi_file, single_file};
    use crate::link::mounts::MountTable;
    use crate::link::LinkMode;
    use crate::resume::RESUME_KEY;

    fn write(path: &Path, len: usize) {
        std::fs::create_dir_all(path.parent().expect("path has a parent")).expect("failed to create dirs");
        std::fs::write(path, vec![0u8; len]).expect("failed to write");
    }

    fn request(descriptor_path: &Path, content_path: &Path, tracker: &str) -> InjectRequest {
        InjectRequest::new(&Config::default(), descriptor_path, content_path, tracker)
    }

    #[tokio::test]
    async fn adds_a_linked_torrent_and_resumes_it() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let release = dir.path().join("data/Show.S01");
        write(&release.join("e01.mkv"), 300);
        let torrent = dir.path().join("[BLU]Show.S01.torrent");
        let descriptor = multi_file("Show.S01", 32768, &[("e01.mkv", 300)]);
        descriptor.save(&torrent).await.expect("failed to save");
        let root = dir.path().join("links");

        let config = ClientConfig {
            linking: LinkMode::Hardlink,
            linked_folders: vec![root.clone()],
            allow_fallback: false,
            tag: Some("seedkit".to_owned()),
            category: Some("uploads".to_owned()),
            super_seed_trackers: vec!["BLU".to_owned()],
            ..ClientConfig::default()
        };
        let client = Arc::new(FakeClient::named("qb"));
        let injector = Injector::new(client.clone(), &config)
            .expect("valid config")
            .with_link_engine(
                LinkEngine::new(LinkMode::Hardlink, vec![root.clone()], false)
                    .with_mounts(MountTable::parse("/dev/root / ext4 rw 0 0\n")),
            );

        let outcome = injector
            .inject(&request(&torrent, &release, "BLU"))
            .await
            .expect("failed to inject");

        let hash = descriptor.info_hash_hex().expect("hash");
        assert_eq!(outcome.hash, hash);
        assert!(root.join("BLU/Show.S01/e01.mkv").is_file());

        let added = client.added.lock();
        let (_, options) = &added[0];
        assert_eq!(options.save_path, format!("{}/", root.join("BLU").display()));
        assert!(options.skip_checking);
        assert!(!options.paused);
        assert_eq!(options.category.as_deref(), Some("uploads"));
        assert_eq!(options.tags.as_deref(), Some("seedkit"));
        assert_eq!(options.file_name, "[BLU]Show.S01.torrent");
        assert_eq!(options.content_path, root.join("BLU/Show.S01").display().to_string());
        assert_eq!(options.remote_file, None);
        assert_eq!(*client.resumed.lock(), vec![hash.clone()]);
        assert_eq!(*client.super_seeded.lock(), vec![hash]);
    }

    #[tokio::test]
    async fn cross_seeds_stay_paused_with_cross_labels() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let content = dir.path().join("movie.mkv");
        write(&content, 100);
        let torrent = dir.path().join("[TL].torrent");
        single_file("movie.mkv", 32768, 100).save(&torrent).await.expect("failed to save");

        let config = ClientConfig {
            cross_category: Some("cross".to_owned()),
            cross_tag: Some("xseed".to_owned()),
            use_tracker_as_tag: true,
            super_seed_trackers: vec!["TL".to_owned()],
            ..ClientConfig::default()
        };
        let client = Arc::new(FakeClient::named("qb"));
        let injector = Injector::new(client.clone(), &config).expect("valid config");
        let mut request = request(&torrent, &content, "TL");
        request.cross_seed = true;
        let outcome = injector.inject(&request).await.expect("failed to inject");

        assert!(!outcome.link.is_linked());
        let added = client.added.lock();
        let (_, options) = &added[0];
        assert!(options.paused);
        assert_eq!(options.category.as_deref(), Some("cross"));
        assert_eq!(options.tags.as_deref(), Some("xseed"));
        assert!(client.resumed.lock().is_empty());
        assert!(client.super_seeded.lock().is_empty());
    }

    fn remapped_single_file(dir: &Path) -> (PathBuf, PathBuf, ClientConfig) {
        let content = dir.join("media/movie.mkv");
        write(&content, 100);
        let torrent = dir.join("[AITHER].torrent");
        let config = ClientConfig {
            local_paths: vec![dir.join("media")],
            remote_paths: vec!["/downloads".to_owned()],
            use_tracker_as_tag: true,
            fast_resume: true,
            ..ClientConfig::default()
        };
        (content, torrent, config)
    }

    #[tokio::test]
    async fn remote_paths_and_fast_resume() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let (content, torrent, config) = remapped_single_file(dir.path());
        single_file("movie.mkv", 32768, 100).save(&torrent).await.expect("failed to save");

        let client = Arc::new(FakeClient {
            fast_resume: true,
            ..FakeClient::named("rt")
        });
        let injector = Injector::new(client.clone(), &config).expect("valid config");
        let outcome = injector
            .inject(&request(&torrent, &content, "AITHER"))
            .await
            .expect("failed to inject");

        assert!(outcome.save_path.remapped);
        let added = client.added.lock();
        let (bytes, options) = &added[0];
        assert_eq!(options.save_path, "/downloads/");
        assert_eq!(options.content_path, "/downloads/movie.mkv");
        assert_eq!(options.tags.as_deref(), Some("AITHER"));
        assert_eq!(options.file_name, "fr.torrent");
        assert_eq!(options.remote_file.as_deref(), Some("/downloads/fr.torrent"));
        let uploaded = TorrentDescriptor::from_bytes(bytes).expect("valid descriptor");
        assert!(uploaded.top_value(RESUME_KEY).is_some());
        // the staged copy is gone once the add returns
        assert!(!dir.path().join("media/fr.torrent").exists());
    }

    #[tokio::test]
    async fn resume_data_is_skipped_for_clients_that_ignore_it() {
        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let (content, torrent, config) = remapped_single_file(dir.path());
        single_file("movie.mkv", 32768, 100).save(&torrent).await.expect("failed to save");

        let client = Arc::new(FakeClient::named("qb"));
        let injector = Injector::new(client.clone(), &config).expect("valid config");
        injector
            .inject(&request(&torrent, &content, "AITHER"))
            .await
            .expect("failed to inject");

        let added = client.added.lock();
        let (bytes, options) = &added[0];
        assert_eq!(options.file_name, "[AITHER].torrent");
        assert_eq!(options.remote_file, None);
        let uploaded = TorrentDescriptor::from_bytes(bytes).expect("valid descriptor");
        assert!(uploaded.top_value(RESUME_KEY).is_none());
        assert!(!dir.path().join("[AITHER]-resume.torrent").exists());
    }

    #[tokio::test]
    async fn missing_torrents_time_out() {
        struct Invisible(FakeClient);

        #[async_trait::async_trait]
        impl TorrentClient for Invisible {
            fn name(&self) -> &str {
                self.0.name()
            }
            async fn list(&self, release_name: &str) -> Result<Vec<crate::client::RemoteTorrent>> {
                self.0.list(release_name).await
            }
            async fn torrent(&self, _hash: &str) -> Result<Option<crate::client::RemoteTorrent>> {
                Ok(None)
            }
            async fn tracker_report(&self, torrent: &crate::client::RemoteTorrent) -> Result<crate::client::TrackerReport> {
                self.0.tracker_report(torrent).await
            }
            async fn export(&self, hash: &str) -> Result<Vec<u8>> {
                self.0.export(hash).await
            }
            async fn add(&self, descriptor: Vec<u8>, options: &AddOptions) -> Result<()> {
                self.0.add(descriptor, options).await
            }
            async fn resume(&self, hash: &str) -> Result<()> {
                self.0.resume(hash).await
            }
            async fn set_super_seeding(&self, hash: &str) -> Result<()> {
                self.0.set_super_seeding(hash).await
            }
        }

        let dir = tempfile::tempdir().expect("failed to create a temp dir");
        let content = dir.path().join("movie.mkv");
        write(&content, 10);
        let torrent = dir.path().join("t.torrent");
        single_file("movie.mkv", 32768, 10).save(&torrent).await.expect("failed to save");

        let client = Arc::new(Invisible(FakeClient::named("qb")));
        let injector = Injector::new(client.clone(), &ClientConfig::default())
            .expect("valid config")
            .with_poll_interval(Duration::from_millis(1));
        let result = injector.inject(&request(&torrent, &content, "BLU")).await;
        assert!(matches!(result, Err(Error::Api(_))));
        assert!(client.0.resumed.lock().is_empty());
    }
}
