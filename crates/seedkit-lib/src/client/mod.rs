//! Torrent-client control surfaces.

pub mod proxy;
pub mod qbittorrent;
pub mod rtorrent;
pub mod tracker_ids;
pub mod xmlrpc;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{ClientConfig, ClientKind};
use crate::error::Result;
use crate::guard::SessionRegistry;

pub use proxy::ProxyClient;
pub use qbittorrent::{QbitSession, QbittorrentClient};
pub use rtorrent::RtorrentClient;
pub use tracker_ids::TrackerIds;

/// Tracker status reported by qBittorrent for a tracker that answered.
pub const TRACKER_WORKING: i64 = 2;
/// Pseudo-trackers qBittorrent lists next to the real ones.
const PSEUDO_TRACKERS: [&str; 3] = ["** [DHT]", "** [PeX]", "** [LSD]"];

/// One entry of `torrents/info`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RemoteTorrent {
    pub hash: String,
    pub name: String,
    pub save_path: String,
    pub content_path: String,
    pub size: i64,
    pub category: String,
    /// Seeders in the swarm
    pub num_complete: i64,
    /// Current announce URL
    pub tracker: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrackerEntry {
    pub url: String,
    #[serde(default)]
    pub status: i64,
}

impl TrackerEntry {
    pub fn is_pseudo(&self) -> bool {
        PSEUDO_TRACKERS.iter().any(|prefix| self.url.starts_with(prefix))
    }
}

/// Trackers and comment of one torrent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerReport {
    pub trackers: Vec<TrackerEntry>,
    pub comment: String,
}

impl TrackerReport {
    pub fn real_trackers(&self) -> impl Iterator<Item = &TrackerEntry> {
        self.trackers.iter().filter(|t| !t.is_pseudo())
    }

    pub fn is_working(&self) -> bool {
        self.real_trackers().any(|t| t.status == TRACKER_WORKING)
    }

    /// Tracker IDs from the comment and announce URLs. Empty unless a tracker works.
    pub fn tracker_ids(&self) -> TrackerIds {
        if !self.is_working() {
            return TrackerIds::new();
        }
        let mut ids = tracker_ids::from_comment(&self.comment);
        for tracker in self.real_trackers() {
            tracker_ids::apply_announce_rules(&mut ids, &tracker.url, &self.comment);
        }
        ids
    }
}

/// How a descriptor is added.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddOptions {
    /// Directory as the client sees it, forward slashes and a trailing slash
    pub save_path: String,
    /// Content file or directory as the client sees it
    pub content_path: String,
    pub paused: bool,
    pub skip_checking: bool,
    pub category: Option<String>,
    pub tags: Option<String>,
    pub content_layout: String,
    /// File name the descriptor is uploaded under
    pub file_name: String,
    /// Staged copy of the descriptor at a path the client can read
    pub remote_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Unvalidated,
    Valid,
    Rejected(String),
}

/// A remote torrent being considered for reuse.
#[derive(Debug, Clone)]
pub struct ClientCandidate {
    pub client: String,
    pub torrent: RemoteTorrent,
    pub trackers: Vec<String>,
    pub comment: String,
    pub working: bool,
    pub tracker_ids: TrackerIds,
    pub validity: Validity,
}

impl ClientCandidate {
    pub fn new(client: &str, torrent: RemoteTorrent, report: &TrackerReport) -> Self {
        ClientCandidate {
            client: client.to_owned(),
            torrent,
            trackers: report.real_trackers().map(|t| t.url.clone()).collect(),
            comment: report.comment.clone(),
            working: report.is_working(),
            tracker_ids: report.tracker_ids(),
            validity: Validity::Unvalidated,
        }
    }

    pub fn hash(&self) -> &str {
        &self.torrent.hash
    }

    /// Working trackers first, then by tracker priority, then candidates with an ID.
    pub fn sort_key(&self) -> (bool, usize, bool) {
        (
            !self.working,
            tracker_ids::priority_rank(&self.tracker_ids),
            self.tracker_ids.is_empty(),
        )
    }
}

/// Operations the search and injection engines need from a torrent client.
#[async_trait]
pub trait TorrentClient: Send + Sync {
    fn name(&self) -> &str;

    /// Torrents that might be `release_name`. Backends with server-side search narrow it down.
    async fn list(&self, release_name: &str) -> Result<Vec<RemoteTorrent>>;

    async fn torrent(&self, hash: &str) -> Result<Option<RemoteTorrent>>;

    async fn tracker_report(&self, torrent: &RemoteTorrent) -> Result<TrackerReport>;

    /// Raw `.torrent` bytes of a loaded torrent.
    async fn export(&self, hash: &str) -> Result<Vec<u8>>;

    async fn add(&self, descriptor: Vec<u8>, options: &AddOptions) -> Result<()>;

    async fn is_present(&self, hash: &str) -> Result<bool> {
        Ok(self.torrent(hash).await?.is_some())
    }

    async fn resume(&self, hash: &str) -> Result<()>;

    async fn set_super_seeding(&self, hash: &str) -> Result<()>;

    /// Whether the client reads libtorrent resume data attached to a descriptor.
    fn wants_fast_resume(&self) -> bool {
        false
    }
}

/// Builds the backend a client configuration describes.
pub fn connect(name: &str, config: &ClientConfig, sessions: Arc<SessionRegistry<QbitSession>>) -> Result<Arc<dyn TorrentClient>> {
    Ok(match (config.kind, &config.proxy_url) {
        (ClientKind::Rtorrent, _) => Arc::new(RtorrentClient::new(name, config)?),
        (ClientKind::Qbittorrent, Some(proxy_url)) => {
            Arc::new(ProxyClient::new(name, proxy_url, config.verify_certificate)?)
        }
        (ClientKind::Qbittorrent, None) => Arc::new(QbittorrentClient::new(name, config, sessions)?),
    })
}
