use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};

use crate::error::{Error, IoContext, Result};
use crate::link::LinkMode;
use crate::retry::RetryPolicy;

/// Root of `seedkit.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Per-release scratch space: built descriptors, exports and `BASE.torrent` land here
    pub work_dir: PathBuf,
    pub hashing: HashingConfig,
    pub search: SearchConfig,
    /// Torrent-client backends, keyed by a user-chosen name
    pub clients: BTreeMap<String, ClientConfig>,
    /// Per-tracker overrides, keyed by the tracker's short name (e.g. `BLU`)
    pub trackers: BTreeMap<String, TrackerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            work_dir: PathBuf::from("./tmp"),
            hashing: HashingConfig::default(),
            search: SearchConfig::default(),
            clients: BTreeMap::new(),
            trackers: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).at_path(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Configuration(e.to_string()))
    }

    pub fn client(&self, name: &str) -> Result<&ClientConfig> {
        self.clients
            .get(name)
            .ok_or_else(|| Error::Configuration(format!("no client named '{name}' is configured")))
    }

    /// Directory name used below a link root for `tracker`.
    pub fn link_dir_name<'a>(&'a self, tracker: &'a str) -> &'a str {
        self.trackers
            .get(tracker)
            .and_then(|t| t.link_dir_name.as_deref())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(tracker)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashingStrategy {
    /// Shell out to `mkbrr`, falling back to in-process hashing on any failure
    #[default]
    External,
    InProcess,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HashingConfig {
    pub strategy: HashingStrategy,
    /// Directory holding bundled tools (`<tools_dir>/mkbrr/<os>/<arch>/mkbrr`)
    pub tools_dir: PathBuf,
    /// Worker threads handed to the external tool. `0` lets it decide
    pub workers: u32,
    /// Upper bound for the piece size, in MiB
    pub max_piece_size_mib: Option<u64>,
    /// Trackers that refuse pieces above 16 MiB
    pub capped_trackers: Vec<String>,
    /// `source` tag written into freshly built descriptors
    pub source: String,
}

impl Default for HashingConfig {
    fn default() -> Self {
        HashingConfig {
            strategy: HashingStrategy::default(),
            tools_dir: PathBuf::from("./bin"),
            workers: 0,
            max_piece_size_mib: None,
            capped_trackers: vec!["HDB".to_owned(), "PTP".to_owned()],
            source: "seedkit".to_owned(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    /// Clients to search, in order. Empty means every client with search enabled
    pub client_order: Vec<String>,
    /// Stop searching once a reusable descriptor with at most this piece size is found
    pub preferred_max_piece_size_mib: Option<u64>,
    /// Reject descriptors that carry `.nfo` files
    pub skip_nfo: bool,
    pub max_retries: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub initial_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub list_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub retry_pause: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            client_order: Vec::new(),
            preferred_max_piece_size_mib: None,
            skip_nfo: false,
            max_retries: 2,
            initial_timeout: Duration::from_secs(10),
            list_timeout: Duration::from_secs(14),
            retry_pause: Duration::from_secs(1),
        }
    }
}

impl SearchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_timeout: self.initial_timeout,
            pause: self.retry_pause,
        }
    }

    pub fn list_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_timeout: self.list_timeout,
            ..self.retry_policy()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    #[default]
    Qbittorrent,
    /// `url` is the full XML-RPC endpoint, usually `.../RPC2`. `port` is ignored
    Rtorrent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub kind: ClientKind,
    /// Base URL of the qBittorrent WebUI or the rTorrent XML-RPC endpoint, without the port
    pub url: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub verify_certificate: bool,
    /// When set, every call goes through this proxy (e.g. qui) instead of the WebUI
    pub proxy_url: Option<String>,
    /// Directory where the client keeps `<hash>.torrent` copies (BT_backup)
    pub torrent_storage_dir: Option<PathBuf>,
    pub enable_search: bool,
    pub linking: LinkMode,
    pub linked_folders: Vec<PathBuf>,
    /// Fall back to the unlinked path when linking fails
    pub allow_fallback: bool,
    pub local_paths: Vec<PathBuf>,
    pub remote_paths: Vec<String>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub cross_category: Option<String>,
    pub cross_tag: Option<String>,
    pub use_tracker_as_tag: bool,
    pub content_layout: String,
    /// Trackers whose uploads get super-seeding enabled after the add
    pub super_seed_trackers: Vec<String>,
    /// Attach synthesized libtorrent resume data for clients that read it (rTorrent)
    pub fast_resume: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            kind: ClientKind::default(),
            url: "http://127.0.0.1".to_owned(),
            port: Some(8080),
            username: String::new(),
            password: String::new(),
            verify_certificate: true,
            proxy_url: None,
            torrent_storage_dir: None,
            enable_search: true,
            linking: LinkMode::None,
            linked_folders: Vec::new(),
            allow_fallback: true,
            local_paths: Vec::new(),
            remote_paths: Vec::new(),
            category: None,
            tag: None,
            cross_category: None,
            cross_tag: None,
            use_tracker_as_tag: false,
            content_layout: "Original".to_owned(),
            super_seed_trackers: Vec::new(),
            fast_resume: false,
        }
    }
}

impl ClientConfig {
    pub fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        match self.port {
            Some(port) => format!("{base}:{port}"),
            None => base.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    pub link_dir_name: Option<String>,
    pub announce_url: Option<String>,
}
