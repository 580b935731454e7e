//! rTorrent over XML-RPC.
//!
//! rTorrent keeps no comment and can't export a loaded torrent, so searches read the session
//! directory (`torrent_storage_dir`) and tracker IDs come from announce URLs only. It is the one
//! backend that reads `libtorrent_resume` data.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use url::Url;

use super::qbittorrent::http_client;
use super::xmlrpc::{self, Value};
use super::{AddOptions, RemoteTorrent, TorrentClient, TrackerEntry, TrackerReport, TRACKER_WORKING};
use crate::config::ClientConfig;
use crate::descriptor::TorrentDescriptor;
use crate::error::{Error, Result};

/// Columns requested from `d.multicall2`, in the order [`remote_torrent`] reads them.
const TORRENT_FIELDS: [&str; 6] = [
    "d.hash=",
    "d.name=",
    "d.base_path=",
    "d.size_bytes=",
    "d.custom1=",
    "d.peers_complete=",
];
/// Trackers that never answered successfully
const TRACKER_UNCONFIRMED: i64 = 1;

pub struct RtorrentClient {
    name: String,
    endpoint: Url,
    username: String,
    password: String,
    http: reqwest::Client,
}

fn remote_torrent(row: &Value) -> Option<RemoteTorrent> {
    let [hash, name, base_path, size, label, seeders] = row.as_array()? else {
        return None;
    };
    let content_path = base_path.as_str()?.to_owned();
    let save_path = content_path
        .rsplit_once('/')
        .map(|(parent, _)| parent.to_owned())
        .unwrap_or_default();
    Some(RemoteTorrent {
        hash: hash.as_str()?.to_lowercase(),
        name: name.as_str()?.to_owned(),
        save_path,
        content_path,
        size: size.as_i64()?,
        category: label.as_str().unwrap_or_default().to_owned(),
        num_complete: seeders.as_i64().unwrap_or_default(),
        tracker: String::new(),
        comment: None,
    })
}

fn tracker_entry(row: &Value) -> Option<TrackerEntry> {
    let [url, successes] = row.as_array()? else {
        return None;
    };
    let status = if successes.as_i64()? > 0 {
        TRACKER_WORKING
    } else {
        TRACKER_UNCONFIRMED
    };
    Some(TrackerEntry {
        url: url.as_str()?.to_owned(),
        status,
    })
}

/// Escapes a value for a double-quoted rTorrent command argument.
fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// The `load.*` call for an add. A staged copy the client can read is loaded by path,
/// otherwise the descriptor travels inline.
fn load_call(descriptor: Vec<u8>, options: &AddOptions, multi_file: bool) -> (&'static str, Vec<Value>) {
    let directory = if multi_file && !options.content_path.is_empty() {
        options.content_path.trim_end_matches('/')
    } else {
        options.save_path.trim_end_matches('/')
    };
    let (method, source) = match (&options.remote_file, options.paused) {
        (Some(file), false) => ("load.start_verbose", Value::from(file.as_str())),
        (Some(file), true) => ("load.verbose", Value::from(file.as_str())),
        (None, false) => ("load.raw_start_verbose", Value::Base64(descriptor)),
        (None, true) => ("load.raw_verbose", Value::Base64(descriptor)),
    };

    let mut params = vec![
        Value::from(""),
        source,
        Value::from(format!("d.directory_base.set={}", quoted(directory))),
    ];
    if let Some(label) = &options.category {
        params.push(Value::from(format!("d.custom1.set={}", quoted(label))));
    }
    (method, params)
}

impl RtorrentClient {
    pub fn new(name: &str, config: &ClientConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.url)
            .map_err(|e| Error::Configuration(format!("invalid rTorrent url '{}': {e}", config.url)))?;
        Ok(RtorrentClient {
            name: name.to_owned(),
            endpoint,
            username: config.username.clone(),
            password: config.password.clone(),
            http: http_client(config.verify_certificate, false)?,
        })
    }

    async fn call(&self, method: &str, params: &[Value]) -> Result<Value> {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "text/xml")
            .body(xmlrpc::encode_call(method, params));
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }
        let body = request.send().await?.error_for_status()?.text().await?;
        xmlrpc::parse_response(&body)
    }
}

#[async_trait]
impl TorrentClient for RtorrentClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, _release_name: &str) -> Result<Vec<RemoteTorrent>> {
        let mut params = vec![Value::from(""), Value::from("main")];
        params.extend(TORRENT_FIELDS.iter().map(|field| Value::from(*field)));
        let rows = self.call("d.multicall2", &params).await?;
        Ok(rows
            .as_array()
            .unwrap_or_default()
            .iter()
            .filter_map(remote_torrent)
            .collect())
    }

    async fn torrent(&self, hash: &str) -> Result<Option<RemoteTorrent>> {
        Ok(self
            .list("")
            .await?
            .into_iter()
            .find(|torrent| torrent.hash.eq_ignore_ascii_case(hash)))
    }

    async fn tracker_report(&self, torrent: &RemoteTorrent) -> Result<TrackerReport> {
        let params = [
            Value::from(torrent.hash.to_uppercase()),
            Value::from(""),
            Value::from("t.url="),
            Value::from("t.success_counter="),
        ];
        let rows = self.call("t.multicall", &params).await?;
        Ok(TrackerReport {
            trackers: rows
                .as_array()
                .unwrap_or_default()
                .iter()
                .filter_map(tracker_entry)
                .collect(),
            comment: String::new(),
        })
    }

    async fn export(&self, hash: &str) -> Result<Vec<u8>> {
        Err(Error::Api(format!(
            "'{}' can't export {hash}, set torrent_storage_dir to its session directory",
            self.name
        )))
    }

    #[tracing::instrument(err, skip(self, descriptor, options), fields(client = %self.name))]
    async fn add(&self, descriptor: Vec<u8>, options: &AddOptions) -> Result<()> {
        let multi_file = TorrentDescriptor::from_bytes(&descriptor)?.is_multi_file();
        let (method, params) = load_call(descriptor, options, multi_file);
        tracing::debug!(method, "loading torrent");
        self.call(method, &params).await?;
        Ok(())
    }

    async fn resume(&self, hash: &str) -> Result<()> {
        self.call("d.start", &[Value::from(hash.to_uppercase())]).await?;
        Ok(())
    }

    async fn set_super_seeding(&self, _hash: &str) -> Result<()> {
        Err(Error::Api(format!("'{}' has no super-seeding switch", self.name)))
    }

    fn wants_fast_resume(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> AddOptions {
        AddOptions {
            save_path: "/downloads/BLU/".to_owned(),
            content_path: "/downloads/BLU/Show.S01".to_owned(),
            category: Some("up \"loads\"".to_owned()),
            ..AddOptions::default()
        }
    }

    #[test]
    fn inline_load_for_multi_file_content() {
        let (method, params) = load_call(b"d4:infoe".to_vec(), &options(), true);
        assert_eq!(method, "load.raw_start_verbose");
        assert_eq!(params[1], Value::Base64(b"d4:infoe".to_vec()));
        assert_eq!(params[2].as_str(), Some("d.directory_base.set=\"/downloads/BLU/Show.S01\""));
        assert_eq!(params[3].as_str(), Some("d.custom1.set=\"up \\\"loads\\\"\""));
    }

    #[test]
    fn staged_single_file_loads_by_path_and_stays_stopped() {
        let options = AddOptions {
            paused: true,
            category: None,
            remote_file: Some("/downloads/BLU/fr.torrent".to_owned()),
            ..options()
        };
        let (method, params) = load_call(Vec::new(), &options, false);
        assert_eq!(method, "load.verbose");
        assert_eq!(params[1].as_str(), Some("/downloads/BLU/fr.torrent"));
        assert_eq!(params[2].as_str(), Some("d.directory_base.set=\"/downloads/BLU\""));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn multicall_rows_become_remote_torrents() {
        let row = Value::Array(vec![
            Value::from("0123ABCD"),
            Value::from("Show.S01"),
            Value::from("/data/BLU/Show.S01"),
            Value::from(4096),
            Value::from("uploads"),
            Value::from(12),
        ]);
        let torrent = remote_torrent(&row).expect("a complete row");
        assert_eq!(torrent.hash, "0123abcd");
        assert_eq!(torrent.save_path, "/data/BLU");
        assert_eq!(torrent.content_path, "/data/BLU/Show.S01");
        assert_eq!(torrent.size, 4096);
        assert_eq!(torrent.category, "uploads");
        assert_eq!(torrent.num_complete, 12);

        assert!(remote_torrent(&Value::Array(vec![Value::from("short")])).is_none());
    }

    #[test]
    fn trackers_count_as_working_after_a_success() {
        let working = Value::Array(vec![Value::from("https://blutopia.cc/announce/x"), Value::from(3)]);
        let silent = Value::Array(vec![Value::from("https://aither.cc/announce/y"), Value::from(0)]);
        assert_eq!(tracker_entry(&working).map(|t| t.status), Some(TRACKER_WORKING));
        assert_eq!(tracker_entry(&silent).map(|t| t.status), Some(TRACKER_UNCONFIRMED));

        let report = TrackerReport {
            trackers: [working, silent].iter().filter_map(tracker_entry).collect(),
            comment: String::new(),
        };
        assert!(report.is_working());
    }
}
