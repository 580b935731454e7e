//! qBittorrent reached through an authenticating proxy such as qui.
//!
//! The proxy URL itself carries the credentials, so there is no login step. Listing uses the
//! proxy's server-side search instead of downloading every torrent.

use async_trait::async_trait;
use reqwest::Response;
use serde::Deserialize;
use url::Url;

use super::qbittorrent::{add_form, api_url, base_url, check_added, http_client};
use super::{AddOptions, RemoteTorrent, TorrentClient, TrackerEntry, TrackerReport, TRACKER_WORKING};
use crate::error::{Error, Result};

const SEARCH_LIMIT: &str = "100";
/// Torrents in these states can't be reused
const EXCLUDED_STATES: &str = "unregistered,tracker_down";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Wrapped { torrents: Vec<RemoteTorrent> },
    Bare(Vec<RemoteTorrent>),
}

impl From<SearchResponse> for Vec<RemoteTorrent> {
    fn from(response: SearchResponse) -> Self {
        match response {
            SearchResponse::Wrapped { torrents } | SearchResponse::Bare(torrents) => torrents,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Properties {
    #[serde(default)]
    comment: String,
}

/// Brackets confuse the proxy's search syntax.
pub fn search_term(release_name: &str) -> String {
    release_name.replace(['[', ']'], ".")
}

pub struct ProxyClient {
    name: String,
    base: Url,
    http: reqwest::Client,
}

impl ProxyClient {
    pub fn new(name: &str, proxy_url: &str, verify_certificate: bool) -> Result<Self> {
        Ok(ProxyClient {
            name: name.to_owned(),
            base: base_url(proxy_url)?,
            http: http_client(verify_certificate, false)?,
        })
    }

    fn url(&self, method: &str) -> Result<Url> {
        api_url(&self.base, method)
    }

    pub fn search_url(&self, release_name: &str) -> Result<Url> {
        let mut url = self.url("torrents/search")?;
        url.query_pairs_mut()
            .append_pair("search", &search_term(release_name))
            .append_pair("sort", "added_on")
            .append_pair("reverse", "true")
            .append_pair("limit", SEARCH_LIMIT)
            .append_pair("filter", EXCLUDED_STATES);
        Ok(url)
    }

    async fn checked(response: reqwest::Result<Response>) -> Result<Response> {
        Ok(response?.error_for_status()?)
    }
}

#[async_trait]
impl TorrentClient for ProxyClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, release_name: &str) -> Result<Vec<RemoteTorrent>> {
        let url = self.search_url(release_name)?;
        let response: SearchResponse = Self::checked(self.http.get(url).send().await).await?.json().await?;
        Ok(response.into())
    }

    async fn torrent(&self, hash: &str) -> Result<Option<RemoteTorrent>> {
        let response = Self::checked(
            self.http
                .get(self.url("torrents/info")?)
                .query(&[("hashes", hash)])
                .send()
                .await,
        )
        .await?;
        let torrents: Vec<RemoteTorrent> = response.json().await?;
        Ok(torrents.into_iter().next())
    }

    /// The proxy already filtered out dead torrents, so the current tracker counts as working.
    async fn tracker_report(&self, torrent: &RemoteTorrent) -> Result<TrackerReport> {
        let comment = match &torrent.comment {
            Some(comment) => comment.clone(),
            None => {
                let response = Self::checked(
                    self.http
                        .get(self.url("torrents/properties")?)
                        .query(&[("hash", torrent.hash.as_str())])
                        .send()
                        .await,
                )
                .await?;
                response.json::<Properties>().await?.comment
            }
        };
        let trackers = if torrent.tracker.is_empty() {
            Vec::new()
        } else {
            vec![TrackerEntry {
                url: torrent.tracker.clone(),
                status: TRACKER_WORKING,
            }]
        };
        Ok(TrackerReport { trackers, comment })
    }

    async fn export(&self, hash: &str) -> Result<Vec<u8>> {
        let response = Self::checked(
            self.http
                .post(self.url("torrents/export")?)
                .form(&[("hash", hash)])
                .send()
                .await,
        )
        .await?;
        Ok(response.bytes().await?.to_vec())
    }

    #[tracing::instrument(err, skip(self, descriptor, options), fields(client = %self.name))]
    async fn add(&self, descriptor: Vec<u8>, options: &AddOptions) -> Result<()> {
        let response = Self::checked(
            self.http
                .post(self.url("torrents/add")?)
                .multipart(add_form(descriptor, options)?)
                .send()
                .await,
        )
        .await?;
        check_added(response).await
    }

    async fn resume(&self, hash: &str) -> Result<()> {
        let resumed = Self::checked(
            self.http
                .post(self.url("torrents/resume")?)
                .form(&[("hashes", hash)])
                .send()
                .await,
        )
        .await;
        match resumed {
            Err(Error::Api(message)) if message.contains("404") => {
                Self::checked(
                    self.http
                        .post(self.url("torrents/start")?)
                        .form(&[("hashes", hash)])
                        .send()
                        .await,
                )
                .await?;
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn set_super_seeding(&self, hash: &str) -> Result<()> {
        Self::checked(
            self.http
                .post(self.url("torrents/setSuperSeeding")?)
                .form(&[("hashes", hash), ("value", "true")])
                .send()
                .await,
        )
        .await?;
        Ok(())
    }
}
