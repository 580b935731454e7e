//! qBittorrent WebUI API v2.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use url::Url;

use super::{AddOptions, RemoteTorrent, TorrentClient, TrackerEntry, TrackerReport};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::guard::{EndpointKey, SessionRegistry};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LOGIN_OK: &str = "Ok.";
const ADD_FAILED: &str = "Fails.";

/// A logged-in WebUI session. The cookie jar inside the HTTP client carries the `SID`.
#[derive(Debug)]
pub struct QbitSession {
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Properties {
    #[serde(default)]
    comment: String,
}

pub(crate) fn http_client(verify_certificate: bool, cookies: bool) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .cookie_store(cookies)
        .danger_accept_invalid_certs(!verify_certificate)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| Error::Configuration(format!("failed to build an HTTP client: {e}")))
}

/// Parses `raw` and makes sure relative joins land below its path.
pub(crate) fn base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).map_err(|e| Error::Configuration(format!("invalid client url '{raw}': {e}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

pub(crate) fn api_url(base: &Url, method: &str) -> Result<Url> {
    base.join(&format!("api/v2/{method}"))
        .map_err(|e| Error::Internal(anyhow::anyhow!("failed to build the '{method}' url: {e}")))
}

pub(crate) fn add_form(descriptor: Vec<u8>, options: &AddOptions) -> Result<Form> {
    let part = Part::bytes(descriptor)
        .file_name(options.file_name.clone())
        .mime_str("application/x-bittorrent")
        .map_err(|e| Error::Internal(anyhow::anyhow!("bad mime type: {e}")))?;
    let paused = options.paused.to_string();
    let mut form = Form::new()
        .part("torrents", part)
        .text("savepath", options.save_path.clone())
        .text("autoTMM", "false")
        .text("skip_checking", options.skip_checking.to_string())
        // qBittorrent 5 renamed `paused` to `stopped`
        .text("paused", paused.clone())
        .text("stopped", paused)
        .text("contentLayout", options.content_layout.clone());
    if let Some(category) = &options.category {
        form = form.text("category", category.clone());
    }
    if let Some(tags) = &options.tags {
        form = form.text("tags", tags.clone());
    }
    Ok(form)
}

/// Maps the add endpoint's plain-text answer to a result.
pub(crate) async fn check_added(response: Response) -> Result<()> {
    let body = response.text().await?;
    if body.trim() == ADD_FAILED {
        return Err(Error::Api("client refused the torrent".to_owned()));
    }
    Ok(())
}

pub struct QbittorrentClient {
    name: String,
    base: Url,
    username: String,
    password: String,
    verify_certificate: bool,
    key: EndpointKey,
    sessions: Arc<SessionRegistry<QbitSession>>,
}

impl QbittorrentClient {
    pub fn new(name: &str, config: &ClientConfig, sessions: Arc<SessionRegistry<QbitSession>>) -> Result<Self> {
        let base = base_url(&config.endpoint())?;
        let key = EndpointKey {
            host: base.host_str().unwrap_or_default().to_owned(),
            port: base.port_or_known_default(),
            user: config.username.clone(),
        };
        Ok(QbittorrentClient {
            name: name.to_owned(),
            base,
            username: config.username.clone(),
            password: config.password.clone(),
            verify_certificate: config.verify_certificate,
            key,
            sessions,
        })
    }

    #[tracing::instrument(err, skip(self), fields(client = %self.name))]
    async fn login(&self) -> Result<QbitSession> {
        let http = http_client(self.verify_certificate, true)?;
        let response = http
            .post(api_url(&self.base, "auth/login")?)
            .form(&[("username", self.username.as_str()), ("password", self.password.as_str())])
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        if body.trim() != LOGIN_OK {
            return Err(Error::Api(format!("login to '{}' was rejected: {}", self.name, body.trim())));
        }
        tracing::debug!("logged in");
        Ok(QbitSession { http })
    }

    async fn session(&self) -> Result<Arc<QbitSession>> {
        self.sessions.get_or_establish(&self.key, || self.login()).await
    }

    /// Sends a request on the shared session. A 403 drops the session so the next call logs in again.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: FnOnce(&reqwest::Client) -> Result<RequestBuilder>,
    {
        let session = self.session().await?;
        let response = build(&session.http)?.send().await?;
        if response.status() == StatusCode::FORBIDDEN {
            self.sessions.invalidate(&self.key);
            return Err(Error::TransientNetwork(format!("session for '{}' expired", self.name)));
        }
        Ok(response.error_for_status()?)
    }

    fn url(&self, method: &str) -> Result<Url> {
        api_url(&self.base, method)
    }
}

#[async_trait]
impl TorrentClient for QbittorrentClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, _release_name: &str) -> Result<Vec<RemoteTorrent>> {
        let url = self.url("torrents/info")?;
        Ok(self.send(|http| Ok(http.get(url))).await?.json().await?)
    }

    async fn torrent(&self, hash: &str) -> Result<Option<RemoteTorrent>> {
        let url = self.url("torrents/info")?;
        let torrents: Vec<RemoteTorrent> = self
            .send(|http| Ok(http.get(url).query(&[("hashes", hash)])))
            .await?
            .json()
            .await?;
        Ok(torrents.into_iter().next())
    }

    async fn tracker_report(&self, torrent: &RemoteTorrent) -> Result<TrackerReport> {
        let hash = torrent.hash.as_str();
        let url = self.url("torrents/trackers")?;
        let trackers: Vec<TrackerEntry> = self
            .send(|http| Ok(http.get(url).query(&[("hash", hash)])))
            .await?
            .json()
            .await?;
        let url = self.url("torrents/properties")?;
        let properties: Properties = self
            .send(|http| Ok(http.get(url).query(&[("hash", hash)])))
            .await?
            .json()
            .await?;
        Ok(TrackerReport {
            trackers,
            comment: properties.comment,
        })
    }

    async fn export(&self, hash: &str) -> Result<Vec<u8>> {
        let url = self.url("torrents/export")?;
        let response = self.send(|http| Ok(http.post(url).form(&[("hash", hash)]))).await?;
        Ok(response.bytes().await?.to_vec())
    }

    #[tracing::instrument(err, skip(self, descriptor, options), fields(client = %self.name))]
    async fn add(&self, descriptor: Vec<u8>, options: &AddOptions) -> Result<()> {
        let url = self.url("torrents/add")?;
        let response = self
            .send(|http| Ok(http.post(url).multipart(add_form(descriptor, options)?)))
            .await?;
        check_added(response).await
    }

    async fn resume(&self, hash: &str) -> Result<()> {
        let url = self.url("torrents/resume")?;
        match self.send(|http| Ok(http.post(url).form(&[("hashes", hash)]))).await {
            // qBittorrent 5 only knows `start`
            Err(Error::Api(message)) if message.contains("404") => {
                let url = self.url("torrents/start")?;
                self.send(|http| Ok(http.post(url).form(&[("hashes", hash)]))).await?;
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn set_super_seeding(&self, hash: &str) -> Result<()> {
        let url = self.url("torrents/setSuperSeeding")?;
        self.send(|http| Ok(http.post(url).form(&[("hashes", hash), ("value", "true")])))
            .await?;
        Ok(())
    }
}
