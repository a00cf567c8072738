//! Blocking HTTP plumbing shared by the gatekeeper and the LKGR finder.

use std::collections::BTreeMap;
use std::time::Duration;

use log::debug;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;

use crate::build_scan::BuildSource;
use crate::buildbot::{master_path, BuildJson, MasterJson};
use crate::errors::FetchError;

/// Per-request timeout for single builds and master summaries.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Full builder histories are large and slow to render on the master.
pub const HISTORY_TIMEOUT: Duration = Duration::from_secs(600);

pub fn headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let user_agent = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
    headers.insert(USER_AGENT, HeaderValue::from_static(user_agent));
    headers
}

pub fn client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .default_headers(headers())
        .timeout(timeout)
        .build()
}

pub(crate) fn get_json<T: DeserializeOwned>(client: &Client, url: &str) -> Result<T, FetchError> {
    debug!("fetching <{}>...", url);
    let http_err = |source| FetchError::Http {
        url: url.to_string(),
        source,
    };
    let body = client
        .get(url)
        .send()
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.text())
        .map_err(http_err)?;
    serde_json::from_str(&body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

/// Reads masters over the buildbot JSON API.
pub struct BuildbotClient {
    client: Client,
    history_client: Client,
}

impl BuildbotClient {
    pub fn new() -> Result<BuildbotClient, reqwest::Error> {
        Ok(BuildbotClient {
            client: client(DEFAULT_TIMEOUT)?,
            history_client: client(HISTORY_TIMEOUT)?,
        })
    }
}

fn api_url(master_url: &str, segments: &[&str]) -> Result<String, FetchError> {
    master_path(master_url, segments).ok_or_else(|| FetchError::Url(master_url.to_string()))
}

impl BuildSource for BuildbotClient {
    fn master(&self, master_url: &str) -> Result<MasterJson, FetchError> {
        get_json(&self.client, &api_url(master_url, &["json"])?)
    }

    fn build(&self, master_url: &str, builder: &str, number: u64) -> Result<BuildJson, FetchError> {
        let number = number.to_string();
        let url = api_url(master_url, &["json", "builders", builder, "builds", &number])?;
        get_json(&self.client, &url)
    }

    fn builder_history(
        &self,
        master_url: &str,
        builder: &str,
    ) -> Result<BTreeMap<String, BuildJson>, FetchError> {
        let url = api_url(master_url, &["json", "builders", builder, "builds", "_all"])?;
        get_json(&self.history_client, &url)
    }
}
