//! etcd v2 keys API client.
//!
//! Peers are tried in order for every request; the first one that
//! answers moves to the front of the list.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use url::Url;

use super::{CoordinationStore, DirStatus, StoreError};

/// "Key already exists"
const ERR_NODE_EXIST: u64 = 105;

pub struct EtcdStore {
    http: Client,
    peers: Vec<Url>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "errorCode")]
    code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<Member>,
}

#[derive(Debug, Deserialize)]
struct Member {
    #[serde(rename = "clientURLs", default)]
    client_urls: Vec<String>,
}

impl EtcdStore {
    pub fn new(peers: &[String], timeout: Duration) -> Result<Self> {
        let peers = peers
            .iter()
            .map(|p| parse_peer(p))
            .collect::<Result<Vec<_>>>()?;
        if peers.is_empty() {
            return Err(anyhow!("at least one etcd peer is required"));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build etcd HTTP client")?;
        Ok(Self { http, peers })
    }

    pub fn peers(&self) -> &[Url] {
        &self.peers
    }

    async fn send<F>(&mut self, build: F) -> Result<Response, StoreError>
    where
        F: Fn(&Client, &Url) -> RequestBuilder + Send + Sync,
    {
        let mut last_error = String::from("no peers configured");
        for i in 0..self.peers.len() {
            match build(&self.http, &self.peers[i]).send().await {
                Ok(resp) => {
                    if i > 0 {
                        let peer = self.peers.remove(i);
                        self.peers.insert(0, peer);
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    debug!("etcd peer {} failed: {}", self.peers[i], e);
                    last_error = format!("{}: {}", self.peers[i], e);
                }
            }
        }
        Err(StoreError::Unreachable(last_error))
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn sync_cluster(&mut self) -> Result<(), StoreError> {
        let resp = self
            .send(|http, peer| http.get(endpoint(peer, "/v2/members")))
            .await?;
        let members: MembersResponse = check(resp)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))?;
        let peers = client_urls(members)?;
        debug!("Synced etcd cluster: {} peers", peers.len());
        self.peers = peers;
        Ok(())
    }

    async fn create_dir(&mut self, dir: &str) -> Result<DirStatus, StoreError> {
        let resp = self
            .send(|http, peer| {
                http.put(keys_url(peer, dir))
                    .query(&[("dir", "true"), ("prevExist", "false")])
            })
            .await?;
        match check(resp).await {
            Ok(_) => Ok(DirStatus::Created),
            Err(StoreError::Api { code, .. }) if code == ERR_NODE_EXIST => Ok(DirStatus::Existing),
            Err(e) => Err(e),
        }
    }

    async fn set(&mut self, key: &str, value: &str, ttl: u64) -> Result<(), StoreError> {
        let ttl = ttl.to_string();
        let resp = self
            .send(|http, peer| {
                http.put(keys_url(peer, key))
                    .form(&[("value", value), ("ttl", ttl.as_str())])
            })
            .await?;
        check(resp).await?;
        Ok(())
    }
}

fn parse_peer(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("Invalid etcd peer `{}`", raw))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(anyhow!("Unsupported etcd peer scheme `{}` in {}", other, raw)),
    }
}

fn endpoint(peer: &Url, path: &str) -> Url {
    let mut url = peer.clone();
    url.set_path(path);
    url
}

fn keys_url(peer: &Url, key: &str) -> Url {
    endpoint(peer, &format!("/v2/keys{}", key))
}

async fn check(resp: Response) -> Result<Response, StoreError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| StoreError::Protocol(e.to_string()))?;
    Err(api_error(status.as_u16(), &body))
}

fn api_error(status: u16, body: &str) -> StoreError {
    match serde_json::from_str::<ApiError>(body) {
        Ok(e) => StoreError::Api {
            code: e.code,
            message: e.message,
            cause: e.cause,
        },
        Err(_) => StoreError::Protocol(format!("HTTP {}: {}", status, body.trim())),
    }
}

fn client_urls(members: MembersResponse) -> Result<Vec<Url>, StoreError> {
    let mut peers: Vec<Url> = Vec::new();
    for raw in members.members.into_iter().flat_map(|m| m.client_urls) {
        match Url::parse(&raw) {
            Ok(url) if !peers.contains(&url) => peers.push(url),
            Ok(_) => {}
            Err(e) => debug!("Ignoring member client URL {}: {}", raw, e),
        }
    }
    if peers.is_empty() {
        return Err(StoreError::NoMembers);
    }
    Ok(peers)
}
