use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{blocking::Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::{serde_as, DefaultOnNull};
use thiserror::Error;

use crate::{
    config::RpcConfig,
    model::{FreeSpace, PeerCounts, TorrentRecord, TorrentState},
};

#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("authentication failed")]
    Authentication,
    #[error("session negotiation failed")]
    Session,
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("response parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type RpcResult<T> = std::result::Result<T, TransmissionError>;

/// Operations the dashboard needs from the daemon.
pub trait TorrentDaemon: Send + Sync {
    fn fetch_torrents(&self) -> RpcResult<Vec<TorrentRecord>>;

    /// Free space for `path`, or for the daemon's download directory.
    fn free_space(&self, path: Option<&str>) -> RpcResult<FreeSpace>;

    fn pause_torrent(&self, id: i64) -> RpcResult<()>;

    fn resume_torrent(&self, id: i64) -> RpcResult<()>;

    fn remove_torrent(&self, id: i64, delete_local_data: bool) -> RpcResult<()>;

    fn add_torrent_file(&self, metainfo: &[u8]) -> RpcResult<AddTorrentOutcome>;

    fn add_magnet(&self, magnet: &str) -> RpcResult<AddTorrentOutcome>;
}

const TORRENT_FIELDS: &[&str] = &[
    "id",
    "name",
    "status",
    "error",
    "errorString",
    "percentDone",
    "rateDownload",
    "rateUpload",
    "eta",
    "peersConnected",
    "peersSendingToUs",
    "downloadedEver",
    "uploadedEver",
    "sizeWhenDone",
    "leftUntilDone",
    "uploadRatio",
    "downloadDir",
    "hashString",
    "magnetLink",
    "trackerStats",
];

pub struct TransmissionClient {
    http: Client,
    endpoint: String,
    auth: Option<(String, Option<String>)>,
    session_id: Mutex<Option<String>>,
    counter: AtomicU64,
}

impl TransmissionClient {
    pub fn new(config: RpcConfig) -> Result<Self> {
        let endpoint = config.endpoint();
        let RpcConfig {
            username,
            password,
            timeout,
            verify_ssl,
            user_agent,
            ..
        } = config;
        let mut builder = Client::builder().timeout(timeout).user_agent(user_agent);
        if !verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;
        let auth = username.map(|user| (user, password));
        Ok(Self {
            http,
            endpoint,
            auth,
            session_id: Mutex::new(None),
            counter: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn download_dir(&self) -> RpcResult<String> {
        let args = json!({ "fields": ["download-dir"] });
        let session: SessionInfo = self.call("session-get", Some(args))?;
        session.download_dir.ok_or_else(|| {
            TransmissionError::Rpc("daemon did not report download-dir".to_string())
        })
    }

    fn set_ids(&self, method: &str, ids: &[i64]) -> RpcResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.call_raw(method, Some(json!({ "ids": ids })))?;
        Ok(())
    }

    fn call<T>(&self, method: &str, arguments: Option<Value>) -> RpcResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let value = self.call_raw(method, arguments)?;
        serde_json::from_value(value).map_err(TransmissionError::from)
    }

    fn call_raw(&self, method: &str, arguments: Option<Value>) -> RpcResult<Value> {
        let payload = RpcRequest {
            method,
            arguments,
            tag: self.counter.fetch_add(1, Ordering::Relaxed),
        };
        loop {
            let mut request = self
                .http
                .post(&self.endpoint)
                .header("Content-Type", "application/json")
                .json(&payload);
            if let Some((user, pass)) = &self.auth {
                request = request.basic_auth(user, pass.as_ref());
            }
            let session_header = match self.session_id.lock() {
                Ok(guard) => (*guard).clone(),
                Err(_) => None,
            };
            if let Some(session) = &session_header {
                request = request.header("X-Transmission-Session-Id", session.as_str());
            }
            let response = request.send()?;
            match response.status() {
                StatusCode::CONFLICT => {
                    let Some(id) = response.headers().get("X-Transmission-Session-Id") else {
                        return Err(TransmissionError::Session);
                    };
                    let value = id
                        .to_str()
                        .map_err(|_| TransmissionError::Session)?
                        .to_string();
                    // The daemon rejecting the id it just issued would loop forever.
                    if session_header.as_deref() == Some(value.as_str()) {
                        return Err(TransmissionError::Session);
                    }
                    if let Ok(mut guard) = self.session_id.lock() {
                        *guard = Some(value);
                    }
                    log::debug!("renewed transmission session id");
                }
                StatusCode::UNAUTHORIZED => return Err(TransmissionError::Authentication),
                status if !status.is_success() => {
                    return Err(TransmissionError::HttpStatus(status));
                }
                _ => {
                    let body: RpcResponse = response.json()?;
                    if body.result != "success" {
                        return Err(TransmissionError::Rpc(body.result));
                    }
                    return Ok(body.arguments.unwrap_or(Value::Null));
                }
            }
        }
    }
}

impl TorrentDaemon for TransmissionClient {
    fn fetch_torrents(&self) -> RpcResult<Vec<TorrentRecord>> {
        let response: TorrentGetResponse =
            self.call("torrent-get", Some(json!({ "fields": TORRENT_FIELDS })))?;
        Ok(response
            .torrents
            .into_iter()
            .map(TorrentRecord::from)
            .collect())
    }

    fn free_space(&self, path: Option<&str>) -> RpcResult<FreeSpace> {
        let path = match path {
            Some(path) => path.to_string(),
            None => self.download_dir()?,
        };
        let response: FreeSpaceResponse = self.call("free-space", Some(json!({ "path": path })))?;
        Ok(FreeSpace {
            path: response.path.unwrap_or(path),
            size_bytes: response.size_bytes,
            total_size: response.total_size,
        })
    }

    fn pause_torrent(&self, id: i64) -> RpcResult<()> {
        self.set_ids("torrent-stop", &[id])
    }

    fn resume_torrent(&self, id: i64) -> RpcResult<()> {
        self.set_ids("torrent-start", &[id])
    }

    fn remove_torrent(&self, id: i64, delete_local_data: bool) -> RpcResult<()> {
        let args = json!({
            "ids": [id],
            "delete-local-data": delete_local_data,
        });
        self.call_raw("torrent-remove", Some(args))?;
        Ok(())
    }

    fn add_torrent_file(&self, metainfo: &[u8]) -> RpcResult<AddTorrentOutcome> {
        let args = json!({
            "metainfo": STANDARD.encode(metainfo),
        });
        let response: AddTorrentResponse = self.call("torrent-add", Some(args))?;
        Ok(AddTorrentOutcome::from(response))
    }

    fn add_magnet(&self, magnet: &str) -> RpcResult<AddTorrentOutcome> {
        let args = json!({
            "filename": magnet,
        });
        let response: AddTorrentResponse = self.call("torrent-add", Some(args))?;
        Ok(AddTorrentOutcome::from(response))
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
    tag: u64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    arguments: Option<Value>,
    result: String,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    #[serde(rename = "download-dir", alias = "download_dir")]
    download_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FreeSpaceResponse {
    path: Option<String>,
    #[serde(default, rename = "size-bytes", alias = "size_bytes")]
    size_bytes: i64,
    #[serde(default, alias = "total-size")]
    total_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TorrentGetResponse {
    #[serde(default)]
    torrents: Vec<TorrentWire>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct TorrentWire {
    id: i64,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: i64,
    #[serde(default)]
    error: i64,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default, alias = "errorString")]
    error_string: String,
    #[serde(default, alias = "percentDone")]
    percent_done: f64,
    #[serde(default, alias = "rateDownload")]
    rate_download: i64,
    #[serde(default, alias = "rateUpload")]
    rate_upload: i64,
    #[serde(default = "unknown_eta")]
    eta: i64,
    #[serde(default, alias = "peersConnected")]
    peers_connected: i64,
    #[serde(default, alias = "peersSendingToUs")]
    peers_sending_to_us: i64,
    #[serde(default, alias = "downloadedEver")]
    downloaded_ever: i64,
    #[serde(default, alias = "uploadedEver")]
    uploaded_ever: i64,
    #[serde(default, alias = "sizeWhenDone")]
    size_when_done: i64,
    #[serde(default, alias = "leftUntilDone")]
    left_until_done: i64,
    #[serde(default, alias = "uploadRatio")]
    upload_ratio: f64,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default, alias = "downloadDir")]
    download_dir: String,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default, alias = "hashString")]
    hash_string: String,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default, alias = "magnetLink")]
    magnet_link: String,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default, alias = "trackerStats")]
    tracker_stats: Vec<TrackerStatWire>,
}

fn unknown_eta() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
struct TrackerStatWire {
    #[serde(default, alias = "seederCount")]
    seeder_count: i64,
    #[serde(default, alias = "leecherCount")]
    leecher_count: i64,
}

impl From<TorrentWire> for TorrentRecord {
    fn from(wire: TorrentWire) -> Self {
        // Trackers report -1 when they have not scraped yet.
        let total_seeds = wire
            .tracker_stats
            .iter()
            .map(|stat| stat.seeder_count.max(0))
            .sum();
        let total_peers = wire
            .tracker_stats
            .iter()
            .map(|stat| stat.leecher_count.max(0))
            .sum();
        TorrentRecord {
            id: wire.id,
            name: wire.name,
            state: TorrentState::from_rpc(wire.status, wire.error),
            progress: wire.percent_done.clamp(0.0, 1.0),
            download_rate: wire.rate_download,
            upload_rate: wire.rate_upload,
            eta: u64::try_from(wire.eta).ok(),
            peers: PeerCounts {
                connected: wire.peers_connected,
                total: total_peers,
            },
            seeds: PeerCounts {
                connected: wire.peers_sending_to_us,
                total: total_seeds,
            },
            downloaded_ever: wire.downloaded_ever,
            uploaded_ever: wire.uploaded_ever,
            size_when_done: wire.size_when_done,
            is_completed: wire.left_until_done < 1,
            left_until_done: wire.left_until_done,
            upload_ratio: wire.upload_ratio,
            download_dir: wire.download_dir,
            hash_string: wire.hash_string,
            magnet_link: Some(wire.magnet_link).filter(|link| !link.is_empty()),
            error: Some(wire.error_string).filter(|err| !err.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddTorrentResponse {
    #[serde(rename = "torrent-added", alias = "torrentAdded", alias = "torrent_added")]
    torrent_added: Option<TorrentRef>,
    #[serde(
        rename = "torrent-duplicate",
        alias = "torrentDuplicate",
        alias = "torrent_duplicate"
    )]
    torrent_duplicate: Option<TorrentRef>,
}

#[derive(Debug, Deserialize)]
struct TorrentRef {
    id: Option<i64>,
    name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddTorrentOutcome {
    pub torrent_id: Option<i64>,
    pub name: Option<String>,
    pub added: bool,
    pub duplicate: bool,
}

impl From<AddTorrentResponse> for AddTorrentOutcome {
    fn from(resp: AddTorrentResponse) -> Self {
        if let Some(added) = resp.torrent_added {
            AddTorrentOutcome {
                torrent_id: added.id,
                name: added.name,
                added: true,
                duplicate: false,
            }
        } else if let Some(dup) = resp.torrent_duplicate {
            AddTorrentOutcome {
                torrent_id: dup.id,
                name: dup.name,
                added: false,
                duplicate: true,
            }
        } else {
            AddTorrentOutcome {
                torrent_id: None,
                name: None,
                added: false,
                duplicate: false,
            }
        }
    }
}
