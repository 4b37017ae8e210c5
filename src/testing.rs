use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use crate::{
    model::{FreeSpace, TorrentRecord},
    rpc::{AddTorrentOutcome, RpcResult, TorrentDaemon, TransmissionError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Pause(i64),
    Resume(i64),
    Remove(i64, bool),
    AddFile(usize),
    AddMagnet(String),
}

/// In-memory daemon that records every command it receives.
#[derive(Default)]
pub struct FakeDaemon {
    pub torrents: Mutex<Vec<TorrentRecord>>,
    pub fail_fetches: Mutex<bool>,
    pub torrent_fetches: AtomicUsize,
    pub free_space_fetches: AtomicUsize,
    pub calls: Mutex<Vec<Call>>,
}

impl FakeDaemon {
    pub fn with_torrents(torrents: Vec<TorrentRecord>) -> Self {
        Self {
            torrents: Mutex::new(torrents),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn torrent_fetches(&self) -> usize {
        self.torrent_fetches.load(Ordering::SeqCst)
    }

    pub fn free_space_fetches(&self) -> usize {
        self.free_space_fetches.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_online(&self) -> RpcResult<()> {
        if *self.fail_fetches.lock().unwrap() {
            return Err(TransmissionError::Rpc("daemon offline".to_string()));
        }
        Ok(())
    }
}

impl TorrentDaemon for FakeDaemon {
    fn fetch_torrents(&self) -> RpcResult<Vec<TorrentRecord>> {
        self.torrent_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self.torrents.lock().unwrap().clone())
    }

    fn free_space(&self, path: Option<&str>) -> RpcResult<FreeSpace> {
        self.free_space_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(FreeSpace {
            path: path.unwrap_or("/downloads").to_string(),
            size_bytes: 5_368_709_120,
            total_size: None,
        })
    }

    fn pause_torrent(&self, id: i64) -> RpcResult<()> {
        self.record(Call::Pause(id));
        Ok(())
    }

    fn resume_torrent(&self, id: i64) -> RpcResult<()> {
        self.record(Call::Resume(id));
        Ok(())
    }

    fn remove_torrent(&self, id: i64, delete_local_data: bool) -> RpcResult<()> {
        self.record(Call::Remove(id, delete_local_data));
        Ok(())
    }

    fn add_torrent_file(&self, metainfo: &[u8]) -> RpcResult<AddTorrentOutcome> {
        self.record(Call::AddFile(metainfo.len()));
        Ok(AddTorrentOutcome {
            torrent_id: Some(100),
            name: Some("file".to_string()),
            added: true,
            duplicate: false,
        })
    }

    fn add_magnet(&self, magnet: &str) -> RpcResult<AddTorrentOutcome> {
        self.record(Call::AddMagnet(magnet.to_string()));
        Ok(AddTorrentOutcome {
            torrent_id: Some(101),
            name: None,
            added: true,
            duplicate: false,
        })
    }
}
