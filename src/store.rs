use crate::{
    model::{FreeSpace, SnapshotDiff, TorrentSnapshot},
    rpc::RpcResult,
};

/// Monotonic per-kind sequence number stamped on every poll request.
pub type PollSeq = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected(String),
}

/// What applying a poll result did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied<T> {
    Updated(T),
    /// An answer to a request older than one already applied.
    Stale,
    Failed,
}

/// The local view of the daemon. Only poll results mutate it.
#[derive(Debug)]
pub struct SnapshotStore {
    torrents: TorrentSnapshot,
    free_space: Option<FreeSpace>,
    free_space_error: Option<String>,
    connection: ConnectionState,
    torrents_seq: Option<PollSeq>,
    free_space_seq: Option<PollSeq>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self {
            torrents: TorrentSnapshot::default(),
            free_space: None,
            free_space_error: None,
            connection: ConnectionState::Connecting,
            torrents_seq: None,
            free_space_seq: None,
        }
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn torrents(&self) -> &TorrentSnapshot {
        &self.torrents
    }

    pub fn free_space(&self) -> Option<&FreeSpace> {
        self.free_space.as_ref()
    }

    /// Why the last free-space poll failed, if it did. Free-space failures
    /// leave the connection state alone; a bad path is not an outage.
    pub fn free_space_error(&self) -> Option<&str> {
        self.free_space_error.as_deref()
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn has_torrents(&self) -> bool {
        self.torrents_seq.is_some()
    }

    /// Replaces the torrent list with `result` unless a newer request has
    /// already been applied. Failures keep the stale list.
    pub fn apply_torrents(
        &mut self,
        seq: PollSeq,
        result: RpcResult<TorrentSnapshot>,
    ) -> Applied<SnapshotDiff> {
        if is_stale(self.torrents_seq, seq) {
            return Applied::Stale;
        }
        match result {
            Ok(snapshot) => {
                self.torrents_seq = Some(seq);
                let diff = self.torrents.reconcile(&snapshot);
                self.torrents = snapshot;
                self.connection = ConnectionState::Connected;
                Applied::Updated(diff)
            }
            Err(err) => {
                self.connection = ConnectionState::Disconnected(err.to_string());
                Applied::Failed
            }
        }
    }

    pub fn apply_free_space(&mut self, seq: PollSeq, result: RpcResult<FreeSpace>) -> Applied<()> {
        if is_stale(self.free_space_seq, seq) {
            return Applied::Stale;
        }
        match result {
            Ok(space) => {
                self.free_space_seq = Some(seq);
                self.free_space = Some(space);
                self.free_space_error = None;
                Applied::Updated(())
            }
            Err(err) => {
                self.free_space_error = Some(err.to_string());
                Applied::Failed
            }
        }
    }

}

fn is_stale(applied: Option<PollSeq>, incoming: PollSeq) -> bool {
    applied.is_some_and(|last| incoming <= last)
}
