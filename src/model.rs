use std::{collections::HashSet, fmt};

/// Lifecycle state of a torrent as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    Downloading,
    Seeding,
    Paused,
    Queued,
    Checking,
    Error,
    Unknown(i64),
}

impl TorrentState {
    /// Maps Transmission's numeric `status` plus its `error` code.
    /// Error code 3 is a local error (disk, missing data) and overrides status.
    pub fn from_rpc(status: i64, error: i64) -> Self {
        if error == 3 {
            return TorrentState::Error;
        }
        match status {
            0 => TorrentState::Paused,
            1 | 2 => TorrentState::Checking,
            3 | 5 => TorrentState::Queued,
            4 => TorrentState::Downloading,
            6 => TorrentState::Seeding,
            other => TorrentState::Unknown(other),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TorrentState::Downloading => "downloading",
            TorrentState::Seeding => "seeding",
            TorrentState::Paused => "paused",
            TorrentState::Queued => "queued",
            TorrentState::Checking => "checking",
            TorrentState::Error => "error",
            TorrentState::Unknown(_) => "unknown",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, TorrentState::Downloading | TorrentState::Seeding)
    }
}

impl fmt::Display for TorrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentState::Unknown(code) => write!(f, "status-{code}"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCounts {
    pub connected: i64,
    pub total: i64,
}

impl fmt::Display for PeerCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connected, self.total)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TorrentRecord {
    pub id: i64,
    pub name: String,
    pub state: TorrentState,
    pub progress: f64,
    pub download_rate: i64,
    pub upload_rate: i64,
    /// Seconds remaining; `None` when the daemon reports it as unknown.
    pub eta: Option<u64>,
    pub peers: PeerCounts,
    pub seeds: PeerCounts,
    pub downloaded_ever: i64,
    pub uploaded_ever: i64,
    pub size_when_done: i64,
    pub left_until_done: i64,
    pub upload_ratio: f64,
    pub download_dir: String,
    pub hash_string: String,
    pub magnet_link: Option<String>,
    pub error: Option<String>,
    pub is_completed: bool,
}

/// Free space reported by the daemon for one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSpace {
    pub path: String,
    pub size_bytes: i64,
    pub total_size: Option<i64>,
}

impl FreeSpace {
    pub fn metric(&self) -> i64 {
        self.total_size.unwrap_or(self.size_bytes)
    }
}

/// The complete torrent list from one poll. Replaced wholesale, never merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorrentSnapshot {
    pub torrents: Vec<TorrentRecord>,
}

impl TorrentSnapshot {
    pub fn new(torrents: Vec<TorrentRecord>) -> Self {
        Self { torrents }
    }

    pub fn len(&self) -> usize {
        self.torrents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.torrents.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&TorrentRecord> {
        self.torrents.iter().find(|torrent| torrent.id == id)
    }

    pub fn total_downloaded(&self) -> i64 {
        self.torrents.iter().map(|t| t.downloaded_ever).sum()
    }

    pub fn total_uploaded(&self) -> i64 {
        self.torrents.iter().map(|t| t.uploaded_ever).sum()
    }

    pub fn download_rate(&self) -> i64 {
        self.torrents.iter().map(|t| t.download_rate).sum()
    }

    pub fn upload_rate(&self) -> i64 {
        self.torrents.iter().map(|t| t.upload_rate).sum()
    }

    /// Compares this snapshot with its successor by torrent id.
    pub fn reconcile(&self, next: &TorrentSnapshot) -> SnapshotDiff {
        let before: HashSet<i64> = self.torrents.iter().map(|t| t.id).collect();
        let after: HashSet<i64> = next.torrents.iter().map(|t| t.id).collect();
        let added = next
            .torrents
            .iter()
            .map(|t| t.id)
            .filter(|id| !before.contains(id))
            .collect();
        let removed = self
            .torrents
            .iter()
            .map(|t| t.id)
            .filter(|id| !after.contains(id))
            .collect();
        let retained = before.intersection(&after).count();
        SnapshotDiff {
            added,
            removed,
            retained,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<i64>,
    pub removed: Vec<i64>,
    pub retained: usize,
}

impl SnapshotDiff {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Binary magnitudes with JEDEC labels, at most two decimals: 5 GiB reads "5 GB".
pub fn format_size(value: i64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut magnitude = value.max(0) as f64;
    let mut unit = 0;
    while magnitude >= 1024.0 && unit < UNITS.len() - 1 {
        magnitude /= 1024.0;
        unit += 1;
    }
    let rounded = format!("{magnitude:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[unit])
}

pub fn format_rate(value: i64) -> String {
    format!("{}/s", format_size(value))
}

pub fn format_progress(value: f64) -> String {
    format!("{:.2}%", value * 100.0)
}

pub fn format_eta(seconds: u64) -> String {
    let days = seconds as f64 / 86_400.0;
    if days > 1.0 {
        let whole = days.floor() as u64;
        let noun = if whole == 1 { "day" } else { "days" };
        return format!("{whole} {noun}");
    }
    if seconds >= 3_600 {
        format!("{} hr", seconds / 3_600)
    } else if seconds >= 60 {
        format!("{} min", seconds / 60)
    } else {
        format!("{seconds} sec")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn record(id: i64, name: &str) -> TorrentRecord {
        TorrentRecord {
            id,
            name: name.to_string(),
            state: TorrentState::Downloading,
            progress: 0.5,
            download_rate: 0,
            upload_rate: 0,
            eta: None,
            peers: PeerCounts::default(),
            seeds: PeerCounts::default(),
            downloaded_ever: 0,
            uploaded_ever: 0,
            size_when_done: 0,
            left_until_done: 0,
            upload_ratio: 0.0,
            download_dir: "/downloads".to_string(),
            hash_string: String::new(),
            magnet_link: None,
            error: None,
            is_completed: false,
        }
    }

    #[test]
    fn eta_uses_largest_whole_unit() {
        assert_eq!(format_eta(125), "2 min");
        assert_eq!(format_eta(90_000), "1 day");
        assert_eq!(format_eta(200_000), "2 days");
        assert_eq!(format_eta(7_200), "2 hr");
        assert_eq!(format_eta(42), "42 sec");
    }

    #[test]
    fn exactly_one_day_reads_as_hours() {
        assert_eq!(format_eta(86_400), "24 hr");
    }

    #[test]
    fn sizes_use_binary_magnitudes() {
        assert_eq!(format_size(5_368_709_120), "5 GB");
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1_536), "1.5 KB");
        assert_eq!(format_size(-20), "0 B");
        assert_eq!(format_rate(2_048), "2 KB/s");
    }

    #[test]
    fn progress_has_two_decimals() {
        assert_eq!(format_progress(0.5), "50.00%");
        assert_eq!(format_progress(1.0), "100.00%");
    }

    #[test]
    fn status_codes_map_to_states() {
        assert_eq!(TorrentState::from_rpc(0, 0), TorrentState::Paused);
        assert_eq!(TorrentState::from_rpc(4, 0), TorrentState::Downloading);
        assert_eq!(TorrentState::from_rpc(6, 0), TorrentState::Seeding);
        assert_eq!(TorrentState::from_rpc(5, 0), TorrentState::Queued);
        assert_eq!(TorrentState::from_rpc(4, 3), TorrentState::Error);
        assert_eq!(TorrentState::from_rpc(9, 0).to_string(), "status-9");
    }

    #[test]
    fn reconcile_reports_added_and_removed_ids() {
        let before = TorrentSnapshot::new(vec![record(1, "a"), record(2, "b"), record(3, "c")]);
        let after = TorrentSnapshot::new(vec![record(3, "c"), record(4, "d"), record(1, "a")]);
        let diff = before.reconcile(&after);
        assert_eq!(diff.added, vec![4]);
        assert_eq!(diff.removed, vec![2]);
        assert_eq!(diff.retained, 2);
        assert!(!diff.is_unchanged());
        assert!(after.reconcile(&after).is_unchanged());
    }

    #[test]
    fn totals_sum_over_records() {
        let mut a = record(1, "a");
        a.downloaded_ever = 100;
        a.uploaded_ever = 10;
        let mut b = record(2, "b");
        b.downloaded_ever = 50;
        b.uploaded_ever = 5;
        let snapshot = TorrentSnapshot::new(vec![a, b]);
        assert_eq!(snapshot.total_downloaded(), 150);
        assert_eq!(snapshot.total_uploaded(), 15);
    }

    #[test]
    fn free_space_prefers_total_size() {
        let space = FreeSpace {
            path: "/downloads".to_string(),
            size_bytes: 10,
            total_size: Some(5_368_709_120),
        };
        assert_eq!(format_size(space.metric()), "5 GB");
        let legacy = FreeSpace {
            total_size: None,
            ..space
        };
        assert_eq!(legacy.metric(), 10);
    }
}
