use std::{collections::HashSet, thread};

use crossbeam_channel::{unbounded, Sender};
use thiserror::Error;

use crate::{
    magnet::{tracked_hashes, MagnetCandidate},
    model::TorrentRecord,
};

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("clipboard read failed: {0}")]
    Read(String),
}

pub trait ClipboardSource: Send {
    fn read_text(&mut self) -> Result<String, ClipboardError>;
}

/// System clipboard. The handle is opened lazily and reopened after failures
/// so a missing display at startup is not permanent.
#[derive(Default)]
pub struct SystemClipboard {
    inner: Option<arboard::Clipboard>,
}

impl ClipboardSource for SystemClipboard {
    fn read_text(&mut self) -> Result<String, ClipboardError> {
        if self.inner.is_none() {
            let clipboard = arboard::Clipboard::new()
                .map_err(|err| ClipboardError::Unavailable(err.to_string()))?;
            self.inner = Some(clipboard);
        }
        let Some(clipboard) = self.inner.as_mut() else {
            return Err(ClipboardError::Unavailable("no clipboard handle".to_string()));
        };
        match clipboard.get_text() {
            Ok(text) => Ok(text),
            Err(err) => {
                self.inner = None;
                Err(ClipboardError::Read(err.to_string()))
            }
        }
    }
}

/// Runs clipboard reads off the UI thread. Each request produces exactly one
/// reply through `reply`, `None` when the read failed.
pub fn spawn_clipboard_reader<C, F>(mut source: C, reply: F) -> (Sender<()>, thread::JoinHandle<()>)
where
    C: ClipboardSource + 'static,
    F: Fn(Option<String>) -> bool + Send + 'static,
{
    let (tx, rx) = unbounded::<()>();
    let handle = thread::spawn(move || {
        while rx.recv().is_ok() {
            let text = match source.read_text() {
                Ok(text) => Some(text),
                Err(err) => {
                    log::debug!("{err}");
                    None
                }
            };
            if !reply(text) {
                break;
            }
        }
    });
    (tx, handle)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WatcherState {
    #[default]
    Idle,
    Offering(MagnetCandidate),
}

/// Offers magnet links from the clipboard that are neither tracked by the
/// daemon nor already offered during this session.
#[derive(Debug, Default)]
pub struct MagnetWatcher {
    state: WatcherState,
    seen: HashSet<String>,
}

impl MagnetWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &WatcherState {
        &self.state
    }

    pub fn pending(&self) -> Option<&MagnetCandidate> {
        match &self.state {
            WatcherState::Offering(candidate) => Some(candidate),
            WatcherState::Idle => None,
        }
    }

    #[cfg(test)]
    pub fn has_seen(&self, raw: &str) -> bool {
        self.seen.contains(raw)
    }

    /// Feeds one clipboard read. Returns the newly offered candidate, if any.
    pub fn observe(
        &mut self,
        clipboard: Option<&str>,
        torrents: &[TorrentRecord],
    ) -> Option<&MagnetCandidate> {
        let candidate = MagnetCandidate::parse(clipboard?)?;
        if self.seen.contains(&candidate.raw) {
            return None;
        }
        if tracked_hashes(torrents).contains(&candidate.info_hash) {
            return None;
        }
        self.seen.insert(candidate.raw.clone());
        log::info!("new magnet link in clipboard: {}", candidate.label());
        self.state = WatcherState::Offering(candidate);
        self.pending()
    }

    /// Takes the pending candidate; the caller adds it to the daemon.
    pub fn accept(&mut self) -> Option<MagnetCandidate> {
        match std::mem::take(&mut self.state) {
            WatcherState::Offering(candidate) => Some(candidate),
            WatcherState::Idle => None,
        }
    }

    pub fn dismiss(&mut self) {
        self.state = WatcherState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        time::Duration,
    };

    use super::*;
    use crate::model::tests::record;

    const NEW_LINK: &str =
        "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&dn=Sintel";
    const TRACKED_LINK: &str =
        "magnet:?xt=urn:btih:08ada5a7a6183aae1e09d831df6748d566095a10&dn=Tears";

    fn tracked() -> Vec<TorrentRecord> {
        let mut torrent = record(1, "Tears");
        torrent.magnet_link = Some(TRACKED_LINK.to_string());
        vec![torrent]
    }

    #[test]
    fn offers_untracked_magnet() {
        let mut watcher = MagnetWatcher::new();
        let offered = watcher.observe(Some(NEW_LINK), &tracked()).cloned();
        let offered = offered.expect("offer");
        assert_eq!(offered.display_name.as_deref(), Some("Sintel"));
        assert_eq!(watcher.pending(), Some(&offered));
        assert!(watcher.has_seen(NEW_LINK));
    }

    #[test]
    fn ignores_magnet_already_tracked() {
        let mut watcher = MagnetWatcher::new();
        let same_hash = "magnet:?xt=urn:btih:08ADA5A7A6183AAE1E09D831DF6748D566095A10";
        assert!(watcher.observe(Some(same_hash), &tracked()).is_none());
        assert_eq!(watcher.state(), &WatcherState::Idle);
        assert!(!watcher.has_seen(same_hash));
    }

    #[test]
    fn dismissed_magnet_is_not_offered_again() {
        let mut watcher = MagnetWatcher::new();
        assert!(watcher.observe(Some(NEW_LINK), &[]).is_some());
        watcher.dismiss();
        assert_eq!(watcher.state(), &WatcherState::Idle);
        assert!(watcher.observe(Some(NEW_LINK), &[]).is_none());
        assert_eq!(watcher.state(), &WatcherState::Idle);
    }

    #[test]
    fn accepted_magnet_is_returned_once() {
        let mut watcher = MagnetWatcher::new();
        watcher.observe(Some(NEW_LINK), &[]);
        let accepted = watcher.accept().expect("candidate");
        assert_eq!(accepted.raw, NEW_LINK);
        assert!(watcher.accept().is_none());
        assert!(watcher.observe(Some(NEW_LINK), &[]).is_none());
    }

    #[test]
    fn unreadable_or_foreign_clipboard_changes_nothing() {
        let mut watcher = MagnetWatcher::new();
        assert!(watcher.observe(None, &[]).is_none());
        assert!(watcher.observe(Some("hello"), &[]).is_none());
        assert!(watcher.observe(Some("magnet:?xt=urn:btih:zz"), &[]).is_none());
        assert_eq!(watcher.state(), &WatcherState::Idle);
    }

    #[test]
    fn newer_candidate_replaces_pending_one() {
        let other = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&dn=Big";
        let mut watcher = MagnetWatcher::new();
        watcher.observe(Some(NEW_LINK), &[]);
        watcher.observe(Some(other), &[]);
        assert_eq!(watcher.pending().map(|c| c.raw.as_str()), Some(other));
        assert!(watcher.has_seen(NEW_LINK));
    }

    struct ScriptedClipboard {
        reads: VecDeque<Result<String, ClipboardError>>,
    }

    impl ClipboardSource for ScriptedClipboard {
        fn read_text(&mut self) -> Result<String, ClipboardError> {
            self.reads
                .pop_front()
                .unwrap_or_else(|| Err(ClipboardError::Read("empty".to_string())))
        }
    }

    #[test]
    fn reader_thread_answers_each_request() {
        let source = ScriptedClipboard {
            reads: VecDeque::from([
                Ok(NEW_LINK.to_string()),
                Err(ClipboardError::Unavailable("no display".to_string())),
            ]),
        };
        let (reply_tx, reply_rx) = unbounded();
        let (requests, handle) =
            spawn_clipboard_reader(source, move |text| reply_tx.send(text).is_ok());
        requests.send(()).unwrap();
        requests.send(()).unwrap();
        let first = reply_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = reply_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.as_deref(), Some(NEW_LINK));
        assert_eq!(second, None);
        drop(requests);
        handle.join().unwrap();
    }
}
