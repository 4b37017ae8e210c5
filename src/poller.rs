use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};

use crate::{
    config::PollConfig,
    model::{FreeSpace, TorrentSnapshot},
    rpc::{RpcResult, TorrentDaemon},
    store::PollSeq,
};

pub enum PollEvent {
    Torrents {
        seq: PollSeq,
        result: RpcResult<TorrentSnapshot>,
    },
    FreeSpace {
        seq: PollSeq,
        result: RpcResult<FreeSpace>,
    },
}

/// Owns the two refresh timers. Dropping the handle cancels them; `stop`
/// additionally waits for an in-flight request to finish.
pub struct PollerHandle {
    stop_tx: Option<Sender<()>>,
    refresh_tx: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl PollerHandle {
    /// Fetches the torrent list out of schedule.
    pub fn refresh_now(&self) -> bool {
        self.refresh_tx
            .as_ref()
            .is_some_and(|tx| tx.send(()).is_ok())
    }

    pub fn stop(mut self) {
        self.cancel();
        for handle in self.threads.drain(..) {
            handle.join().ok();
        }
    }

    fn cancel(&mut self) {
        self.stop_tx.take();
        self.refresh_tx.take();
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Fetches free space and the torrent list once, then keeps refreshing each
/// on its own fixed interval. Results go to `sink`; a `false` return from
/// the sink ends polling.
pub fn start<F>(daemon: Arc<dyn TorrentDaemon>, config: PollConfig, sink: F) -> PollerHandle
where
    F: Fn(PollEvent) -> bool + Send + Sync + 'static,
{
    let sink = Arc::new(sink);
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let (refresh_tx, refresh_rx) = unbounded::<()>();

    let free_space = {
        let daemon = Arc::clone(&daemon);
        let sink = Arc::clone(&sink);
        let stop_rx = stop_rx.clone();
        let path = config.free_space_path.clone();
        thread::spawn(move || {
            let fetch = |seq| {
                let result = daemon.free_space(path.as_deref());
                if let Err(err) = &result {
                    log::warn!("free space refresh failed: {err}");
                }
                sink(PollEvent::FreeSpace { seq, result })
            };
            run_timer(config.free_space, &stop_rx, None, fetch);
        })
    };

    let torrents = thread::spawn(move || {
        let fetch = |seq| {
            let result = daemon.fetch_torrents().map(TorrentSnapshot::new);
            match &result {
                Ok(snapshot) => log::debug!("poll {seq}: {} torrents", snapshot.len()),
                Err(err) => log::warn!("torrent refresh failed: {err}"),
            }
            sink(PollEvent::Torrents { seq, result })
        };
        run_timer(config.torrents, &stop_rx, Some(&refresh_rx), fetch);
    });

    PollerHandle {
        stop_tx: Some(stop_tx),
        refresh_tx: Some(refresh_tx),
        threads: vec![free_space, torrents],
    }
}

/// Runs `fetch` immediately and then on every tick. The fetch runs on the
/// timer thread, so ticks that fire while a request is outstanding are dropped
/// rather than queued.
fn run_timer<F>(interval: Duration, stop: &Receiver<()>, refresh: Option<&Receiver<()>>, fetch: F)
where
    F: Fn(PollSeq) -> bool,
{
    let mut seq: PollSeq = 1;
    if !fetch(seq) {
        return;
    }
    let ticker = tick(interval);
    let never = crossbeam_channel::never();
    let refresh = refresh.unwrap_or(&never);
    loop {
        let wake = select! {
            recv(stop) -> _ => false,
            recv(ticker) -> _ => true,
            recv(refresh) -> msg => msg.is_ok(),
        };
        if !wake {
            break;
        }
        seq += 1;
        if !fetch(seq) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::{model::tests::record, testing::FakeDaemon};

    fn config(torrents_ms: u64, free_space_ms: u64) -> PollConfig {
        PollConfig {
            torrents: Duration::from_millis(torrents_ms),
            free_space: Duration::from_millis(free_space_ms),
            free_space_path: Some("/data".to_string()),
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn fetches_both_immediately() {
        let daemon = Arc::new(FakeDaemon::with_torrents(vec![record(1, "a")]));
        let (tx, rx) = unbounded();
        let handle = start(daemon.clone(), config(60_000, 60_000), move |event| {
            tx.send(event).is_ok()
        });
        let mut saw_torrents = false;
        let mut saw_space = false;
        for _ in 0..2 {
            match rx.recv_timeout(Duration::from_secs(2)).expect("event") {
                PollEvent::Torrents { seq, result } => {
                    assert_eq!(seq, 1);
                    assert_eq!(result.unwrap().len(), 1);
                    saw_torrents = true;
                }
                PollEvent::FreeSpace { seq, result } => {
                    assert_eq!(seq, 1);
                    assert_eq!(result.unwrap().path, "/data");
                    saw_space = true;
                }
            }
        }
        assert!(saw_torrents && saw_space);
        handle.stop();
    }

    #[test]
    fn timers_run_independently() {
        let daemon = Arc::new(FakeDaemon::default());
        let handle = start(daemon.clone(), config(10, 60_000), |_| true);
        assert!(wait_until(Duration::from_secs(2), || daemon.torrent_fetches() >= 4));
        assert!(wait_until(Duration::from_secs(2), || daemon.free_space_fetches() == 1));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(daemon.free_space_fetches(), 1);
        handle.stop();
    }

    #[test]
    fn sequence_numbers_increase() {
        let daemon = Arc::new(FakeDaemon::default());
        let (tx, rx) = unbounded();
        let handle = start(daemon, config(10, 60_000), move |event| {
            if let PollEvent::Torrents { seq, .. } = event {
                return tx.send(seq).is_ok();
            }
            true
        });
        let seqs: Vec<PollSeq> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("tick"))
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        handle.stop();
    }

    #[test]
    fn refresh_now_fetches_out_of_schedule() {
        let daemon = Arc::new(FakeDaemon::default());
        let handle = start(daemon.clone(), config(60_000, 60_000), |_| true);
        assert!(wait_until(Duration::from_secs(2), || daemon.torrent_fetches() == 1));
        assert!(handle.refresh_now());
        assert!(wait_until(Duration::from_secs(2), || daemon.torrent_fetches() == 2));
        assert!(daemon.free_space_fetches() <= 1);
        handle.stop();
    }

    #[test]
    fn stop_cancels_timers() {
        let daemon = Arc::new(FakeDaemon::default());
        let handle = start(daemon.clone(), config(5, 5), |_| true);
        assert!(wait_until(Duration::from_secs(2), || daemon.torrent_fetches() >= 2));
        handle.stop();
        let torrents = daemon.torrent_fetches();
        let space = daemon.free_space_fetches();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(daemon.torrent_fetches(), torrents);
        assert_eq!(daemon.free_space_fetches(), space);
    }

    #[test]
    fn closed_sink_ends_polling() {
        let daemon = Arc::new(FakeDaemon::default());
        let handle = start(daemon.clone(), config(5, 60_000), |_| false);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(daemon.torrent_fetches(), 1);
        handle.stop();
    }

    #[test]
    fn failed_fetch_is_reported_not_retried() {
        let daemon = Arc::new(FakeDaemon::default());
        *daemon.fail_fetches.lock().unwrap() = true;
        let (tx, rx) = unbounded();
        let handle = start(daemon.clone(), config(60_000, 60_000), move |event| {
            tx.send(event).is_ok()
        });
        for _ in 0..2 {
            let failed = match rx.recv_timeout(Duration::from_secs(2)).expect("event") {
                PollEvent::Torrents { result, .. } => result.is_err(),
                PollEvent::FreeSpace { result, .. } => result.is_err(),
            };
            assert!(failed);
        }
        thread::sleep(Duration::from_millis(30));
        assert_eq!(daemon.torrent_fetches(), 1);
        handle.stop();
    }
}
