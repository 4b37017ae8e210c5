use std::{
    fs,
    io::{self, Stdout},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::{
    event::{
        self, DisableBracketedPaste, DisableFocusChange, EnableBracketedPaste, EnableFocusChange,
        Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};

use crate::{
    config::AppConfig,
    model::{format_eta, format_progress, format_rate, format_size, TorrentRecord, TorrentState},
    poller::{self, PollEvent, PollerHandle},
    rpc::{AddTorrentOutcome, RpcResult, TorrentDaemon, TransmissionClient},
    store::{Applied, ConnectionState, SnapshotStore},
    watcher::{spawn_clipboard_reader, MagnetWatcher, SystemClipboard, WatcherState},
};

type Backend = ratatui::backend::CrosstermBackend<Stdout>;

pub fn run(config: AppConfig) -> Result<()> {
    let client = TransmissionClient::new(config.rpc.clone())
        .context("failed to construct Transmission RPC client")?;
    let connection_label = client.endpoint().to_string();
    let daemon: Arc<dyn TorrentDaemon> = Arc::new(client);
    let mut terminal = setup_terminal()?;
    let (event_tx, event_rx) = unbounded();
    let (command_tx, command_rx) = unbounded();

    let input_handle = spawn_input_thread(event_tx.clone());
    let worker_handle = spawn_command_worker(Arc::clone(&daemon), command_rx, event_tx.clone());
    let poller = {
        let tx = event_tx.clone();
        poller::start(daemon, config.poll.clone(), move |event| {
            tx.send(AppEvent::Poll(event)).is_ok()
        })
    };
    let (clipboard_tx, clipboard_handle) = if config.clipboard {
        let tx = event_tx.clone();
        let (requests, handle) = spawn_clipboard_reader(SystemClipboard::default(), move |text| {
            tx.send(AppEvent::Clipboard(text)).is_ok()
        });
        (Some(requests), Some(handle))
    } else {
        (None, None)
    };

    let mut app = App::new(
        connection_label,
        Links {
            commands: command_tx,
            clipboard: clipboard_tx,
            poller: Some(poller),
        },
    );
    app.set_status(StatusUpdate::info("Connecting to transmission…"));

    let loop_result = run_loop(&mut terminal, &mut app, event_rx);

    app.shutdown();
    drop(event_tx);

    restore_terminal(&mut terminal)?;
    input_handle.join().ok();
    worker_handle.join().ok();
    if let Some(handle) = clipboard_handle {
        handle.join().ok();
    }

    loop_result
}

fn run_loop(
    terminal: &mut Terminal<Backend>,
    app: &mut App,
    events: Receiver<AppEvent>,
) -> Result<()> {
    terminal.draw(|f| app.render(f))?;
    loop {
        let event = match events.recv() {
            Ok(event) => event,
            Err(_) => break,
        };
        if app.process_event(event)? {
            break;
        }
        terminal.draw(|f| app.render(f))?;
        if app.should_quit {
            break;
        }
    }
    Ok(())
}

fn setup_terminal() -> Result<Terminal<Backend>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(
        stdout,
        EnterAlternateScreen,
        EnableBracketedPaste,
        EnableFocusChange
    )?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

fn restore_terminal(terminal: &mut Terminal<Backend>) -> Result<()> {
    disable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(
        stdout,
        DisableFocusChange,
        DisableBracketedPaste,
        LeaveAlternateScreen
    )?;
    terminal.show_cursor()?;
    Ok(())
}

fn spawn_input_thread(tx: Sender<AppEvent>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let tick_rate = Duration::from_millis(250);
        loop {
            match event::poll(tick_rate) {
                Ok(true) => match event::read() {
                    Ok(evt) => {
                        if tx.send(AppEvent::Input(evt)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(AppEvent::Status(StatusUpdate::error(format!(
                            "Input error: {err}"
                        ))));
                    }
                },
                Ok(false) | Err(_) => {
                    if tx.send(AppEvent::Tick).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_command_worker(
    daemon: Arc<dyn TorrentDaemon>,
    rx: Receiver<Command>,
    tx: Sender<AppEvent>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(cmd) = rx.recv() {
            handle_command(daemon.as_ref(), cmd, &tx);
        }
    })
}

/// Proxies one command to the daemon. The snapshot is left to the poller,
/// so the effect shows up with the next torrent refresh.
fn handle_command(daemon: &dyn TorrentDaemon, cmd: Command, tx: &Sender<AppEvent>) {
    match cmd {
        Command::AddMagnet(magnet) => handle_add_magnet(daemon, magnet, tx),
        Command::AddTorrentFile(path) => handle_add_file(daemon, &path, tx),
        Command::RemoveTorrent {
            id,
            name,
            delete_data,
        } => {
            log::info!("removing torrent {id} (delete data: {delete_data})");
            let result = daemon.remove_torrent(id, delete_data);
            report(tx, result, format!("Removed {name}"), "Remove failed");
        }
        Command::ResumeTorrent { id, name } => {
            log::info!("resuming torrent {id}");
            let result = daemon.resume_torrent(id);
            report(tx, result, format!("Resumed {name}"), "Resume failed");
        }
        Command::PauseTorrent { id, name } => {
            log::info!("pausing torrent {id}");
            let result = daemon.pause_torrent(id);
            report(tx, result, format!("Paused {name}"), "Pause failed");
        }
    }
}

fn report(tx: &Sender<AppEvent>, result: RpcResult<()>, success: String, failure: &str) {
    let status = match result {
        Ok(()) => StatusUpdate::success(success),
        Err(err) => {
            log::warn!("{failure}: {err}");
            StatusUpdate::error(format!("{failure}: {err}"))
        }
    };
    let _ = tx.send(AppEvent::Status(status));
}

fn handle_add_magnet(daemon: &dyn TorrentDaemon, magnet: String, tx: &Sender<AppEvent>) {
    let trimmed = magnet.trim();
    if trimmed.is_empty() {
        let _ = tx.send(AppEvent::Status(StatusUpdate::info(
            "Ignoring empty magnet input",
        )));
        return;
    }
    log::info!("adding magnet link");
    match daemon.add_magnet(trimmed) {
        Ok(outcome) => report_added(tx, outcome, "Magnet"),
        Err(err) => {
            let _ = tx.send(AppEvent::Status(StatusUpdate::error(format!(
                "Add failed: {err}"
            ))));
        }
    }
}

fn handle_add_file(daemon: &dyn TorrentDaemon, path: &Path, tx: &Sender<AppEvent>) {
    let metainfo = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = tx.send(AppEvent::Status(StatusUpdate::error(format!(
                "Cannot read {}: {err}",
                path.display()
            ))));
            return;
        }
    };
    log::info!("adding torrent file {}", path.display());
    match daemon.add_torrent_file(&metainfo) {
        Ok(outcome) => report_added(tx, outcome, "Torrent"),
        Err(err) => {
            let _ = tx.send(AppEvent::Status(StatusUpdate::error(format!(
                "Add failed: {err}"
            ))));
        }
    }
}

fn report_added(tx: &Sender<AppEvent>, outcome: AddTorrentOutcome, kind: &str) {
    let label = outcome
        .name
        .clone()
        .unwrap_or_else(|| "torrent".to_string());
    let status = if outcome.duplicate {
        StatusUpdate::warning(format!("{kind} already present ({label})"))
    } else if outcome.added {
        StatusUpdate::success(format!("{kind} queued ({label})"))
    } else {
        StatusUpdate::success(format!("{kind} processed ({label})"))
    };
    let _ = tx.send(AppEvent::Status(status));
    if let Some(id) = outcome.torrent_id {
        let _ = tx.send(AppEvent::FocusTorrent(Some(id)));
    }
}

enum AppEvent {
    Input(Event),
    Tick,
    Poll(PollEvent),
    Clipboard(Option<String>),
    Status(StatusUpdate),
    FocusTorrent(Option<i64>),
}

#[derive(Clone)]
struct StatusUpdate {
    text: String,
    level: StatusLevel,
}

impl StatusUpdate {
    fn info(message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            level: StatusLevel::Info,
        }
    }

    fn success(message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            level: StatusLevel::Success,
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            level: StatusLevel::Warning,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            level: StatusLevel::Error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StatusLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Clone)]
struct StatusMessage {
    text: String,
    level: StatusLevel,
    expires_at: Option<Instant>,
}

impl StatusMessage {
    fn from_update(update: StatusUpdate) -> Self {
        let duration = match update.level {
            StatusLevel::Info => Duration::from_secs(4),
            StatusLevel::Success => Duration::from_secs(5),
            StatusLevel::Warning => Duration::from_secs(6),
            StatusLevel::Error => Duration::from_secs(8),
        };
        Self {
            text: update.text,
            level: update.level,
            expires_at: Some(Instant::now() + duration),
        }
    }
}

/// Channels from the UI thread to the background workers.
struct Links {
    commands: Sender<Command>,
    clipboard: Option<Sender<()>>,
    poller: Option<PollerHandle>,
}

struct App {
    connection_label: String,
    links: Links,
    store: SnapshotStore,
    watcher: MagnetWatcher,
    list_state: ListState,
    filtered_indices: Vec<usize>,
    filter_text: String,
    filter_lower: String,
    pending_focus: Option<i64>,
    selected_id: Option<i64>,
    status: Option<StatusMessage>,
    toast: Option<StatusMessage>,
    mode: InputMode,
    should_quit: bool,
    pending_manual_refresh: bool,
    delete_armed: bool,
    delete_armed_until: Option<Instant>,
}

impl App {
    fn new(connection_label: String, links: Links) -> Self {
        Self {
            connection_label,
            links,
            store: SnapshotStore::new(),
            watcher: MagnetWatcher::new(),
            list_state: ListState::default(),
            filtered_indices: Vec::new(),
            filter_text: String::new(),
            filter_lower: String::new(),
            pending_focus: None,
            selected_id: None,
            status: None,
            toast: None,
            mode: InputMode::Normal,
            should_quit: false,
            pending_manual_refresh: false,
            delete_armed: false,
            delete_armed_until: None,
        }
    }

    /// Stops polling and closes the worker channels so their threads exit.
    fn shutdown(self) {
        let Links {
            commands,
            clipboard,
            poller,
        } = self.links;
        drop(commands);
        drop(clipboard);
        if let Some(poller) = poller {
            poller.stop();
        }
    }

    fn render(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(6),
                Constraint::Min(0),
                Constraint::Length(1),
            ])
            .split(frame.size());
        self.render_header(frame, chunks[0]);
        self.render_body(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);
        self.render_toast(frame);
        match &self.mode {
            InputMode::Normal => self.render_magnet_offer(frame),
            InputMode::Prompt(prompt) => {
                let area = centered_rect(60, 30, frame.size());
                let block = Block::default()
                    .title(Span::raw(format!(" {} ", prompt.kind.title())))
                    .borders(Borders::ALL);
                let text = vec![
                    Line::from(prompt.kind.hint()),
                    Line::from(format!("> {}", prompt.buffer)),
                ];
                let paragraph = Paragraph::new(text).block(block).wrap(Wrap { trim: true });
                frame.render_widget(Clear, area);
                frame.render_widget(paragraph, area);
            }
            InputMode::Confirm(confirm) => {
                let area = centered_rect(50, 30, frame.size());
                let block = Block::default().title(confirm.title).borders(Borders::ALL);
                let text = vec![
                    Line::from(confirm.message.clone()),
                    Line::from(Span::styled(
                        "Press y to confirm, n or Esc to cancel",
                        Style::default().fg(Color::Yellow),
                    )),
                ];
                let paragraph = Paragraph::new(text).block(block).wrap(Wrap { trim: true });
                frame.render_widget(Clear, area);
                frame.render_widget(paragraph, area);
            }
            InputMode::Help => {
                let area = centered_rect(70, 70, frame.size());
                let block = Block::default().title("Key Bindings").borders(Borders::ALL);
                let lines = help_lines();
                let paragraph = Paragraph::new(lines)
                    .block(block)
                    .wrap(Wrap { trim: false });
                frame.render_widget(Clear, area);
                frame.render_widget(paragraph, area);
            }
            InputMode::Filter { .. } => {}
        }
    }

    fn render_magnet_offer(&self, frame: &mut Frame) {
        let Some(candidate) = self.watcher.pending() else {
            return;
        };
        let area = centered_rect(60, 30, frame.size());
        let block = Block::default()
            .title(Span::raw(" New magnet link "))
            .borders(Borders::ALL);
        let text = vec![
            Line::from(vec![
                Span::raw("Would you like to add "),
                Span::styled(
                    candidate.label().to_string(),
                    Style::default().add_modifier(Modifier::BOLD),
                ),
                Span::raw(" which is in your clipboard?"),
            ]),
            Line::from(""),
            Line::from(Span::styled(
                "Press y to add now, n or Esc to cancel",
                Style::default().fg(Color::Yellow),
            )),
        ];
        let paragraph = Paragraph::new(text).block(block).wrap(Wrap { trim: true });
        frame.render_widget(Clear, area);
        frame.render_widget(paragraph, area);
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let (connection, connection_style) = match self.store.connection() {
            ConnectionState::Connecting => (
                "○ Connecting…".to_string(),
                Style::default().fg(Color::Yellow),
            ),
            ConnectionState::Connected => {
                ("● Connected".to_string(), Style::default().fg(Color::Green))
            }
            ConnectionState::Disconnected(reason) => (
                format!("● Disconnected: {reason}"),
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            ),
        };
        let mut lines = vec![Line::from(vec![
            Span::styled(
                "Transmission",
                Style::default().add_modifier(Modifier::BOLD),
            ),
            Span::raw("  |  "),
            Span::raw(&self.connection_label),
            Span::raw("  |  "),
            Span::styled(connection, connection_style),
        ])];
        let snapshot = self.store.torrents();
        let available = match (self.store.free_space(), self.store.free_space_error()) {
            (_, Some(_)) => "unavailable".to_string(),
            (Some(space), None) => format_size(space.metric()),
            (None, None) => "…".to_string(),
        };
        if self.store.has_torrents() {
            lines.push(Line::from(format!(
                "Downloaded {}  Uploaded {}  Available {}",
                format_size(snapshot.total_downloaded()),
                format_size(snapshot.total_uploaded()),
                available
            )));
            lines.push(Line::from(format!(
                "DL {}  UL {}  | Torrents {}",
                format_rate(snapshot.download_rate()),
                format_rate(snapshot.upload_rate()),
                snapshot.len()
            )));
        } else {
            lines.push(Line::from(format!("Available {available}")));
            lines.push(Line::from("Waiting for torrent list…"));
        }
        if let Some(status) = &self.status {
            lines.push(Line::from(Span::styled(
                status.text.clone(),
                status_style(status.level),
            )));
        }
        let paragraph = Paragraph::new(lines).block(
            Block::default()
                .borders(Borders::ALL)
                .title(Span::raw(" Session ")),
        );
        frame.render_widget(paragraph, area);
    }

    fn render_body(&mut self, frame: &mut Frame, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(area);
        self.render_list(frame, chunks[0]);
        self.render_detail(frame, chunks[1]);
    }

    fn render_list(&mut self, frame: &mut Frame, area: Rect) {
        let torrents = &self.store.torrents().torrents;
        let mut items = self
            .filtered_indices
            .iter()
            .filter_map(|&idx| torrents.get(idx))
            .map(|torrent| {
                ListItem::new(Line::from(summary_line(torrent))).style(state_style(torrent))
            })
            .collect::<Vec<_>>();
        if self.store.torrents().is_empty() {
            items.push(ListItem::new(Line::from("No torrents loaded")));
        } else if items.is_empty() {
            items.push(ListItem::new(Line::from("No torrents match the filter")));
        }
        let block = Block::default()
            .borders(Borders::ALL)
            .title(Span::raw(" Torrents "));
        let list = List::new(items)
            .block(block)
            .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
            .highlight_symbol("> ");
        frame.render_stateful_widget(list, area, &mut self.list_state);
    }

    fn render_detail(&self, frame: &mut Frame, area: Rect) {
        let block = Block::default()
            .borders(Borders::ALL)
            .title(Span::raw(" Info "));
        let Some(torrent) = self.current_torrent() else {
            let paragraph = Paragraph::new("No torrent selected")
                .block(block)
                .wrap(Wrap { trim: false });
            frame.render_widget(paragraph, area);
            return;
        };
        let eta = torrent.eta.map(format_eta).unwrap_or_else(|| "-".to_string());
        let mut lines = vec![
            Line::from(Span::styled(
                torrent.name.clone(),
                Style::default().add_modifier(Modifier::BOLD),
            )),
            Line::from(format!("State: {}", torrent.state)),
            Line::from(format!(
                "Progress: {}  ETA {}",
                format_progress(torrent.progress),
                eta
            )),
            Line::from(format!(
                "Size: {} (remaining {})",
                format_size(torrent.size_when_done),
                format_size(torrent.left_until_done)
            )),
            Line::from(format!(
                "Transferred: down {}  up {}  ratio {:.2}",
                format_size(torrent.downloaded_ever),
                format_size(torrent.uploaded_ever),
                torrent.upload_ratio
            )),
            Line::from(format!(
                "Rates: DL {}  UL {}",
                format_rate(torrent.download_rate),
                format_rate(torrent.upload_rate)
            )),
            Line::from(format!(
                "Peers: {}  Seeds: {}",
                torrent.peers, torrent.seeds
            )),
            Line::from(format!("Path: {}", torrent.download_dir)),
            Line::from(format!("Hash: {}", torrent.hash_string)),
        ];
        if let Some(error) = &torrent.error {
            lines.push(Line::from(Span::styled(
                format!("Error: {error}"),
                Style::default().fg(Color::Red),
            )));
        }
        let paragraph = Paragraph::new(lines)
            .block(block)
            .wrap(Wrap { trim: false });
        frame.render_widget(paragraph, area);
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let mode_label = match &self.mode {
            InputMode::Normal if matches!(self.watcher.state(), WatcherState::Offering(_)) => {
                "MAGNET"
            }
            InputMode::Normal => "NORMAL",
            InputMode::Filter { .. } => "FILTER",
            InputMode::Prompt(_) => "PROMPT",
            InputMode::Confirm(_) => "CONFIRM",
            InputMode::Help => "HELP",
        };
        let filter_display = match &self.mode {
            InputMode::Filter { buffer } => format!("/{}", buffer),
            _ => {
                if self.filter_text.is_empty() {
                    "(no filter)".to_string()
                } else {
                    format!("/{}", self.filter_text)
                }
            }
        };
        let summary = Line::from(format!("Mode {mode_label} | Filter {filter_display}"));
        let sections = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Min(0), Constraint::Length(14)])
            .split(area);
        let left = Paragraph::new(summary).wrap(Wrap { trim: true });
        frame.render_widget(left, sections[0]);
        let help_label =
            Paragraph::new(Line::from(Span::raw("Help [?]"))).alignment(Alignment::Right);
        frame.render_widget(help_label, sections[1]);
    }

    fn render_toast(&self, frame: &mut Frame) {
        if !matches!(self.mode, InputMode::Normal | InputMode::Filter { .. }) {
            return;
        }
        let Some(toast) = &self.toast else {
            return;
        };
        let frame_area = frame.size();
        if frame_area.width < 20 || frame_area.height < 5 {
            return;
        }
        let padding = 2;
        let max_width = frame_area.width.saturating_sub(padding * 2);
        let width = max_width.clamp(20, 60);
        let height = 3;
        let x = frame_area
            .x
            .saturating_add(frame_area.width.saturating_sub(width + padding));
        let y = frame_area
            .y
            .saturating_add(frame_area.height.saturating_sub(height + padding));
        let area = Rect::new(x, y, width, height);
        let text = Line::from(Span::styled(toast.text.clone(), status_style(toast.level)));
        let paragraph = Paragraph::new(text).alignment(Alignment::Center).block(
            Block::default()
                .borders(Borders::ALL)
                .title(Span::raw(" Notice ")),
        );
        frame.render_widget(Clear, area);
        frame.render_widget(paragraph, area);
    }

    fn process_event(&mut self, event: AppEvent) -> Result<bool> {
        match event {
            AppEvent::Input(event) => self.handle_input(event),
            AppEvent::Tick => {
                self.expire_status();
                Ok(false)
            }
            AppEvent::Poll(event) => {
                self.apply_poll(event);
                Ok(false)
            }
            AppEvent::Clipboard(text) => {
                self.observe_clipboard(text);
                Ok(false)
            }
            AppEvent::Status(update) => {
                self.set_status(update);
                Ok(false)
            }
            AppEvent::FocusTorrent(target) => {
                self.pending_focus = target;
                Ok(false)
            }
        }
    }

    fn handle_input(&mut self, event: Event) -> Result<bool> {
        match event {
            Event::FocusGained => {
                self.request_clipboard_check();
                Ok(false)
            }
            Event::Key(key) if key.kind == KeyEventKind::Press => {
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
                    self.should_quit = true;
                    return Ok(true);
                }
                if matches!(self.mode, InputMode::Normal) {
                    if self.watcher.pending().is_some() {
                        self.handle_offer_key(key);
                        return Ok(false);
                    }
                    return self.handle_normal_key(key);
                }
                match &mut self.mode {
                    InputMode::Filter { buffer } => {
                        let mut action = FilterAction::None;
                        match key.code {
                            KeyCode::Enter => {
                                let value = buffer.trim().to_string();
                                action = FilterAction::Apply(value);
                            }
                            KeyCode::Esc => {
                                action = FilterAction::Cancel;
                            }
                            KeyCode::Backspace => {
                                buffer.pop();
                            }
                            KeyCode::Char(c) => {
                                buffer.push(c);
                            }
                            _ => {}
                        }
                        match action {
                            FilterAction::Apply(value) => {
                                self.mode = InputMode::Normal;
                                self.apply_filter_text(value);
                            }
                            FilterAction::Cancel => {
                                self.mode = InputMode::Normal;
                            }
                            FilterAction::None => {}
                        }
                        Ok(false)
                    }
                    InputMode::Prompt(prompt) => {
                        let mut action = PromptAction::None;
                        match key.code {
                            KeyCode::Enter => {
                                let value = prompt.buffer.trim().to_string();
                                action = if value.is_empty() {
                                    PromptAction::Cancel
                                } else {
                                    PromptAction::Submit(prompt.kind, value)
                                };
                            }
                            KeyCode::Esc => {
                                action = PromptAction::Cancel;
                            }
                            KeyCode::Backspace => {
                                prompt.buffer.pop();
                            }
                            KeyCode::Char(c) => {
                                prompt.buffer.push(c);
                            }
                            _ => {}
                        }
                        match action {
                            PromptAction::Submit(PromptKind::Magnet, value) => {
                                self.mode = InputMode::Normal;
                                self.set_status(StatusUpdate::info("Submitting magnet…"));
                                self.send_command(
                                    Command::AddMagnet(value),
                                    "Failed to queue magnet add",
                                );
                            }
                            PromptAction::Submit(PromptKind::TorrentFile, value) => {
                                self.mode = InputMode::Normal;
                                self.queue_files(vec![unquote_path(&value)]);
                            }
                            PromptAction::Cancel => {
                                self.mode = InputMode::Normal;
                            }
                            PromptAction::None => {}
                        }
                        Ok(false)
                    }
                    InputMode::Confirm(confirm) => {
                        let mut action = ConfirmAction::None;
                        match key.code {
                            KeyCode::Char('y') | KeyCode::Enter => {
                                action = ConfirmAction::Accept;
                            }
                            KeyCode::Char('n') | KeyCode::Esc => {
                                action = ConfirmAction::Cancel;
                            }
                            _ => {}
                        }
                        match action {
                            ConfirmAction::Accept => {
                                let info = format!("Removing {}…", confirm.target_name);
                                let id = confirm.target_id;
                                let name = confirm.target_name.clone();
                                let delete_data = confirm.delete_data;
                                self.mode = InputMode::Normal;
                                self.set_status(StatusUpdate::info(info));
                                self.send_command(
                                    Command::RemoveTorrent {
                                        id,
                                        name,
                                        delete_data,
                                    },
                                    "Failed to queue deletion",
                                );
                            }
                            ConfirmAction::Cancel => {
                                self.mode = InputMode::Normal;
                                self.set_status(StatusUpdate::info("Deletion cancelled"));
                            }
                            ConfirmAction::None => {}
                        }
                        Ok(false)
                    }
                    InputMode::Help => {
                        match key.code {
                            KeyCode::Char('?')
                            | KeyCode::Esc
                            | KeyCode::Enter
                            | KeyCode::Char('q') => {
                                self.mode = InputMode::Normal;
                            }
                            _ => {}
                        }
                        Ok(false)
                    }
                    InputMode::Normal => Ok(false),
                }
            }
            Event::Paste(data) => self.handle_paste(data),
            _ => Ok(false),
        }
    }

    fn handle_offer_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Char('y') | KeyCode::Enter => {
                if let Some(candidate) = self.watcher.accept() {
                    self.set_status(StatusUpdate::info(format!(
                        "Adding {}…",
                        candidate.label()
                    )));
                    self.send_command(
                        Command::AddMagnet(candidate.raw),
                        "Failed to queue magnet add",
                    );
                }
            }
            KeyCode::Char('n') | KeyCode::Esc => {
                self.watcher.dismiss();
                self.set_status(StatusUpdate::info("Ignored magnet link from clipboard"));
            }
            _ => {}
        }
    }

    fn handle_paste(&mut self, data: String) -> Result<bool> {
        match &mut self.mode {
            InputMode::Filter { buffer } => {
                buffer.push_str(&data);
                Ok(false)
            }
            InputMode::Prompt(prompt) => {
                prompt.buffer.push_str(data.trim());
                Ok(false)
            }
            _ => {
                match classify_paste(&data) {
                    Pasted::Files(paths) => self.queue_files(paths),
                    Pasted::Magnet(text) | Pasted::Text(text) => {
                        let mut prompt = PromptState::new(PromptKind::Magnet);
                        prompt.buffer.push_str(&text);
                        self.mode = InputMode::Prompt(prompt);
                    }
                }
                Ok(false)
            }
        }
    }

    fn handle_normal_key(&mut self, key: KeyEvent) -> Result<bool> {
        let plain_d = matches!(key.code, KeyCode::Char('d')) && key.modifiers.is_empty();
        if !plain_d {
            self.disarm_delete();
        }
        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                Ok(true)
            }
            KeyCode::Char('r') => {
                if key.modifiers.contains(KeyModifiers::SHIFT) {
                    self.queue_refresh();
                } else {
                    self.resume_selected_torrent();
                }
                Ok(false)
            }
            KeyCode::Char('R') => {
                self.queue_refresh();
                Ok(false)
            }
            KeyCode::Char('p') => {
                self.pause_selected_torrent();
                Ok(false)
            }
            KeyCode::Char('a') => {
                self.mode = InputMode::Prompt(PromptState::new(PromptKind::Magnet));
                Ok(false)
            }
            KeyCode::Char('o') => {
                self.mode = InputMode::Prompt(PromptState::new(PromptKind::TorrentFile));
                Ok(false)
            }
            KeyCode::Char('m') => {
                self.request_clipboard_check();
                Ok(false)
            }
            KeyCode::Char('/') => {
                self.mode = InputMode::Filter {
                    buffer: self.filter_text.clone(),
                };
                Ok(false)
            }
            KeyCode::Char('j') | KeyCode::Down => {
                self.move_selection(1);
                Ok(false)
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.move_selection(-1);
                Ok(false)
            }
            KeyCode::Char('g') => {
                if key.modifiers.contains(KeyModifiers::SHIFT) {
                    self.goto_bottom();
                } else {
                    self.goto_top();
                }
                Ok(false)
            }
            KeyCode::Char('G') => {
                self.goto_bottom();
                Ok(false)
            }
            KeyCode::Char('?') => {
                self.mode = InputMode::Help;
                Ok(false)
            }
            KeyCode::Char('d') if plain_d => {
                if self.delete_armed {
                    self.disarm_delete();
                    self.prompt_delete_current(false);
                } else {
                    self.arm_delete();
                }
                Ok(false)
            }
            KeyCode::Char('D') => {
                self.prompt_delete_current(true);
                Ok(false)
            }
            KeyCode::Char('d') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.move_selection(5);
                Ok(false)
            }
            KeyCode::Char('u') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.move_selection(-5);
                Ok(false)
            }
            KeyCode::Esc => {
                self.clear_filter();
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    fn move_selection(&mut self, delta: isize) {
        if self.filtered_indices.is_empty() {
            return;
        }
        let max_index = self.filtered_indices.len() as isize - 1;
        let current = self.list_state.selected().unwrap_or(0) as isize;
        let next = (current + delta).clamp(0, max_index) as usize;
        self.list_state.select(Some(next));
        self.update_selected_id();
    }

    fn goto_top(&mut self) {
        if self.filtered_indices.is_empty() {
            return;
        }
        self.list_state.select(Some(0));
        self.update_selected_id();
    }

    fn goto_bottom(&mut self) {
        if self.filtered_indices.is_empty() {
            return;
        }
        let index = self.filtered_indices.len() - 1;
        self.list_state.select(Some(index));
        self.update_selected_id();
    }

    fn update_selected_id(&mut self) {
        self.selected_id = self.current_torrent().map(|t| t.id);
    }

    fn current_torrent(&self) -> Option<&TorrentRecord> {
        let selected = self.list_state.selected()?;
        let torrent_index = *self.filtered_indices.get(selected)?;
        self.store.torrents().torrents.get(torrent_index)
    }

    fn clear_filter(&mut self) {
        if self.filter_text.is_empty() {
            return;
        }
        self.filter_text.clear();
        self.filter_lower.clear();
        self.rebuild_indices();
    }

    fn apply_filter_text(&mut self, value: String) {
        self.filter_lower = value.to_lowercase();
        self.filter_text = value;
        self.rebuild_indices();
    }

    fn rebuild_indices(&mut self) {
        let torrents = &self.store.torrents().torrents;
        self.filtered_indices = torrents
            .iter()
            .enumerate()
            .filter(|(_, torrent)| {
                self.filter_lower.is_empty()
                    || torrent.name.to_lowercase().contains(&self.filter_lower)
            })
            .map(|(idx, _)| idx)
            .collect();
        if self.filtered_indices.is_empty() {
            self.list_state.select(None);
            self.selected_id = None;
            return;
        }
        // A just-added torrent may only show up a few polls later.
        let target = match self.pending_focus {
            Some(id) if self.store.torrents().get(id).is_some() => self.pending_focus.take(),
            _ => self.selected_id,
        };
        if let Some(target) = target {
            if let Some(pos) = self
                .filtered_indices
                .iter()
                .position(|&idx| torrents[idx].id == target)
            {
                self.list_state.select(Some(pos));
                self.selected_id = Some(target);
                return;
            }
        }
        let selected = self.list_state.selected().unwrap_or(0);
        let selected = selected.min(self.filtered_indices.len() - 1);
        self.list_state.select(Some(selected));
        self.update_selected_id();
    }

    fn expire_status(&mut self) {
        let now = Instant::now();
        if self
            .status
            .as_ref()
            .and_then(|status| status.expires_at)
            .is_some_and(|expiry| now >= expiry)
        {
            self.status = None;
        }
        if self
            .toast
            .as_ref()
            .and_then(|toast| toast.expires_at)
            .is_some_and(|expiry| now >= expiry)
        {
            self.toast = None;
        }
        if self.delete_armed && self.delete_armed_until.is_some_and(|deadline| now >= deadline) {
            self.disarm_delete();
        }
    }

    fn set_status(&mut self, update: StatusUpdate) {
        let message = StatusMessage::from_update(update.clone());
        if matches!(update.level, StatusLevel::Warning | StatusLevel::Error) {
            self.toast = Some(message.clone());
        }
        self.status = Some(message);
    }

    fn send_command(&mut self, command: Command, failure: &str) {
        if self.links.commands.send(command).is_err() {
            self.set_status(StatusUpdate::error(failure));
        }
    }

    fn request_clipboard_check(&mut self) {
        let Some(tx) = &self.links.clipboard else {
            return;
        };
        if tx.send(()).is_err() {
            log::warn!("clipboard reader stopped; disabling magnet detection");
            self.links.clipboard = None;
        }
    }

    fn observe_clipboard(&mut self, text: Option<String>) {
        // Without a torrent list every magnet would look new.
        if !self.store.has_torrents() {
            log::debug!("clipboard read before first torrent list; ignored");
            return;
        }
        let torrents = &self.store.torrents().torrents;
        let Some(candidate) = self.watcher.observe(text.as_deref(), torrents) else {
            return;
        };
        let label = candidate.label().to_string();
        self.disarm_delete();
        self.set_status(StatusUpdate::info(format!("Magnet link detected: {label}")));
    }

    fn apply_poll(&mut self, event: PollEvent) {
        let was = self.store.connection().clone();
        match event {
            PollEvent::Torrents { seq, result } => {
                let first = !self.store.has_torrents();
                match self.store.apply_torrents(seq, result) {
                    Applied::Updated(diff) => {
                        if !diff.is_unchanged() {
                            log::info!(
                                "torrent list changed: {} added, {} removed",
                                diff.added.len(),
                                diff.removed.len()
                            );
                        }
                        if self.selected_id.is_none() && self.pending_focus.is_none() {
                            self.selected_id =
                                self.store.torrents().torrents.first().map(|t| t.id);
                        }
                        self.rebuild_indices();
                        if self.pending_manual_refresh || first {
                            let count = self.store.torrents().len();
                            self.set_status(StatusUpdate::success(format!(
                                "Refreshed {count} torrents"
                            )));
                        }
                        self.pending_manual_refresh = false;
                        if first {
                            self.request_clipboard_check();
                        }
                    }
                    Applied::Stale => log::debug!("discarded stale torrent poll {seq}"),
                    Applied::Failed => self.pending_manual_refresh = false,
                }
            }
            PollEvent::FreeSpace { seq, result } => {
                let had_error = self.store.free_space_error().is_some();
                if self.store.apply_free_space(seq, result) == Applied::Stale {
                    log::debug!("discarded stale free space poll {seq}");
                }
                if let Some(reason) = self.store.free_space_error().filter(|_| !had_error) {
                    let message = format!("Free space unavailable: {reason}");
                    self.set_status(StatusUpdate::warning(message));
                }
            }
        }
        match (&was, self.store.connection()) {
            (ConnectionState::Disconnected(_), ConnectionState::Connected) => {
                self.set_status(StatusUpdate::success("Reconnected to transmission"));
            }
            (ConnectionState::Disconnected(_), _) => {}
            (_, ConnectionState::Disconnected(reason)) => {
                let message = format!("RPC error: {reason}");
                self.set_status(StatusUpdate::error(message));
            }
            _ => {}
        }
    }

    fn disarm_delete(&mut self) {
        self.delete_armed = false;
        self.delete_armed_until = None;
    }

    fn queue_refresh(&mut self) {
        let queued = self
            .links
            .poller
            .as_ref()
            .is_some_and(|poller| poller.refresh_now());
        if queued {
            self.pending_manual_refresh = true;
            self.set_status(StatusUpdate::info("Refreshing…"));
        } else {
            self.set_status(StatusUpdate::error("Failed to queue refresh"));
        }
    }

    fn queue_files(&mut self, paths: Vec<PathBuf>) {
        for path in paths {
            if is_torrent_file(&path) {
                self.set_status(StatusUpdate::info(format!("Adding {}…", path.display())));
                self.send_command(Command::AddTorrentFile(path), "Failed to queue torrent add");
            } else {
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                self.set_status(StatusUpdate::warning(format!(
                    "Unsupported file {name}: only .torrent files can be added"
                )));
            }
        }
    }

    fn arm_delete(&mut self) {
        self.delete_armed = true;
        self.delete_armed_until = Some(Instant::now() + Duration::from_secs(2));
        self.set_status(StatusUpdate::info(
            "Press d again to delete the selected torrent",
        ));
    }

    fn prompt_delete_current(&mut self, delete_data: bool) {
        let Some(torrent) = self.current_torrent().cloned() else {
            self.set_status(StatusUpdate::error("No torrent selected to delete"));
            return;
        };
        if torrent.state == TorrentState::Downloading {
            self.set_status(StatusUpdate::warning(format!(
                "Pause {} before deleting it",
                torrent.name
            )));
            return;
        }
        self.mode = InputMode::Confirm(ConfirmState::remove_torrent(
            torrent.name,
            torrent.id,
            delete_data,
        ));
    }

    fn resume_selected_torrent(&mut self) {
        let Some(torrent) = self.current_torrent().cloned() else {
            self.set_status(StatusUpdate::warning("No torrent selected; cannot resume"));
            return;
        };
        if !matches!(torrent.state, TorrentState::Paused | TorrentState::Error) {
            self.set_status(StatusUpdate::warning(format!(
                "{} is not paused",
                torrent.name
            )));
            return;
        }
        let TorrentRecord { id, name, .. } = torrent;
        self.set_status(StatusUpdate::info(format!("Resuming {name}…")));
        self.send_command(Command::ResumeTorrent { id, name }, "Failed to queue resume");
    }

    fn pause_selected_torrent(&mut self) {
        let Some(torrent) = self.current_torrent().cloned() else {
            self.set_status(StatusUpdate::warning("No torrent selected; cannot pause"));
            return;
        };
        let verb = match torrent.state {
            TorrentState::Paused => {
                self.set_status(StatusUpdate::warning(format!(
                    "{} is already paused",
                    torrent.name
                )));
                return;
            }
            TorrentState::Seeding => "Stopping",
            _ => "Pausing",
        };
        let TorrentRecord { id, name, .. } = torrent;
        self.set_status(StatusUpdate::info(format!("{verb} {name}…")));
        self.send_command(Command::PauseTorrent { id, name }, "Failed to queue pause");
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PromptKind {
    Magnet,
    TorrentFile,
}

impl PromptKind {
    fn title(self) -> &'static str {
        match self {
            PromptKind::Magnet => "Add magnet",
            PromptKind::TorrentFile => "Add torrent file",
        }
    }

    fn hint(self) -> &'static str {
        match self {
            PromptKind::Magnet => "Enter a magnet URL and press Enter (Esc to cancel)",
            PromptKind::TorrentFile => "Enter the path of a .torrent file (Esc to cancel)",
        }
    }
}

#[derive(Clone)]
struct PromptState {
    kind: PromptKind,
    buffer: String,
}

impl PromptState {
    fn new(kind: PromptKind) -> Self {
        Self {
            kind,
            buffer: String::new(),
        }
    }
}

#[derive(Clone)]
struct ConfirmState {
    title: &'static str,
    message: String,
    target_id: i64,
    target_name: String,
    delete_data: bool,
}

impl ConfirmState {
    fn remove_torrent(name: String, id: i64, delete_data: bool) -> Self {
        let message = if delete_data {
            format!("Remove '{name}' and delete its downloaded data?")
        } else {
            format!("Remove '{name}' from Transmission?")
        };
        Self {
            title: "Remove torrent",
            message,
            target_id: id,
            target_name: name,
            delete_data,
        }
    }
}

enum InputMode {
    Normal,
    Filter { buffer: String },
    Prompt(PromptState),
    Confirm(ConfirmState),
    Help,
}

enum FilterAction {
    None,
    Apply(String),
    Cancel,
}

enum PromptAction {
    None,
    Submit(PromptKind, String),
    Cancel,
}

enum ConfirmAction {
    None,
    Accept,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    AddMagnet(String),
    AddTorrentFile(PathBuf),
    RemoveTorrent {
        id: i64,
        name: String,
        delete_data: bool,
    },
    ResumeTorrent {
        id: i64,
        name: String,
    },
    PauseTorrent {
        id: i64,
        name: String,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum Pasted {
    Magnet(String),
    Files(Vec<PathBuf>),
    Text(String),
}

/// Terminals paste the path of a file dropped onto them, one per line, often
/// quoted or with escaped spaces.
fn classify_paste(data: &str) -> Pasted {
    let trimmed = data.trim();
    if trimmed.starts_with("magnet:") {
        return Pasted::Magnet(trimmed.to_string());
    }
    let paths: Vec<PathBuf> = trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(unquote_path)
        .collect();
    let all_files = !paths.is_empty()
        && paths
            .iter()
            .all(|path| path.is_file() || is_torrent_file(path));
    if all_files {
        Pasted::Files(paths)
    } else {
        Pasted::Text(trimmed.to_string())
    }
}

fn unquote_path(raw: &str) -> PathBuf {
    let raw = raw.trim();
    let raw = raw.strip_prefix("file://").unwrap_or(raw);
    for quote in ['\'', '"'] {
        if let Some(inner) = raw
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return PathBuf::from(inner);
        }
    }
    PathBuf::from(raw.replace("\\ ", " "))
}

fn is_torrent_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("torrent"))
}

fn summary_line(torrent: &TorrentRecord) -> String {
    let mut metrics = Vec::new();
    if let Some(eta) = torrent.eta {
        metrics.push(format!("ETA {}", format_eta(eta)));
    }
    if torrent.state == TorrentState::Downloading {
        metrics.push(format!("DL {}", format_rate(torrent.download_rate)));
    }
    if torrent.state.is_active() {
        metrics.push(format!("UL {}", format_rate(torrent.upload_rate)));
        metrics.push(format!("peers {}", torrent.peers));
    }
    if torrent.state == TorrentState::Downloading {
        metrics.push(format!("seeds {}", torrent.seeds));
    }
    if torrent.state == TorrentState::Paused {
        metrics.push(format!(
            "Paused at {} out of {}",
            format_size(torrent.downloaded_ever),
            format_size(torrent.size_when_done)
        ));
    }
    format!(
        "{:<40.40}  {:<11}  {:>7}  {}",
        torrent.name,
        torrent.state.to_string(),
        format_progress(torrent.progress),
        metrics.join("  ")
    )
}

fn state_style(torrent: &TorrentRecord) -> Style {
    match torrent.state {
        TorrentState::Downloading => Style::default().fg(Color::LightRed),
        TorrentState::Seeding => Style::default().fg(Color::Green),
        TorrentState::Paused if torrent.is_completed => Style::default().fg(Color::Blue),
        TorrentState::Error => Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        _ => Style::default(),
    }
}

fn status_style(level: StatusLevel) -> Style {
    match level {
        StatusLevel::Info => Style::default().fg(Color::Blue),
        StatusLevel::Success => Style::default().fg(Color::Green),
        StatusLevel::Warning => Style::default().fg(Color::Yellow),
        StatusLevel::Error => Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);
    let vertical = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1]);
    vertical[1]
}

fn help_lines() -> Vec<Line<'static>> {
    let heading = |text: &'static str| {
        Line::from(Span::styled(
            text,
            Style::default().add_modifier(Modifier::BOLD | Modifier::UNDERLINED),
        ))
    };
    vec![
        heading("Navigation"),
        Line::from("  j / k: move selection"),
        Line::from("  g / G: jump to first / last"),
        Line::from("  Ctrl+d / Ctrl+u: half-page down/up"),
        Line::from(""),
        heading("Actions"),
        Line::from("  p: pause downloading / stop seeding torrent"),
        Line::from("  r: resume paused torrent"),
        Line::from("  R: refresh now"),
        Line::from("  a: add magnet"),
        Line::from("  o: add .torrent file (or paste / drop its path)"),
        Line::from("  m: check clipboard for a magnet link"),
        Line::from("  dd: remove highlighted torrent"),
        Line::from("  D: remove highlighted torrent and its data"),
        Line::from("  /: filter list"),
        Line::from("  Esc: clear filter / cancel dialog"),
        Line::from("  ?: toggle this help"),
        Line::from("  q or Ctrl+c: quit"),
        Line::from(""),
        heading("Dialogs"),
        Line::from("  Prompt: Enter to submit, Esc to cancel"),
        Line::from("  Confirm: y to accept, n/Esc to cancel"),
        Line::from("  Magnet from clipboard: y to add, n/Esc to ignore"),
    ]
}
