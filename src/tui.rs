use std::env;
use std::fs;
use std::io::{self, Stdout, Write};
use std::panic;
use std::process::Command;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Terminal,
};
use tracing::warn;

use crate::console::Console;
use crate::models::{format_bytes, BackupInfo};

type Term = Terminal<CrosstermBackend<Stdout>>;

enum InputMode {
    Normal,
    ConfirmSave,
    ConfirmRollback,
    NewFile,
    NewDir,
}

#[derive(PartialEq)]
enum Focus {
    Files,
    Backups,
}

struct App {
    console: Arc<Console>,
    header: String,

    files: Vec<String>,
    state: ListState,
    backups: Vec<BackupInfo>,
    backup_state: ListState,
    focus: Focus,

    preview: String,
    preview_title: String,
    preview_scroll: u16,

    is_processing: bool,
    progress: u16,
    status_msg: String,
    spinner_tick: u64,

    input_text: String,
    input_mode: InputMode,

    pending_edit: Option<String>,
    pending_content: Option<Vec<u8>>,
    rollback_target: String,

    receiver: Option<mpsc::Receiver<(f32, String)>>,
    output_receiver: Option<mpsc::Receiver<String>>,
}

impl App {
    fn new(console: Arc<Console>, header: String) -> Self {
        let mut app = App {
            console,
            header,
            files: vec![],
            state: ListState::default(),
            backups: vec![],
            backup_state: ListState::default(),
            focus: Focus::Files,
            preview: String::new(),
            preview_title: " Preview ".into(),
            preview_scroll: 0,
            is_processing: false,
            progress: 0,
            status_msg: "Ready.".into(),
            spinner_tick: 0,
            input_text: String::new(),
            input_mode: InputMode::Normal,
            pending_edit: None,
            pending_content: None,
            rollback_target: String::new(),
            receiver: None,
            output_receiver: None,
        };
        app.refresh_list();
        app
    }

    fn selected_file(&self) -> Option<String> {
        self.state.selected().and_then(|i| self.files.get(i)).cloned()
    }

    fn selected_backup(&self) -> Option<&BackupInfo> {
        self.backup_state.selected().and_then(|i| self.backups.get(i))
    }

    fn refresh_list(&mut self) {
        let previous = self.selected_file();
        match self.console.list_files() {
            Ok(files) => self.files = files,
            Err(e) => {
                self.files.clear();
                self.status_msg = format!("❌ {e}");
            }
        }
        let idx = previous
            .and_then(|p| self.files.iter().position(|f| *f == p))
            .unwrap_or(0);
        self.state
            .select(if self.files.is_empty() { None } else { Some(idx) });
        self.load_selection();
    }

    fn load_selection(&mut self) {
        self.preview_scroll = 0;
        let Some(rel) = self.selected_file() else {
            self.backups.clear();
            self.backup_state.select(None);
            self.preview = "No files under root. [N] New file, [M] New directory.".into();
            self.preview_title = " Preview ".into();
            return;
        };

        self.backups = self.console.list_backups(&rel).unwrap_or_default();
        // Newest on top.
        self.backups.reverse();
        self.backup_state
            .select(if self.backups.is_empty() { None } else { Some(0) });
        self.load_preview();
    }

    fn load_preview(&mut self) {
        let Some(rel) = self.selected_file() else { return };
        let (title, data) = match (&self.focus, self.selected_backup()) {
            (Focus::Backups, Some(b)) => (
                format!(" {} ", b.identifier),
                self.console.download_backup(&rel, &b.identifier),
            ),
            _ => (format!(" {rel} "), self.console.read_file(&rel)),
        };
        self.preview_title = title;
        self.preview = match data {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => format!("❌ {e}"),
        };
    }

    fn move_selection(&mut self, down: bool) {
        let (state, len) = match self.focus {
            Focus::Files => (&mut self.state, self.files.len()),
            Focus::Backups => (&mut self.backup_state, self.backups.len()),
        };
        if len == 0 {
            return;
        }
        let i = match state.selected() {
            Some(i) if down => (i + 1) % len,
            Some(0) => len - 1,
            Some(i) => i - 1,
            None => 0,
        };
        state.select(Some(i));
        match self.focus {
            Focus::Files => self.load_selection(),
            Focus::Backups => {
                self.preview_scroll = 0;
                self.load_preview();
            }
        }
    }

    fn toggle_focus(&mut self) {
        self.focus = match self.focus {
            Focus::Files if !self.backups.is_empty() => Focus::Backups,
            _ => Focus::Files,
        };
        self.preview_scroll = 0;
        self.load_preview();
    }

    // ---------------------------- actions ----------------------------------

    fn start_worker<F>(&mut self, label: String, job: F)
    where
        F: FnOnce(Arc<Console>, mpsc::Sender<(f32, String)>, mpsc::Sender<String>) + Send + 'static,
    {
        self.is_processing = true;
        self.progress = 0;
        self.status_msg = label;

        let (tx, rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();
        self.receiver = Some(rx);
        self.output_receiver = Some(out_rx);
        let console = Arc::clone(&self.console);

        thread::spawn(move || job(console, tx, out_tx));
    }

    fn action_restart(&mut self) {
        let Some(rel) = self.selected_file() else { return };
        self.start_worker(format!("Restarting {rel}..."), move |console, tx, out| {
            tx.send((20.0, "Stopping, then starting...".into())).ok();
            match console.restart_file(&rel) {
                Ok(outcome) => {
                    out.send(outcome.output).ok();
                    tx.send((100.0, format!("✅ {rel} restarted."))).ok();
                }
                Err(e) => {
                    out.send(e.to_string()).ok();
                    tx.send((100.0, format!("❌ Restart of {rel} failed."))).ok();
                }
            }
        });
    }

    fn start_edit(&mut self) {
        if let Some(rel) = self.selected_file() {
            self.pending_edit = Some(rel);
        }
    }

    fn finish_edit(&mut self, edited: Option<Vec<u8>>) {
        match edited {
            Some(content) => {
                self.pending_content = Some(content);
                self.input_mode = InputMode::ConfirmSave;
            }
            None => {
                self.pending_edit = None;
                self.status_msg = "No changes.".into();
            }
        }
    }

    fn action_save(&mut self, restart: bool) {
        self.input_mode = InputMode::Normal;
        let (Some(rel), Some(content)) = (self.pending_edit.take(), self.pending_content.take())
        else {
            return;
        };
        self.start_worker(format!("Saving {rel}..."), move |console, tx, out| {
            tx.send((10.0, format!("Backing up {rel}..."))).ok();
            match console.save_file(&rel, &content, restart) {
                Ok(res) => {
                    let mut msg = format!("✅ Saved {rel} (backup {})", res.backup);
                    if let Some(outcome) = res.restart {
                        msg = format!("{msg} | {}", outcome.summary());
                        out.send(outcome.output).ok();
                    }
                    tx.send((100.0, msg)).ok();
                }
                Err(e) => {
                    tx.send((100.0, format!("❌ {e}"))).ok();
                }
            }
        });
    }

    fn start_rollback(&mut self) {
        let Some(b) = self.selected_backup() else { return };
        self.rollback_target = b.identifier.clone();
        self.input_text.clear();
        self.input_mode = InputMode::ConfirmRollback;
    }

    fn action_rollback_confirm(&mut self) {
        if !self.input_text.trim().eq_ignore_ascii_case("y") {
            return;
        }
        self.input_mode = InputMode::Normal;
        self.input_text.clear();
        let Some(rel) = self.selected_file() else { return };
        let id = self.rollback_target.clone();

        self.start_worker(format!("Rolling back {rel}..."), move |console, tx, out| {
            tx.send((10.0, format!("Saving current state of {rel}..."))).ok();
            match console.rollback_file(&id, &rel) {
                Ok(res) => {
                    out.send(res.restart.output.clone()).ok();
                    tx.send((
                        100.0,
                        format!(
                            "✅ {} (current state kept as {})",
                            res.message, res.pre_rollback_backup
                        ),
                    ))
                    .ok();
                }
                Err(e) => {
                    tx.send((100.0, format!("❌ {e}"))).ok();
                }
            }
        });
    }

    fn action_create(&mut self) {
        let name = self.input_text.trim().to_string();
        let dir = matches!(self.input_mode, InputMode::NewDir);
        self.input_mode = InputMode::Normal;
        self.input_text.clear();
        if name.is_empty() {
            return;
        }
        let result = if dir {
            self.console.create_directory(&name)
        } else {
            self.console.create_file(&name, b"")
        };
        self.status_msg = match result {
            Ok(()) => format!("✅ Created {name}"),
            Err(e) => format!("❌ {e}"),
        };
        self.refresh_list();
    }

    fn check_progress(&mut self) {
        let mut done = false;

        if let Some(rx) = &self.receiver {
            for (p, msg) in rx.try_iter() {
                self.progress = p as u16;
                self.status_msg = msg;
                if self.progress >= 100 {
                    done = true;
                }
            }
        }

        if let Some(rx) = &self.output_receiver {
            for output in rx.try_iter() {
                if !output.is_empty() {
                    self.preview = output;
                    self.preview_title = " Restart output ".into();
                    self.preview_scroll = 0;
                }
            }
        }

        if done {
            self.is_processing = false;
            self.progress = 0;
            self.receiver = None;
            self.output_receiver = None;

            let showing_output = self.preview_title == " Restart output ";
            let preview = std::mem::take(&mut self.preview);
            self.refresh_list();
            if showing_output {
                self.preview = preview;
                self.preview_title = " Restart output ".into();
            }
        }
    }

    /// Returns `true` when the console should close. A running worker is
    /// never abandoned: quitting waits until it reports completion.
    fn handle_key(&mut self, code: KeyCode) -> bool {
        match self.input_mode {
            InputMode::Normal => match code {
                KeyCode::Char('q') if self.is_processing => {
                    self.status_msg = "Busy: wait for the current operation to finish.".into();
                }
                KeyCode::Char('q') => return true,
                KeyCode::Down if !self.is_processing => self.move_selection(true),
                KeyCode::Up if !self.is_processing => self.move_selection(false),
                KeyCode::Tab => self.toggle_focus(),
                KeyCode::PageDown => {
                    self.preview_scroll = self.preview_scroll.saturating_add(5);
                }
                KeyCode::PageUp => {
                    self.preview_scroll = self.preview_scroll.saturating_sub(5);
                }
                KeyCode::Enter if !self.is_processing => match self.focus {
                    Focus::Files => self.start_edit(),
                    Focus::Backups => self.start_rollback(),
                },
                KeyCode::Char('e') if !self.is_processing => self.start_edit(),
                KeyCode::Char('r') if !self.is_processing => self.action_restart(),
                KeyCode::Char('n') if !self.is_processing => {
                    self.input_text.clear();
                    self.input_mode = InputMode::NewFile;
                }
                KeyCode::Char('m') if !self.is_processing => {
                    self.input_text.clear();
                    self.input_mode = InputMode::NewDir;
                }
                KeyCode::F(5) if !self.is_processing => self.refresh_list(),
                _ => {}
            },
            InputMode::ConfirmSave => match code {
                KeyCode::Char('y') => self.action_save(true),
                KeyCode::Char('n') => self.action_save(false),
                KeyCode::Esc => {
                    self.pending_edit = None;
                    self.pending_content = None;
                    self.input_mode = InputMode::Normal;
                    self.status_msg = "Edit discarded.".into();
                }
                _ => {}
            },
            InputMode::ConfirmRollback => match code {
                KeyCode::Esc => self.input_mode = InputMode::Normal,
                KeyCode::Enter => self.action_rollback_confirm(),
                KeyCode::Backspace => {
                    self.input_text.pop();
                }
                KeyCode::Char(c) => self.input_text.push(c),
                _ => {}
            },
            InputMode::NewFile | InputMode::NewDir => match code {
                KeyCode::Esc => self.input_mode = InputMode::Normal,
                KeyCode::Enter => self.action_create(),
                KeyCode::Backspace => {
                    self.input_text.pop();
                }
                KeyCode::Char(c) => self.input_text.push(c),
                _ => {}
            },
        }
        false
    }
}

// ------------------------- UI helpers / loop ------------------------------

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Percentage((100 - percent_y) / 2),
                Constraint::Percentage(percent_y),
                Constraint::Percentage((100 - percent_y) / 2),
            ]
            .as_ref(),
        )
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints(
            [
                Constraint::Percentage((100 - percent_x) / 2),
                Constraint::Percentage(percent_x),
                Constraint::Percentage((100 - percent_x) / 2),
            ]
            .as_ref(),
        )
        .split(popup_layout[1])[1]
}

/// Hands a temp copy to `$VISUAL`/`$EDITOR`; `None` when nothing changed or
/// the editor exited with an error.
fn edit_externally(terminal: &mut Term, name: &str, original: &[u8]) -> io::Result<Option<Vec<u8>>> {
    let mut tmp = tempfile::Builder::new()
        .prefix("keeper-")
        .suffix(&format!("-{name}"))
        .tempfile()?;
    tmp.write_all(original)?;
    tmp.flush()?;

    let editor = env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".into());
    let mut parts = editor.split_whitespace();
    let program = parts.next().unwrap_or("vi");

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    let status = Command::new(program).args(parts).arg(tmp.path()).status();
    enable_raw_mode()?;
    execute!(terminal.backend_mut(), EnterAlternateScreen)?;
    terminal.clear()?;

    if !status?.success() {
        return Ok(None);
    }
    let edited = fs::read(tmp.path())?;
    Ok(if edited == original { None } else { Some(edited) })
}

fn draw(f: &mut ratatui::Frame, app: &mut App) {
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(1),
                Constraint::Min(10),
                Constraint::Length(3),
                Constraint::Length(3),
            ]
            .as_ref(),
        )
        .split(f.size());

    let header = Paragraph::new(format!(" -- KEEPER -- {}", app.header))
        .style(Style::default().fg(Color::Black).bg(Color::White));
    f.render_widget(header, main_chunks[0]);

    let split_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(main_chunks[1]);

    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(split_chunks[1]);

    let focus_style = |focused: bool| {
        if focused {
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        }
    };

    let files = List::new(
        app.files
            .iter()
            .map(|i| ListItem::new(i.as_str()))
            .collect::<Vec<_>>(),
    )
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Tracked Files ")
            .border_style(focus_style(app.focus == Focus::Files)),
    )
    .highlight_style(Style::default().bg(Color::Blue).add_modifier(Modifier::BOLD));
    f.render_stateful_widget(files, split_chunks[0], &mut app.state);

    let backups = List::new(
        app.backups
            .iter()
            .map(|b| {
                ListItem::new(Line::from(vec![
                    Span::raw(b.timestamp.clone()),
                    Span::styled(
                        format!("  {}", b.identifier),
                        Style::default().fg(Color::Cyan),
                    ),
                    Span::styled(
                        format!(
                            "  {} {}",
                            format_bytes(b.size),
                            b.sha256.get(..8).unwrap_or("")
                        ),
                        Style::default().fg(Color::DarkGray),
                    ),
                ]))
            })
            .collect::<Vec<_>>(),
    )
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Backups ({}) ", app.backups.len()))
            .border_style(focus_style(app.focus == Focus::Backups)),
    )
    .highlight_style(Style::default().bg(Color::DarkGray));
    f.render_stateful_widget(backups, right_chunks[0], &mut app.backup_state);

    f.render_widget(
        Paragraph::new(app.preview.as_str())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(app.preview_title.as_str()),
            )
            .scroll((app.preview_scroll, 0)),
        right_chunks[1],
    );

    if app.is_processing {
        let blink_char = if (app.spinner_tick / 5) % 2 == 0 { "●" } else { " " };
        let gauge = Gauge::default()
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!(" Working... {blink_char} ")),
            )
            .gauge_style(Style::default().fg(Color::Green))
            .percent(app.progress);
        f.render_widget(gauge, main_chunks[2]);
    }

    let footer_content = match app.input_mode {
        InputMode::Normal => format!(
            "{} | [E] Edit | [R] Restart | [Tab] Backups | [Enter] Rollback | [N] File | [M] Dir | [F5] | [Q] Quit",
            app.status_msg
        ),
        InputMode::ConfirmSave => {
            "SAVE: [Y] save and restart | [N] save only | [Esc] discard edit".into()
        }
        InputMode::ConfirmRollback => "ROLLBACK: type 'y' and press [Enter], [Esc] cancels".into(),
        InputMode::NewFile => "NEW FILE: path relative to root, [Enter] creates".into(),
        InputMode::NewDir => "NEW DIRECTORY: name, [Enter] creates".into(),
    };
    f.render_widget(
        Paragraph::new(footer_content).block(Block::default().borders(Borders::ALL)),
        main_chunks[3],
    );

    match app.input_mode {
        InputMode::NewFile | InputMode::NewDir => {
            let r = centered_rect(60, 20, f.size());
            f.render_widget(Clear, r);
            let title = if let InputMode::NewDir = app.input_mode {
                "New Directory"
            } else {
                "New File"
            };
            let block = Block::default().borders(Borders::ALL).title(title);
            let inner = block.inner(r);
            f.render_widget(Paragraph::new(app.input_text.clone()).block(block), r);
            let max_width = inner.width.saturating_sub(1);
            f.set_cursor(
                inner.x + (app.input_text.len() as u16).min(max_width),
                inner.y,
            );
        }
        InputMode::ConfirmRollback => {
            let r = centered_rect(60, 40, f.size());
            f.render_widget(Clear, r);
            let b = Block::default()
                .borders(Borders::ALL)
                .title("ROLLBACK")
                .style(Style::default().fg(Color::Red));
            let i = b.inner(r);
            f.render_widget(b, r);

            let c = Layout::default()
                .constraints([Constraint::Min(4), Constraint::Length(3)])
                .split(i);
            let file = app.selected_file().unwrap_or_default();
            f.render_widget(
                Paragraph::new(format!(
                    "Restore {file} from {}? The current content is backed up first and the stack is restarted.",
                    app.rollback_target
                ))
                .wrap(Wrap { trim: true }),
                c[0],
            );
            f.render_widget(
                Paragraph::new(app.input_text.clone())
                    .block(Block::default().borders(Borders::ALL)),
                c[1],
            );
            f.set_cursor(c[1].x + 1 + app.input_text.len() as u16, c[1].y + 1);
        }
        _ => {}
    }
}

pub fn run(console: Arc<Console>, header: String) -> io::Result<()> {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        original_hook(panic_info);
    }));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut app = App::new(console, header);

    loop {
        terminal.draw(|f| draw(f, &mut app))?;

        app.check_progress();
        app.spinner_tick = app.spinner_tick.wrapping_add(1);

        if matches!(app.input_mode, InputMode::Normal) && app.pending_content.is_none() {
            if let Some(rel) = app.pending_edit.clone() {
                match app.console.read_file(&rel) {
                    Ok(original) => {
                        let name = rel.rsplit('/').next().unwrap_or("file");
                        let edited = edit_externally(&mut terminal, name, &original)
                            .unwrap_or_else(|e| {
                                warn!(file = %rel, error = %e, "editor failed");
                                None
                            });
                        app.finish_edit(edited);
                    }
                    Err(e) => {
                        app.pending_edit = None;
                        app.status_msg = format!("❌ {e}");
                    }
                }
            }
        }

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && app.handle_key(key.code) {
                    break;
                }
            }
        }
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{OperatorTable, Role};
    use crate::backup::tests::StepClock;
    use crate::backup::BackupStore;
    use crate::revision::tests::FakeRestarter;
    use crate::revision::RevisionController;
    use std::collections::BTreeMap;
    use std::time::Instant;
    use tempfile::TempDir;

    fn app() -> (TempDir, Arc<FakeRestarter>, App) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(root.join("app")).unwrap();
        fs::write(root.join("app/docker-compose.yml"), "v1").unwrap();

        let mut ops = BTreeMap::new();
        ops.insert("admin".to_string(), Role::Admin);
        let restarter = Arc::new(FakeRestarter::default());
        let store = BackupStore::with_clock(20, Arc::new(StepClock::new()));
        let console = Console::new(
            &root,
            RevisionController::new(store, restarter.clone()),
            Box::new(OperatorTable::new(ops, Some("admin".into()))),
        )
        .unwrap();
        (tmp, restarter, App::new(Arc::new(console), String::new()))
    }

    #[test]
    fn quit_is_refused_while_a_worker_runs() {
        let (_tmp, restarter, mut app) = app();
        assert_eq!(app.files, vec!["app/docker-compose.yml".to_string()]);

        assert!(!app.handle_key(KeyCode::Char('r')));
        assert!(app.is_processing);
        assert!(!app.handle_key(KeyCode::Char('q')));
        assert!(app.status_msg.starts_with("Busy"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while app.is_processing && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
            app.check_progress();
        }
        assert!(!app.is_processing);
        assert_eq!(restarter.count(), 1);
        assert!(app.handle_key(KeyCode::Char('q')));
    }

    #[test]
    fn quit_when_idle_closes() {
        let (_tmp, _r, mut app) = app();
        assert!(app.handle_key(KeyCode::Char('q')));
    }
}
