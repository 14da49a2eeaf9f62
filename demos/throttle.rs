use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use dccex_throttle::{
    ClientConfig, ConsoleDirection, DccClient, SessionState, Station, TrackId, TrackMode,
    TrackPower,
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const SPEED_STEP: f64 = 0.05;

#[derive(PartialEq)]
enum AppState {
    Stations,
    Throttle,
}

struct App {
    state: AppState,
    client: DccClient,
    selected_station_index: usize,
    address: i64,
    speed: f64,
    forward: bool,
    headlight: bool,
    status_message: String,
}

impl App {
    fn new(client: DccClient) -> Self {
        Self {
            state: AppState::Stations,
            client,
            selected_station_index: 0,
            address: 3,
            speed: 0.0,
            forward: true,
            headlight: false,
            status_message: "Scanning for command stations...".to_string(),
        }
    }

    fn select_next(&mut self) {
        let count = self.client.station_list().len();
        if count > 0 {
            self.selected_station_index = (self.selected_station_index + 1) % count;
        }
    }

    fn select_previous(&mut self) {
        let count = self.client.station_list().len();
        if count > 0 {
            if self.selected_station_index == 0 {
                self.selected_station_index = count - 1;
            } else {
                self.selected_station_index -= 1;
            }
        }
    }

    fn connect_to_selected_station(&mut self) {
        let stations = self.client.station_list();
        let Some(station) = stations.get(self.selected_station_index) else {
            self.status_message = "No stations to connect to".to_string();
            return;
        };
        if !station.is_online {
            self.status_message = format!("{} is offline", station.name);
            return;
        }

        self.client.connect(station);
        self.speed = 0.0;
        self.forward = true;
        self.state = AppState::Throttle;
        self.status_message = format!("Connecting to {}...", station.name);
    }

    fn report(&mut self, action: &str, result: dccex_throttle::Result<()>) {
        self.status_message = match result {
            Ok(()) => action.to_string(),
            Err(e) => format!("{} failed: {}", action, e),
        };
    }

    fn adjust_speed(&mut self, delta: f64) {
        self.speed = (self.speed + delta).clamp(0.0, 1.0);
        let result = self.client.set_speed(self.address, self.speed, self.forward);
        self.report(&format!("Speed {:.0}%", self.speed * 100.0), result);
    }

    fn reverse(&mut self) {
        self.forward = !self.forward;
        let result = self.client.set_speed(self.address, self.speed, self.forward);
        let direction = if self.forward { "Forward" } else { "Reverse" };
        self.report(direction, result);
    }

    fn stop(&mut self) {
        self.speed = 0.0;
        let result = self.client.stop_locomotive(self.address, self.forward);
        self.report("Stop", result);
    }

    fn emergency_stop(&mut self) {
        self.speed = 0.0;
        let result = self.client.emergency_stop();
        self.report("EMERGENCY STOP", result);
    }

    fn toggle_headlight(&mut self) {
        self.headlight = !self.headlight;
        let result = self.client.set_function(self.address, 0, self.headlight);
        self.report(if self.headlight { "F0 on" } else { "F0 off" }, result);
    }

    fn change_address(&mut self, delta: i64) {
        self.address = (self.address + delta).clamp(1, 10239);
        self.speed = 0.0;
        self.status_message = format!("Locomotive {}", self.address);
    }

    fn toggle_power(&mut self) {
        let on = self.client.tracks().iter().all(|t| t.power == TrackPower::Off);
        let result = self.client.set_all_tracks_power(on);
        self.report(if on { "Power on" } else { "Power off" }, result);
    }

    fn toggle_track_mode(&mut self, track: TrackId) {
        let mode = match self.client.track(track).mode {
            TrackMode::Main => TrackMode::Program,
            TrackMode::Program => TrackMode::Main,
        };
        let result = self.client.set_track_mode(track, mode);
        self.report(&format!("Track {} {}", track, mode.wire_keyword()), result);
    }

    fn read_address(&mut self) {
        let result = self.client.read_address();
        self.report("Reading address on programming track", result);
    }

    fn go_back(&mut self) {
        self.client.disconnect();
        self.state = AppState::Stations;
        self.status_message = format!(
            "Found {} station(s). Press Enter to connect.",
            self.client.station_list().len()
        );
    }
}

fn ui(f: &mut Frame, app: &App) {
    let outer_chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(f.size());

    match app.state {
        AppState::Stations => {
            render_stations(f, app, outer_chunks[0]);
        }
        AppState::Throttle => {
            let inner_chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
                .split(outer_chunks[0]);

            render_throttle(f, app, inner_chunks[0]);
            render_console(f, app, inner_chunks[1]);
        }
    }

    render_status(f, app, outer_chunks[1]);
}

fn render_stations(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Command Stations (j/k select, Enter connect, r rescan, q quit) ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let stations = app.client.station_list();
    if stations.is_empty() {
        let text =
            Paragraph::new("Scanning...\n\nWaiting for DCC-EX command stations on the network.")
                .block(block)
                .wrap(Wrap { trim: true });
        f.render_widget(text, area);
        return;
    }

    let items: Vec<ListItem> = stations
        .iter()
        .map(|station| {
            let (status, color) = if station.is_online {
                ("online", Color::Green)
            } else {
                ("offline", Color::Red)
            };
            ListItem::new(vec![
                Line::from(vec![
                    Span::styled("Name: ", Style::default().fg(Color::Yellow)),
                    Span::raw(station.name.as_str()),
                    Span::raw("  "),
                    Span::styled(status, Style::default().fg(color)),
                ]),
                Line::from(vec![
                    Span::styled("Address: ", Style::default().fg(Color::Yellow)),
                    Span::raw(format!("{}:{}", station.ip_address, station.port)),
                ]),
                Line::from(""),
            ])
        })
        .collect();

    let mut state = ListState::default();
    state.select(Some(app.selected_station_index.min(stations.len() - 1)));

    let list = List::new(items)
        .block(block)
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol(">> ");

    f.render_stateful_widget(list, area, &mut state);
}

fn on_off(on: bool) -> Span<'static> {
    if on {
        Span::styled("ON", Style::default().fg(Color::Green).add_modifier(Modifier::BOLD))
    } else {
        Span::styled("OFF", Style::default().fg(Color::Red))
    }
}

fn render_throttle(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(concat!(
            " Throttle (+/- speed, d dir, space stop, e estop, l F0, [/] loco,",
            " p power, a/b mode, c read, Esc back) "
        ))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(block.inner(area));
    f.render_widget(block, area);

    let station = app
        .client
        .connected_station()
        .map(|s| s.name)
        .unwrap_or_else(|| "none".to_string());
    let session = match app.client.session_state() {
        SessionState::Connected => Span::styled("Connected", Style::default().fg(Color::Green)),
        SessionState::Connecting => Span::styled("Connecting", Style::default().fg(Color::Yellow)),
        SessionState::Disconnected => {
            Span::styled("Disconnected", Style::default().fg(Color::Gray))
        }
        SessionState::Failed(reason) => {
            Span::styled(format!("Failed: {}", reason), Style::default().fg(Color::Red))
        }
    };

    let mut lines = vec![
        Line::from(vec![
            Span::styled(
                "Station: ",
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            ),
            Span::raw(station),
        ]),
        Line::from(vec![Span::styled("Session: ", Style::default().fg(Color::Yellow)), session]),
        Line::from(""),
        Line::from(vec![
            Span::styled("Locomotive: ", Style::default().fg(Color::Yellow)),
            Span::styled(
                app.address.to_string(),
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(vec![
            Span::styled("Direction: ", Style::default().fg(Color::Yellow)),
            Span::raw(if app.forward { "Forward" } else { "Reverse" }),
        ]),
        Line::from(vec![
            Span::styled("Headlight: ", Style::default().fg(Color::Yellow)),
            on_off(app.headlight),
        ]),
        Line::from(""),
    ];

    for track in app.client.tracks() {
        lines.push(Line::from(vec![
            Span::styled(format!("Track {}: ", track.id), Style::default().fg(Color::Yellow)),
            on_off(track.power == TrackPower::On),
            Span::raw(format!("  {}", track.mode.wire_keyword())),
        ]));
    }
    lines.push(Line::from(""));

    let reported_speed = app.client.last_speed().borrow().clone();
    if let Some(update) = reported_speed {
        lines.push(Line::from(vec![
            Span::styled("Reported speed: ", Style::default().fg(Color::Yellow)),
            Span::raw(format!("cab {} step {}", update.cab, update.value)),
        ]));
    }
    let programming = app.client.last_programming_response().borrow().clone();
    if let Some(response) = programming {
        lines.push(Line::from(vec![
            Span::styled("Programming: ", Style::default().fg(Color::Yellow)),
            Span::raw(format!("{} = {}", response.kind.as_str(), response.value)),
        ]));
    }

    let text = Paragraph::new(lines).wrap(Wrap { trim: true });
    f.render_widget(text, chunks[0]);

    let gauge = Gauge::default()
        .block(Block::default().title(" Speed ").borders(Borders::ALL))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(app.speed);
    f.render_widget(gauge, chunks[1]);
}

fn render_console(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Console ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Magenta));

    let height = area.height.saturating_sub(2) as usize;
    let entries = app.client.console().entries();
    let lines: Vec<Line> = entries
        .iter()
        .skip(entries.len().saturating_sub(height))
        .map(|entry| {
            let (arrow, color) = match entry.direction {
                ConsoleDirection::Sent => ("-> ", Color::Cyan),
                ConsoleDirection::Received => ("<- ", Color::White),
            };
            Line::from(vec![
                Span::styled(
                    entry.timestamp.format("%H:%M:%S ").to_string(),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(format!("{}{}", arrow, entry.content), Style::default().fg(color)),
            ])
        })
        .collect();

    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_status(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Status ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Gray));

    let text = Paragraph::new(app.status_message.clone())
        .block(block)
        .wrap(Wrap { trim: true });

    f.render_widget(text, area);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs would corrupt the terminal, so they go to a file when RUST_LOG is set
    if std::env::var_os("RUST_LOG").is_some() {
        let file = std::fs::File::create("throttle.log")?;
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    }

    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    let client = DccClient::new(config)?;

    // `throttle <config> <host>` skips discovery
    let direct = std::env::args()
        .nth(2)
        .map(|host| Station::new(host.clone(), host, dccex_throttle::DEFAULT_PORT));

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(client);
    match direct {
        Some(station) => {
            app.client.connect(&station);
            app.state = AppState::Throttle;
            app.status_message = format!("Connecting to {}...", station.name);
        }
        None => app.client.scan()?,
    }

    let res = run_app(&mut terminal, &mut app).await;

    app.client.disconnect();
    app.client.stop_scan();

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {}", err);
    }

    Ok(())
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        if app.state == AppState::Stations {
            let count = app.client.station_list().len();
            if count > 0 {
                app.status_message = format!("Found {} station(s). Press Enter to connect.", count);
            }
        }

        terminal.draw(|f| ui(f, app))?;

        // Yield so session and discovery tasks make progress between frames
        if !event::poll(std::time::Duration::from_millis(0))? {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            continue;
        }

        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match app.state {
                AppState::Stations => match key.code {
                    KeyCode::Char('q') => return Ok(()),
                    KeyCode::Char('j') | KeyCode::Down => app.select_next(),
                    KeyCode::Char('k') | KeyCode::Up => app.select_previous(),
                    KeyCode::Char('r') => {
                        app.client.refresh_scan()?;
                        app.selected_station_index = 0;
                        app.status_message = "Rescanning...".to_string();
                    }
                    KeyCode::Enter => app.connect_to_selected_station(),
                    _ => {}
                },
                AppState::Throttle => match key.code {
                    KeyCode::Char('q') => return Ok(()),
                    KeyCode::Esc => app.go_back(),
                    KeyCode::Char('+') | KeyCode::Char('=') | KeyCode::Up => {
                        app.adjust_speed(SPEED_STEP)
                    }
                    KeyCode::Char('-') | KeyCode::Char('_') | KeyCode::Down => {
                        app.adjust_speed(-SPEED_STEP)
                    }
                    KeyCode::Char('d') => app.reverse(),
                    KeyCode::Char(' ') => app.stop(),
                    KeyCode::Char('e') => app.emergency_stop(),
                    KeyCode::Char('l') => app.toggle_headlight(),
                    KeyCode::Char('[') => app.change_address(-1),
                    KeyCode::Char(']') => app.change_address(1),
                    KeyCode::Char('p') => app.toggle_power(),
                    KeyCode::Char('a') => app.toggle_track_mode(TrackId::A),
                    KeyCode::Char('b') => app.toggle_track_mode(TrackId::B),
                    KeyCode::Char('c') => app.read_address(),
                    _ => {}
                },
            }
        }
    }
}
