use crate::browser::{MdnsBrowser, ServiceBrowser};
use crate::config::ClientConfig;
use crate::console::{Console, ConsoleDirection};
use crate::discovery::{DiscoveryEngine, DiscoveryEvent};
use crate::error::{DccError, Result};
use crate::protocol;
use crate::registry::{StationList, StationRegistry};
use crate::session::{SessionId, SessionManager};
use crate::subscription::{
    DirectionUpdate, FunctionUpdate, ProgrammingResponse, SessionEvent, SessionReceiver,
    SessionState, SpeedUpdate,
};
use crate::types::{CvNumber, CvValue, LocoAddress, Station, TrackId, TrackMode, TrackState};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Client for discovering and driving DCC-EX command stations
///
/// `DccClient` pairs a [`DiscoveryEngine`] with a [`SessionManager`] and is the
/// one object a user interface needs to hold. Intents that take caller input
/// validate it first and fail synchronously with a validation error; nothing
/// invalid reaches the wire.
///
/// Must be created inside a Tokio runtime.
///
/// # Example
///
/// ```no_run
/// use dccex_throttle::{ClientConfig, DccClient};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = DccClient::new(ClientConfig::default())?;
///     client.scan()?;
///
///     tokio::time::sleep(tokio::time::Duration::from_secs(3)).await;
///
///     if let Some(station) = client.station_list().into_iter().find(|s| s.is_online) {
///         client.connect(&station);
///         let mut connected = client.connectivity();
///         connected.wait_for(|c| *c).await?;
///
///         client.set_all_tracks_power(true)?;
///         client.set_speed(3, 0.5, true)?;
///     }
///     Ok(())
/// }
/// ```
pub struct DccClient {
    discovery: DiscoveryEngine,
    session: Arc<SessionManager>,
    console: Console,
    tracks: Mutex<[TrackState; 2]>,
    watcher: JoinHandle<()>,
}

impl DccClient {
    /// Create a client that browses with multicast DNS
    pub fn new(config: ClientConfig) -> Result<Self> {
        let browser = MdnsBrowser::new()?;
        Ok(Self::with_browser(Arc::new(browser), config))
    }

    /// Create a client on top of any service browser
    pub fn with_browser(browser: Arc<dyn ServiceBrowser>, config: ClientConfig) -> Self {
        let session = Arc::new(SessionManager::new(
            config.connect_timeout(),
            config.channel_capacity,
        ));
        let console = Console::new(config.console_capacity);
        let discovery = DiscoveryEngine::with_registry(browser, config, StationRegistry::new());

        let watcher = tokio::spawn(watch_traffic(
            session.clone(),
            console.clone(),
            discovery.subscribe_events(),
            session.subscribe(),
        ));

        Self {
            discovery,
            session,
            console,
            tracks: Mutex::new(TrackId::ALL.map(TrackState::new)),
            watcher,
        }
    }

    // ── Discovery ───────────────────────────────────────────────────

    /// Start (or restart) scanning, keeping known stations
    pub fn scan(&self) -> Result<()> {
        tracing::info!("Starting station scan");
        self.discovery.start(false)
    }

    /// Restart scanning from an empty station list
    pub fn refresh_scan(&self) -> Result<()> {
        tracing::info!("Refreshing station scan");
        self.discovery.start(true)
    }

    /// Stop scanning and forget discovered stations
    pub fn stop_scan(&self) {
        tracing::info!("Stopping station scan");
        self.discovery.stop(true);
    }

    pub fn is_scanning(&self) -> bool {
        self.discovery.is_browsing()
    }

    pub fn registry(&self) -> &StationRegistry {
        self.discovery.registry()
    }

    /// Current station list, online first then by name
    pub fn station_list(&self) -> Vec<Station> {
        self.discovery.registry().snapshot()
    }

    pub fn stations(&self) -> watch::Receiver<StationList> {
        self.discovery.registry().subscribe()
    }

    pub fn discovery_events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.discovery.subscribe_events()
    }

    // ── Session ─────────────────────────────────────────────────────

    pub fn connect(&self, station: &Station) -> SessionId {
        self.session.connect(station)
    }

    pub fn disconnect(&self) {
        self.session.disconnect();
    }

    /// Send a raw command string
    pub fn send(&self, command: &str) -> Result<()> {
        self.session.send(command)?;
        self.console.push(ConsoleDirection::Sent, command);
        Ok(())
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Station targeted by the live session
    pub fn connected_station(&self) -> Option<Station> {
        self.session.station()
    }

    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.session.watch_connected()
    }

    pub fn session_states(&self) -> watch::Receiver<SessionState> {
        self.session.watch_state()
    }

    pub fn last_message(&self) -> watch::Receiver<Option<String>> {
        self.session.watch_last_message()
    }

    pub fn last_speed(&self) -> watch::Receiver<Option<SpeedUpdate>> {
        self.session.watch_speed()
    }

    pub fn last_direction(&self) -> watch::Receiver<Option<DirectionUpdate>> {
        self.session.watch_direction()
    }

    pub fn last_function(&self) -> watch::Receiver<Option<FunctionUpdate>> {
        self.session.watch_function()
    }

    pub fn last_programming_response(&self) -> watch::Receiver<Option<ProgrammingResponse>> {
        self.session.watch_programming()
    }

    /// Every state change, received line and sent command
    pub fn session_events(&self) -> SessionReceiver {
        self.session.subscribe()
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    // ── Throttle ────────────────────────────────────────────────────

    /// Set speed from a 0.0..=1.0 slider position
    pub fn set_speed(&self, address: i64, normalized: f64, forward: bool) -> Result<()> {
        let address = LocoAddress::new(address)?;
        self.send(&protocol::encode_speed(
            address.get().into(),
            normalized,
            forward,
        ))
    }

    /// Bring a locomotive to speed step 0, keeping its direction
    pub fn stop_locomotive(&self, address: i64, forward: bool) -> Result<()> {
        self.set_speed(address, 0.0, forward)
    }

    pub fn set_function(&self, address: i64, function: u32, state: bool) -> Result<()> {
        let address = LocoAddress::new(address)?;
        self.send(&protocol::encode_function(address.get().into(), function, state))
    }

    pub fn emergency_stop(&self) -> Result<()> {
        tracing::warn!("Emergency stop");
        self.send(&protocol::encode_emergency_stop_all())
    }

    // ── Tracks ──────────────────────────────────────────────────────

    /// Locally tracked state of both outputs
    pub fn tracks(&self) -> [TrackState; 2] {
        *self.tracks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn track(&self, id: TrackId) -> TrackState {
        self.tracks()
            .into_iter()
            .find(|t| t.id == id)
            .unwrap_or_else(|| TrackState::new(id))
    }

    /// Power a track. The station has no per-track power command, so this
    /// switches every output while only `track`'s local state is updated.
    pub fn set_track_power(&self, track: TrackId, on: bool) -> Result<()> {
        self.send(&protocol::encode_track_power(on))?;
        self.update_tracks(|t| {
            if t.id == track {
                t.power = on.into();
            }
        });
        Ok(())
    }

    pub fn set_all_tracks_power(&self, on: bool) -> Result<()> {
        self.send(&protocol::encode_all_tracks_power(on))?;
        self.update_tracks(|t| t.power = on.into());
        Ok(())
    }

    pub fn set_track_mode(&self, track: TrackId, mode: TrackMode) -> Result<()> {
        self.send(&protocol::encode_track_mode(track, mode))?;
        self.update_tracks(|t| {
            if t.id == track {
                t.mode = mode;
            }
        });
        Ok(())
    }

    fn update_tracks(&self, f: impl FnMut(&mut TrackState)) {
        self.tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .for_each(f);
    }

    // ── Programming track ───────────────────────────────────────────

    pub fn read_address(&self) -> Result<()> {
        self.send(&protocol::encode_read_address())
    }

    pub fn write_address(&self, address: i64) -> Result<()> {
        let address = LocoAddress::new(address)?;
        self.send(&protocol::encode_write_address(address.get().into()))
    }

    pub fn read_cv(&self, cv: i64) -> Result<()> {
        let cv = CvNumber::new(cv)?;
        self.send(&protocol::encode_read_cv(cv.get().into()))
    }

    pub fn write_cv(&self, cv: i64, value: i64) -> Result<()> {
        let cv = CvNumber::new(cv)?;
        let value = CvValue::new(value)?;
        self.send(&protocol::encode_write_cv(cv.get().into(), value.get().into()))
    }
}

impl Drop for DccClient {
    fn drop(&mut self) {
        self.watcher.abort();
        self.session.disconnect();
    }
}

/// Log received traffic and drop the session when its station disappears
async fn watch_traffic(
    session: Arc<SessionManager>,
    console: Console,
    mut discovery_events: broadcast::Receiver<DiscoveryEvent>,
    mut session_events: SessionReceiver,
) {
    let mut discovery_open = true;
    loop {
        tokio::select! {
            event = discovery_events.recv(), if discovery_open => match event {
                Ok(DiscoveryEvent::StationLost(name)) => {
                    if session.station().is_some_and(|s| s.name == name) {
                        tracing::info!("Connected station {} went offline, disconnecting", name);
                        session.disconnect();
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Discovery watcher lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => discovery_open = false,
            },
            event = session_events.recv() => match event {
                Ok(SessionEvent::LineReceived(line)) => {
                    console.push(ConsoleDirection::Received, line);
                }
                Ok(_) => {}
                Err(DccError::Lagged(n)) => {
                    tracing::warn!("Console lagged by {} events", n);
                }
                Err(_) => break,
            },
        }
    }
}
