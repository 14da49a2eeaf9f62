use crate::error::{DccError, Result};
use crate::framing::LineCodec;
use crate::protocol::{self, DecodedMessage};
use crate::subscription::{
    DirectionUpdate, FunctionUpdate, LastValues, ProgrammingResponse, SessionEvent,
    SessionReceiver, SessionState, SpeedUpdate,
};
use crate::types::Station;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use uuid::Uuid;

/// Identifies one connect attempt; stale tasks compare against it
pub type SessionId = Uuid;

/// The live session, if any
struct ActiveSession {
    id: SessionId,
    station: Station,
    commands: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// State shared between the manager handle and its session task
struct Shared {
    active: Mutex<Option<ActiveSession>>,
    state_tx: watch::Sender<SessionState>,
    connected_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<SessionEvent>,
    last: LastValues,
}

/// Owner of the single TCP session to a command station
///
/// At most one session is live at a time; connecting again tears the previous
/// one down first. Every state transition is published while the session slot
/// is locked, so a task belonging to a torn-down session can never publish
/// over its successor.
///
/// [`disconnect`](SessionManager::disconnect) notifies subscribers before it
/// returns.
pub struct SessionManager {
    shared: Arc<Shared>,
    connect_timeout: Duration,
}

impl SessionManager {
    pub fn new(connect_timeout: Duration, channel_capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (connected_tx, _) = watch::channel(false);
        let (event_tx, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                active: Mutex::new(None),
                state_tx,
                connected_tx,
                event_tx,
                last: LastValues::new(),
            }),
            connect_timeout,
        }
    }

    /// Start connecting to `station`.
    ///
    /// Returns once the attempt is scheduled; watch [`state`](Self::state) or
    /// [`subscribe`](Self::subscribe) for the outcome.
    pub fn connect(&self, station: &Station) -> SessionId {
        let mut active = self.shared.lock();
        if let Some(previous) = active.take() {
            tracing::info!("Replacing session {} to {}", previous.id, previous.station.name);
            previous.task.abort();
            self.shared.publish(SessionState::Disconnected);
        }

        let id = Uuid::new_v4();
        let (commands, command_rx) = mpsc::unbounded_channel();
        self.shared.publish(SessionState::Connecting);

        let task = tokio::spawn(run_session(
            self.shared.clone(),
            id,
            station.clone(),
            command_rx,
            self.connect_timeout,
        ));

        *active = Some(ActiveSession {
            id,
            station: station.clone(),
            commands,
            task,
        });
        id
    }

    /// Tear down the session, if any. Subscribers see `Disconnected` before
    /// this returns.
    pub fn disconnect(&self) {
        let mut active = self.shared.lock();
        if let Some(session) = active.take() {
            session.task.abort();
            self.shared.publish(SessionState::Disconnected);
            self.shared
                .last
                .message
                .send_replace(Some(format!("Disconnected from {}", session.station.name)));
            tracing::info!("Disconnected from {}", session.station.name);
        }
    }

    /// Queue `command` for the station; a newline is appended on the wire.
    ///
    /// Outside the `Connected` state nothing is written and
    /// [`DccError::NotConnected`] is returned.
    pub fn send(&self, command: &str) -> Result<()> {
        let active = self.shared.lock();
        let connected = self.shared.state_tx.borrow().is_connected();
        match active.as_ref() {
            Some(session) if connected => session
                .commands
                .send(command.to_string())
                .map_err(|_| DccError::NotConnected),
            _ => {
                tracing::debug!("Not connected, cannot send command: {}", command);
                Err(DccError::NotConnected)
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected_tx.borrow()
    }

    /// Station targeted by the live session
    pub fn station(&self) -> Option<Station> {
        self.shared.lock().as_ref().map(|s| s.station.clone())
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.lock().as_ref().map(|s| s.id)
    }

    pub fn subscribe(&self) -> SessionReceiver {
        SessionReceiver::new(self.shared.event_tx.subscribe())
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected_tx.subscribe()
    }

    pub fn watch_last_message(&self) -> watch::Receiver<Option<String>> {
        self.shared.last.message.subscribe()
    }

    pub fn watch_speed(&self) -> watch::Receiver<Option<SpeedUpdate>> {
        self.shared.last.speed.subscribe()
    }

    pub fn watch_direction(&self) -> watch::Receiver<Option<DirectionUpdate>> {
        self.shared.last.direction.subscribe()
    }

    pub fn watch_function(&self) -> watch::Receiver<Option<FunctionUpdate>> {
        self.shared.last.function.subscribe()
    }

    pub fn watch_programming(&self) -> watch::Receiver<Option<ProgrammingResponse>> {
        self.shared.last.programming.subscribe()
    }

    pub fn watch_heartbeat(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.shared.last.heartbeat.subscribe()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(session) = self.shared.lock().take() {
            session.task.abort();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Caller must hold the session slot lock
    fn publish(&self, state: SessionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        tracing::info!("Session state: {:?}", state);
        self.connected_tx.send_replace(state.is_connected());
        self.state_tx.send_replace(state.clone());
        let _ = self.event_tx.send(SessionEvent::StateChanged(state));
    }

    /// Publish `state` only if `id` is still the live session
    fn transition(&self, id: SessionId, state: SessionState) -> bool {
        let active = self.lock();
        if active.as_ref().map(|s| s.id) != Some(id) {
            return false;
        }
        self.publish(state);
        true
    }

    /// End session `id` from inside its own task
    fn close(&self, id: SessionId, failure: Option<String>, notice: String) {
        let mut active = self.lock();
        if active.as_ref().map(|s| s.id) != Some(id) {
            return;
        }
        // Dropping our own JoinHandle detaches; the task is already exiting
        active.take();
        if let Some(reason) = failure {
            self.publish(SessionState::Failed(reason));
        }
        self.publish(SessionState::Disconnected);
        self.last.message.send_replace(Some(notice));
    }

    fn command_sent(&self, id: SessionId, command: String) {
        let active = self.lock();
        if active.as_ref().map(|s| s.id) == Some(id) {
            let _ = self.event_tx.send(SessionEvent::CommandSent(command));
        }
    }

    /// Dispatch one received line. The slot stays locked throughout so a
    /// concurrent `disconnect` either precedes the line entirely or follows it.
    fn handle_line(&self, id: SessionId, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let active = self.lock();
        if active.as_ref().map(|s| s.id) != Some(id) {
            return;
        }

        tracing::debug!("Received: {}", trimmed);
        self.last.message.send_replace(Some(trimmed.to_string()));
        let _ = self
            .event_tx
            .send(SessionEvent::LineReceived(trimmed.to_string()));

        if let Some(message) = protocol::decode(trimmed) {
            match &message {
                DecodedMessage::Unknown { raw } => tracing::debug!("Unknown message: {}", raw),
                other => tracing::debug!("Parsed: {}", other),
            }
            self.last.record(&message);
            let _ = self.event_tx.send(SessionEvent::MessageDecoded(message));
        }
    }
}

async fn run_session(
    shared: Arc<Shared>,
    id: SessionId,
    station: Station,
    mut commands: mpsc::UnboundedReceiver<String>,
    connect_timeout: Duration,
) {
    let host = station.host_name.as_str();
    tracing::info!("Connecting to {} at {}:{}", station.name, host, station.port);

    let stream = match timeout(connect_timeout, TcpStream::connect((host, station.port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!("Connection to {} failed: {}", station.name, e);
            shared.close(id, Some(e.to_string()), format!("Connection failed: {}", e));
            return;
        }
        Err(_) => {
            let e = DccError::ConnectTimeout(connect_timeout);
            tracing::warn!("Connection to {} failed: {}", station.name, e);
            shared.close(id, Some(e.to_string()), format!("Connection failed: {}", e));
            return;
        }
    };

    if !shared.transition(id, SessionState::Connected) {
        return;
    }
    tracing::info!("Connected to {} at {}:{}", station.name, host, station.port);

    let (mut sink, mut lines) = Framed::new(stream, LineCodec::new()).split();

    // One iteration per read or queued command; the loop never nests
    let notice = loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) => shared.handle_line(id, &line),
                Some(Err(e)) => {
                    tracing::warn!("Receive error: {}", e);
                    break format!("Disconnected: receive error: {}", e);
                }
                None => {
                    tracing::info!("Connection closed by peer");
                    break "Disconnected: connection closed by peer".to_string();
                }
            },
            command = commands.recv() => match command {
                Some(command) => {
                    if let Err(e) = sink.send(command.clone()).await {
                        tracing::warn!("Error sending command {}: {}", command, e);
                        break format!("Disconnected: send error: {}", e);
                    }
                    tracing::debug!("Sent command: {}", command);
                    shared.command_sent(id, command);
                }
                None => break "Disconnected".to_string(),
            },
        }
    };

    shared.close(id, None, notice);
}
