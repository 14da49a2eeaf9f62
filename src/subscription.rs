use crate::error::{DccError, Result};
use crate::protocol::{DecodedMessage, ProgrammingKind};
use crate::types::CabNumber;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

/// Lifecycle of the station session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

/// Event emitted by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session moved to a new state
    StateChanged(SessionState),

    /// A non-blank line arrived (trimmed)
    LineReceived(String),

    /// The line decoded into a message
    MessageDecoded(DecodedMessage),

    /// A command was written to the station
    CommandSent(String),
}

/// Latest speed report from the station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedUpdate {
    pub cab: CabNumber,
    pub value: i32,
}

/// Latest direction report from the station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionUpdate {
    pub cab: CabNumber,
    pub forward: bool,
}

/// Latest function report from the station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionUpdate {
    pub cab: CabNumber,
    pub number: u32,
    pub state: bool,
}

/// Latest programming-track response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgrammingResponse {
    pub kind: ProgrammingKind,
    pub value: i32,
}

/// Last-value-wins projections of decoded traffic
pub(crate) struct LastValues {
    pub message: watch::Sender<Option<String>>,
    pub speed: watch::Sender<Option<SpeedUpdate>>,
    pub direction: watch::Sender<Option<DirectionUpdate>>,
    pub function: watch::Sender<Option<FunctionUpdate>>,
    pub programming: watch::Sender<Option<ProgrammingResponse>>,
    pub heartbeat: watch::Sender<Option<DateTime<Utc>>>,
}

impl LastValues {
    pub fn new() -> Self {
        Self {
            message: watch::channel(None).0,
            speed: watch::channel(None).0,
            direction: watch::channel(None).0,
            function: watch::channel(None).0,
            programming: watch::channel(None).0,
            heartbeat: watch::channel(None).0,
        }
    }

    /// Store `message` in the projection for its kind
    pub fn record(&self, message: &DecodedMessage) {
        match *message {
            DecodedMessage::Speed { cab, value } => {
                self.speed.send_replace(Some(SpeedUpdate { cab, value }));
            }
            DecodedMessage::Direction { cab, forward } => {
                self.direction
                    .send_replace(Some(DirectionUpdate { cab, forward }));
            }
            DecodedMessage::Function { cab, number, state } => {
                self.function
                    .send_replace(Some(FunctionUpdate { cab, number, state }));
            }
            DecodedMessage::ProgrammingResponse { kind, value } => {
                self.programming
                    .send_replace(Some(ProgrammingResponse { kind, value }));
            }
            DecodedMessage::Heartbeat => {
                self.heartbeat.send_replace(Some(Utc::now()));
            }
            DecodedMessage::Unknown { .. } => {}
        }
    }
}

/// Receiver for session events
pub struct SessionReceiver {
    rx: broadcast::Receiver<SessionEvent>,
}

impl SessionReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<SessionEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next session event
    ///
    /// Fails with [`DccError::ChannelClosed`] once the session manager is gone.
    pub async fn recv(&mut self) -> Result<SessionEvent> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => DccError::ChannelClosed,
            broadcast::error::RecvError::Lagged(n) => DccError::Lagged(n),
        })
    }

    /// Try to receive an event without waiting
    ///
    /// Returns `None` if no event is available.
    pub fn try_recv(&mut self) -> Result<Option<SessionEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(DccError::ChannelClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(DccError::Lagged(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keeps_latest_per_kind() {
        let last = LastValues::new();
        let speed = last.speed.subscribe();
        let programming = last.programming.subscribe();

        last.record(&DecodedMessage::Speed { cab: 3, value: 10 });
        last.record(&DecodedMessage::Speed { cab: 4, value: 50 });
        last.record(&DecodedMessage::Unknown { raw: "x".into() });
        last.record(&DecodedMessage::ProgrammingResponse {
            kind: ProgrammingKind::ReadCv,
            value: 7,
        });

        assert_eq!(*speed.borrow(), Some(SpeedUpdate { cab: 4, value: 50 }));
        assert_eq!(
            *programming.borrow(),
            Some(ProgrammingResponse {
                kind: ProgrammingKind::ReadCv,
                value: 7
            })
        );
        assert!(last.direction.borrow().is_none());
    }

    #[tokio::test]
    async fn receiver_maps_closed_channel() {
        let (tx, rx) = broadcast::channel(4);
        let mut receiver = SessionReceiver::new(rx);
        tx.send(SessionEvent::LineReceived("*".into())).unwrap();
        assert_eq!(
            receiver.try_recv().unwrap(),
            Some(SessionEvent::LineReceived("*".into()))
        );
        assert_eq!(receiver.try_recv().unwrap(), None);
        drop(tx);
        assert!(matches!(receiver.recv().await, Err(DccError::ChannelClosed)));
    }
}
