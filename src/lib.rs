//! Rust library for discovering and driving DCC-EX model railroad command stations
//!
//! This library provides an async API for finding DCC-EX command stations on
//! the local network and controlling them over their TCP text protocol. It
//! supports:
//!
//! - Discovery of WiThrottle (`_withrottle._tcp`) services via multicast DNS
//! - Active health checking of discovered stations
//! - A single managed TCP session with line framing and decoding
//! - Throttle speed, direction and function commands
//! - Track power and track mode commands
//! - Programming-track reads, writes and verify responses
//! - Last-value and event subscriptions for decoded station traffic
//!
//! # Quick Start
//!
//! ```no_run
//! use dccex_throttle::{ClientConfig, DccClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = DccClient::new(ClientConfig::default())?;
//!     client.scan()?;
//!
//!     // Wait for stations to be discovered
//!     tokio::time::sleep(tokio::time::Duration::from_secs(3)).await;
//!
//!     let stations = client.station_list();
//!     if let Some(station) = stations.first() {
//!         println!("Found station: {} ({})", station.name, station.ip_address);
//!
//!         client.connect(station);
//!         client.connectivity().wait_for(|connected| *connected).await?;
//!
//!         client.set_all_tracks_power(true)?;
//!         client.set_speed(3, 0.25, true)?;
//!
//!         let mut events = client.session_events();
//!         while let Ok(event) = events.recv().await {
//!             println!("Station event: {:?}", event);
//!         }
//!     }
//!
//!     client.stop_scan();
//!     Ok(())
//! }
//! ```
//!
//! # Direct Connection
//!
//! If you know where the station is, skip discovery:
//!
//! ```no_run
//! use dccex_throttle::{ClientConfig, DccClient, Station};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = DccClient::new(ClientConfig::default())?;
//!     client.connect(&Station::new("layout", "192.168.1.50", 2560));
//!     client.connectivity().wait_for(|connected| *connected).await?;
//!     client.read_cv(29)?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Protocol**: pure encode/decode of the native and multi-throttle grammars
//! - **Registry**: the shared list of known stations and their online state
//! - **Discovery**: service browsing, address resolution and health checks
//! - **Session**: the TCP connection, line framing and decoded event fan-out
//! - **Client**: the facade combining discovery and session

mod browser;
mod client;
mod config;
mod console;
mod discovery;
mod error;
mod framing;
pub mod protocol;
mod registry;
mod session;
mod subscription;
mod types;

// Public exports
pub use browser::{
    BrowseBatch, BrowseChange, ChannelBrowser, MdnsBrowser, ServiceBrowser, ServiceEndpoint,
};
pub use client::DccClient;
pub use config::{ClientConfig, DEFAULT_PORT, SERVICE_DOMAIN, SERVICE_TYPE};
pub use console::{Console, ConsoleDirection, ConsoleEntry};
pub use discovery::{DiscoveryEngine, DiscoveryEvent};
pub use error::{DccError, Result};
pub use framing::{LineCodec, MAX_LINE_LENGTH};
pub use protocol::{DecodedMessage, ProgrammingKind};
pub use registry::{StationList, StationRegistry};
pub use session::{SessionId, SessionManager};
pub use subscription::{
    DirectionUpdate, FunctionUpdate, ProgrammingResponse, SessionEvent, SessionReceiver,
    SessionState, SpeedUpdate,
};
pub use types::{
    CabNumber, CvNumber, CvValue, LocoAddress, Station, StationName, TrackId, TrackMode,
    TrackPower, TrackState, UNRESOLVED_ADDRESS,
};
