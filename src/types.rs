use crate::error::{DccError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Station name as advertised by service discovery
pub type StationName = String;

/// Locomotive (cab) address carried by throttle messages
pub type CabNumber = u32;

/// Placeholder IP shown until address resolution succeeds
pub const UNRESOLVED_ADDRESS: &str = "Resolving...";

/// A discovered DCC-EX command station
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub name: StationName,

    /// Advertised host name, e.g. `dccex.local.`
    pub host_name: String,

    /// Resolved IP address, or [`UNRESOLVED_ADDRESS`]
    pub ip_address: String,

    pub port: u16,

    pub is_online: bool,
}

impl Station {
    /// Create a freshly discovered, online station with an unresolved address
    pub fn new(name: impl Into<String>, host_name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host_name: host_name.into(),
            ip_address: UNRESOLVED_ADDRESS.to_string(),
            port,
            is_online: true,
        }
    }

    /// Whether the IP address has been resolved yet
    pub fn is_resolved(&self) -> bool {
        self.ip_address != UNRESOLVED_ADDRESS
    }
}

/// Track output on the command station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackId {
    A,
    B,
}

impl TrackId {
    pub const ALL: [TrackId; 2] = [TrackId::A, TrackId::B];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackId::A => "A",
            TrackId::B => "B",
        }
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Track mode: main line operations or the programming track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TrackMode {
    #[default]
    Main,
    Program,
}

impl TrackMode {
    /// Wire keyword used by the `<= TRACK MODE>` command
    pub fn wire_keyword(&self) -> &'static str {
        match self {
            TrackMode::Main => "MAIN",
            TrackMode::Program => "PROG",
        }
    }
}

/// Track power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TrackPower {
    On,
    #[default]
    Off,
}

impl From<bool> for TrackPower {
    fn from(on: bool) -> Self {
        if on {
            TrackPower::On
        } else {
            TrackPower::Off
        }
    }
}

/// Locally tracked state of one track output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackState {
    pub id: TrackId,
    pub power: TrackPower,
    pub mode: TrackMode,
}

impl TrackState {
    pub fn new(id: TrackId) -> Self {
        Self {
            id,
            power: TrackPower::Off,
            mode: TrackMode::Main,
        }
    }
}

/// DCC locomotive address, short (1-127) or long (128-10239)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocoAddress(u16);

impl LocoAddress {
    pub const MIN: i64 = 1;
    pub const MAX: i64 = 10239;

    pub fn new(address: i64) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&address) {
            Ok(Self(address as u16))
        } else {
            Err(DccError::InvalidAddress(address))
        }
    }

    pub fn get(&self) -> u16 {
        self.0
    }

    /// Short addresses fit in a single byte on the wire
    pub fn is_long(&self) -> bool {
        self.0 > 127
    }
}

/// Decoder configuration variable number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CvNumber(u16);

impl CvNumber {
    pub const MIN: i64 = 1;
    pub const MAX: i64 = 1024;

    pub fn new(cv: i64) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&cv) {
            Ok(Self(cv as u16))
        } else {
            Err(DccError::InvalidCv(cv))
        }
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

/// Value stored in a configuration variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CvValue(u8);

impl CvValue {
    pub fn new(value: i64) -> Result<Self> {
        u8::try_from(value)
            .map(Self)
            .map_err(|_| DccError::InvalidCvValue(value))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_bounds() {
        assert!(LocoAddress::new(0).is_err());
        assert_eq!(LocoAddress::new(1).unwrap().get(), 1);
        assert_eq!(LocoAddress::new(10239).unwrap().get(), 10239);
        assert!(matches!(
            LocoAddress::new(10240),
            Err(DccError::InvalidAddress(10240))
        ));
        assert!(!LocoAddress::new(127).unwrap().is_long());
        assert!(LocoAddress::new(128).unwrap().is_long());
    }

    #[test]
    fn cv_bounds() {
        assert!(CvNumber::new(0).is_err());
        assert!(CvNumber::new(1024).is_ok());
        assert!(CvNumber::new(1025).is_err());
        assert!(CvValue::new(-1).is_err());
        assert_eq!(CvValue::new(255).unwrap().get(), 255);
        assert!(matches!(CvValue::new(256), Err(DccError::InvalidCvValue(256))));
    }

    #[test]
    fn new_station_is_online_and_unresolved() {
        let station = Station::new("DCC-EX", "DCC-EX.local.", 2560);
        assert!(station.is_online);
        assert!(!station.is_resolved());
        assert_eq!(station.ip_address, UNRESOLVED_ADDRESS);
    }
}
