//! DCC-EX wire codec.
//!
//! Inbound lines arrive in one of two grammars sharing one TCP stream: the
//! native bracket grammar (`<r 5>`) and the WiThrottle multi-throttle grammar
//! (`MTA0L3<;>V50`). [`decode`] tries them in a fixed order. Outbound
//! commands are always native-grammar strings produced by the `encode_*`
//! functions; callers validate ranges beforehand.

use crate::types::{CabNumber, TrackId, TrackMode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the locomotive and command descriptors of a
/// multi-throttle line
pub const THROTTLE_SEPARATOR: &str = "<;>";

/// Number of speed steps used by the `<t>` throttle command
pub const SPEED_STEPS: f64 = 126.0;

const MIN_THROTTLE_LINE_LEN: usize = 10;

/// Which programming-track response a native frame carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgrammingKind {
    ReadAddress,
    ReadCv,
    WriteAddress,
    WriteCv,
    VerifyCv,
    ReadValue,
}

impl ProgrammingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgrammingKind::ReadAddress => "read_address",
            ProgrammingKind::ReadCv => "read_cv",
            ProgrammingKind::WriteAddress => "write_address",
            ProgrammingKind::WriteCv => "write_cv",
            ProgrammingKind::VerifyCv => "verify_cv",
            ProgrammingKind::ReadValue => "read_value",
        }
    }
}

/// A single inbound line after classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecodedMessage {
    Speed { cab: CabNumber, value: i32 },
    Direction { cab: CabNumber, forward: bool },
    Function { cab: CabNumber, number: u32, state: bool },
    Heartbeat,
    ProgrammingResponse { kind: ProgrammingKind, value: i32 },
    Unknown { raw: String },
}

impl fmt::Display for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedMessage::Speed { cab, value } => write!(f, "Speed: Loco {cab} -> {value}"),
            DecodedMessage::Direction { cab, forward } => write!(
                f,
                "Direction: Loco {cab} -> {}",
                if *forward { "Forward" } else { "Reverse" }
            ),
            DecodedMessage::Function { cab, number, state } => write!(
                f,
                "Function: Loco {cab} F{number} -> {}",
                if *state { "ON" } else { "OFF" }
            ),
            DecodedMessage::Heartbeat => f.write_str("Heartbeat"),
            DecodedMessage::ProgrammingResponse { kind, value } => {
                write!(f, "Programming: {} -> {value}", kind.as_str())
            }
            DecodedMessage::Unknown { raw } => write!(f, "Unknown: {raw}"),
        }
    }
}

/// Decode one already-delimited line.
///
/// Returns `None` for blank lines. Anything that is not a heartbeat and
/// matches neither grammar becomes [`DecodedMessage::Unknown`].
pub fn decode(line: &str) -> Option<DecodedMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed == "*" {
        return Some(DecodedMessage::Heartbeat);
    }

    if let Some(message) = decode_native(trimmed) {
        return Some(message);
    }

    Some(decode_multi_throttle(trimmed))
}

/// Native bracket grammar. `None` means "not a native frame we understand".
pub fn decode_native(line: &str) -> Option<DecodedMessage> {
    let content = line.strip_prefix('<')?.strip_suffix('>')?;
    let parts: Vec<&str> = content.split(' ').filter(|p| !p.is_empty()).collect();
    let command = parts.first()?.to_lowercase();

    let int_at = |index: usize| parts.get(index).and_then(|p| p.parse::<i32>().ok());
    let response = |kind, value| DecodedMessage::ProgrammingResponse { kind, value };

    match command.as_str() {
        "r" => int_at(1).map(|v| response(ProgrammingKind::ReadAddress, v)),
        "r1" | "r2" | "r3" => int_at(1).map(|v| response(ProgrammingKind::ReadCv, v)),
        "w" => int_at(1).map(|v| response(ProgrammingKind::WriteAddress, v)),
        "w1" | "w2" | "w3" => int_at(1).map(|v| response(ProgrammingKind::WriteCv, v)),
        // <v CV VALUE>: the CV is echoed back but only the value is reported
        "v" => int_at(2).map(|v| response(ProgrammingKind::VerifyCv, v)),
        other => {
            if other.starts_with(|c: char| c.is_ascii_digit()) {
                other
                    .parse::<i32>()
                    .ok()
                    .map(|v| response(ProgrammingKind::ReadValue, v))
            } else {
                None
            }
        }
    }
}

/// Multi-throttle grammar: `M<throttle>A<id><L|S><cab><;><cmd><value>`.
///
/// Never fails; malformed lines come back as `Unknown`.
pub fn decode_multi_throttle(line: &str) -> DecodedMessage {
    parse_multi_throttle(line).unwrap_or_else(|| DecodedMessage::Unknown {
        raw: line.to_string(),
    })
}

fn parse_multi_throttle(line: &str) -> Option<DecodedMessage> {
    if !line.starts_with('M')
        || line.chars().count() < MIN_THROTTLE_LINE_LEN
        || line.chars().nth(2) != Some('A')
    {
        return None;
    }

    let separator = line.find(THROTTLE_SEPARATOR)?;

    // Locomotive descriptor starts after the fourth character
    let loco_start = line.char_indices().nth(4).map_or(line.len(), |(i, _)| i);
    let loco = line.get(loco_start..separator)?;
    if loco.chars().count() < 2 {
        return None;
    }
    // First character is the address class (L/S)
    let cab: CabNumber = skip_first(loco).parse().ok()?;

    let command = &line[separator + THROTTLE_SEPARATOR.len()..];
    if command.chars().count() < 2 {
        return None;
    }
    let value = skip_first(command);

    match command.chars().next()? {
        'V' => Some(DecodedMessage::Speed {
            cab,
            value: value.parse().ok()?,
        }),
        'R' => {
            let direction: i32 = value.parse().ok()?;
            Some(DecodedMessage::Direction {
                cab,
                forward: direction != 0,
            })
        }
        'F' => {
            // F<state><number>: F15 is function 5 on, F05 function 5 off
            if value.chars().count() < 2 {
                return None;
            }
            let state = value.starts_with('1');
            let number = skip_first(value).parse().ok()?;
            Some(DecodedMessage::Function { cab, number, state })
        }
        _ => None,
    }
}

fn skip_first(s: &str) -> &str {
    let mut chars = s.chars();
    chars.next();
    chars.as_str()
}

// ── Encoders ────────────────────────────────────────────────────────

/// Map a normalized slider position onto the 0..=126 step range
pub fn speed_step(normalized: f64) -> u32 {
    if normalized.is_nan() {
        return 0;
    }
    (normalized.clamp(0.0, 1.0) * SPEED_STEPS).floor() as u32
}

/// `<t ADDRESS STEP DIR>`
pub fn encode_speed(address: u32, normalized: f64, forward: bool) -> String {
    format!(
        "<t {} {} {}>",
        address,
        speed_step(normalized),
        u8::from(forward)
    )
}

/// `<F ADDRESS FUNCTION STATE>`
pub fn encode_function(address: u32, function: u32, state: bool) -> String {
    format!("<F {} {} {}>", address, function, u8::from(state))
}

/// `<1>` or `<0>`
pub fn encode_track_power(on: bool) -> String {
    let literal = if on { "<1>" } else { "<0>" };
    literal.to_string()
}

/// Same literals as [`encode_track_power`]; a bare power command already
/// applies to every track.
pub fn encode_all_tracks_power(on: bool) -> String {
    encode_track_power(on)
}

/// `<= TRACK MAIN|PROG>`
pub fn encode_track_mode(track: TrackId, mode: TrackMode) -> String {
    format!("<= {} {}>", track.as_str(), mode.wire_keyword())
}

pub fn encode_emergency_stop_all() -> String {
    "<!>".to_string()
}

pub fn encode_read_address() -> String {
    "<R>".to_string()
}

pub fn encode_write_address(address: u32) -> String {
    format!("<W {}>", address)
}

pub fn encode_read_cv(cv: u32) -> String {
    format!("<R {}>", cv)
}

pub fn encode_write_cv(cv: u32, value: u32) -> String {
    format!("<W {} {}>", cv, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn programming(kind: ProgrammingKind, value: i32) -> Option<DecodedMessage> {
        Some(DecodedMessage::ProgrammingResponse { kind, value })
    }

    fn unknown(raw: &str) -> Option<DecodedMessage> {
        Some(DecodedMessage::Unknown {
            raw: raw.to_string(),
        })
    }

    #[test]
    fn native_programming_responses() {
        assert_eq!(decode("<r 5>"), programming(ProgrammingKind::ReadAddress, 5));
        assert_eq!(decode("<r2 17>"), programming(ProgrammingKind::ReadCv, 17));
        assert_eq!(decode("<w 3>"), programming(ProgrammingKind::WriteAddress, 3));
        assert_eq!(decode("<w1 12>"), programming(ProgrammingKind::WriteCv, 12));
        assert_eq!(decode("<v 7 99>"), programming(ProgrammingKind::VerifyCv, 99));
        assert_eq!(decode("<235>"), programming(ProgrammingKind::ReadValue, 235));
    }

    #[test]
    fn native_is_case_insensitive_and_collapses_spaces() {
        assert_eq!(decode("  <R   42>  "), programming(ProgrammingKind::ReadAddress, 42));
        assert_eq!(decode("<W3  8>"), programming(ProgrammingKind::WriteCv, 8));
    }

    #[test]
    fn verify_requires_three_tokens() {
        assert_eq!(decode("<v 99>"), unknown("<v 99>"));
    }

    #[test]
    fn native_misses_fall_through_to_unknown() {
        assert_eq!(decode("<r abc>"), unknown("<r abc>"));
        assert_eq!(decode("<iDCC-EX V-5.0>"), unknown("<iDCC-EX V-5.0>"));
        assert_eq!(decode("<>"), unknown("<>"));
        assert_eq!(decode("<-3>"), unknown("<-3>"));
        assert_eq!(decode_native("<p1>"), None);
    }

    #[test]
    fn heartbeat_and_blank() {
        assert_eq!(decode("*"), Some(DecodedMessage::Heartbeat));
        assert_eq!(decode("  *\r"), Some(DecodedMessage::Heartbeat));
        assert_eq!(decode(""), None);
        assert_eq!(decode(" \t\r\n"), None);
    }

    #[test]
    fn multi_throttle_messages() {
        assert_eq!(
            decode("MTA0L3<;>V50"),
            Some(DecodedMessage::Speed { cab: 3, value: 50 })
        );
        assert_eq!(
            decode("MTA0L3<;>R0"),
            Some(DecodedMessage::Direction { cab: 3, forward: false })
        );
        assert_eq!(
            decode("MTA0L3<;>R1"),
            Some(DecodedMessage::Direction { cab: 3, forward: true })
        );
        assert_eq!(
            decode("MTA0L3<;>F15"),
            Some(DecodedMessage::Function { cab: 3, number: 5, state: true })
        );
        assert_eq!(
            decode("MTA0S42<;>F012"),
            Some(DecodedMessage::Function { cab: 42, number: 12, state: false })
        );
    }

    #[test]
    fn malformed_multi_throttle_is_unknown() {
        // too short
        assert_eq!(decode("MTA0L3<;>"), unknown("MTA0L3<;>"));
        // third character is not 'A'
        assert_eq!(decode("MTX0L3<;>V50"), unknown("MTX0L3<;>V50"));
        // no separator
        assert_eq!(decode("MTA0L3;;;V50"), unknown("MTA0L3;;;V50"));
        // non-numeric cab
        assert_eq!(decode("MTA0LX<;>V50"), unknown("MTA0LX<;>V50"));
        // command too short
        assert_eq!(decode("MTA0L3333<;>V"), unknown("MTA0L3333<;>V"));
        // unsupported command
        assert_eq!(decode("MTA0L3<;>Q12"), unknown("MTA0L3<;>Q12"));
        // function payload too short
        assert_eq!(decode("MTA0L3333<;>F1"), unknown("MTA0L3333<;>F1"));
    }

    #[test]
    fn unrelated_lines_are_unknown_and_trimmed() {
        assert_eq!(decode("  VN2.0 \r\n"), unknown("VN2.0"));
        assert_eq!(decode("PPA1"), unknown("PPA1"));
    }

    #[test]
    fn speed_encoding() {
        assert_eq!(encode_speed(3, 0.5, true), "<t 3 63 1>");
        assert_eq!(encode_speed(3, 0.0, false), "<t 3 0 0>");
        assert_eq!(encode_speed(4014, 1.0, true), "<t 4014 126 1>");
        assert_eq!(encode_speed(3, 1.7, true), "<t 3 126 1>");
        assert_eq!(encode_speed(3, -0.2, true), "<t 3 0 1>");
        assert_eq!(speed_step(f64::NAN), 0);
    }

    #[test]
    fn command_encoding() {
        assert_eq!(encode_function(3, 0, true), "<F 3 0 1>");
        assert_eq!(encode_function(3, 28, false), "<F 3 28 0>");
        assert_eq!(encode_track_power(true), "<1>");
        assert_eq!(encode_all_tracks_power(false), "<0>");
        assert_eq!(encode_track_mode(TrackId::A, TrackMode::Main), "<= A MAIN>");
        assert_eq!(encode_track_mode(TrackId::B, TrackMode::Program), "<= B PROG>");
        assert_eq!(encode_emergency_stop_all(), "<!>");
        assert_eq!(encode_read_address(), "<R>");
        assert_eq!(encode_write_address(1234), "<W 1234>");
        assert_eq!(encode_read_cv(29), "<R 29>");
        assert_eq!(encode_write_cv(29, 6), "<W 29 6>");
    }

    #[test]
    fn display_descriptions() {
        assert_eq!(
            DecodedMessage::Function { cab: 3, number: 5, state: true }.to_string(),
            "Function: Loco 3 F5 -> ON"
        );
        assert_eq!(
            DecodedMessage::ProgrammingResponse {
                kind: ProgrammingKind::VerifyCv,
                value: 99
            }
            .to_string(),
            "Programming: verify_cv -> 99"
        );
    }
}
