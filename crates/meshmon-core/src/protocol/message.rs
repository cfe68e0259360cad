//! Typed application messages and port dispatch
//!
//! `AppPort` is the fixed table of application ports the pipeline handles.
//! Every port maps to exactly one `AppMessage` variant; anything else is
//! `AppPort::Unrecognized` and is dropped by the dispatcher.

use prost::Message;
use serde::{Deserialize, Serialize};

use super::schema::{
    self, NeighborInfo, Paxcount, PortNum, Position, RouteDiscovery, Routing, Telemetry, User,
    Waypoint,
};
use crate::errors::DecodeError;

// ----------------------------------------------------------------------------
// Port Table
// ----------------------------------------------------------------------------

/// Application port handled by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppPort {
    Text,
    CompressedText,
    Position,
    NodeInfo,
    Telemetry,
    Traceroute,
    Routing,
    Admin,
    NeighborInfo,
    Paxcounter,
    Waypoint,
    RangeTest,
    StoreForward,
    Unrecognized(i32),
}

impl AppPort {
    /// Look up the handler port for a raw port number
    pub fn from_portnum(portnum: i32) -> Self {
        match PortNum::try_from(portnum) {
            Ok(PortNum::TextMessageApp) => AppPort::Text,
            Ok(PortNum::TextMessageCompressedApp) => AppPort::CompressedText,
            Ok(PortNum::PositionApp) => AppPort::Position,
            Ok(PortNum::NodeinfoApp) => AppPort::NodeInfo,
            Ok(PortNum::TelemetryApp) => AppPort::Telemetry,
            Ok(PortNum::TracerouteApp) => AppPort::Traceroute,
            Ok(PortNum::RoutingApp) => AppPort::Routing,
            Ok(PortNum::AdminApp) => AppPort::Admin,
            Ok(PortNum::NeighborinfoApp) => AppPort::NeighborInfo,
            Ok(PortNum::PaxcounterApp) => AppPort::Paxcounter,
            Ok(PortNum::WaypointApp) => AppPort::Waypoint,
            Ok(PortNum::RangeTestApp) => AppPort::RangeTest,
            Ok(PortNum::StoreForwardApp) => AppPort::StoreForward,
            _ => AppPort::Unrecognized(portnum),
        }
    }

    /// Raw port number on the wire
    pub fn portnum(&self) -> i32 {
        let port = match self {
            AppPort::Text => PortNum::TextMessageApp,
            AppPort::CompressedText => PortNum::TextMessageCompressedApp,
            AppPort::Position => PortNum::PositionApp,
            AppPort::NodeInfo => PortNum::NodeinfoApp,
            AppPort::Telemetry => PortNum::TelemetryApp,
            AppPort::Traceroute => PortNum::TracerouteApp,
            AppPort::Routing => PortNum::RoutingApp,
            AppPort::Admin => PortNum::AdminApp,
            AppPort::NeighborInfo => PortNum::NeighborinfoApp,
            AppPort::Paxcounter => PortNum::PaxcounterApp,
            AppPort::Waypoint => PortNum::WaypointApp,
            AppPort::RangeTest => PortNum::RangeTestApp,
            AppPort::StoreForward => PortNum::StoreForwardApp,
            AppPort::Unrecognized(raw) => return *raw,
        };
        port as i32
    }

    pub fn name(&self) -> &'static str {
        match self {
            AppPort::Text => "text",
            AppPort::CompressedText => "compressed-text",
            AppPort::Position => "position",
            AppPort::NodeInfo => "nodeinfo",
            AppPort::Telemetry => "telemetry",
            AppPort::Traceroute => "traceroute",
            AppPort::Routing => "routing",
            AppPort::Admin => "admin",
            AppPort::NeighborInfo => "neighborinfo",
            AppPort::Paxcounter => "paxcounter",
            AppPort::Waypoint => "waypoint",
            AppPort::RangeTest => "range-test",
            AppPort::StoreForward => "store-forward",
            AppPort::Unrecognized(_) => "unrecognized",
        }
    }
}

// ----------------------------------------------------------------------------
// Typed Messages
// ----------------------------------------------------------------------------

/// Decoded application payload, one variant per handled port
#[derive(Debug, Clone, PartialEq)]
pub enum AppMessage {
    Text { text: String },
    /// Compressed text is carried opaquely; only its presence is recorded
    CompressedText { payload: Vec<u8> },
    Position(Position),
    NodeInfo(User),
    Telemetry(Telemetry),
    Traceroute(RouteDiscovery),
    Routing(Routing),
    /// Admin payloads are session-keyed; only the size is kept
    Admin { payload_len: usize },
    NeighborInfo(NeighborInfo),
    Paxcounter(Paxcount),
    Waypoint(Waypoint),
    RangeTest { text: String },
    StoreForward { payload_len: usize },
}

impl AppMessage {
    /// Decode a payload for the given port
    pub fn decode(port: AppPort, payload: &[u8]) -> Result<Self, DecodeError> {
        let malformed = |reason: String| DecodeError::MalformedPayload {
            port: port.name(),
            reason,
        };

        let message = match port {
            AppPort::Text => AppMessage::Text {
                text: decode_text(payload).map_err(malformed)?,
            },
            AppPort::CompressedText => AppMessage::CompressedText {
                payload: payload.to_vec(),
            },
            AppPort::Position => {
                AppMessage::Position(Position::decode(payload).map_err(|e| malformed(e.to_string()))?)
            }
            AppPort::NodeInfo => {
                AppMessage::NodeInfo(User::decode(payload).map_err(|e| malformed(e.to_string()))?)
            }
            AppPort::Telemetry => AppMessage::Telemetry(
                Telemetry::decode(payload).map_err(|e| malformed(e.to_string()))?,
            ),
            AppPort::Traceroute => AppMessage::Traceroute(
                RouteDiscovery::decode(payload).map_err(|e| malformed(e.to_string()))?,
            ),
            AppPort::Routing => {
                AppMessage::Routing(Routing::decode(payload).map_err(|e| malformed(e.to_string()))?)
            }
            AppPort::Admin => AppMessage::Admin {
                payload_len: payload.len(),
            },
            AppPort::NeighborInfo => AppMessage::NeighborInfo(
                NeighborInfo::decode(payload).map_err(|e| malformed(e.to_string()))?,
            ),
            AppPort::Paxcounter => AppMessage::Paxcounter(
                Paxcount::decode(payload).map_err(|e| malformed(e.to_string()))?,
            ),
            AppPort::Waypoint => AppMessage::Waypoint(
                Waypoint::decode(payload).map_err(|e| malformed(e.to_string()))?,
            ),
            AppPort::RangeTest => AppMessage::RangeTest {
                text: decode_text(payload).map_err(malformed)?,
            },
            AppPort::StoreForward => AppMessage::StoreForward {
                payload_len: payload.len(),
            },
            AppPort::Unrecognized(port) => return Err(DecodeError::UnrecognizedPort { port }),
        };
        Ok(message)
    }

    pub fn port(&self) -> AppPort {
        match self {
            AppMessage::Text { .. } => AppPort::Text,
            AppMessage::CompressedText { .. } => AppPort::CompressedText,
            AppMessage::Position(_) => AppPort::Position,
            AppMessage::NodeInfo(_) => AppPort::NodeInfo,
            AppMessage::Telemetry(_) => AppPort::Telemetry,
            AppMessage::Traceroute(_) => AppPort::Traceroute,
            AppMessage::Routing(_) => AppPort::Routing,
            AppMessage::Admin { .. } => AppPort::Admin,
            AppMessage::NeighborInfo(_) => AppPort::NeighborInfo,
            AppMessage::Paxcounter(_) => AppPort::Paxcounter,
            AppMessage::Waypoint(_) => AppPort::Waypoint,
            AppMessage::RangeTest { .. } => AppPort::RangeTest,
            AppMessage::StoreForward { .. } => AppPort::StoreForward,
        }
    }

    /// Routing error reason, if this is a routing nak
    pub fn routing_error(&self) -> Option<schema::RoutingError> {
        match self {
            AppMessage::Routing(Routing {
                variant: Some(schema::routing::Variant::ErrorReason(reason)),
            }) => schema::RoutingError::try_from(*reason).ok(),
            _ => None,
        }
    }
}

fn decode_text(payload: &[u8]) -> Result<String, String> {
    String::from_utf8(payload.to_vec()).map_err(|e| format!("invalid utf-8: {}", e))
}
