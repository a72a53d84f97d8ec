//! Shared data model for daemon-reported state.
//!
//! These types cross the IPC boundary and are mirrored on the client side by
//! the coordination layer. The daemon is the only source of truth for all of
//! them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A WireGuard public key, in the base64 form the daemon reports it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(pub String);

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PublicKey {
    fn from(s: &str) -> Self {
        PublicKey(s.to_string())
    }
}

/// What the daemon does once an active tunnel has been torn down.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionAfterDisconnect {
    /// Leave the network open
    Nothing,

    /// Keep blocking all traffic
    Block,

    /// Bring a new tunnel up immediately
    Reconnect,
}

/// Why the daemon entered the error state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorCause {
    /// Whether the daemon is blocking all traffic while in this state
    pub is_blocking: bool,

    /// Daemon-supplied description of the failure
    pub reason: String,
}

/// State of the tunnel as reported by the daemon.
///
/// Exactly one variant is active at a time. Transitions originate from daemon
/// push events; the client never predicts them locally, with the single
/// exception of `Disconnecting`, which the session layer may synthesize while
/// a requested disconnect awaits daemon confirmation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum TunnelState {
    /// No tunnel, traffic flows outside it
    Disconnected,

    /// A tunnel is being negotiated towards the selected relay
    Connecting {
        /// Relay-derived location of the endpoint being connected to, if known
        location: Option<GeoLocation>,
    },

    /// The tunnel is up
    Connected {
        /// Relay-derived location of the connected endpoint
        location: GeoLocation,
    },

    /// The tunnel is being torn down
    Disconnecting {
        /// What the daemon does once the teardown completes
        after_disconnect: ActionAfterDisconnect,
    },

    /// The daemon failed to reach the requested state
    Error {
        /// Cause of the failure, including whether traffic is blocked
        cause: ErrorCause,
    },
}

impl TunnelState {
    /// Returns true if the tunnel state is the error state.
    pub fn is_in_error_state(&self) -> bool {
        matches!(self, TunnelState::Error { .. })
    }
}

/// A network location, either measured by the daemon or inferred from relay
/// metadata.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GeoLocation {
    /// Latitude, absent for relay-inferred locations
    pub latitude: Option<f64>,

    /// Longitude, absent for relay-inferred locations
    pub longitude: Option<f64>,

    /// Country name
    pub country: String,

    /// City name, if resolved to that granularity
    pub city: Option<String>,

    /// Relay hostname, only present when derived from a specific relay
    pub hostname: Option<String>,
}

/// The relay constraint currently selected in the daemon settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RelaySelection {
    /// Any relay in a country
    Country { country: String },

    /// Any relay in a city
    City { country: String, city: String },

    /// One specific relay
    Relay {
        country: String,
        city: String,
        hostname: String,
    },
}

impl RelaySelection {
    /// The location inferred from the relay metadata alone. Coordinates are
    /// never available this way; granularity follows the selection.
    pub fn to_location(&self) -> GeoLocation {
        match self {
            RelaySelection::Country { country } => GeoLocation {
                latitude: None,
                longitude: None,
                country: country.clone(),
                city: None,
                hostname: None,
            },
            RelaySelection::City { country, city } => GeoLocation {
                latitude: None,
                longitude: None,
                country: country.clone(),
                city: Some(city.clone()),
                hostname: None,
            },
            RelaySelection::Relay {
                country,
                city,
                hostname,
            } => GeoLocation {
                latitude: None,
                longitude: None,
                country: country.clone(),
                city: Some(city.clone()),
                hostname: Some(hostname.clone()),
            },
        }
    }
}

/// Daemon settings relevant to the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Settings {
    /// Whether LAN traffic bypasses the tunnel
    pub allow_lan: bool,

    /// The relay constraint the daemon connects to
    pub selected_relay: Option<RelaySelection>,
}

/// Key lifecycle outcome as the daemon reports it, both as the response to a
/// generation request and as an unsolicited key event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DaemonKeyEvent {
    /// A key is registered with the relay infrastructure
    NewKey(PublicKey),

    /// The account has reached its key limit
    TooManyKeys,

    /// Key generation or registration failed
    GenerationFailure,
}
