//! IPC Message Definitions
//!
//! This module defines the message types used for communication between the
//! client and the daemon. Requests carry an id so that replies can be matched
//! to them while unsolicited push events interleave on the same stream.

use crate::types::{DaemonKeyEvent, GeoLocation, PublicKey, Settings, TunnelState};
use serde::{Deserialize, Serialize};

/// Operation requested by the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DaemonRequest {
    /// Fetch the current daemon settings
    GetSettings,

    /// Allow or disallow LAN traffic outside the tunnel
    SetAllowLan(bool),

    /// Fetch the currently registered public key, if any
    GetKey,

    /// Generate and register a new key pair
    GenerateKey,

    /// Verify that the current key is registered with the relay infrastructure
    VerifyKey,

    /// Measure the current apparent network location
    GetLocation,

    /// Fetch the current tunnel state
    GetState,

    /// Replace the set of applications excluded from the tunnel
    SetExcludedApps(Vec<String>),

    /// Swap the underlying tunnel device in place, without tearing down the
    /// outer connection sequencing
    ReplaceTunnelDevice,

    /// Bring the tunnel up
    ConnectTunnel,

    /// Tear the tunnel down
    DisconnectTunnel,

    /// Ask the daemon to exit
    Shutdown,
}

/// Successful payload of a daemon reply.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DaemonResponse {
    /// Generic acknowledgement for requests without a payload
    Ack,

    /// Response to a settings request
    Settings(Settings),

    /// Response to a key fetch; `None` when no key is registered yet
    Key(Option<PublicKey>),

    /// Outcome of a key generation request
    KeyGeneration(DaemonKeyEvent),

    /// Outcome of a key verification request
    KeyVerification(bool),

    /// Response to a location request; `None` when the measurement failed
    Location(Option<GeoLocation>),

    /// Response to a tunnel state request
    State(TunnelState),
}

/// Event pushed by the daemon without a preceding request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    /// The tunnel moved to a new state
    TunnelStateChanged(TunnelState),

    /// The key registered for this account changed
    KeyEvent(DaemonKeyEvent),

    /// The daemon settings changed
    SettingsChanged(Settings),
}

/// Client to daemon frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Matches the reply to this request
    pub id: u64,

    /// The requested operation
    pub request: DaemonRequest,
}

/// Daemon to client frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DaemonMessage {
    /// Reply to the request with the given id. Daemon-reported failures
    /// travel as the error string.
    Reply {
        id: u64,
        result: Result<DaemonResponse, String>,
    },

    /// Unsolicited push event
    Event(DaemonEvent),
}
