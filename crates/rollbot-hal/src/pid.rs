//! Controller channel tables: PID gains, telemetry channels and speed-profile
//! axes, addressed either by index or by name.
//!
//! Every lookup goes through a tagged [`ChannelId`] and returns an `Option`;
//! an unknown identifier is an ordinary outcome the caller must check.
//!
//! ```rust
//! use rollbot_hal::pid::{default_pid_table, lookup, ChannelId};
//!
//! let pids = default_pid_table();
//! let rho: ChannelId = "rho".parse().unwrap();
//! assert_eq!(lookup(&pids, &rho).map(|p| p.index), Some(1));
//! assert!(lookup(&pids, &ChannelId::Index(9)).is_none());
//! ```

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use rollbot_types::RobotError;
use serde::{Deserialize, Serialize};

use crate::channel::{decode_f32s, encode_f32s};

/// Index-or-name identifier, parsed from operator text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Index(u8),
    Name(String),
}

impl FromStr for ChannelId {
    type Err = Infallible;

    /// Numeric text becomes an index, anything else a name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<u8>() {
            Ok(idx) => ChannelId::Index(idx),
            Err(_) => ChannelId::Name(s.to_string()),
        })
    }
}

impl From<u8> for ChannelId {
    fn from(idx: u8) -> Self {
        ChannelId::Index(idx)
    }
}

impl From<&str> for ChannelId {
    fn from(name: &str) -> Self {
        ChannelId::Name(name.to_string())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Index(idx) => write!(f, "#{idx}"),
            ChannelId::Name(name) => write!(f, "{name}"),
        }
    }
}

/// Anything addressable by a [`ChannelId`].
pub trait Channel {
    fn name(&self) -> &str;
    fn index(&self) -> u8;
}

/// Resolve `id` against `items`.
pub fn lookup<'a, T: Channel>(items: &'a [T], id: &ChannelId) -> Option<&'a T> {
    items.iter().find(|item| match id {
        ChannelId::Index(idx) => item.index() == *idx,
        ChannelId::Name(name) => item.name() == name,
    })
}

// ────────────────────────────────────────────────────────────────────────────
// PID parameters
// ────────────────────────────────────────────────────────────────────────────

/// Gains of one on-device PID loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidParameters {
    pub name: String,
    /// Register sub-address of this loop.
    pub index: u8,
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl PidParameters {
    /// Wire size of the gains payload.
    pub const WIRE_LEN: usize = 12;

    pub fn new(name: impl Into<String>, index: u8) -> Self {
        Self {
            name: name.into(),
            index,
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
        }
    }

    pub fn set(&mut self, kp: f32, ki: f32, kd: f32) -> &mut Self {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
        self
    }

    /// `kp, ki, kd` as three little-endian `f32`s.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_f32s(&[self.kp, self.ki, self.kd])
    }

    /// Overwrite the gains from a 12-byte payload.
    pub fn from_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self, RobotError> {
        let [kp, ki, kd] = decode_f32s::<3>(bytes)?;
        Ok(self.set(kp, ki, kd))
    }
}

impl Channel for PidParameters {
    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> u8 {
        self.index
    }
}

impl fmt::Display for PidParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pid(name={}, idx={}, kp={}, ki={}, kd={})",
            self.name, self.index, self.kp, self.ki, self.kd
        )
    }
}

/// The loops exposed by the motion-control firmware.
pub fn default_pid_table() -> Vec<PidParameters> {
    ["theta", "rho", "left_vel", "right_vel"]
        .into_iter()
        .zip(0u8..)
        .map(|(name, idx)| PidParameters::new(name, idx))
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Telemetry channels
// ────────────────────────────────────────────────────────────────────────────

/// A firmware telemetry stream that can be switched on or off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryChannel {
    pub name: String,
    pub index: u8,
}

impl Channel for TelemetryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> u8 {
        self.index
    }
}

/// One `pid_<name>` telemetry stream per PID loop, sharing its index.
pub fn telemetry_for(pids: &[PidParameters]) -> Vec<TelemetryChannel> {
    pids.iter()
        .map(|pid| TelemetryChannel {
            name: format!("pid_{}", pid.name),
            index: pid.index,
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Speed-profile axes
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileAxis {
    Distance,
    Angle,
}

impl ProfileAxis {
    pub fn index(self) -> u8 {
        match self {
            ProfileAxis::Distance => 0,
            ProfileAxis::Angle => 1,
        }
    }

    /// Resolve an operator identifier (`0`/`distance`/`dst`, `1`/`angle`).
    pub fn resolve(id: &ChannelId) -> Option<Self> {
        match id {
            ChannelId::Index(0) => Some(ProfileAxis::Distance),
            ChannelId::Index(1) => Some(ProfileAxis::Angle),
            ChannelId::Index(_) => None,
            ChannelId::Name(name) => match name.as_str() {
                "distance" | "dst" | "rho" => Some(ProfileAxis::Distance),
                "angle" | "theta" => Some(ProfileAxis::Angle),
                _ => None,
            },
        }
    }
}
