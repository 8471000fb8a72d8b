//! Configuration Vault – reads `~/.rollbot/config.toml`.

use rollbot_hal::GateConfig;
use rollbot_kernel::SafetyConfig;
use rollbot_perception::{GridConfig, PlannerConfig};
use rollbot_runtime::NavigationConfig;
use rollbot_types::{Point2, RobotError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Which transport the motion controller is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// No transport: commands are logged, reads return zeros.
    Simulate,
    /// In-process kinematic base with a simulated lidar.
    #[default]
    KinematicSim,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Simulate => write!(f, "simulate"),
            Backend::KinematicSim => write!(f, "kinematic-sim"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = RobotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "simulate" => Ok(Backend::Simulate),
            "kinematic-sim" => Ok(Backend::KinematicSim),
            other => Err(RobotError::Config(format!("unknown backend '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bus address of the motion controller.
    pub address: u8,
    pub backend: Backend,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            backend: Backend::default(),
        }
    }
}

/// World seen by the simulated lidar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub obstacles: Vec<Point2>,
    pub lidar_range: f32,
    /// Starting pose of the simulated base.
    pub start: Point2,
    pub start_heading: f32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            obstacles: Vec::new(),
            lidar_range: default_lidar_range(),
            start: Point2::new(50.0, 50.0),
            start_heading: 0.0,
        }
    }
}

/// Persisted configuration stored in `~/.rollbot/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub gate: GateConfig,
    pub grid: GridConfig,
    pub planner: PlannerConfig,
    pub navigation: NavigationConfig,
    pub safety: SafetyConfig,
    pub sim: SimConfig,
}

fn default_address() -> u8 {
    0x42
}
fn default_lidar_range() -> f32 {
    2000.0
}

/// Return the path to `~/.rollbot/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".rollbot").join("config.toml")
}

/// Load the config from `path`, falling back to defaults when the file does
/// not exist.  Environment overrides are applied either way.
pub fn load_or_default(path: &Path) -> Result<Config, RobotError> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg)?;
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, RobotError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        RobotError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| RobotError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `ROLLBOT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ROLLBOT_BUS_ADDRESS` | `device.address` (decimal or `0x` hex) |
/// | `ROLLBOT_BACKEND` | `device.backend` |
/// | `ROLLBOT_SAFETY_DISTANCE` | `safety.min_distance` |
///
/// Unparsable values are a [`RobotError::Config`].
pub fn apply_env_overrides(cfg: &mut Config) -> Result<(), RobotError> {
    if let Ok(v) = std::env::var("ROLLBOT_BUS_ADDRESS") {
        cfg.device.address = parse_address(&v)?;
    }
    if let Ok(v) = std::env::var("ROLLBOT_BACKEND") {
        cfg.device.backend = v.parse()?;
    }
    if let Ok(v) = std::env::var("ROLLBOT_SAFETY_DISTANCE") {
        cfg.safety.min_distance = v
            .trim()
            .parse::<f32>()
            .ok()
            .filter(|d| d.is_finite() && *d >= 0.0)
            .ok_or_else(|| RobotError::Config(format!("invalid ROLLBOT_SAFETY_DISTANCE '{v}'")))?;
    }
    Ok(())
}

fn parse_address(value: &str) -> Result<u8, RobotError> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse::<u8>(),
    };
    parsed.map_err(|_| RobotError::Config(format!("invalid bus address '{value}'")))
}
