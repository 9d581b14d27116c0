//! # obs-wire
//!
//! Shared wire vocabulary and codecs for the observatory federation daemon.
//!
//! These types are used by:
//! - `obsd`: decoding device/client traffic and encoding downstream commands
//! - `obs-sim`: producing device-side frames for integration testing
//!
//! ## Dialects
//!
//! Two line-terminated ASCII dialects share every TCP stream; a frame ends at
//! the first `\n` and never exceeds [`MAX_FRAME`] bytes:
//! - **key-value** (`kv`): `<type> <k>=<v>,<k>=<v>,…` — clients, cameras,
//!   modern mounts, environment sensors;
//! - **fixed-field** (`fixed`): `g#<gid><uid>…%` — one legacy mount family,
//!   with pre-scaled integer numerics.
//!
//! ## Conventions
//! - angles are degrees, times ISO-8601 extended (`CCYY-MM-DDThh:mm:ss[.fff]`)
//! - identifier triple `(gid, uid, cid)`; empty fields are wildcards

pub mod fixed;
pub mod kv;

use serde::{Deserialize, Serialize};

/// Hard upper bound for one wire frame, terminator included.
pub const MAX_FRAME: usize = 1400;

/// Codec failures. A decode error on a connection is grounds for closing it.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame exceeds {MAX_FRAME} bytes without terminator")]
    Oversize,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("field `{field}` unparsable: {value}")]
    BadField { field: &'static str, value: String },
}

// ── Addressing ────────────────────────────────────────────────────────────────

/// Hierarchical device address: group / unit / camera. Empty components act
/// as wildcards when matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddr {
    pub gid: String,
    pub uid: String,
    pub cid: String,
}

impl DeviceAddr {
    pub fn new(gid: impl Into<String>, uid: impl Into<String>, cid: impl Into<String>) -> Self {
        Self { gid: gid.into(), uid: uid.into(), cid: cid.into() }
    }

    pub fn group_unit(gid: impl Into<String>, uid: impl Into<String>) -> Self {
        Self::new(gid, uid, "")
    }

    /// Wildcard match of `(self.gid, self.uid)` against a concrete unit.
    /// `(a, b)` matches `(A, B)` iff `a==A || a==""` and
    /// `b==B || b=="" || a==""`.
    pub fn matches_unit(&self, gid: &str, uid: &str) -> bool {
        (self.gid == gid || self.gid.is_empty())
            && (self.uid == uid || self.uid.is_empty() || self.gid.is_empty())
    }

    pub fn is_complete_unit(&self) -> bool {
        !self.gid.is_empty() && !self.uid.is_empty()
    }
}

impl std::fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.cid.is_empty() {
            write!(f, "{}:{}", self.gid, self.uid)
        } else {
            write!(f, "{}:{}:{}", self.gid, self.uid, self.cid)
        }
    }
}

// ── Coordinate systems & image types ─────────────────────────────────────────

/// Pointing coordinate system carried by plans and `slewto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i8)]
pub enum CoorSys {
    /// Azimuth/altitude pair.
    Horizontal = 0,
    /// J2000 right ascension / declination.
    Equatorial = 1,
    /// Two-line orbital elements; propagation is the mount's responsibility.
    Orbit = 2,
}

impl CoorSys {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Horizontal),
            1 => Some(Self::Equatorial),
            2 => Some(Self::Orbit),
            _ => None,
        }
    }
}

/// Frame flavor of an exposure program. The ordinal mapping is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ImageType {
    Bias = 0,
    Dark = 1,
    Flat = 2,
    Object = 3,
    Focus = 4,
}

impl ImageType {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bias" => Some(Self::Bias),
            "dark" => Some(Self::Dark),
            "flat" => Some(Self::Flat),
            "object" | "objt" => Some(Self::Object),
            "focus" | "focs" => Some(Self::Focus),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Bias => "bias",
            Self::Dark => "dark",
            Self::Flat => "flat",
            Self::Object => "object",
            Self::Focus => "focus",
        }
    }

    /// Calibration frames need no pointing and bypass the safety gate.
    pub fn needs_pointing(self) -> bool {
        self >= Self::Flat
    }

    /// Sky light reaches the sensor (flat and brighter).
    pub fn needs_light(self) -> bool {
        self > Self::Dark
    }
}

// ── Plan lifecycle ───────────────────────────────────────────────────────────

/// Plan lifecycle. Strict DAG:
/// `Cataloged → Waiting → Running → {Over | Interrupted | Deleted | Abandoned}`.
/// Only `Cataloged` and `Interrupted` plans are reselectable; everything at
/// `Over` or beyond is terminal and swept daily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PlanState {
    Cataloged = 0,
    Waiting = 1,
    Running = 2,
    Interrupted = 3,
    Over = 4,
    Deleted = 5,
    Abandoned = 6,
    Error = 7,
}

impl PlanState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Cataloged => "cataloged",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Interrupted => "interrupted",
            Self::Over => "over",
            Self::Deleted => "deleted",
            Self::Abandoned => "abandoned",
            Self::Error => "error",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cataloged" => Some(Self::Cataloged),
            "waiting" => Some(Self::Waiting),
            "running" => Some(Self::Running),
            "interrupted" => Some(Self::Interrupted),
            "over" => Some(Self::Over),
            "deleted" => Some(Self::Deleted),
            "abandoned" => Some(Self::Abandoned),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Swept daily, reported to the database, never rescheduled.
    pub fn is_terminal(self) -> bool {
        self >= Self::Over
    }

    /// Eligible for (re-)selection by the acquisition loop.
    pub fn is_selectable(self) -> bool {
        matches!(self, Self::Cataloged | Self::Interrupted)
    }
}

// ── Device states ────────────────────────────────────────────────────────────

/// Mount work state as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i8)]
pub enum MountState {
    Error = 0,
    Freeze = 1,
    Homing = 2,
    Homed = 3,
    Parking = 4,
    Parked = 5,
    Slewing = 6,
    Tracking = 7,
}

impl MountState {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Error),
            1 => Some(Self::Freeze),
            2 => Some(Self::Homing),
            3 => Some(Self::Homed),
            4 => Some(Self::Parking),
            5 => Some(Self::Parked),
            6 => Some(Self::Slewing),
            7 => Some(Self::Tracking),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::Freeze => "Freeze",
            Self::Homing => "Homing",
            Self::Homed => "Homed",
            Self::Parking => "Parking",
            Self::Parked => "Parked",
            Self::Slewing => "Slewing",
            Self::Tracking => "Tracking",
        }
    }
}

/// Camera control state as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i8)]
pub enum CameraState {
    Error = 0,
    Idle = 1,
    Exposing = 2,
    Complete = 3,
    Aborted = 4,
    Paused = 5,
    WaitTime = 6,
    /// Flat sequence paused: waiting for the mount to re-point.
    WaitFlat = 7,
}

impl CameraState {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Error),
            1 => Some(Self::Idle),
            2 => Some(Self::Exposing),
            3 => Some(Self::Complete),
            4 => Some(Self::Aborted),
            5 => Some(Self::Paused),
            6 => Some(Self::WaitTime),
            7 => Some(Self::WaitFlat),
            _ => None,
        }
    }

    /// In the middle of an exposure sequence.
    pub fn is_exposing(self) -> bool {
        self >= Self::Exposing
    }
}

/// Exposure command fanned out to cameras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExposeCommand {
    Start = 1,
    Stop = 2,
    Pause = 3,
    Resume = 4,
}

impl ExposeCommand {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::Start),
            2 => Some(Self::Stop),
            3 => Some(Self::Pause),
            4 => Some(Self::Resume),
            _ => None,
        }
    }
}

/// Dome slit commands and reported states share one value space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i8)]
pub enum SlitState {
    Unknown = 0,
    Open = 1,
    Opening = 2,
    Closed = 3,
    Closing = 4,
}

impl SlitState {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Unknown),
            1 => Some(Self::Open),
            2 => Some(Self::Opening),
            3 => Some(Self::Closed),
            4 => Some(Self::Closing),
            _ => None,
        }
    }
}

/// Mirror-cover state; commands use `Open`/`Closed` as targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i8)]
pub enum MirrorCoverState {
    Closing = -2,
    Closed = -1,
    Unknown = 0,
    Open = 1,
    Opening = 2,
}

impl MirrorCoverState {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            -2 => Some(Self::Closing),
            -1 => Some(Self::Closed),
            0 => Some(Self::Unknown),
            1 => Some(Self::Open),
            2 => Some(Self::Opening),
            _ => None,
        }
    }
}

// ── System-level classifications ─────────────────────────────────────────────

/// Observation system run mode, derived solely from device availability and
/// the robotic flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObsMode {
    Error,
    Manual,
    Auto,
}

/// Observational duration type: coarse sky-brightness class from Sun altitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum Odt {
    Daytime = 0,
    Flat = 1,
    Night = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_match_rule() {
        let any = DeviceAddr::group_unit("", "");
        assert!(any.matches_unit("001", "01"));

        let group = DeviceAddr::group_unit("001", "");
        assert!(group.matches_unit("001", "01"));
        assert!(group.matches_unit("001", "02"));
        assert!(!group.matches_unit("002", "01"));

        let exact = DeviceAddr::group_unit("001", "01");
        assert!(exact.matches_unit("001", "01"));
        assert!(!exact.matches_unit("001", "02"));

        // empty gid wildcards the uid too
        let odd = DeviceAddr::group_unit("", "07");
        assert!(odd.matches_unit("003", "01"));
    }

    #[test]
    fn plan_state_ordering() {
        assert!(PlanState::Cataloged < PlanState::Interrupted);
        assert!(PlanState::Interrupted < PlanState::Over);
        assert!(PlanState::Over.is_terminal());
        assert!(PlanState::Abandoned.is_terminal());
        assert!(!PlanState::Running.is_terminal());
        assert!(PlanState::Interrupted.is_selectable());
        assert!(!PlanState::Waiting.is_selectable());
    }

    #[test]
    fn image_type_ordinals() {
        assert_eq!(ImageType::from_name("BIAS"), Some(ImageType::Bias));
        assert_eq!(ImageType::Focus as u8, 4);
        assert!(!ImageType::Dark.needs_pointing());
        assert!(ImageType::Flat.needs_pointing());
        assert!(!ImageType::Dark.needs_light());
        assert!(ImageType::Flat.needs_light());
    }
}
