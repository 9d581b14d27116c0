//! Device proxies owned by one observation system: the mount, its cameras,
//! and the annex connections. A proxy keeps the link handle plus the last
//! reported state; all mutation happens on the owning system's worker.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::astro;
use crate::net::ConnHandle;
use obs_wire::kv::CameraReport;
use obs_wire::{CameraState, ImageType, MountState};

/// Outcome of a coupling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoupleMode {
    /// The observation system owns the read loop.
    P2p,
    /// The federation keeps the read loop and forwards messages.
    P2h,
    /// Refused (duplicate coupling of the class).
    Refused,
}

/// Cumulative guide offset that forces a zero-point sync, degrees.
const OFFSET_SYNC_LIMIT: f64 = 2.0;

#[derive(Debug, Default)]
pub struct MountProxy {
    pub conn: Option<ConnHandle>,
    /// `true` when the peer speaks the key-value dialect.
    pub kv_dialect: bool,
    pub state: Option<MountState>,
    pub ready: bool,
    pub utc: String,
    /// Live pointing, J2000 degrees.
    pub ra: f64,
    pub dec: f64,
    /// Commanded target; `None` while idle.
    pub target: Option<(f64, f64)>,
    /// Accumulated guide offsets, degrees.
    pub d_ra: f64,
    pub d_dec: f64,
    pub clock_faults: u32,
}

impl MountProxy {
    pub fn is_open(&self) -> bool {
        self.conn.as_ref().map(|c| !c.is_closed()).unwrap_or(false)
    }

    pub fn begin_slew(&mut self, ra: f64, dec: f64) {
        self.target = Some((ra, dec));
        self.d_ra = 0.0;
        self.d_dec = 0.0;
    }

    /// Great-circle separation between target and reported pointing, degrees.
    pub fn arrive_error(&self) -> f64 {
        match self.target {
            Some((ra, dec)) => astro::sphere_distance(ra, dec, self.ra, self.dec),
            None => 0.0,
        }
    }

    /// Accumulate one guide correction; `true` once the total calls for a
    /// zero-point sync.
    pub fn add_offset(&mut self, d_ra: f64, d_dec: f64) -> bool {
        self.d_ra += d_ra;
        self.d_dec += d_dec;
        self.d_ra.abs() > OFFSET_SYNC_LIMIT || self.d_dec.abs() > OFFSET_SYNC_LIMIT
    }

    pub fn clear_target(&mut self) {
        self.target = None;
        self.d_ra = 0.0;
        self.d_dec = 0.0;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Full-field-of-view guide cameras carry a cid divisible by five by
/// convention; the rest are joint-field cameras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    Guide,
    Joint,
}

#[derive(Debug)]
pub struct CameraProxy {
    pub cid: String,
    pub kind: CameraKind,
    pub conn: Option<ConnHandle>,
    pub state: Option<CameraState>,
    pub imgtype: Option<ImageType>,
    pub frmnum: i32,
    pub frmtot: i32,
    pub filter: String,
    /// Last completed flat frame was usable (fresh frame number).
    pub valid_flat: bool,
    pub fwhm: f64,
}

impl CameraProxy {
    pub fn new(cid: &str) -> Self {
        let kind = match cid.trim().parse::<u32>() {
            Ok(n) if n % 5 == 0 => CameraKind::Guide,
            _ => CameraKind::Joint,
        };
        Self {
            cid: cid.to_string(),
            kind,
            conn: None,
            state: None,
            imgtype: None,
            frmnum: -1,
            frmtot: -1,
            filter: String::new(),
            valid_flat: false,
            fwhm: 0.0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.as_ref().map(|c| !c.is_closed()).unwrap_or(false)
    }

    pub fn is_exposing(&self) -> bool {
        self.state.map(|s| s.is_exposing()).unwrap_or(false)
    }

    /// Fold one wire report in; returns the previous state for transition
    /// detection.
    pub fn apply_report(&mut self, report: &CameraReport) -> Option<CameraState> {
        let prev = self.state;
        if report.state == CameraState::Complete {
            self.valid_flat = report.frmnum >= 1 && report.frmnum != self.frmnum;
        }
        self.state = Some(report.state);
        if report.imgtype.is_some() {
            self.imgtype = report.imgtype;
        }
        if report.frmnum >= 0 {
            self.frmnum = report.frmnum;
        }
        if report.frmtot >= 0 {
            self.frmtot = report.frmtot;
        }
        if !report.filter.is_empty() {
            self.filter = report.filter.clone();
        }
        prev
    }

    pub fn reset(&mut self) {
        self.conn = None;
        self.state = None;
        self.imgtype = None;
        self.frmnum = -1;
        self.frmtot = -1;
        self.valid_flat = false;
        self.fwhm = 0.0;
    }
}

/// Mount-annex / camera-annex link (focusers, mirror covers, dome slit,
/// coolers). State of the individual sub-devices is tracked per camera.
#[derive(Debug, Default)]
pub struct AnnexProxy {
    pub conn: Option<ConnHandle>,
    pub kv_dialect: bool,
}

impl AnnexProxy {
    pub fn is_open(&self) -> bool {
        self.conn.as_ref().map(|c| !c.is_closed()).unwrap_or(false)
    }

    pub fn reset(&mut self) {
        self.conn = None;
    }
}

/// Mount clock drift monitor: warn once per `RATE` faults when the mount's
/// clock strays 50 ms or more from the daemon clock.
pub fn clock_drift_ms(reported: &str, now: DateTime<Utc>) -> Option<i64> {
    let parsed = chrono::NaiveDateTime::parse_from_str(reported, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(reported, "%Y-%m-%dT%H:%M:%S"))
        .ok()?;
    Some((parsed.and_utc() - now).num_milliseconds())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn guide_cameras_follow_the_cid_convention() {
        assert_eq!(CameraProxy::new("005").kind, CameraKind::Guide);
        assert_eq!(CameraProxy::new("010").kind, CameraKind::Guide);
        assert_eq!(CameraProxy::new("011").kind, CameraKind::Joint);
        assert_eq!(CameraProxy::new("abc").kind, CameraKind::Joint);
    }

    #[test]
    fn arrive_error_measures_great_circle() {
        let mut mount = MountProxy::default();
        mount.begin_slew(180.0, 30.0);
        mount.ra = 180.0;
        mount.dec = 30.0;
        assert!(mount.arrive_error() < 1e-12);
        mount.dec = 30.5;
        assert!((mount.arrive_error() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn offsets_accumulate_to_the_sync_limit() {
        let mut mount = MountProxy::default();
        assert!(!mount.add_offset(0.9, 0.0));
        assert!(!mount.add_offset(0.9, 0.0));
        assert!(mount.add_offset(0.3, 0.0));
    }

    #[test]
    fn flat_validity_requires_fresh_frame_number() {
        let mut cam = CameraProxy::new("011");
        let mut report = CameraReport::default();
        report.state = CameraState::Complete;
        report.frmnum = 1;
        cam.apply_report(&report);
        assert!(cam.valid_flat);

        // same frame number again: stale, not a fresh flat
        let mut repeat = CameraReport::default();
        repeat.state = CameraState::Complete;
        repeat.frmnum = 1;
        cam.apply_report(&repeat);
        assert!(!cam.valid_flat);
    }

    #[test]
    fn clock_drift_is_signed_milliseconds() {
        let now = chrono::Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let d = clock_drift_ms("2026-08-01T12:00:01", now).unwrap();
        assert_eq!(d, 1000);
        let d = clock_drift_ms("2026-08-01T11:59:59.950", now).unwrap();
        assert_eq!(d, -50);
        assert!(clock_drift_ms("garbage", now).is_none());
    }
}
