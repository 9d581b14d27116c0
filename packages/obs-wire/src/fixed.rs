//! Fixed-field dialect used by one legacy mount family.
//!
//! Every frame starts with `g#`, ends with `%` (then the shared `\n`
//! terminator); the identifier triple occupies fixed-width 3-character slots
//! and numerics are pre-scaled integers:
//! - `slew` / `sync` carry degrees ×10⁴ in 7-digit slots,
//! - `guide` carries integer arcseconds in signed 5-digit slots,
//! - `fwhm` carries ×100, `focus` a raw signed 5-digit position.
//!
//! Decoders locate the keyword by substring search and slice fixed-width
//! fields around it; a frame that does not parse is dropped and the
//! connection closed by the caller.

use std::fmt::Write as _;
use std::sync::Mutex;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{DeviceAddr, WireError, MAX_FRAME};

const ID_LEN: usize = 3;
const RING_SLOTS: usize = 10;

/// One decoded fixed-field report (device → daemon direction).
#[derive(Debug, Clone, PartialEq)]
pub enum FixedMessage {
    /// Device self-check result.
    Ready { addr: DeviceAddr, ready: i32 },
    /// Mount work state digit.
    Status { addr: DeviceAddr, state: i32 },
    /// Mount clock, ISO time (the wire carries `%` in place of `T`).
    Utc { addr: DeviceAddr, utc: String },
    /// Live equatorial pointing, degrees.
    CurrentPos { addr: DeviceAddr, ra: f64, dec: f64 },
    /// Focuser readout.
    Focus { addr: DeviceAddr, position: i32 },
    /// Mirror-cover state digit pair.
    MirrorCover { addr: DeviceAddr, state: i32 },
    /// Dome slit state.
    Slit { addr: DeviceAddr, state: i32 },
    /// Rain sensor flag.
    Rain { addr: DeviceAddr, value: i32 },
}

impl FixedMessage {
    pub fn addr(&self) -> &DeviceAddr {
        match self {
            Self::Ready { addr, .. }
            | Self::Status { addr, .. }
            | Self::Utc { addr, .. }
            | Self::CurrentPos { addr, .. }
            | Self::Focus { addr, .. }
            | Self::MirrorCover { addr, .. }
            | Self::Slit { addr, .. }
            | Self::Rain { addr, .. } => addr,
        }
    }
}

/// Quick sniff so mixed streams can pick the dialect per frame.
pub fn looks_fixed(line: &str) -> bool {
    line.starts_with("g#")
}

/// Decode one fixed-field frame (without the `\n` terminator).
pub fn resolve(line: &str) -> Result<FixedMessage, WireError> {
    if line.len() > MAX_FRAME {
        return Err(WireError::Oversize);
    }
    let body = line
        .trim_end_matches(['\r', '\n'])
        .strip_prefix("g#")
        .ok_or(WireError::Malformed("missing g# prefix"))?;
    let body = body.strip_suffix('%').unwrap_or(body);

    // Recognition order matters: `currentpos` and `status` both embed other
    // keywords' letters, so probe the longer, more specific words first.
    if let Some(pos) = body.find("utc") {
        let (addr, value) = split_fields(body, pos, "utc", 0)?;
        return Ok(FixedMessage::Utc { addr, utc: value.replace('%', "T") });
    }
    if let Some(pos) = body.find("currentpos") {
        let (addr, value) = split_fields(body, pos, "currentpos", 0)?;
        let (ra_s, dec_s) =
            value.split_once('%').ok_or(WireError::Malformed("currentpos without separator"))?;
        let ra: i64 = ra_s
            .parse()
            .map_err(|_| WireError::BadField { field: "ra", value: ra_s.to_string() })?;
        let dec: i64 = dec_s
            .parse()
            .map_err(|_| WireError::BadField { field: "dec", value: dec_s.to_string() })?;
        return Ok(FixedMessage::CurrentPos {
            addr,
            ra: ra as f64 * 1e-4,
            dec: dec as f64 * 1e-4,
        });
    }
    if let Some(pos) = body.find("focus") {
        let (addr, value) = split_fields(body, pos, "focus", ID_LEN)?;
        let position = value
            .parse()
            .map_err(|_| WireError::BadField { field: "focus", value: value.to_string() })?;
        return Ok(FixedMessage::Focus { addr, position });
    }
    if let Some(pos) = body.find("rain") {
        let (addr, value) = split_fields(body, pos, "rain", 0)?;
        let value: i32 = value
            .parse()
            .map_err(|_| WireError::BadField { field: "rain", value: value.to_string() })?;
        return Ok(FixedMessage::Rain { addr, value });
    }
    if let Some(pos) = body.find("slit") {
        let (addr, value) = split_fields(body, pos, "slit", 0)?;
        let state = value
            .parse()
            .map_err(|_| WireError::BadField { field: "slit", value: value.to_string() })?;
        return Ok(FixedMessage::Slit { addr, state });
    }
    if let Some(pos) = body.find("ready") {
        let (addr, value) = split_fields(body, pos, "ready", 0)?;
        let ready = value
            .parse()
            .map_err(|_| WireError::BadField { field: "ready", value: value.to_string() })?;
        return Ok(FixedMessage::Ready { addr, ready });
    }
    if let Some(pos) = body.find("status") {
        let (addr, value) = split_fields(body, pos, "status", 0)?;
        let state = value
            .parse()
            .map_err(|_| WireError::BadField { field: "status", value: value.to_string() })?;
        return Ok(FixedMessage::Status { addr, state });
    }
    if let Some(pos) = body.find("mirr") {
        let (addr, value) = split_fields(body, pos, "mirr", ID_LEN)?;
        let state = value
            .parse()
            .map_err(|_| WireError::BadField { field: "mirr", value: value.to_string() })?;
        return Ok(FixedMessage::MirrorCover { addr, state });
    }
    Err(WireError::Malformed("unrecognized fixed-field frame"))
}

/// Split `<gid><uid><keyword>[<cid>]<value>`; ids may be absent for
/// group-broadcast forms (`slit`, `rain`).
fn split_fields<'a>(
    body: &'a str,
    keyword_pos: usize,
    keyword: &str,
    cid_len: usize,
) -> Result<(DeviceAddr, &'a str), WireError> {
    let mut addr = DeviceAddr::default();
    match keyword_pos {
        0 => {}
        n if n == ID_LEN => addr.gid = body[..ID_LEN].to_string(),
        n if n == 2 * ID_LEN => {
            addr.gid = body[..ID_LEN].to_string();
            addr.uid = body[ID_LEN..2 * ID_LEN].to_string();
        }
        _ => return Err(WireError::Malformed("bad identifier slot width")),
    }
    let after = keyword_pos + keyword.len();
    if body.len() < after + cid_len {
        return Err(WireError::Malformed("frame truncated"));
    }
    if cid_len > 0 {
        addr.cid = body[after..after + cid_len].to_string();
    }
    Ok((addr, &body[after + cid_len..]))
}

// ── Command encoders ─────────────────────────────────────────────────────────

/// Encoder for downstream fixed-field commands, over the same ring scheme as
/// the key-value encoder.
pub struct Encoder {
    ring: Mutex<Ring>,
}

struct Ring {
    slots: Vec<BytesMut>,
    idx: usize,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        let slots = (0..RING_SLOTS).map(|_| BytesMut::with_capacity(MAX_FRAME)).collect();
        Self { ring: Mutex::new(Ring { slots, idx: 0 }) }
    }

    fn emit(&self, content: &str) -> Bytes {
        let mut ring = self.ring.lock().unwrap();
        let idx = ring.idx;
        ring.idx = (idx + 1) % RING_SLOTS;
        let slot = &mut ring.slots[idx];
        slot.reserve(content.len() + 1);
        slot.put_slice(content.as_bytes());
        slot.put_u8(b'\n');
        slot.split().freeze()
    }

    pub fn find_home(&self, gid: &str, uid: &str) -> Bytes {
        self.emit(&format!("g#{gid}{uid}homera1dec1%"))
    }

    /// Zero-point sync to the given J2000 position, degrees.
    pub fn home_sync(&self, gid: &str, uid: &str, ra: f64, dec: f64) -> Bytes {
        self.emit(&format!(
            "g#{gid}{uid}sync{:07}%{:+07}%",
            (ra * 1e4).round() as i64,
            (dec * 1e4).round() as i64
        ))
    }

    /// Slew to the given J2000 position, degrees.
    pub fn slew(&self, gid: &str, uid: &str, ra: f64, dec: f64) -> Bytes {
        self.emit(&format!(
            "g#{gid}{uid}slew{:07}%{:+07}%",
            (ra * 1e4).round() as i64,
            (dec * 1e4).round() as i64
        ))
    }

    /// Guide correction, offsets in degrees, transmitted as arcseconds.
    pub fn guide(&self, gid: &str, uid: &str, d_ra: f64, d_dec: f64) -> Bytes {
        self.emit(&format!(
            "g#{gid}{uid}guide{:+05}%{:+05}%",
            (d_ra * 3600.0).round() as i64,
            (d_dec * 3600.0).round() as i64
        ))
    }

    pub fn park(&self, gid: &str, uid: &str) -> Bytes {
        self.emit(&format!("g#{gid}{uid}park%"))
    }

    pub fn abort_slew(&self, gid: &str, uid: &str) -> Bytes {
        self.emit(&format!("g#{gid}{uid}abortslew%"))
    }

    /// Slit command; empty ids broadcast within the annex connection.
    pub fn slit(&self, gid: &str, uid: &str, command: i32) -> Bytes {
        let mut s = String::from("g#");
        if !gid.is_empty() {
            s.push_str(gid);
        }
        if !uid.is_empty() {
            s.push_str(uid);
        }
        let _ = write!(s, "slit{command:02}%");
        self.emit(&s)
    }

    pub fn mirror_cover(&self, gid: &str, uid: &str, cid: &str, open: bool) -> Bytes {
        self.emit(&format!("g#{gid}{uid}{cid}mirr{}%", if open { "open" } else { "close" }))
    }

    pub fn fwhm(&self, gid: &str, uid: &str, cid: &str, fwhm: f64) -> Bytes {
        self.emit(&format!("g#{gid}{uid}fwhm{cid}{:04}%", (fwhm * 100.0).round() as i64))
    }

    pub fn focus(&self, gid: &str, uid: &str, cid: &str, position: i32) -> Bytes {
        self.emit(&format!("g#{gid}{uid}focus{cid}{position:+05}%"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_status_and_ready() {
        let msg = resolve("g#001002status7%").unwrap();
        assert_eq!(
            msg,
            FixedMessage::Status { addr: DeviceAddr::group_unit("001", "002"), state: 7 }
        );
        let msg = resolve("g#001002ready1%").unwrap();
        assert_eq!(
            msg,
            FixedMessage::Ready { addr: DeviceAddr::group_unit("001", "002"), ready: 1 }
        );
    }

    #[test]
    fn resolve_current_pos_scales() {
        let msg = resolve("g#001001currentpos1801234%-300500%").unwrap();
        match msg {
            FixedMessage::CurrentPos { addr, ra, dec } => {
                assert_eq!(addr.gid, "001");
                assert_eq!(addr.uid, "001");
                assert!((ra - 180.1234).abs() < 1e-9);
                assert!((dec + 30.05).abs() < 1e-9);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn resolve_utc_restores_t() {
        let msg = resolve("g#001001utc2026-08-01%21:15:30%").unwrap();
        match msg {
            FixedMessage::Utc { utc, .. } => assert_eq!(utc, "2026-08-01T21:15:30"),
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn resolve_focus_with_cid() {
        let msg = resolve("g#001001focus005+01250%").unwrap();
        match msg {
            FixedMessage::Focus { addr, position } => {
                assert_eq!(addr.cid, "005");
                assert_eq!(position, 1250);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn resolve_group_broadcast_rain() {
        let msg = resolve("g#001rain1%").unwrap();
        match msg {
            FixedMessage::Rain { addr, value } => {
                assert_eq!(addr.gid, "001");
                assert!(addr.uid.is_empty());
                assert_eq!(value, 1);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(resolve("currentpos123%").is_err());
        assert!(resolve("g#001001teleport1%").is_err());
        assert!(resolve("g#001001currentpos1801234%").is_err()); // missing dec
    }

    #[test]
    fn slew_command_round_trips_through_current_pos_scaling() {
        let enc = Encoder::new();
        let frame = enc.slew("001", "001", 180.1234, -30.05);
        let text = std::str::from_utf8(&frame).unwrap();
        assert_eq!(text, "g#001001slew1801234%-300500%\n");
        // a mount echoing the target as currentpos decodes to the same angles
        let echo = text.replace("slew", "currentpos");
        match resolve(echo.trim_end()).unwrap() {
            FixedMessage::CurrentPos { ra, dec, .. } => {
                assert!((ra - 180.1234).abs() < 1e-9);
                assert!((dec + 30.05).abs() < 1e-9);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn guide_command_uses_arcseconds() {
        let enc = Encoder::new();
        let frame = enc.guide("001", "001", 0.01, -0.02);
        assert_eq!(std::str::from_utf8(&frame).unwrap(), "g#001001guide+0036%-0072%\n");
    }

    #[test]
    fn slit_command_allows_group_broadcast() {
        let enc = Encoder::new();
        let frame = enc.slit("001", "", 2);
        assert_eq!(std::str::from_utf8(&frame).unwrap(), "g#001slit02%\n");
    }
}
