//! Key-value dialect: `<type> <k>=<v>,<k>=<v>,…\n`.
//!
//! Reserved keys `utc`, `gid`, `uid`, `cid` are lifted onto the frame header;
//! every other recognized key feeds the typed body, and unknown keys are
//! preserved verbatim in a side list so forwarding does not lose information.
//!
//! The encoder keeps a small mutex-guarded ring of fixed-size buffers so
//! concurrent senders get distinct slices without per-call allocation.

use std::fmt::Write as _;
use std::sync::Mutex;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;

use crate::{
    CameraState, CoorSys, DeviceAddr, ExposeCommand, ImageType, MirrorCoverState, MountState,
    ObsMode, Odt, PlanState, SlitState, WireError, MAX_FRAME,
};

// ── Typed frames ─────────────────────────────────────────────────────────────

/// One decoded key-value frame.
#[derive(Debug, Clone)]
pub struct KvFrame {
    /// Sender timestamp, ISO-8601 extended; empty when the peer omitted it.
    pub utc: String,
    pub addr: DeviceAddr,
    pub body: KvBody,
    /// Unrecognized keys, preserved in arrival order.
    pub extras: Vec<(String, String)>,
}

impl KvFrame {
    pub fn new(addr: DeviceAddr, body: KvBody) -> Self {
        Self { utc: String::new(), addr, body, extras: Vec::new() }
    }
}

/// Typed body of a key-value frame.
#[derive(Debug, Clone)]
pub enum KvBody {
    /// Client associates itself with an id filter for status fanout.
    Register,
    Unregister,
    /// Start / stop the automatic observation flow.
    Start,
    Stop,
    Enable,
    Disable,
    AppendPlan(PlanFields),
    ImplementPlan(PlanFields),
    AbortPlan { plan_sn: String },
    CheckPlan { plan_sn: String },
    /// Plan execution state, daemon → client/database.
    PlanStatus { plan_sn: String, state: PlanState },
    FindHome,
    HomeSync { ra: f64, dec: f64 },
    Slewto(SlewFields),
    Park,
    Guide(GuideFields),
    AbortSlew,
    /// Mount live report.
    Mount(MountReport),
    Slit { command: Option<SlitState>, state: Option<SlitState> },
    MirrorCover { command: Option<MirrorCoverState>, state: Option<MirrorCoverState> },
    TakeImage(TakeImageFields),
    AbortImage,
    /// Observation target descriptor, daemon → camera.
    Object(ObjectFields),
    Expose { command: ExposeCommand },
    /// Camera live report.
    Camera(CameraReport),
    Fwhm { value: f64 },
    Focus { position: i32 },
    Rainfall { rainy: bool },
    Wind { speed: f64, direction: f64 },
    Cloud { percent: f64 },
    /// Site description, daemon → client.
    ObsSite { name: String, lon: f64, lat: f64, alt: f64, timezone: i32 },
    /// Observation system live state, daemon → client/database.
    ObssStatus(ObssReport),
}

impl KvBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Unregister => "unregister",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::AppendPlan(_) => "append_plan",
            Self::ImplementPlan(_) => "implement_plan",
            Self::AbortPlan { .. } => "abort_plan",
            Self::CheckPlan { .. } => "check_plan",
            Self::PlanStatus { .. } => "plan",
            Self::FindHome => "find_home",
            Self::HomeSync { .. } => "home_sync",
            Self::Slewto(_) => "slewto",
            Self::Park => "park",
            Self::Guide(_) => "guide",
            Self::AbortSlew => "abort_slew",
            Self::Mount(_) => "mount",
            Self::Slit { .. } => "slit",
            Self::MirrorCover { .. } => "mcover",
            Self::TakeImage(_) => "take_image",
            Self::AbortImage => "abort_image",
            Self::Object(_) => "object",
            Self::Expose { .. } => "expose",
            Self::Camera(_) => "camera",
            Self::Fwhm { .. } => "fwhm",
            Self::Focus { .. } => "focus",
            Self::Rainfall { .. } => "rainfall",
            Self::Wind { .. } => "wind",
            Self::Cloud { .. } => "cloud",
            Self::ObsSite { .. } => "obsite",
            Self::ObssStatus(_) => "obss",
        }
    }
}

/// Plan payload of `append_plan` / `implement_plan`. Sentinel values
/// (`f64::INFINITY` coordinates) mark fields the sender did not provide;
/// calibration plans legitimately carry no coordinate at all.
#[derive(Debug, Clone)]
pub struct PlanFields {
    pub plan_sn: String,
    pub plan_time: String,
    pub plan_type: String,
    pub obstype: String,
    pub observer: String,
    pub grid_id: String,
    pub field_id: String,
    pub runname: String,
    pub objname: String,
    pub pair_id: Option<i32>,
    pub coorsys: CoorSys,
    pub lon: f64,
    pub lat: f64,
    pub epoch: f64,
    pub line1: String,
    pub line2: String,
    pub objra: f64,
    pub objdec: f64,
    pub objepoch: f64,
    pub objerror: String,
    pub imgtype: Option<ImageType>,
    /// Filter names; multiple filters separated by `|`, `;`, `+` or space on
    /// the wire.
    pub filters: Vec<String>,
    pub expdur: f64,
    pub delay: f64,
    pub frmcnt: i32,
    pub loopcnt: i32,
    pub priority: i64,
    pub tmbegin: String,
    pub tmend: String,
}

impl Default for PlanFields {
    fn default() -> Self {
        Self {
            plan_sn: String::new(),
            plan_time: String::new(),
            plan_type: String::new(),
            obstype: String::new(),
            observer: String::new(),
            grid_id: String::new(),
            field_id: String::new(),
            runname: String::new(),
            objname: String::new(),
            pair_id: None,
            coorsys: CoorSys::Equatorial,
            lon: f64::INFINITY,
            lat: f64::INFINITY,
            epoch: 2000.0,
            line1: String::new(),
            line2: String::new(),
            objra: f64::INFINITY,
            objdec: f64::INFINITY,
            objepoch: 2000.0,
            objerror: String::new(),
            imgtype: None,
            filters: Vec::new(),
            expdur: 0.0,
            delay: 0.0,
            frmcnt: 1,
            loopcnt: 1,
            priority: 0,
            tmbegin: String::new(),
            tmend: String::new(),
        }
    }
}

impl PlanFields {
    /// Split a multi-filter token (`B|V|R`, `B;V`, `B+V`) into names.
    pub fn push_filters(&mut self, token: &str) {
        for name in token.split(|c| c == '|' || c == ';' || c == '+' || c == ' ') {
            if !name.is_empty() {
                self.filters.push(name.to_string());
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlewFields {
    pub coorsys: CoorSys,
    pub lon: f64,
    pub lat: f64,
    pub epoch: f64,
    pub line1: String,
    pub line2: String,
}

impl Default for SlewFields {
    fn default() -> Self {
        Self {
            coorsys: CoorSys::Equatorial,
            lon: f64::INFINITY,
            lat: f64::INFINITY,
            epoch: 2000.0,
            line1: String::new(),
            line2: String::new(),
        }
    }
}

/// Guide corrections in degrees on both axes; optional object/real positions
/// let the daemon re-derive the offset itself.
#[derive(Debug, Clone, Default)]
pub struct GuideFields {
    pub ra: f64,
    pub dec: f64,
    pub objra: Option<f64>,
    pub objdec: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct MountReport {
    pub state: Option<MountState>,
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub azi: Option<f64>,
    pub alt: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CameraReport {
    pub state: CameraState,
    pub imgtype: Option<ImageType>,
    pub frmnum: i32,
    pub frmtot: i32,
    pub filter: String,
    pub coolget: Option<f64>,
    pub freedisk: Option<i64>,
    pub filename: String,
}

impl Default for CameraReport {
    fn default() -> Self {
        Self {
            state: CameraState::Idle,
            imgtype: None,
            frmnum: -1,
            frmtot: -1,
            filter: String::new(),
            coolget: None,
            freedisk: None,
            filename: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TakeImageFields {
    pub objname: String,
    pub imgtype: Option<ImageType>,
    pub filter: String,
    pub expdur: f64,
    pub frmcnt: i32,
}

/// Target descriptor pushed to cameras ahead of `expose`.
#[derive(Debug, Clone)]
pub struct ObjectFields {
    pub plan_sn: String,
    pub objname: String,
    pub obstype: String,
    pub imgtype: ImageType,
    pub filter: String,
    pub expdur: f64,
    pub delay: f64,
    pub frmcnt: i32,
    pub loopcnt: i32,
    pub lon: f64,
    pub lat: f64,
    pub grid_id: String,
    pub field_id: String,
    pub runname: String,
    pub observer: String,
}

impl Default for ObjectFields {
    fn default() -> Self {
        Self {
            plan_sn: String::new(),
            objname: String::new(),
            obstype: String::new(),
            imgtype: ImageType::Object,
            filter: String::new(),
            expdur: 0.0,
            delay: 0.0,
            frmcnt: 1,
            loopcnt: 1,
            lon: f64::INFINITY,
            lat: f64::INFINITY,
            grid_id: String::new(),
            field_id: String::new(),
            runname: String::new(),
            observer: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObssReport {
    pub mode: ObsMode,
    pub odt: Odt,
    pub plan_sn: String,
    pub mount: Option<MountState>,
    pub cameras: i32,
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Working list of `k=v` pairs; recognized keys are consumed, the remainder
/// becomes the frame's extras.
struct KvPairs(Vec<(String, String)>);

impl KvPairs {
    fn parse(s: &str) -> Self {
        let mut pairs = Vec::new();
        for token in s.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Some((k, v)) = token.split_once('=') {
                pairs.push((k.trim().to_string(), v.trim().to_string()));
            }
        }
        Self(pairs)
    }

    fn take(&mut self, key: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(key))?;
        Some(self.0.remove(idx).1)
    }

    fn take_f64(&mut self, key: &'static str) -> Result<Option<f64>, WireError> {
        match self.take(key) {
            None => Ok(None),
            Some(v) => v
                .parse::<f64>()
                .map(Some)
                .map_err(|_| WireError::BadField { field: key, value: v }),
        }
    }

    fn take_i32(&mut self, key: &'static str) -> Result<Option<i32>, WireError> {
        match self.take(key) {
            None => Ok(None),
            Some(v) => v
                .parse::<i32>()
                .map(Some)
                .map_err(|_| WireError::BadField { field: key, value: v }),
        }
    }

    fn take_i64(&mut self, key: &'static str) -> Result<Option<i64>, WireError> {
        match self.take(key) {
            None => Ok(None),
            Some(v) => v
                .parse::<i64>()
                .map(Some)
                .map_err(|_| WireError::BadField { field: key, value: v }),
        }
    }

    fn into_extras(self) -> Vec<(String, String)> {
        self.0
    }
}

/// Decode one frame (terminator already stripped by the read loop).
pub fn resolve(line: &str) -> Result<KvFrame, WireError> {
    if line.len() > MAX_FRAME {
        return Err(WireError::Oversize);
    }
    let line = line.trim_end_matches(['\r', '\n']);
    let (typ, rest) = match line.split_once(' ') {
        Some((t, r)) => (t, r),
        None => (line, ""),
    };
    if typ.is_empty() {
        return Err(WireError::Malformed("empty type"));
    }

    let mut pairs = KvPairs::parse(rest);
    let utc = pairs.take("utc").unwrap_or_default();
    let addr = DeviceAddr::new(
        pairs.take("gid").unwrap_or_default(),
        pairs.take("uid").unwrap_or_default(),
        pairs.take("cid").unwrap_or_default(),
    );

    let body = resolve_body(typ, &mut pairs)?;
    Ok(KvFrame { utc, addr, body, extras: pairs.into_extras() })
}

fn resolve_body(typ: &str, pairs: &mut KvPairs) -> Result<KvBody, WireError> {
    let body = match typ.to_ascii_lowercase().as_str() {
        "register" => KvBody::Register,
        "unregister" => KvBody::Unregister,
        "start" => KvBody::Start,
        "stop" => KvBody::Stop,
        "enable" => KvBody::Enable,
        "disable" => KvBody::Disable,
        "append_plan" => KvBody::AppendPlan(resolve_plan(pairs)?),
        "implement_plan" => KvBody::ImplementPlan(resolve_plan(pairs)?),
        "abort_plan" => KvBody::AbortPlan { plan_sn: pairs.take("plan_sn").unwrap_or_default() },
        "check_plan" => KvBody::CheckPlan { plan_sn: pairs.take("plan_sn").unwrap_or_default() },
        "plan" => {
            let plan_sn = pairs.take("plan_sn").unwrap_or_default();
            let state = pairs
                .take("state")
                .and_then(|s| PlanState::from_name(&s))
                .ok_or(WireError::Malformed("plan without state"))?;
            KvBody::PlanStatus { plan_sn, state }
        }
        "find_home" => KvBody::FindHome,
        "home_sync" => KvBody::HomeSync {
            ra: pairs.take_f64("ra")?.ok_or(WireError::Malformed("home_sync without ra"))?,
            dec: pairs.take_f64("dec")?.ok_or(WireError::Malformed("home_sync without dec"))?,
        },
        "slewto" => {
            let mut f = SlewFields::default();
            if let Some(v) = pairs.take_i32("coorsys")? {
                f.coorsys = CoorSys::from_i32(v).ok_or(WireError::Malformed("bad coorsys"))?;
            }
            if let Some(v) = pairs.take_f64("lon")? {
                f.lon = v;
            }
            if let Some(v) = pairs.take_f64("lat")? {
                f.lat = v;
            }
            if let Some(v) = pairs.take_f64("epoch")? {
                f.epoch = v;
            }
            f.line1 = pairs.take("line1").unwrap_or_default();
            f.line2 = pairs.take("line2").unwrap_or_default();
            KvBody::Slewto(f)
        }
        "park" => KvBody::Park,
        "guide" => KvBody::Guide(GuideFields {
            ra: pairs.take_f64("ra")?.unwrap_or(0.0),
            dec: pairs.take_f64("dec")?.unwrap_or(0.0),
            objra: pairs.take_f64("objra")?,
            objdec: pairs.take_f64("objdec")?,
        }),
        "abort_slew" => KvBody::AbortSlew,
        "mount" => KvBody::Mount(MountReport {
            state: pairs.take_i32("state")?.and_then(MountState::from_i32),
            ra: pairs.take_f64("ra")?,
            dec: pairs.take_f64("dec")?,
            azi: pairs.take_f64("azi")?,
            alt: pairs.take_f64("alt")?,
        }),
        "slit" => KvBody::Slit {
            command: pairs.take_i32("command")?.and_then(SlitState::from_i32),
            state: pairs.take_i32("state")?.and_then(SlitState::from_i32),
        },
        "mcover" => KvBody::MirrorCover {
            command: pairs.take_i32("command")?.and_then(MirrorCoverState::from_i32),
            state: pairs.take_i32("state")?.and_then(MirrorCoverState::from_i32),
        },
        "take_image" => KvBody::TakeImage(TakeImageFields {
            objname: pairs.take("objname").unwrap_or_default(),
            imgtype: pairs.take("imgtype").and_then(|s| ImageType::from_name(&s)),
            filter: pairs.take("filter").unwrap_or_default(),
            expdur: pairs.take_f64("expdur")?.unwrap_or(0.0),
            frmcnt: pairs.take_i32("frmcnt")?.unwrap_or(1),
        }),
        "abort_image" => KvBody::AbortImage,
        "object" => {
            let mut f = ObjectFields::default();
            f.plan_sn = pairs.take("plan_sn").unwrap_or_default();
            f.objname = pairs.take("objname").unwrap_or_default();
            f.obstype = pairs.take("obstype").unwrap_or_default();
            f.imgtype = pairs
                .take("imgtype")
                .and_then(|s| ImageType::from_name(&s))
                .ok_or(WireError::Malformed("object without imgtype"))?;
            f.filter = pairs.take("filter").unwrap_or_default();
            f.expdur = pairs.take_f64("expdur")?.unwrap_or(0.0);
            f.delay = pairs.take_f64("delay")?.unwrap_or(0.0);
            f.frmcnt = pairs.take_i32("frmcnt")?.unwrap_or(1);
            f.loopcnt = pairs.take_i32("loopcnt")?.unwrap_or(1);
            f.lon = pairs.take_f64("lon")?.unwrap_or(f64::INFINITY);
            f.lat = pairs.take_f64("lat")?.unwrap_or(f64::INFINITY);
            f.grid_id = pairs.take("grid_id").unwrap_or_default();
            f.field_id = pairs.take("field_id").unwrap_or_default();
            f.runname = pairs.take("runname").unwrap_or_default();
            f.observer = pairs.take("observer").unwrap_or_default();
            KvBody::Object(f)
        }
        "expose" => {
            let cmd = pairs
                .take_i32("command")?
                .and_then(ExposeCommand::from_i32)
                .ok_or(WireError::Malformed("expose without command"))?;
            KvBody::Expose { command: cmd }
        }
        "camera" => {
            let state = pairs
                .take_i32("state")?
                .and_then(CameraState::from_i32)
                .ok_or(WireError::Malformed("camera without state"))?;
            KvBody::Camera(CameraReport {
                state,
                imgtype: pairs.take("imgtype").and_then(|s| ImageType::from_name(&s)),
                frmnum: pairs.take_i32("frmnum")?.unwrap_or(-1),
                frmtot: pairs.take_i32("frmtot")?.unwrap_or(-1),
                filter: pairs.take("filter").unwrap_or_default(),
                coolget: pairs.take_f64("coolget")?,
                freedisk: pairs.take_i64("freedisk")?,
                filename: pairs.take("filename").unwrap_or_default(),
            })
        }
        "fwhm" => KvBody::Fwhm {
            value: pairs.take_f64("value")?.ok_or(WireError::Malformed("fwhm without value"))?,
        },
        "focus" => KvBody::Focus {
            position: pairs
                .take_i32("position")?
                .ok_or(WireError::Malformed("focus without position"))?,
        },
        "rainfall" => KvBody::Rainfall {
            rainy: pairs.take_i32("value")?.map(|v| v != 0).unwrap_or(false),
        },
        "wind" => KvBody::Wind {
            speed: pairs.take_f64("speed")?.ok_or(WireError::Malformed("wind without speed"))?,
            direction: pairs.take_f64("direction")?.unwrap_or(0.0),
        },
        "cloud" => KvBody::Cloud {
            percent: pairs.take_f64("value")?.ok_or(WireError::Malformed("cloud without value"))?,
        },
        "obsite" => KvBody::ObsSite {
            name: pairs.take("name").unwrap_or_default(),
            lon: pairs.take_f64("lon")?.unwrap_or(0.0),
            lat: pairs.take_f64("lat")?.unwrap_or(0.0),
            alt: pairs.take_f64("alt")?.unwrap_or(0.0),
            timezone: pairs.take_i32("timezone")?.unwrap_or(0),
        },
        "obss" => {
            let mode = match pairs.take("mode").unwrap_or_default().to_ascii_uppercase().as_str() {
                "AUTO" => ObsMode::Auto,
                "MANUAL" => ObsMode::Manual,
                _ => ObsMode::Error,
            };
            let odt = match pairs.take_i32("odt")?.unwrap_or(0) {
                2 => Odt::Night,
                1 => Odt::Flat,
                _ => Odt::Daytime,
            };
            KvBody::ObssStatus(ObssReport {
                mode,
                odt,
                plan_sn: pairs.take("plan_sn").unwrap_or_default(),
                mount: pairs.take_i32("mount")?.and_then(MountState::from_i32),
                cameras: pairs.take_i32("cameras")?.unwrap_or(0),
            })
        }
        other => return Err(WireError::UnknownType(other.to_string())),
    };
    Ok(body)
}

fn resolve_plan(pairs: &mut KvPairs) -> Result<PlanFields, WireError> {
    let mut f = PlanFields::default();
    f.plan_sn = pairs.take("plan_sn").unwrap_or_default();
    f.plan_time = pairs.take("plan_time").unwrap_or_default();
    f.plan_type = pairs.take("plan_type").unwrap_or_default();
    f.obstype = pairs.take("obstype").unwrap_or_default();
    f.observer = pairs.take("observer").unwrap_or_default();
    f.grid_id = pairs.take("grid_id").unwrap_or_default();
    f.field_id = pairs.take("field_id").unwrap_or_default();
    f.runname = pairs.take("runname").unwrap_or_default();
    f.objname = pairs.take("objname").unwrap_or_default();
    f.pair_id = pairs.take_i32("pair_id")?;
    if let Some(v) = pairs.take_i32("coorsys")? {
        f.coorsys = CoorSys::from_i32(v).ok_or(WireError::Malformed("bad coorsys"))?;
    }
    if let Some(v) = pairs.take_f64("lon")? {
        f.lon = v;
    }
    if let Some(v) = pairs.take_f64("lat")? {
        f.lat = v;
    }
    if let Some(v) = pairs.take_f64("epoch")? {
        f.epoch = v;
    }
    f.line1 = pairs.take("line1").unwrap_or_default();
    f.line2 = pairs.take("line2").unwrap_or_default();
    if let Some(v) = pairs.take_f64("objra")? {
        f.objra = v;
    }
    if let Some(v) = pairs.take_f64("objdec")? {
        f.objdec = v;
    }
    if let Some(v) = pairs.take_f64("objepoch")? {
        f.objepoch = v;
    }
    f.objerror = pairs.take("objerror").unwrap_or_default();
    f.imgtype = pairs.take("imgtype").and_then(|s| ImageType::from_name(&s));
    if let Some(v) = pairs.take("filter") {
        f.push_filters(&v);
    }
    f.expdur = pairs.take_f64("expdur")?.unwrap_or(0.0);
    f.delay = pairs.take_f64("delay")?.unwrap_or(0.0);
    f.frmcnt = pairs.take_i32("frmcnt")?.unwrap_or(1);
    f.loopcnt = pairs.take_i32("loopcnt")?.unwrap_or(1);
    f.priority = pairs.take_i64("priority")?.unwrap_or(0);
    f.tmbegin = pairs.take("begin_time").or_else(|| pairs.take("tmbegin")).unwrap_or_default();
    f.tmend = pairs.take("end_time").or_else(|| pairs.take("tmend")).unwrap_or_default();
    Ok(f)
}

// ── Encoding ─────────────────────────────────────────────────────────────────

const RING_SLOTS: usize = 10;

/// Frame encoder over a ring of reusable buffers.
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

    /// Encode a frame exactly as carried (timestamp and extras preserved).
    pub fn compact_frame(&self, frame: &KvFrame) -> Bytes {
        let mut line = String::with_capacity(128);
        line.push_str(frame.body.type_name());
        line.push(' ');
        let mut first = true;
        let mut push = |line: &mut String, k: &str, v: &str| {
            if !first {
                line.push(',');
            }
            first = false;
            let _ = write!(line, "{k}={v}");
        };
        if !frame.utc.is_empty() {
            push(&mut line, "utc", &frame.utc);
        }
        if !frame.addr.gid.is_empty() {
            push(&mut line, "gid", &frame.addr.gid);
        }
        if !frame.addr.uid.is_empty() {
            push(&mut line, "uid", &frame.addr.uid);
        }
        if !frame.addr.cid.is_empty() {
            push(&mut line, "cid", &frame.addr.cid);
        }
        for (k, v) in body_pairs(&frame.body) {
            push(&mut line, &k, &v);
        }
        for (k, v) in &frame.extras {
            push(&mut line, k, v);
        }
        self.emit(line.trim_end())
    }

    /// Encode a fresh outbound frame, stamping the current UTC time.
    pub fn compact(&self, addr: DeviceAddr, body: KvBody) -> Bytes {
        let mut frame = KvFrame::new(addr, body);
        frame.utc = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string();
        self.compact_frame(&frame)
    }
}

fn fmt_num(v: f64) -> String {
    if (v - v.round()).abs() < 1e-9 {
        format!("{}", v.round() as i64)
    } else {
        format!("{v}")
    }
}

fn body_pairs(body: &KvBody) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    let mut kv = |k: &str, v: String| out.push((k.to_string(), v));
    match body {
        KvBody::Register
        | KvBody::Unregister
        | KvBody::Start
        | KvBody::Stop
        | KvBody::Enable
        | KvBody::Disable
        | KvBody::FindHome
        | KvBody::Park
        | KvBody::AbortSlew
        | KvBody::AbortImage => {}
        KvBody::AppendPlan(f) | KvBody::ImplementPlan(f) => plan_pairs(f, &mut out),
        KvBody::AbortPlan { plan_sn } | KvBody::CheckPlan { plan_sn } => {
            kv("plan_sn", plan_sn.clone())
        }
        KvBody::PlanStatus { plan_sn, state } => {
            kv("plan_sn", plan_sn.clone());
            kv("state", state.name().to_string());
        }
        KvBody::HomeSync { ra, dec } => {
            kv("ra", fmt_num(*ra));
            kv("dec", fmt_num(*dec));
        }
        KvBody::Slewto(f) => {
            kv("coorsys", format!("{}", f.coorsys as i8));
            if f.lon.is_finite() {
                kv("lon", fmt_num(f.lon));
            }
            if f.lat.is_finite() {
                kv("lat", fmt_num(f.lat));
            }
            if f.epoch != 2000.0 {
                kv("epoch", fmt_num(f.epoch));
            }
            if !f.line1.is_empty() {
                kv("line1", f.line1.clone());
            }
            if !f.line2.is_empty() {
                kv("line2", f.line2.clone());
            }
        }
        KvBody::Guide(f) => {
            kv("ra", fmt_num(f.ra));
            kv("dec", fmt_num(f.dec));
            if let Some(v) = f.objra {
                kv("objra", fmt_num(v));
            }
            if let Some(v) = f.objdec {
                kv("objdec", fmt_num(v));
            }
        }
        KvBody::Mount(f) => {
            if let Some(s) = f.state {
                kv("state", format!("{}", s as i8));
            }
            if let Some(v) = f.ra {
                kv("ra", fmt_num(v));
            }
            if let Some(v) = f.dec {
                kv("dec", fmt_num(v));
            }
            if let Some(v) = f.azi {
                kv("azi", fmt_num(v));
            }
            if let Some(v) = f.alt {
                kv("alt", fmt_num(v));
            }
        }
        KvBody::Slit { command, state } => {
            if let Some(c) = command {
                kv("command", format!("{}", *c as i8));
            }
            if let Some(s) = state {
                kv("state", format!("{}", *s as i8));
            }
        }
        KvBody::MirrorCover { command, state } => {
            if let Some(c) = command {
                kv("command", format!("{}", *c as i8));
            }
            if let Some(s) = state {
                kv("state", format!("{}", *s as i8));
            }
        }
        KvBody::TakeImage(f) => {
            if !f.objname.is_empty() {
                kv("objname", f.objname.clone());
            }
            if let Some(t) = f.imgtype {
                kv("imgtype", t.name().to_string());
            }
            if !f.filter.is_empty() {
                kv("filter", f.filter.clone());
            }
            kv("expdur", fmt_num(f.expdur));
            kv("frmcnt", format!("{}", f.frmcnt));
        }
        KvBody::Object(f) => {
            if !f.plan_sn.is_empty() {
                kv("plan_sn", f.plan_sn.clone());
            }
            if !f.objname.is_empty() {
                kv("objname", f.objname.clone());
            }
            if !f.obstype.is_empty() {
                kv("obstype", f.obstype.clone());
            }
            kv("imgtype", f.imgtype.name().to_string());
            if !f.filter.is_empty() {
                kv("filter", f.filter.clone());
            }
            kv("expdur", fmt_num(f.expdur));
            if f.delay > 0.0 {
                kv("delay", fmt_num(f.delay));
            }
            kv("frmcnt", format!("{}", f.frmcnt));
            if f.loopcnt != 1 {
                kv("loopcnt", format!("{}", f.loopcnt));
            }
            if f.lon.is_finite() {
                kv("lon", fmt_num(f.lon));
            }
            if f.lat.is_finite() {
                kv("lat", fmt_num(f.lat));
            }
            if !f.grid_id.is_empty() {
                kv("grid_id", f.grid_id.clone());
            }
            if !f.field_id.is_empty() {
                kv("field_id", f.field_id.clone());
            }
            if !f.runname.is_empty() {
                kv("runname", f.runname.clone());
            }
            if !f.observer.is_empty() {
                kv("observer", f.observer.clone());
            }
        }
        KvBody::Expose { command } => kv("command", format!("{}", *command as u8)),
        KvBody::Camera(f) => {
            kv("state", format!("{}", f.state as i8));
            if let Some(t) = f.imgtype {
                kv("imgtype", t.name().to_string());
            }
            if f.frmnum >= 0 {
                kv("frmnum", format!("{}", f.frmnum));
            }
            if f.frmtot >= 0 {
                kv("frmtot", format!("{}", f.frmtot));
            }
            if !f.filter.is_empty() {
                kv("filter", f.filter.clone());
            }
            if let Some(v) = f.coolget {
                kv("coolget", fmt_num(v));
            }
            if let Some(v) = f.freedisk {
                kv("freedisk", format!("{v}"));
            }
            if !f.filename.is_empty() {
                kv("filename", f.filename.clone());
            }
        }
        KvBody::Fwhm { value } => kv("value", fmt_num(*value)),
        KvBody::Focus { position } => kv("position", format!("{position}")),
        KvBody::Rainfall { rainy } => kv("value", format!("{}", *rainy as i32)),
        KvBody::Wind { speed, direction } => {
            kv("speed", fmt_num(*speed));
            kv("direction", fmt_num(*direction));
        }
        KvBody::Cloud { percent } => kv("value", fmt_num(*percent)),
        KvBody::ObsSite { name, lon, lat, alt, timezone } => {
            kv("name", name.clone());
            kv("lon", fmt_num(*lon));
            kv("lat", fmt_num(*lat));
            kv("alt", fmt_num(*alt));
            kv("timezone", format!("{timezone}"));
        }
        KvBody::ObssStatus(f) => {
            kv(
                "mode",
                match f.mode {
                    ObsMode::Auto => "AUTO".into(),
                    ObsMode::Manual => "MANUAL".into(),
                    ObsMode::Error => "ERROR".into(),
                },
            );
            kv("odt", format!("{}", f.odt as u8));
            if !f.plan_sn.is_empty() {
                kv("plan_sn", f.plan_sn.clone());
            }
            if let Some(m) = f.mount {
                kv("mount", format!("{}", m as i8));
            }
            kv("cameras", format!("{}", f.cameras));
        }
    }
    out
}

fn plan_pairs(f: &PlanFields, out: &mut Vec<(String, String)>) {
    let mut kv = |k: &str, v: String| out.push((k.to_string(), v));
    kv("plan_sn", f.plan_sn.clone());
    if !f.plan_time.is_empty() {
        kv("plan_time", f.plan_time.clone());
    }
    if !f.plan_type.is_empty() {
        kv("plan_type", f.plan_type.clone());
    }
    if !f.obstype.is_empty() {
        kv("obstype", f.obstype.clone());
    }
    if !f.observer.is_empty() {
        kv("observer", f.observer.clone());
    }
    if !f.grid_id.is_empty() {
        kv("grid_id", f.grid_id.clone());
    }
    if !f.field_id.is_empty() {
        kv("field_id", f.field_id.clone());
    }
    if !f.runname.is_empty() {
        kv("runname", f.runname.clone());
    }
    if !f.objname.is_empty() {
        kv("objname", f.objname.clone());
    }
    if let Some(v) = f.pair_id {
        kv("pair_id", format!("{v}"));
    }
    kv("coorsys", format!("{}", f.coorsys as i8));
    if f.lon.is_finite() {
        kv("lon", fmt_num(f.lon));
    }
    if f.lat.is_finite() {
        kv("lat", fmt_num(f.lat));
    }
    if f.epoch != 2000.0 {
        kv("epoch", fmt_num(f.epoch));
    }
    if !f.line1.is_empty() {
        kv("line1", f.line1.clone());
    }
    if !f.line2.is_empty() {
        kv("line2", f.line2.clone());
    }
    if f.objra.is_finite() {
        kv("objra", fmt_num(f.objra));
    }
    if f.objdec.is_finite() {
        kv("objdec", fmt_num(f.objdec));
    }
    if f.objepoch != 2000.0 {
        kv("objepoch", fmt_num(f.objepoch));
    }
    if !f.objerror.is_empty() {
        kv("objerror", f.objerror.clone());
    }
    if let Some(t) = f.imgtype {
        kv("imgtype", t.name().to_string());
    }
    if !f.filters.is_empty() {
        kv("filter", f.filters.join("|"));
    }
    kv("expdur", fmt_num(f.expdur));
    if f.delay > 0.0 {
        kv("delay", fmt_num(f.delay));
    }
    kv("frmcnt", format!("{}", f.frmcnt));
    if f.loopcnt != 1 {
        kv("loopcnt", format!("{}", f.loopcnt));
    }
    kv("priority", format!("{}", f.priority));
    if !f.tmbegin.is_empty() {
        kv("begin_time", f.tmbegin.clone());
    }
    if !f.tmend.is_empty() {
        kv("end_time", f.tmend.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_append_plan() {
        let line = "append_plan utc=2026-08-01T12:00:00,gid=001,plan_sn=A23,imgtype=object,\
                    lon=180.5,lat=30,filter=B|V|R,expdur=30,frmcnt=10,priority=10,\
                    begin_time=2026-08-01T13:00:00,end_time=2026-08-01T14:00:00,survey=north";
        let frame = resolve(line).unwrap();
        assert_eq!(frame.addr.gid, "001");
        assert_eq!(frame.utc, "2026-08-01T12:00:00");
        let plan = match &frame.body {
            KvBody::AppendPlan(p) => p,
            other => panic!("wrong body: {other:?}"),
        };
        assert_eq!(plan.plan_sn, "A23");
        assert_eq!(plan.imgtype, Some(ImageType::Object));
        assert_eq!(plan.filters, vec!["B", "V", "R"]);
        assert_eq!(plan.lon, 180.5);
        assert_eq!(plan.priority, 10);
        // unknown keys survive in the side list
        assert_eq!(frame.extras, vec![("survey".to_string(), "north".to_string())]);
    }

    #[test]
    fn resolve_rejects_unknown_type() {
        assert!(matches!(resolve("teleport x=1"), Err(WireError::UnknownType(_))));
    }

    #[test]
    fn resolve_rejects_oversize() {
        let line = format!("mount state=7,pad={}", "x".repeat(MAX_FRAME));
        assert!(matches!(resolve(&line), Err(WireError::Oversize)));
    }

    #[test]
    fn camera_report_requires_state() {
        assert!(resolve("camera frmnum=3").is_err());
        let frame = resolve("camera cid=011,state=2,frmnum=3,frmtot=10").unwrap();
        match frame.body {
            KvBody::Camera(c) => {
                assert_eq!(c.state, CameraState::Exposing);
                assert_eq!(c.frmnum, 3);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let enc = Encoder::new();
        let lines = [
            "slewto utc=2026-08-01T10:00:00,gid=001,uid=01,coorsys=1,lon=180,lat=30",
            "expose utc=2026-08-01T10:00:00,cid=005,command=1",
            "mount utc=2026-08-01T10:00:00,gid=001,uid=01,state=7,ra=180.123,dec=-30.5",
            "wind utc=2026-08-01T10:00:00,gid=001,speed=16,direction=270",
            "plan utc=2026-08-01T10:00:00,plan_sn=A23,state=running",
        ];
        for line in lines {
            let frame = resolve(line).unwrap();
            let encoded = enc.compact_frame(&frame);
            let text = std::str::from_utf8(&encoded).unwrap();
            assert_eq!(text.trim_end(), line, "round trip changed the frame");
        }
    }

    #[test]
    fn encoder_ring_hands_out_distinct_slices() {
        let enc = Encoder::new();
        let a = enc.compact(DeviceAddr::default(), KvBody::Park);
        let b = enc.compact(DeviceAddr::default(), KvBody::FindHome);
        assert!(a.starts_with(b"park"));
        assert!(b.starts_with(b"find_home"));
    }

    #[test]
    fn calibration_plan_has_sentinel_coordinates() {
        let frame = resolve("append_plan plan_sn=20260801_bias,imgtype=bias,expdur=0,frmcnt=10").unwrap();
        match frame.body {
            KvBody::AppendPlan(p) => {
                assert!(p.lon.is_infinite());
                assert!(p.lat.is_infinite());
            }
            other => panic!("wrong body: {other:?}"),
        }
    }
}
