//! The observation system: one mount, N cameras, optional annex devices,
//! executing one plan at a time.
//!
//! All state transitions are linearized by the mailbox worker; the public
//! handle only enqueues events or takes short read locks. The acquisition
//! task wakes every two minutes (or on signal) and pulls the next plan
//! through the injected hook, so the system never needs to know the
//! federation exists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

use obs_wire::fixed::{self, FixedMessage};
use obs_wire::kv::{
    self, GuideFields, KvBody, KvFrame, ObjectFields, ObssReport, SlewFields, TakeImageFields,
};
use obs_wire::{
    CameraState, CoorSys, DeviceAddr, ExposeCommand, ImageType, MountState, ObsMode, Odt,
    PlanState, SlitState,
};

use crate::astro;
use crate::config::ObssConfig;
use crate::db::DbSink;
use crate::devices::{clock_drift_ms, AnnexProxy, CameraKind, CameraProxy, CoupleMode, MountProxy};
use crate::journal::Journal;
use crate::net::{ClientRegistry, ConnHandle, FrameSink, Inbound, PeerClass};
use crate::plans::{seconds_until_local_noon, Plan, PlanPtr, PlanQueue};

/// Strong match: exact unit. Weak: wildcard. Used by the federation for
/// routing and fanout.
pub const MATCH_NO: u8 = 0;
pub const MATCH_STRONG: u8 = 1;
pub const MATCH_WEAK: u8 = 2;

/// Lead time within which a pending plan may be picked up, seconds.
pub const ACQUIRE_LEAD_SECS: i64 = 300;

/// Re-slew threshold when the mount already tracks near the target, degrees.
const RESLEW_THRESHOLD: f64 = 0.03;

/// A stuck flat pointing is refreshed after this long without a valid frame.
const FLAT_RETRY_SECS: i64 = 1200;

/// Site geography for one observation system.
#[derive(Debug, Clone)]
pub struct Site {
    pub name: String,
    pub lon: f64,
    pub lat: f64,
    pub alt: f64,
    pub timezone: i32,
}

#[derive(Debug, Clone)]
pub struct ObssParams {
    pub gid: String,
    pub uid: String,
    pub site: Site,
    /// Minimum safe pointing altitude, degrees.
    pub alt_limit: f64,
    pub robotic: bool,
    pub auto_bias: bool,
    pub auto_dark: bool,
    pub auto_flat: bool,
    pub auto_frmcnt: i32,
    pub auto_expdur: f64,
    pub p2h_mount: bool,
    pub p2h_camera: bool,
    pub p2h_mount_annex: bool,
    pub p2h_camera_annex: bool,
    pub use_dome_slit: bool,
    pub use_home_sync: bool,
    pub use_guide: bool,
    /// Arrival tolerance, arcminutes.
    pub t_arrive: f64,
}

impl ObssParams {
    pub fn from_config(cfg: &ObssConfig, uid: &str) -> Self {
        Self {
            gid: cfg.group_id.clone(),
            uid: uid.to_string(),
            site: Site {
                name: cfg.site.name.clone(),
                lon: cfg.site.lon,
                lat: cfg.site.lat,
                alt: cfg.site.alt,
                timezone: cfg.site.timezone,
            },
            alt_limit: cfg.alt_limit,
            robotic: cfg.robotic,
            auto_bias: cfg.auto_calibration.bias,
            auto_dark: cfg.auto_calibration.dark,
            auto_flat: cfg.auto_calibration.flat,
            auto_frmcnt: cfg.auto_calibration.frame_count,
            auto_expdur: cfg.auto_calibration.duration,
            p2h_mount: cfg.p2h.mount,
            p2h_camera: cfg.p2h.camera,
            p2h_mount_annex: cfg.p2h.mount_annex,
            p2h_camera_annex: cfg.p2h.camera_annex,
            use_dome_slit: cfg.dome.slit,
            use_home_sync: cfg.mount.home_sync,
            use_guide: cfg.mount.guide,
            t_arrive: cfg.slew_tolerance,
        }
    }
}

/// Hook returning the next plan this system should run, or nothing.
pub type AcquireHook = Arc<dyn Fn(&ObssParams) -> Option<PlanPtr> + Send + Sync>;

/// Mailbox traffic.
pub enum ObssEvent {
    DeviceKv { conn: ConnHandle, frame: KvFrame },
    DeviceFixed { conn: ConnHandle, msg: FixedMessage },
    DeviceClosed { conn: ConnHandle },
    ClientKv { frame: KvFrame, reply: Option<ConnHandle> },
    NotifyPlan(PlanPtr),
    AbortPlan(PlanPtr),
    Odt(Odt),
    SlitState(SlitState),
}

pub struct ObsState {
    pub mode: ObsMode,
    pub odt: Odt,
    pub mount: MountProxy,
    pub cameras: Vec<CameraProxy>,
    pub mount_annex: AnnexProxy,
    pub camera_annex: AnnexProxy,
    pub plan_now: Option<PlanPtr>,
    pub plan_wait: Option<PlanPtr>,
    pub slit: Option<SlitState>,
    pub obsflow_active: bool,
    pub parking: bool,
    pub guide_converged: bool,
    pub valid_flat: bool,
    pub last_flat_slew: Option<DateTime<Utc>>,
    /// An expose-start went out for the current segment; idle aggregation
    /// only counts after that.
    exposing_active: bool,
    err_safe: u32,
}

impl ObsState {
    fn new() -> Self {
        Self {
            mode: ObsMode::Error,
            odt: Odt::Daytime,
            mount: MountProxy::default(),
            cameras: Vec::new(),
            mount_annex: AnnexProxy::default(),
            camera_annex: AnnexProxy::default(),
            plan_now: None,
            plan_wait: None,
            slit: None,
            obsflow_active: false,
            parking: false,
            guide_converged: false,
            valid_flat: false,
            last_flat_slew: None,
            exposing_active: false,
            err_safe: 0,
        }
    }

    fn open_cameras(&self) -> impl Iterator<Item = &CameraProxy> {
        self.cameras.iter().filter(|c| c.is_open())
    }

    fn camera_counts(&self) -> (usize, usize, usize) {
        let mut total = 0;
        let mut idle = 0;
        let mut wait_flat = 0;
        for cam in self.open_cameras() {
            total += 1;
            match cam.state {
                Some(CameraState::WaitFlat) => wait_flat += 1,
                Some(CameraState::Idle) | None => idle += 1,
                _ => {}
            }
        }
        (total, idle, wait_flat)
    }

    fn any_camera_exposing(&self) -> bool {
        self.open_cameras().any(|c| c.is_exposing())
    }
}

pub struct ObssShared {
    pub params: Arc<ObssParams>,
    state: RwLock<ObsState>,
    tx: mpsc::Sender<ObssEvent>,
    raw_tx: FrameSink,
    acquire: Notify,
    quit: Notify,
    stopped: AtomicBool,
    kv_enc: Arc<kv::Encoder>,
    fixed_enc: Arc<fixed::Encoder>,
    journal: Journal,
    db: DbSink,
    clients: Arc<ClientRegistry>,
    queue: Arc<PlanQueue>,
    hook: AcquireHook,
}

pub type ObsSystem = Arc<ObssShared>;

pub struct ObssDeps {
    pub queue: Arc<PlanQueue>,
    pub journal: Journal,
    pub db: DbSink,
    pub clients: Arc<ClientRegistry>,
    pub kv_enc: Arc<kv::Encoder>,
    pub fixed_enc: Arc<fixed::Encoder>,
    pub hook: AcquireHook,
}

/// Build one observation system and start its long-lived tasks.
pub fn start(params: ObssParams, deps: ObssDeps) -> ObsSystem {
    let (tx, rx) = mpsc::channel(64);
    let (raw_tx, raw_rx) = mpsc::channel(64);
    let sys: ObsSystem = Arc::new(ObssShared {
        params: Arc::new(params),
        state: RwLock::new(ObsState::new()),
        tx,
        raw_tx,
        acquire: Notify::new(),
        quit: Notify::new(),
        stopped: AtomicBool::new(false),
        kv_enc: deps.kv_enc,
        fixed_enc: deps.fixed_enc,
        journal: deps.journal,
        db: deps.db,
        clients: deps.clients,
        queue: deps.queue,
        hook: deps.hook,
    });
    info!(obss = %unit_name(&sys.params), "observation system starts running");

    tokio::spawn(run_worker(sys.clone(), rx));
    tokio::spawn(run_adapter(sys.clone(), raw_rx));
    tokio::spawn(run_acquisition(sys.clone()));
    if sys.params.auto_bias || sys.params.auto_dark || sys.params.auto_flat {
        tokio::spawn(run_calibration(sys.clone()));
    }
    sys
}

fn unit_name(params: &ObssParams) -> String {
    format!("{}:{}", params.gid, params.uid)
}

impl ObssShared {
    // ── public operations ────────────────────────────────────────────────

    pub fn is_matched(&self, gid: &str, uid: &str) -> u8 {
        if self.params.gid == gid && self.params.uid == uid {
            MATCH_STRONG
        } else if gid.is_empty() || (self.params.gid == gid && uid.is_empty()) {
            MATCH_WEAK
        } else {
            MATCH_NO
        }
    }

    /// Effective priority for preemption arbitration.
    pub async fn get_priority(&self, now: DateTime<Utc>) -> i64 {
        let st = self.state.read().await;
        let wait = st.plan_wait.as_ref().map(|p| p.lock().unwrap().priority);
        let current = st.plan_now.as_ref().map(|p| {
            let p = p.lock().unwrap();
            (p.priority, p.period, (now - p.tmbegin).num_seconds())
        });
        effective_priority(st.mode, wait, current)
    }

    pub fn is_safe_point(&self, plan: &Plan, now: DateTime<Utc>) -> bool {
        is_safe_point(&self.params.site, self.params.alt_limit, plan, now)
    }

    /// Connected device count.
    pub async fn is_active(&self) -> usize {
        let st = self.state.read().await;
        st.open_cameras().count() + usize::from(st.mount.is_open())
    }

    pub fn signal_acquire(&self) {
        self.acquire.notify_one();
    }

    /// Sink for point-to-point connections owned by this system.
    pub fn raw_sink(&self) -> FrameSink {
        self.raw_tx.clone()
    }

    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.quit.notify_waiters();
        self.acquire.notify_waiters();
        info!(obss = %unit_name(&self.params), "observation system stopped");
    }

    pub async fn notify_plan(&self, plan: PlanPtr) {
        let _ = self.tx.send(ObssEvent::NotifyPlan(plan)).await;
    }

    pub async fn abort_plan(&self, plan: PlanPtr) {
        let _ = self.tx.send(ObssEvent::AbortPlan(plan)).await;
    }

    pub async fn notify_odt(&self, odt: Odt) {
        let _ = self.tx.send(ObssEvent::Odt(odt)).await;
    }

    pub async fn notify_slit_state(&self, state: SlitState) {
        let _ = self.tx.send(ObssEvent::SlitState(state)).await;
    }

    pub async fn notify_client_kv(&self, frame: KvFrame, reply: Option<ConnHandle>) {
        let _ = self.tx.send(ObssEvent::ClientKv { frame, reply }).await;
    }

    pub async fn post_device_kv(&self, conn: ConnHandle, frame: KvFrame) {
        let _ = self.tx.send(ObssEvent::DeviceKv { conn, frame }).await;
    }

    pub async fn post_device_fixed(&self, conn: ConnHandle, msg: FixedMessage) {
        let _ = self.tx.send(ObssEvent::DeviceFixed { conn, msg }).await;
    }

    pub async fn device_closed(&self, conn: ConnHandle) {
        let _ = self.tx.send(ObssEvent::DeviceClosed { conn }).await;
    }

    // ── coupling ─────────────────────────────────────────────────────────

    pub async fn couple_mount(self: &Arc<Self>, conn: ConnHandle, kv_dialect: bool) -> CoupleMode {
        {
            let mut st = self.state.write().await;
            if st.mount.is_open() {
                if st.mount.conn.as_ref().map(|c| c.id) != Some(conn.id) {
                    warn!(obss = %unit_name(&self.params), "already has a coupled mount, refusing");
                    return CoupleMode::Refused;
                }
                return self.mount_mode();
            }
            st.mount.conn = Some(conn.clone());
            st.mount.kv_dialect = kv_dialect;
        }
        info!(obss = %unit_name(&self.params), "mount is on-line");
        if !self.params.p2h_mount {
            conn.redirect(self.raw_sink());
        }
        self.refresh_mode().await;
        self.mount_mode()
    }

    fn mount_mode(&self) -> CoupleMode {
        if self.params.p2h_mount {
            CoupleMode::P2h
        } else {
            CoupleMode::P2p
        }
    }

    pub async fn couple_camera(self: &Arc<Self>, conn: ConnHandle, cid: &str) -> CoupleMode {
        {
            let mut st = self.state.write().await;
            let idx = match st.cameras.iter().position(|c| c.cid == cid) {
                Some(idx) => idx,
                None => {
                    st.cameras.push(CameraProxy::new(cid));
                    st.cameras.len() - 1
                }
            };
            let cam = &mut st.cameras[idx];
            if cam.is_open() {
                if cam.conn.as_ref().map(|c| c.id) != Some(conn.id) {
                    warn!(obss = %unit_name(&self.params), cid,
                          "already has a coupled camera, refusing");
                    return CoupleMode::Refused;
                }
                return self.camera_mode();
            }
            cam.conn = Some(conn.clone());
        }
        info!(obss = %unit_name(&self.params), cid, "camera is on-line");
        if !self.params.p2h_camera {
            conn.redirect(self.raw_sink());
        }
        self.refresh_mode().await;
        self.camera_mode()
    }

    fn camera_mode(&self) -> CoupleMode {
        if self.params.p2h_camera {
            CoupleMode::P2h
        } else {
            CoupleMode::P2p
        }
    }

    pub async fn couple_mount_annex(&self, conn: ConnHandle, kv_dialect: bool) -> CoupleMode {
        {
            let mut st = self.state.write().await;
            if st.mount_annex.is_open()
                && st.mount_annex.conn.as_ref().map(|c| c.id) != Some(conn.id)
            {
                warn!(obss = %unit_name(&self.params), "already has a coupled mount-annex, refusing");
                return CoupleMode::Refused;
            }
            st.mount_annex.conn = Some(conn.clone());
            st.mount_annex.kv_dialect = kv_dialect;
        }
        if !self.params.p2h_mount_annex {
            conn.redirect(self.raw_sink());
            CoupleMode::P2p
        } else {
            CoupleMode::P2h
        }
    }

    pub async fn couple_camera_annex(&self, conn: ConnHandle, kv_dialect: bool) -> CoupleMode {
        {
            let mut st = self.state.write().await;
            if st.camera_annex.is_open()
                && st.camera_annex.conn.as_ref().map(|c| c.id) != Some(conn.id)
            {
                warn!(obss = %unit_name(&self.params), "already has a coupled camera-annex, refusing");
                return CoupleMode::Refused;
            }
            st.camera_annex.conn = Some(conn.clone());
            st.camera_annex.kv_dialect = kv_dialect;
        }
        if !self.params.p2h_camera_annex {
            conn.redirect(self.raw_sink());
            CoupleMode::P2p
        } else {
            CoupleMode::P2h
        }
    }

    pub async fn status_snapshot(&self) -> serde_json::Value {
        let st = self.state.read().await;
        let plan_sn = st
            .plan_now
            .as_ref()
            .map(|p| p.lock().unwrap().plan_sn.clone())
            .unwrap_or_default();
        let cameras: Vec<serde_json::Value> = st
            .open_cameras()
            .map(|c| {
                serde_json::json!({
                    "cid": c.cid,
                    "kind": c.kind,
                    "state": c.state,
                    "imgtype": c.imgtype,
                    "frmnum": c.frmnum,
                    "frmtot": c.frmtot,
                    "filter": c.filter,
                    "fwhm": c.fwhm,
                })
            })
            .collect();
        serde_json::json!({
            "gid": self.params.gid,
            "uid": self.params.uid,
            "mode": st.mode,
            "odt": st.odt,
            "mount": st.mount.state.map(|s| s.name()),
            "mount_ready": st.mount.ready,
            "mount_utc": st.mount.utc,
            "cameras": cameras,
            "plan_sn": plan_sn,
            "slit": st.slit,
        })
    }

    // ── worker internals ─────────────────────────────────────────────────

    async fn handle_event(self: &Arc<Self>, ev: ObssEvent) {
        match ev {
            ObssEvent::DeviceKv { conn, frame } => self.on_device_kv(conn, frame).await,
            ObssEvent::DeviceFixed { conn, msg } => self.on_device_fixed(conn, msg).await,
            ObssEvent::DeviceClosed { conn } => self.on_device_closed(conn).await,
            ObssEvent::ClientKv { frame, reply } => self.on_client_kv(frame, reply).await,
            ObssEvent::NotifyPlan(plan) => self.on_notify_plan(plan).await,
            ObssEvent::AbortPlan(plan) => self.on_abort_plan(plan).await,
            ObssEvent::Odt(odt) => self.on_odt(odt).await,
            ObssEvent::SlitState(state) => self.on_slit_state(state).await,
        }
    }

    async fn on_device_kv(self: &Arc<Self>, conn: ConnHandle, frame: KvFrame) {
        match (conn.peer, &frame.body) {
            (PeerClass::Mount, KvBody::Mount(report)) => {
                let old = {
                    let mut st = self.state.write().await;
                    let old = st.mount.state;
                    if let Some(s) = report.state {
                        st.mount.state = Some(s);
                    }
                    if let (Some(ra), Some(dec)) = (report.ra, report.dec) {
                        st.mount.ra = ra;
                        st.mount.dec = dec;
                    }
                    old
                };
                if !frame.utc.is_empty() {
                    self.check_mount_clock(&frame.utc).await;
                }
                if let (Some(ra), Some(dec)) = (report.ra, report.dec) {
                    self.on_mount_position(ra, dec).await;
                }
                let new = self.state.read().await.mount.state;
                if old != new {
                    self.on_mount_state_changed(old).await;
                }
            }
            (PeerClass::Camera, KvBody::Camera(report)) => {
                let changed = {
                    let mut st = self.state.write().await;
                    let stx = &mut *st;
                    let cid = frame.addr.cid.clone();
                    let cam = stx
                        .cameras
                        .iter_mut()
                        .find(|c| c.cid == cid || c.conn.as_ref().map(|x| x.id) == Some(conn.id));
                    match cam {
                        Some(cam) => {
                            let prev = cam.apply_report(report);
                            if report.state == CameraState::Complete && cam.valid_flat {
                                stx.valid_flat = true;
                            }
                            prev != Some(report.state)
                        }
                        None => false,
                    }
                };
                if changed {
                    self.on_camera_state_changed().await;
                }
            }
            (PeerClass::MountAnnex | PeerClass::CameraAnnex, KvBody::Focus { position }) => {
                self.forward_focus(&frame.addr.cid, *position).await;
            }
            (PeerClass::MountAnnex | PeerClass::CameraAnnex, KvBody::Slit { state, .. }) => {
                if let Some(s) = state {
                    self.on_slit_state(*s).await;
                }
            }
            _ => debug!(obss = %unit_name(&self.params), peer = conn.peer.name(),
                        typ = frame.body.type_name(), "unhandled device frame"),
        }
    }

    async fn on_device_fixed(self: &Arc<Self>, _conn: ConnHandle, msg: FixedMessage) {
        match msg {
            FixedMessage::Ready { ready, .. } => {
                let mut st = self.state.write().await;
                st.mount.ready = ready != 0;
            }
            FixedMessage::Status { state, .. } => {
                let (old, new) = {
                    let mut st = self.state.write().await;
                    let old = st.mount.state;
                    st.mount.state = MountState::from_i32(state);
                    (old, st.mount.state)
                };
                if old != new {
                    self.on_mount_state_changed(old).await;
                }
            }
            FixedMessage::Utc { utc, .. } => {
                {
                    let mut st = self.state.write().await;
                    st.mount.utc = utc.clone();
                }
                self.check_mount_clock(&utc).await;
            }
            FixedMessage::CurrentPos { ra, dec, .. } => {
                {
                    let mut st = self.state.write().await;
                    st.mount.ra = ra;
                    st.mount.dec = dec;
                }
                self.on_mount_position(ra, dec).await;
            }
            FixedMessage::Focus { ref addr, position } => {
                self.forward_focus(&addr.cid, position).await;
            }
            FixedMessage::MirrorCover { ref addr, state } => {
                info!(obss = %unit_name(&self.params), cid = %addr.cid, state,
                      "mirror-cover report");
            }
            FixedMessage::Slit { state, .. } => {
                if let Some(s) = SlitState::from_i32(state) {
                    self.on_slit_state(s).await;
                }
            }
            FixedMessage::Rain { value, .. } => {
                debug!(obss = %unit_name(&self.params), value, "rain flag via annex");
            }
        }
    }

    /// Focuser readout travels to the camera so the FITS headers carry it.
    async fn forward_focus(&self, cid: &str, position: i32) {
        let st = self.state.read().await;
        if let Some(cam) = st.cameras.iter().find(|c| c.cid == cid && c.is_open()) {
            info!(obss = %unit_name(&self.params), cid, position, "focus position");
            let frame = self.kv_enc.compact(
                DeviceAddr::new(&self.params.gid, &self.params.uid, cid),
                KvBody::Focus { position },
            );
            if let Some(conn) = &cam.conn {
                conn.send(frame);
            }
        }
    }

    async fn check_mount_clock(&self, utc: &str) {
        let drift = clock_drift_ms(utc, Utc::now());
        let mut st = self.state.write().await;
        match drift {
            Some(ms) if ms.abs() >= 50 => {
                st.mount.clock_faults += 1;
                if st.mount.clock_faults % 6000 == 1 {
                    warn!(obss = %unit_name(&self.params),
                          "mount clock drifts {:.3} s", ms as f64 / 1000.0);
                }
            }
            Some(_) => {}
            None => {
                st.mount.clock_faults += 1;
                if st.mount.clock_faults % 6000 == 1 {
                    warn!(obss = %unit_name(&self.params), utc, "mount tells a broken time");
                }
            }
        }
    }

    /// Position report: the safety limit and the excursion monitor.
    async fn on_mount_position(self: &Arc<Self>, ra: f64, dec: f64) {
        let now = Utc::now();
        let mjd = astro::mjd(now);
        let lmst = astro::local_mean_sidereal_time(mjd, self.params.site.lon);
        let (_, alt) = astro::eq_to_horizon(lmst - ra, dec, self.params.site.lat);
        let safe = alt >= self.params.alt_limit;

        let mut action: Option<&'static str> = None;
        {
            let mut st = self.state.write().await;
            if !safe && !st.parking {
                st.err_safe += 1;
                if st.err_safe >= 2 {
                    st.err_safe = 0;
                    st.parking = true;
                    action = Some("out-of-limit");
                }
            } else if safe {
                st.err_safe = 0;
                if st.mount.state == Some(MountState::Tracking) && st.plan_now.is_some() {
                    let err = st.mount.arrive_error();
                    if st.mount.target.is_some() && err * 60.0 > 2.0 * self.params.t_arrive {
                        action = Some("excursion");
                    }
                }
            }
        }

        match action {
            Some("out-of-limit") => {
                warn!(obss = %unit_name(&self.params),
                      "position <{ra:.4}, {dec:.4}> is out of the safe range, parking");
                self.journal
                    .safety(
                        &self.params.gid,
                        &self.params.uid,
                        "park",
                        serde_json::json!({ "ra": ra, "dec": dec, "alt": alt }),
                    )
                    .await;
                self.send_park().await;
                self.abort_current("unsafe position").await;
            }
            Some("excursion") => {
                warn!(obss = %unit_name(&self.params),
                      "pointing excursion beyond tolerance, aborting plan");
                self.journal
                    .safety(
                        &self.params.gid,
                        &self.params.uid,
                        "abort",
                        serde_json::json!({ "reason": "excursion", "ra": ra, "dec": dec }),
                    )
                    .await;
                self.abort_current("position excursion").await;
            }
            _ => {}
        }
    }

    async fn on_mount_state_changed(self: &Arc<Self>, _old: Option<MountState>) {
        let (state, arrived) = {
            let mut st = self.state.write().await;
            let state = st.mount.state;
            if state == Some(MountState::Parked) {
                st.parking = false;
            }
            let arrived = state == Some(MountState::Tracking) && st.plan_now.is_some();
            (state, arrived)
        };
        if let Some(s) = state {
            info!(obss = %unit_name(&self.params), "mount goes into <{}>", s.name());
        }
        if !arrived {
            return;
        }

        // arrival gate: calibration skips the pointing check
        let (ok, err_arcmin, guide_first) = {
            let st = self.state.read().await;
            let plan = st.plan_now.as_ref().unwrap().lock().unwrap();
            let skip = plan.image_type() <= ImageType::Flat;
            let err = st.mount.arrive_error() * 60.0;
            let guide_first = exposure_starts_with_guide(&plan, &st);
            (skip || err <= self.params.t_arrive, err, guide_first)
        };
        if ok {
            info!(obss = %unit_name(&self.params), "arrival confirmed, starting exposure");
            self.start_exposure(guide_first).await;
        } else {
            warn!(obss = %unit_name(&self.params),
                  "PE <{err_arcmin:.1}> arcmin beyond the threshold, aborting plan");
            self.abort_current("arrival error").await;
        }
    }

    async fn on_camera_state_changed(self: &Arc<Self>) {
        enum Next {
            Nothing,
            Segment(SegmentData),
            Finish,
            FlatReslew,
        }

        let next = {
            let mut st = self.state.write().await;
            let (total, idle, wait_flat) = st.camera_counts();
            let running = st
                .plan_now
                .as_ref()
                .map(|p| p.lock().unwrap().state == PlanState::Running)
                .unwrap_or(false);
            if total == 0 || st.plan_now.is_none() {
                Next::Nothing
            } else if idle == total {
                if running && !st.exposing_active {
                    // cameras reported idle before any expose-start went out
                    Next::Nothing
                } else {
                    // all cameras settled: advance the cursor or finish
                    let plan = st.plan_now.as_ref().unwrap().clone();
                    let mut p = plan.lock().unwrap();
                    if p.state == PlanState::Running && advance_cursor(&mut p) {
                        let seg = segment_data(&p);
                        drop(p);
                        Next::Segment(seg)
                    } else {
                        drop(p);
                        Next::Finish
                    }
                }
            } else if wait_flat > 0 && wait_flat + idle == total {
                Next::FlatReslew
            } else {
                Next::Nothing
            }
        };

        match next {
            Next::Nothing => {}
            Next::Segment(seg) => self.emit_segment(seg).await,
            Next::Finish => self.finish_plan().await,
            Next::FlatReslew => self.flat_reslew().await,
        }
    }

    async fn on_notify_plan(self: &Arc<Self>, plan: PlanPtr) {
        let had_running = {
            let mut st = self.state.write().await;
            if let Some(stale) = st.plan_wait.take() {
                stale.lock().unwrap().state = PlanState::Cataloged;
            }
            if st.plan_now.is_some() {
                plan.lock().unwrap().state = PlanState::Waiting;
                st.plan_wait = Some(plan.clone());
                true
            } else {
                false
            }
        };
        if had_running {
            let sn = plan.lock().unwrap().plan_sn.clone();
            info!(obss = %unit_name(&self.params), plan_sn = %sn, "plan parked in the wait slot");
            self.report_plan(&plan).await;
            self.abort_current("preempted").await;
        } else {
            self.start_plan(plan).await;
        }
    }

    async fn on_abort_plan(self: &Arc<Self>, plan: PlanPtr) {
        let which = {
            let mut st = self.state.write().await;
            let sn = plan.lock().unwrap().plan_sn.clone();
            if st
                .plan_wait
                .as_ref()
                .map(|p| p.lock().unwrap().plan_sn == sn)
                .unwrap_or(false)
            {
                let wait = st.plan_wait.take().unwrap();
                wait.lock().unwrap().state = PlanState::Deleted;
                Some(("wait", wait))
            } else if st
                .plan_now
                .as_ref()
                .map(|p| p.lock().unwrap().plan_sn == sn)
                .unwrap_or(false)
            {
                Some(("now", plan))
            } else {
                None
            }
        };
        match which {
            Some(("wait", plan)) => self.report_plan(&plan).await,
            Some(("now", _)) => self.abort_current("operator abort").await,
            _ => {}
        }
    }

    async fn on_odt(self: &Arc<Self>, odt: Odt) {
        let changed = {
            let mut st = self.state.write().await;
            let changed = st.odt != odt;
            st.odt = odt;
            changed
        };
        if changed {
            info!(obss = %unit_name(&self.params), "observation duration becomes {odt:?}");
            self.switch_obsflow().await;
        }
    }

    async fn on_slit_state(self: &Arc<Self>, state: SlitState) {
        {
            let mut st = self.state.write().await;
            if st.slit == Some(state) {
                return;
            }
            st.slit = Some(state);
        }
        info!(obss = %unit_name(&self.params), "slit is {state:?}");
        self.switch_obsflow().await;
    }

    async fn on_device_closed(self: &Arc<Self>, conn: ConnHandle) {
        let mut abandoned: Option<PlanPtr> = None;
        let mut relevant = false;
        {
            let mut st = self.state.write().await;
            let stx = &mut *st;
            if stx.mount.conn.as_ref().map(|c| c.id) == Some(conn.id) {
                info!(obss = %unit_name(&self.params), "mount is off-line");
                stx.mount.reset();
                relevant = true;
            } else if let Some(cam) =
                stx.cameras.iter_mut().find(|c| c.conn.as_ref().map(|x| x.id) == Some(conn.id))
            {
                info!(obss = %unit_name(&self.params), cid = %cam.cid, "camera is off-line");
                let mid_exposure = cam.is_exposing();
                cam.reset();
                relevant = true;
                if mid_exposure {
                    if let Some(plan) = stx.plan_now.clone() {
                        plan.lock().unwrap().state = PlanState::Abandoned;
                        abandoned = Some(plan);
                    }
                }
            } else if stx.mount_annex.conn.as_ref().map(|c| c.id) == Some(conn.id) {
                stx.mount_annex.reset();
            } else if stx.camera_annex.conn.as_ref().map(|c| c.id) == Some(conn.id) {
                stx.camera_annex.reset();
            }
        }
        if let Some(plan) = abandoned {
            warn!(obss = %unit_name(&self.params),
                  plan_sn = %plan.lock().unwrap().plan_sn,
                  "camera dropped mid-exposure, plan abandoned");
            self.finish_plan().await;
        }
        if relevant {
            self.refresh_mode().await;
        }
    }

    async fn on_client_kv(self: &Arc<Self>, frame: KvFrame, reply: Option<ConnHandle>) {
        match frame.body.clone() {
            KvBody::Slewto(f) => self.client_slewto(f, reply).await,
            KvBody::Park => {
                {
                    let mut st = self.state.write().await;
                    st.parking = true;
                }
                self.send_park().await;
                self.abort_current("operator park").await;
            }
            KvBody::AbortSlew => self.send_abort_slew().await,
            KvBody::FindHome => self.send_find_home().await,
            KvBody::HomeSync { ra, dec } => {
                if self.params.use_home_sync {
                    self.send_home_sync(ra, dec).await;
                } else {
                    debug!(obss = %unit_name(&self.params), "home_sync disabled, ignored");
                }
            }
            KvBody::Guide(g) => self.client_guide(g).await,
            KvBody::TakeImage(t) => self.client_take_image(t, &frame.addr.cid).await,
            KvBody::AbortImage => {
                self.expose_command(ExposeCommand::Stop, ExposeScope::Cid(frame.addr.cid.clone()))
                    .await;
            }
            KvBody::Slit { command: Some(cmd), .. } => self.send_slit(cmd).await,
            KvBody::MirrorCover { command: Some(cmd), .. } => {
                self.send_mirror_cover(&frame.addr.cid, cmd == obs_wire::MirrorCoverState::Open)
                    .await;
            }
            KvBody::Focus { position } => self.send_focus(&frame.addr.cid, position).await,
            KvBody::Fwhm { value } => {
                {
                    let mut st = self.state.write().await;
                    if let Some(cam) = st.cameras.iter_mut().find(|c| c.cid == frame.addr.cid) {
                        cam.fwhm = value;
                    }
                }
                self.send_fwhm(&frame.addr.cid, value).await;
            }
            KvBody::Start => self.signal_acquire(),
            KvBody::Stop => self.abort_current("operator stop").await,
            KvBody::AbortPlan { .. } => self.abort_current("operator abort").await,
            KvBody::Enable | KvBody::Disable => {
                info!(obss = %unit_name(&self.params), typ = frame.body.type_name(),
                      "device gating request acknowledged");
            }
            other => debug!(obss = %unit_name(&self.params), typ = other.type_name(),
                            "unhandled client request"),
        }
    }

    async fn client_slewto(self: &Arc<Self>, f: SlewFields, reply: Option<ConnHandle>) {
        let busy = self.state.read().await.plan_now.is_some();
        if busy {
            warn!(obss = %unit_name(&self.params), "slewto refused: a plan is running");
            if let Some(conn) = reply {
                conn.send(self.status_frame().await);
            }
            return;
        }
        if f.coorsys == CoorSys::Equatorial && f.lon.is_finite() && f.lat.is_finite() {
            let mut st = self.state.write().await;
            st.mount.begin_slew(f.lon, f.lat);
        }
        self.send_slew(&f).await;
    }

    async fn client_guide(self: &Arc<Self>, g: GuideFields) {
        if !self.params.use_guide {
            debug!(obss = %unit_name(&self.params), "guide disabled, ignored");
            return;
        }
        // offsets may come directly or as (reference, measured) pairs
        let (d_ra, d_dec) = match (g.objra, g.objdec) {
            (Some(objra), Some(objdec)) => (objra - g.ra, objdec - g.dec),
            _ => (g.ra, g.dec),
        };
        let err_arcmin = d_ra.abs().max(d_dec.abs()) * 60.0;
        if err_arcmin <= self.params.t_arrive {
            // converged: promote guide-first exposures to the full mosaic
            let promote = {
                let mut st = self.state.write().await;
                let was = st.guide_converged;
                st.guide_converged = true;
                !was && st.plan_now.is_some()
            };
            if promote {
                info!(obss = %unit_name(&self.params), "guide converged, exposing all cameras");
                self.expose_command(ExposeCommand::Start, ExposeScope::All).await;
            }
            return;
        }
        let needs_sync = {
            let mut st = self.state.write().await;
            st.mount.add_offset(d_ra, d_dec)
        };
        self.send_guide(d_ra, d_dec).await;
        if needs_sync && self.params.use_home_sync {
            let target = self.state.read().await.mount.target;
            if let Some((ra, dec)) = target {
                warn!(obss = %unit_name(&self.params),
                      "accumulated guide offset beyond 2 degrees, syncing zero point");
                self.send_home_sync(ra, dec).await;
                let mut st = self.state.write().await;
                st.mount.d_ra = 0.0;
                st.mount.d_dec = 0.0;
            }
        }
    }

    async fn client_take_image(self: &Arc<Self>, t: TakeImageFields, cid: &str) {
        let busy = self.state.read().await.plan_now.is_some();
        if busy {
            warn!(obss = %unit_name(&self.params), "take_image refused: a plan is running");
            return;
        }
        let object = ObjectFields {
            objname: t.objname.clone(),
            imgtype: t.imgtype.unwrap_or(ImageType::Object),
            filter: t.filter.clone(),
            expdur: t.expdur,
            frmcnt: t.frmcnt,
            ..ObjectFields::default()
        };
        self.send_object(&object, ExposeScope::Cid(cid.to_string())).await;
        self.expose_command(ExposeCommand::Start, ExposeScope::Cid(cid.to_string())).await;
    }

    // ── plan execution ───────────────────────────────────────────────────

    async fn start_plan(self: &Arc<Self>, plan: PlanPtr) {
        let now = Utc::now();
        enum Pointing {
            None,
            Slew(f64, f64),
            Tle(SlewFields),
        }

        let (seg, pointing, guide_first, sn) = {
            let mut st = self.state.write().await;
            let mut p = plan.lock().unwrap();
            if p.gid.is_empty() {
                p.gid = self.params.gid.clone();
            }
            if p.uid.is_empty() {
                p.uid = self.params.uid.clone();
            }
            p.state = PlanState::Running;
            p.tmbegin = now;
            p.ifilter = 0;
            p.iloop = 0;

            let imgtype = p.image_type();
            let pointing = match (imgtype, p.coorsys) {
                (t, _) if !t.needs_pointing() => Pointing::None,
                (ImageType::Flat, _) => {
                    let (ra, dec) = random_zenith(&self.params.site, now);
                    p.lon = ra;
                    p.lat = dec;
                    p.coorsys = CoorSys::Equatorial;
                    st.valid_flat = false;
                    st.last_flat_slew = Some(now);
                    Pointing::Slew(ra, dec)
                }
                (_, CoorSys::Orbit) => Pointing::Tle(SlewFields {
                    coorsys: CoorSys::Orbit,
                    line1: p.line1.clone(),
                    line2: p.line2.clone(),
                    ..SlewFields::default()
                }),
                (_, CoorSys::Horizontal) => {
                    // convert once; the mount tracks equatorially
                    let lmst = astro::local_mean_sidereal_time(astro::mjd(now), self.params.site.lon);
                    let (ha, dec) = astro::horizon_to_eq(p.lon, p.lat, self.params.site.lat);
                    Pointing::Slew(astro::norm_deg(lmst - ha), dec)
                }
                (_, CoorSys::Equatorial) => {
                    let close = st.mount.state == Some(MountState::Tracking)
                        && astro::sphere_distance(p.lon, p.lat, st.mount.ra, st.mount.dec)
                            <= RESLEW_THRESHOLD;
                    if close {
                        // already on target; keep it for the excursion monitor
                        st.mount.begin_slew(p.lon, p.lat);
                        Pointing::None
                    } else {
                        Pointing::Slew(p.lon, p.lat)
                    }
                }
            };
            if let Pointing::Slew(ra, dec) = &pointing {
                st.mount.begin_slew(*ra, *dec);
            }
            st.guide_converged = false;
            st.exposing_active = false;
            st.plan_now = Some(plan.clone());
            let guide_first = exposure_starts_with_guide(&p, &st);
            (segment_data(&p), pointing, guide_first, p.plan_sn.clone())
        };

        info!(obss = %unit_name(&self.params), plan_sn = %sn, "plan goes running");
        self.report_plan(&plan).await;

        match pointing {
            Pointing::Slew(ra, dec) => {
                info!(obss = %unit_name(&self.params), "points to <{ra:.4}, {dec:.4}> deg");
                self.send_slew(&SlewFields {
                    coorsys: CoorSys::Equatorial,
                    lon: ra,
                    lat: dec,
                    ..SlewFields::default()
                })
                .await;
                self.send_object(&seg.object, ExposeScope::All).await;
                // exposure starts once the mount reports TRACKING
            }
            Pointing::Tle(f) => {
                self.send_slew(&f).await;
                self.send_object(&seg.object, ExposeScope::All).await;
            }
            Pointing::None => {
                self.send_object(&seg.object, ExposeScope::All).await;
                self.start_exposure(guide_first).await;
            }
        }
    }

    async fn start_exposure(self: &Arc<Self>, guide_first: bool) {
        {
            let mut st = self.state.write().await;
            st.exposing_active = true;
        }
        let scope = if guide_first {
            ExposeScope::GuideOnly
        } else {
            ExposeScope::All
        };
        self.expose_command(ExposeCommand::Start, scope).await;
    }

    async fn emit_segment(self: &Arc<Self>, seg: SegmentData) {
        let guide_first = {
            let st = self.state.read().await;
            match st.plan_now.as_ref() {
                Some(plan) => exposure_starts_with_guide(&plan.lock().unwrap(), &st),
                None => return,
            }
        };
        debug!(obss = %unit_name(&self.params),
               filter = %seg.object.filter, "next exposure segment");
        self.send_object(&seg.object, ExposeScope::All).await;
        self.start_exposure(guide_first).await;
    }

    /// Current plan reached a terminal or interrupted state; report, clear,
    /// and promote the wait slot.
    async fn finish_plan(self: &Arc<Self>) {
        let (plan, promoted) = {
            let mut st = self.state.write().await;
            let Some(plan) = st.plan_now.take() else { return };
            {
                let mut p = plan.lock().unwrap();
                if p.state == PlanState::Running {
                    p.state = PlanState::Over;
                }
            }
            st.mount.clear_target();
            st.guide_converged = false;
            st.exposing_active = false;
            (plan, st.plan_wait.take())
        };
        {
            let p = plan.lock().unwrap();
            info!(obss = %unit_name(&self.params), plan_sn = %p.plan_sn,
                  "plan is {}", p.state.name());
        }
        self.report_plan(&plan).await;
        self.signal_acquire();

        if let Some(next) = promoted {
            self.start_plan(next).await;
        }
    }

    /// Mark the runner interrupted and push stop commands downstream; the
    /// terminal state is observed once every camera settles back to idle.
    async fn abort_current(self: &Arc<Self>, reason: &str) {
        let (has_plan, still_exposing) = {
            let mut st = self.state.write().await;
            let Some(plan) = st.plan_now.clone() else { return };
            {
                let mut p = plan.lock().unwrap();
                if p.state == PlanState::Running {
                    p.state = PlanState::Interrupted;
                }
            }
            (true, st.any_camera_exposing())
        };
        if has_plan {
            info!(obss = %unit_name(&self.params), reason, "aborting the running plan");
            self.send_abort_slew().await;
            self.expose_command(ExposeCommand::Stop, ExposeScope::All).await;
            if !still_exposing {
                self.finish_plan().await;
            }
        }
    }

    /// Twilight flats: refresh the pointing once a valid flat is in the can,
    /// or after twenty minutes of fruitless tries at the same field.
    async fn flat_reslew(self: &Arc<Self>) {
        let now = Utc::now();
        enum FlatAction {
            Reslew(f64, f64, SegmentData),
            Resume,
            Nothing,
        }
        let action = {
            let mut st = self.state.write().await;
            let Some(plan) = st.plan_now.clone() else { return };
            let mut p = plan.lock().unwrap();
            if p.image_type() != ImageType::Flat {
                FlatAction::Nothing
            } else {
                let stuck = st
                    .last_flat_slew
                    .map(|t| (now - t).num_seconds() > FLAT_RETRY_SECS)
                    .unwrap_or(true);
                if st.valid_flat || stuck {
                    let (ra, dec) = random_zenith(&self.params.site, now);
                    p.lon = ra;
                    p.lat = dec;
                    st.valid_flat = false;
                    st.last_flat_slew = Some(now);
                    st.mount.begin_slew(ra, dec);
                    let seg = segment_data(&p);
                    FlatAction::Reslew(ra, dec, seg)
                } else {
                    FlatAction::Resume
                }
            }
        };
        match action {
            FlatAction::Reslew(ra, dec, seg) => {
                info!(obss = %unit_name(&self.params),
                      "flat re-slew to <{ra:.4}, {dec:.4}> deg");
                self.send_object(&seg.object, ExposeScope::All).await;
                self.send_slew(&SlewFields {
                    coorsys: CoorSys::Equatorial,
                    lon: ra,
                    lat: dec,
                    ..SlewFields::default()
                })
                .await;
            }
            FlatAction::Resume => {
                self.expose_command(ExposeCommand::Start, ExposeScope::All).await;
            }
            FlatAction::Nothing => {}
        }
    }

    // ── mode & flow ──────────────────────────────────────────────────────

    /// Recompute the run mode from device availability.
    async fn refresh_mode(self: &Arc<Self>) {
        let changed = {
            let mut st = self.state.write().await;
            let mount_up = st.mount.is_open();
            let cams_up = st.open_cameras().count() > 0;
            let mode = if mount_up && cams_up && self.params.robotic {
                ObsMode::Auto
            } else if mount_up || cams_up {
                ObsMode::Manual
            } else {
                ObsMode::Error
            };
            if mode != st.mode {
                st.mode = mode;
                Some(mode)
            } else {
                None
            }
        };
        if let Some(mode) = changed {
            info!(obss = %unit_name(&self.params), "enters {mode:?} mode");
            self.broadcast_status().await;
            self.switch_obsflow().await;
        }
    }

    async fn switch_obsflow(self: &Arc<Self>) {
        let transition = {
            let mut st = self.state.write().await;
            let should_run = st.odt > Odt::Daytime && st.mode == ObsMode::Auto;
            if should_run != st.obsflow_active {
                st.obsflow_active = should_run;
                Some(should_run)
            } else {
                None
            }
        };
        match transition {
            Some(true) => {
                info!(obss = %unit_name(&self.params), "starts observation");
                self.signal_acquire();
            }
            Some(false) => {
                info!(obss = %unit_name(&self.params), "stops observation");
            }
            None => {}
        }
    }

    // ── downstream commands ──────────────────────────────────────────────

    async fn send_slew(&self, f: &SlewFields) {
        let st = self.state.read().await;
        let Some(conn) = st.mount.conn.clone() else { return };
        let frame = if st.mount.kv_dialect {
            self.kv_enc.compact(self.unit_addr(), KvBody::Slewto(f.clone()))
        } else if f.lon.is_finite() && f.lat.is_finite() {
            self.fixed_enc.slew(&self.params.gid, &self.params.uid, f.lon, f.lat)
        } else {
            warn!(obss = %unit_name(&self.params), "legacy mount cannot track orbital elements");
            return;
        };
        conn.send(frame);
    }

    async fn send_park(&self) {
        let st = self.state.read().await;
        let Some(conn) = st.mount.conn.clone() else { return };
        let frame = if st.mount.kv_dialect {
            self.kv_enc.compact(self.unit_addr(), KvBody::Park)
        } else {
            self.fixed_enc.park(&self.params.gid, &self.params.uid)
        };
        conn.send_critical(frame);
    }

    async fn send_abort_slew(&self) {
        let st = self.state.read().await;
        let Some(conn) = st.mount.conn.clone() else { return };
        let frame = if st.mount.kv_dialect {
            self.kv_enc.compact(self.unit_addr(), KvBody::AbortSlew)
        } else {
            self.fixed_enc.abort_slew(&self.params.gid, &self.params.uid)
        };
        conn.send_critical(frame);
    }

    async fn send_find_home(&self) {
        let st = self.state.read().await;
        let Some(conn) = st.mount.conn.clone() else { return };
        let frame = if st.mount.kv_dialect {
            self.kv_enc.compact(self.unit_addr(), KvBody::FindHome)
        } else {
            self.fixed_enc.find_home(&self.params.gid, &self.params.uid)
        };
        conn.send(frame);
    }

    async fn send_home_sync(&self, ra: f64, dec: f64) {
        let st = self.state.read().await;
        let Some(conn) = st.mount.conn.clone() else { return };
        let frame = if st.mount.kv_dialect {
            self.kv_enc.compact(self.unit_addr(), KvBody::HomeSync { ra, dec })
        } else {
            self.fixed_enc.home_sync(&self.params.gid, &self.params.uid, ra, dec)
        };
        conn.send(frame);
    }

    async fn send_guide(&self, d_ra: f64, d_dec: f64) {
        let st = self.state.read().await;
        let Some(conn) = st.mount.conn.clone() else { return };
        let frame = if st.mount.kv_dialect {
            self.kv_enc.compact(
                self.unit_addr(),
                KvBody::Guide(GuideFields { ra: d_ra, dec: d_dec, objra: None, objdec: None }),
            )
        } else {
            self.fixed_enc.guide(&self.params.gid, &self.params.uid, d_ra, d_dec)
        };
        conn.send(frame);
    }

    /// Slit commands go to the configured annex operator; close is critical.
    async fn send_slit(&self, cmd: SlitState) {
        if !self.params.use_dome_slit {
            debug!(obss = %unit_name(&self.params), "dome slit not configured, ignored");
            return;
        }
        let st = self.state.read().await;
        let Some(conn) = st.mount_annex.conn.clone() else {
            warn!(obss = %unit_name(&self.params), "slit command without an annex link");
            return;
        };
        let frame = if st.mount_annex.kv_dialect {
            self.kv_enc
                .compact(self.unit_addr(), KvBody::Slit { command: Some(cmd), state: None })
        } else {
            self.fixed_enc.slit(&self.params.gid, &self.params.uid, cmd as i32)
        };
        if cmd == SlitState::Closed {
            conn.send_critical(frame);
        } else {
            conn.send(frame);
        }
    }

    async fn send_mirror_cover(&self, cid: &str, open: bool) {
        let st = self.state.read().await;
        let Some(conn) = st.mount_annex.conn.clone() else { return };
        let cids: Vec<String> = if cid.is_empty() {
            st.open_cameras().map(|c| c.cid.clone()).collect()
        } else {
            vec![cid.to_string()]
        };
        for cid in cids {
            let frame = if st.mount_annex.kv_dialect {
                self.kv_enc.compact(
                    DeviceAddr::new(&self.params.gid, &self.params.uid, &cid),
                    KvBody::MirrorCover {
                        command: Some(if open {
                            obs_wire::MirrorCoverState::Open
                        } else {
                            obs_wire::MirrorCoverState::Closed
                        }),
                        state: None,
                    },
                )
            } else {
                self.fixed_enc.mirror_cover(&self.params.gid, &self.params.uid, &cid, open)
            };
            conn.send(frame);
        }
    }

    async fn send_focus(&self, cid: &str, position: i32) {
        let st = self.state.read().await;
        let Some(conn) = st.mount_annex.conn.clone() else { return };
        let frame = if st.mount_annex.kv_dialect {
            self.kv_enc.compact(
                DeviceAddr::new(&self.params.gid, &self.params.uid, cid),
                KvBody::Focus { position },
            )
        } else {
            self.fixed_enc.focus(&self.params.gid, &self.params.uid, cid, position)
        };
        conn.send(frame);
    }

    async fn send_fwhm(&self, cid: &str, value: f64) {
        let st = self.state.read().await;
        let Some(conn) = st.mount_annex.conn.clone() else { return };
        let frame = if st.mount_annex.kv_dialect {
            self.kv_enc.compact(
                DeviceAddr::new(&self.params.gid, &self.params.uid, cid),
                KvBody::Fwhm { value },
            )
        } else {
            self.fixed_enc.fwhm(&self.params.gid, &self.params.uid, cid, value)
        };
        conn.send(frame);
    }

    async fn send_object(&self, object: &ObjectFields, scope: ExposeScope) {
        let st = self.state.read().await;
        for cam in st.open_cameras() {
            if !scope.includes(cam) {
                continue;
            }
            let frame = self.kv_enc.compact(
                DeviceAddr::new(&self.params.gid, &self.params.uid, &cam.cid),
                KvBody::Object(object.clone()),
            );
            if let Some(conn) = &cam.conn {
                conn.send(frame);
            }
        }
    }

    async fn expose_command(&self, cmd: ExposeCommand, scope: ExposeScope) {
        let st = self.state.read().await;
        for cam in st.open_cameras() {
            if !scope.includes(cam) {
                continue;
            }
            let frame = self.kv_enc.compact(
                DeviceAddr::new(&self.params.gid, &self.params.uid, &cam.cid),
                KvBody::Expose { command: cmd },
            );
            if let Some(conn) = &cam.conn {
                if cmd == ExposeCommand::Stop {
                    conn.send_critical(frame);
                } else {
                    conn.send(frame);
                }
            }
        }
    }

    fn unit_addr(&self) -> DeviceAddr {
        DeviceAddr::group_unit(&self.params.gid, &self.params.uid)
    }

    // ── reporting ────────────────────────────────────────────────────────

    async fn report_plan(&self, plan: &PlanPtr) {
        let (sn, state, gid, uid) = {
            let p = plan.lock().unwrap();
            (p.plan_sn.clone(), p.state, p.gid.clone(), p.uid.clone())
        };
        let frame = self.kv_enc.compact(
            DeviceAddr::group_unit(&gid, &uid),
            KvBody::PlanStatus { plan_sn: sn.clone(), state },
        );
        self.clients.broadcast(&self.params.gid, &self.params.uid, frame);
        self.journal.plan_state(&sn, state.name(), &gid, &uid).await;
        self.db.upload_plan_state(&sn, state.name(), &gid, &uid).await;
    }

    async fn status_frame(&self) -> Bytes {
        let st = self.state.read().await;
        let report = ObssReport {
            mode: st.mode,
            odt: st.odt,
            plan_sn: st
                .plan_now
                .as_ref()
                .map(|p| p.lock().unwrap().plan_sn.clone())
                .unwrap_or_default(),
            mount: st.mount.state,
            cameras: st.open_cameras().count() as i32,
        };
        self.kv_enc.compact(self.unit_addr(), KvBody::ObssStatus(report))
    }

    async fn broadcast_status(&self) {
        let frame = self.status_frame().await;
        self.clients.broadcast(&self.params.gid, &self.params.uid, frame);
        if self.db.is_enabled() {
            let doc = self.status_snapshot().await;
            self.db.upload_obss_status(doc).await;
        }
    }
}

// ── exposure plumbing ────────────────────────────────────────────────────────

#[derive(Clone)]
enum ExposeScope {
    All,
    GuideOnly,
    /// One camera, or all when the cid is empty.
    Cid(String),
}

impl ExposeScope {
    fn includes(&self, cam: &CameraProxy) -> bool {
        match self {
            Self::All => true,
            Self::GuideOnly => cam.kind == CameraKind::Guide,
            Self::Cid(cid) => cid.is_empty() || &cam.cid == cid,
        }
    }
}

struct SegmentData {
    object: ObjectFields,
}

/// The camera-facing descriptor for the plan's current (loop, filter) slot.
fn segment_data(p: &Plan) -> SegmentData {
    let filter = p.filters.get(p.ifilter).cloned().unwrap_or_default();
    SegmentData {
        object: ObjectFields {
            plan_sn: p.plan_sn.clone(),
            objname: p.objname.clone(),
            obstype: p.obstype.clone(),
            imgtype: p.image_type(),
            filter,
            expdur: p.expdur,
            delay: p.delay,
            frmcnt: p.frmcnt,
            loopcnt: p.loopcnt,
            lon: p.lon,
            lat: p.lat,
            grid_id: p.grid_id.clone(),
            field_id: p.field_id.clone(),
            runname: p.runname.clone(),
            observer: p.observer.clone(),
        },
    }
}

/// Advance the (filter, loop) cursor after a settled segment; `false` once
/// the program is exhausted.
fn advance_cursor(p: &mut Plan) -> bool {
    let nfilter = p.filters.len().max(1);
    p.ifilter += 1;
    if p.ifilter >= nfilter {
        p.ifilter = 0;
        p.iloop += 1;
    }
    p.iloop < p.loopcnt
}

/// Monitoring and target-of-opportunity runs start on the guide cameras
/// only; the mosaic joins once a guide solution converges.
fn exposure_starts_with_guide(p: &Plan, st: &ObsState) -> bool {
    let flavored = p.obstype.eq_ignore_ascii_case("mon") || p.obstype.eq_ignore_ascii_case("toa");
    flavored
        && !st.guide_converged
        && st.open_cameras().any(|c| c.kind == CameraKind::Guide)
        && st.open_cameras().any(|c| c.kind == CameraKind::Joint)
}

/// Effective priority used by the federation's preemption arbitration.
/// `plan_now` carries `(priority, period_secs, elapsed_secs)`.
pub fn effective_priority(
    mode: ObsMode,
    plan_wait: Option<i64>,
    plan_now: Option<(i64, i64, i64)>,
) -> i64 {
    if mode != ObsMode::Auto {
        return i64::MAX;
    }
    if let Some(priority) = plan_wait {
        return priority;
    }
    match plan_now {
        Some((priority, period, elapsed)) => {
            let t = period.max(1);
            let dt = elapsed.clamp(0, t);
            if 10 * dt >= 7 * t {
                priority.saturating_mul(4)
            } else {
                priority.saturating_mul(t) / (t - dt)
            }
        }
        None => 0,
    }
}

/// Pointing admissibility. Orbital plans delegate propagation to the mount;
/// calibration frames carry no coordinate and bypass the gate.
pub fn is_safe_point(site: &Site, alt_limit: f64, plan: &Plan, now: DateTime<Utc>) -> bool {
    if !plan.image_type().needs_pointing() {
        return true;
    }
    match plan.coorsys {
        CoorSys::Orbit => true,
        CoorSys::Horizontal => !plan.lat.is_finite() || plan.lat >= alt_limit,
        CoorSys::Equatorial => {
            if !plan.lon.is_finite() || !plan.lat.is_finite() {
                return true;
            }
            let at = if plan.tmbegin > now { plan.tmbegin } else { now };
            let lmst = astro::local_mean_sidereal_time(astro::mjd(at), site.lon);
            let (_, alt) = astro::eq_to_horizon(lmst - plan.lon, plan.lat, site.lat);
            alt >= alt_limit
        }
    }
}

/// Random zenith-adjacent pointing for twilight flats: altitude in
/// [80°, 85°], azimuth in the eastern quadrant before local noon and the
/// western one after, expressed equatorially through the sidereal time.
pub fn random_zenith(site: &Site, now: DateTime<Utc>) -> (f64, f64) {
    use chrono::Timelike;
    let mut rng = rand::thread_rng();
    let local_hour = (now + Duration::hours(site.timezone as i64)).hour();
    let alt = rng.gen_range(80.0..85.0);
    let azi = if local_hour < 12 {
        rng.gen_range(45.0..135.0)
    } else {
        rng.gen_range(225.0..315.0)
    };
    let (ha, dec) = astro::horizon_to_eq(azi, alt, site.lat);
    let lmst = astro::local_mean_sidereal_time(astro::mjd(now), site.lon);
    (astro::norm_deg(lmst - ha), dec)
}

// ── long-lived tasks ─────────────────────────────────────────────────────────

async fn run_worker(sys: ObsSystem, mut rx: mpsc::Receiver<ObssEvent>) {
    loop {
        tokio::select! {
            biased;
            _ = sys.quit.notified() => {
                // drain what is already queued, then leave
                while let Ok(ev) = rx.try_recv() {
                    sys.handle_event(ev).await;
                }
                break;
            }
            ev = rx.recv() => match ev {
                Some(ev) => sys.handle_event(ev).await,
                None => break,
            },
        }
    }
}

/// Decode frames arriving on point-to-point connections owned by this
/// system. A frame that does not parse closes the connection.
async fn run_adapter(sys: ObsSystem, mut raw_rx: mpsc::Receiver<Inbound>) {
    while let Some(inbound) = raw_rx.recv().await {
        match inbound {
            Inbound::Frame { conn, line } => {
                if fixed::looks_fixed(&line) {
                    match fixed::resolve(&line) {
                        Ok(msg) => sys.post_device_fixed(conn, msg).await,
                        Err(e) => {
                            warn!(obss = %unit_name(&sys.params), "bad fixed frame: {e}");
                            conn.close();
                            sys.device_closed(conn).await;
                        }
                    }
                } else {
                    match kv::resolve(&line) {
                        Ok(frame) => sys.post_device_kv(conn, frame).await,
                        Err(e) => {
                            warn!(obss = %unit_name(&sys.params), "bad kv frame: {e}");
                            conn.close();
                            sys.device_closed(conn).await;
                        }
                    }
                }
            }
            Inbound::Closed { conn } => sys.device_closed(conn).await,
        }
    }
}

/// Wake every two minutes or on signal; pull the next plan when both slots
/// are empty and the observation flow is on.
async fn run_acquisition(sys: ObsSystem) {
    loop {
        tokio::select! {
            _ = sys.acquire.notified() => {}
            _ = tokio::time::sleep(StdDuration::from_secs(120)) => {}
        }
        if sys.stopped.load(Ordering::SeqCst) {
            break;
        }
        let ready = {
            let st = sys.state.read().await;
            st.obsflow_active && st.plan_now.is_none() && st.plan_wait.is_none()
        };
        if !ready {
            continue;
        }
        if let Some(plan) = (sys.hook.as_ref())(&sys.params) {
            let _ = sys.tx.send(ObssEvent::NotifyPlan(plan)).await;
        }
    }
}

/// One calibration plan per enabled type per day, generated at local noon.
async fn run_calibration(sys: ObsSystem) {
    tokio::time::sleep(StdDuration::from_secs(10)).await;
    loop {
        if sys.stopped.load(Ordering::SeqCst) {
            break;
        }
        let now = Utc::now();
        generate_calibration_plans(&sys.params, &sys.queue, now);
        let secs = seconds_until_local_noon(now, sys.params.site.timezone);
        tokio::select! {
            _ = tokio::time::sleep(StdDuration::from_secs(secs as u64)) => {}
            _ = sys.quit.notified() => break,
        }
    }
}

/// Calibration plans run at top priority and bypass the safety gate (no
/// coordinate); the 23-hour window keeps one per day alive.
pub fn generate_calibration_plans(params: &ObssParams, queue: &PlanQueue, now: DateTime<Utc>) {
    let day = now.format("%Y%m%d");
    let base = |imgtype: ImageType, sn: String| {
        let mut plan = Plan::from_wire(kv::PlanFields::default(), now);
        plan.plan_sn = sn;
        plan.plan_time = now.format("%Y-%m-%dT%H:%M:%S").to_string();
        plan.plan_type = "Calibration".into();
        plan.obstype = "cal".into();
        plan.observer = "auto".into();
        plan.gid = params.gid.clone();
        plan.uid = params.uid.clone();
        plan.imgtype = Some(imgtype);
        plan.expdur = params.auto_expdur;
        plan.frmcnt = params.auto_frmcnt;
        plan.priority = i64::MAX;
        plan.tmbegin = now;
        plan.tmend = now + Duration::hours(23);
        plan
    };
    let mut candidates = Vec::new();
    if params.auto_bias {
        candidates.push(base(ImageType::Bias, format!("{day}_bias")));
    }
    if params.auto_dark {
        candidates.push(base(ImageType::Dark, format!("{day}_dark")));
    }
    if params.auto_flat {
        let mut plan = base(ImageType::Flat, format!("{day}_flat"));
        plan.filters.push("All".into());
        candidates.push(plan);
    }
    for mut plan in candidates {
        if plan.complete_check(now) && queue.add(Arc::new(std::sync::Mutex::new(plan.clone()))) {
            info!(obss = %unit_name(params), plan_sn = %plan.plan_sn, "calibration plan cataloged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::test_conn;
    use chrono::TimeZone;

    fn test_site() -> Site {
        Site { name: "t".into(), lon: 117.0, lat: 40.0, alt: 900.0, timezone: 8 }
    }

    fn test_params() -> ObssParams {
        ObssParams {
            gid: "001".into(),
            uid: "01".into(),
            site: test_site(),
            alt_limit: 20.0,
            robotic: true,
            auto_bias: false,
            auto_dark: false,
            auto_flat: false,
            auto_frmcnt: 10,
            auto_expdur: 10.0,
            p2h_mount: true,
            p2h_camera: true,
            p2h_mount_annex: true,
            p2h_camera_annex: true,
            use_dome_slit: false,
            use_home_sync: false,
            use_guide: false,
            t_arrive: 10.0,
        }
    }

    fn test_deps(queue: Arc<PlanQueue>) -> ObssDeps {
        ObssDeps {
            queue,
            journal: Journal::new(std::env::temp_dir().join("obsd-obss-tests")),
            db: DbSink::disabled(),
            clients: Arc::new(ClientRegistry::default()),
            kv_enc: Arc::new(kv::Encoder::new()),
            fixed_enc: Arc::new(fixed::Encoder::new()),
            hook: Arc::new(|_| None),
        }
    }

    fn object_plan(sn: &str, priority: i64) -> PlanPtr {
        let now = Utc::now();
        let mut f = kv::PlanFields::default();
        f.plan_sn = sn.into();
        f.imgtype = Some(ImageType::Object);
        f.coorsys = CoorSys::Equatorial;
        f.lon = 180.0;
        f.lat = 30.0;
        f.expdur = 30.0;
        f.frmcnt = 10;
        f.priority = priority;
        let mut p = Plan::from_wire(f, now);
        assert!(p.complete_check(now));
        Arc::new(std::sync::Mutex::new(p))
    }

    #[test]
    fn priority_reflects_mode_and_slots() {
        assert_eq!(effective_priority(ObsMode::Manual, None, None), i64::MAX);
        assert_eq!(effective_priority(ObsMode::Error, None, None), i64::MAX);
        assert_eq!(effective_priority(ObsMode::Auto, Some(42), None), 42);
        assert_eq!(effective_priority(ObsMode::Auto, None, None), 0);
    }

    #[test]
    fn priority_ages_monotonically() {
        // a fixed running plan gains effective priority as time passes
        let mut last = 0;
        for dt in [0, 100, 300, 500, 650] {
            let p = effective_priority(ObsMode::Auto, None, Some((10, 1000, dt)));
            assert!(p >= last, "aging went backwards at dt={dt}");
            last = p;
        }
        // nearly done: hard to preempt
        assert_eq!(effective_priority(ObsMode::Auto, None, Some((10, 1000, 700))), 40);
        assert_eq!(effective_priority(ObsMode::Auto, None, Some((10, 1000, 999))), 40);
        // max-priority plans can never be displaced
        assert_eq!(
            effective_priority(ObsMode::Auto, None, Some((i64::MAX, 1000, 800))),
            i64::MAX
        );
    }

    #[test]
    fn safety_gate_rejects_southern_target_from_northern_site() {
        // site at +40: a dec -60 target never clears a 20 degree limit
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 16, 0, 0).unwrap();
        let mut plan = object_plan("south", 1).lock().unwrap().clone();
        plan.lat = -60.0;
        assert!(!is_safe_point(&test_site(), 20.0, &plan, now));
    }

    #[test]
    fn safety_gate_accepts_zenith_and_calibration() {
        let now = Utc::now();
        let site = test_site();
        // a target at the current zenith is always admissible
        let lmst = astro::local_mean_sidereal_time(astro::mjd(now), site.lon);
        let mut plan = object_plan("zenith", 1).lock().unwrap().clone();
        plan.lon = lmst;
        plan.lat = site.lat;
        plan.tmbegin = now;
        assert!(is_safe_point(&site, 20.0, &plan, now));

        // bias plans carry no coordinate and bypass the gate
        let mut bias = object_plan("bias", 1).lock().unwrap().clone();
        bias.imgtype = Some(ImageType::Bias);
        bias.lon = f64::INFINITY;
        bias.lat = f64::INFINITY;
        assert!(is_safe_point(&site, 20.0, &bias, now));

        // orbital plans delegate propagation to the mount
        let mut tle = object_plan("tle", 1).lock().unwrap().clone();
        tle.coorsys = CoorSys::Orbit;
        tle.lat = -89.0;
        assert!(is_safe_point(&site, 20.0, &tle, now));
    }

    #[test]
    fn random_zenith_stays_near_the_zenith() {
        let site = test_site();
        // morning local time (UTC 00 + 8 = 08 local)
        let morning = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        for _ in 0..20 {
            let (ra, dec) = random_zenith(&site, morning);
            let lmst = astro::local_mean_sidereal_time(astro::mjd(morning), site.lon);
            let (azi, alt) = astro::eq_to_horizon(lmst - ra, dec, site.lat);
            assert!(alt >= 79.9 && alt <= 85.1, "alt={alt}");
            assert!(azi > 44.0 && azi < 136.0, "morning azi={azi}");
        }
        // evening local time (UTC 10 + 8 = 18 local)
        let evening = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        for _ in 0..20 {
            let (ra, dec) = random_zenith(&site, evening);
            let lmst = astro::local_mean_sidereal_time(astro::mjd(evening), site.lon);
            let (azi, alt) = astro::eq_to_horizon(lmst - ra, dec, site.lat);
            assert!(alt >= 79.9 && alt <= 85.1, "alt={alt}");
            assert!(azi > 224.0 && azi < 316.0, "evening azi={azi}");
        }
    }

    #[test]
    fn cursor_walks_filters_then_loops() {
        let now = Utc::now();
        let mut f = kv::PlanFields::default();
        f.plan_sn = "c".into();
        f.imgtype = Some(ImageType::Object);
        f.expdur = 1.0;
        f.frmcnt = 1;
        f.loopcnt = 2;
        f.push_filters("B|V");
        let mut p = Plan::from_wire(f, now);
        assert!(p.complete_check(now));

        // segments: (0,B) (0,V) (1,B) (1,V) then exhausted
        assert_eq!(p.ifilter, 0);
        assert!(advance_cursor(&mut p));
        assert_eq!((p.iloop, p.ifilter), (0, 1));
        assert!(advance_cursor(&mut p));
        assert_eq!((p.iloop, p.ifilter), (1, 0));
        assert!(advance_cursor(&mut p));
        assert_eq!((p.iloop, p.ifilter), (1, 1));
        assert!(!advance_cursor(&mut p));
    }

    #[test]
    fn calibration_generation_is_daily_and_top_priority() {
        let queue = Arc::new(PlanQueue::new());
        let mut params = test_params();
        params.auto_bias = true;
        params.auto_dark = true;
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 4, 0, 0).unwrap();

        generate_calibration_plans(&params, &queue, now);
        assert_eq!(queue.len(), 2);
        let bias = queue.find("20260801_bias").unwrap();
        {
            let p = bias.lock().unwrap();
            assert_eq!(p.priority, i64::MAX);
            assert_eq!(p.state, PlanState::Cataloged);
            assert_eq!((p.tmend - p.tmbegin).num_hours(), 23);
            assert!(is_safe_point(&params.site, 20.0, &p, now));
        }
        // second generation on the same day deduplicates
        generate_calibration_plans(&params, &queue, now);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn acquisition_runs_plan_through_the_hook() {
        let queue = Arc::new(PlanQueue::new());
        let plan = object_plan("A", 10);
        queue.add(plan.clone());

        let mut deps = test_deps(queue.clone());
        let hook_queue = queue.clone();
        let params = test_params();
        deps.hook = Arc::new(move |p: &ObssParams| {
            let now = Utc::now();
            hook_queue.begin_iter(&p.gid, &p.uid);
            while let Some(plan) = hook_queue.next() {
                let ok = {
                    let pl = plan.lock().unwrap();
                    pl.state.is_selectable() && pl.window_allows(now)
                };
                if ok {
                    return Some(plan);
                }
            }
            None
        });
        let sys = start(params, deps);

        // bring the system to AUTO at night with one mount and one camera
        let (mount, _m_rx) = test_conn(PeerClass::Mount);
        let (camera, _c_rx) = test_conn(PeerClass::Camera);
        assert_eq!(sys.couple_mount(mount.clone(), false).await, CoupleMode::P2h);
        assert_eq!(sys.couple_camera(camera.clone(), "011").await, CoupleMode::P2h);
        sys.notify_odt(Odt::Night).await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        sys.signal_acquire();
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        assert_eq!(plan.lock().unwrap().state, PlanState::Running);
        // the legacy mount received a slew command
        let frames = mount.take_outbox();
        assert!(frames.iter().any(|f| f.starts_with(b"g#00101slew")), "frames: {frames:?}");

        // mount reaches TRACKING at the target: the camera gets expose start
        sys.post_device_fixed(mount.clone(), FixedMessage::CurrentPos {
            addr: DeviceAddr::group_unit("001", "01"),
            ra: 180.0,
            dec: 30.0,
        })
        .await;
        sys.post_device_fixed(mount.clone(), FixedMessage::Status {
            addr: DeviceAddr::group_unit("001", "01"),
            state: MountState::Tracking as i32,
        })
        .await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let frames = camera.take_outbox();
        let text: Vec<String> =
            frames.iter().map(|f| String::from_utf8_lossy(f).into_owned()).collect();
        assert!(text.iter().any(|l| l.starts_with("object ")), "frames: {text:?}");
        assert!(
            text.iter().any(|l| l.starts_with("expose ") && l.contains("command=1")),
            "frames: {text:?}"
        );
        sys.stop().await;
    }

    #[tokio::test]
    async fn preemption_parks_the_runner_and_promotes_the_wait_slot() {
        let queue = Arc::new(PlanQueue::new());
        let sys = start(test_params(), test_deps(queue.clone()));
        let (mount, _m_rx) = test_conn(PeerClass::Mount);
        sys.couple_mount(mount.clone(), false).await;

        let p1 = object_plan("P1", 10);
        let p2 = object_plan("P2", 20);
        queue.add(p1.clone());
        queue.add(p2.clone());

        sys.notify_plan(p1.clone()).await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(p1.lock().unwrap().state, PlanState::Running);

        sys.notify_plan(p2.clone()).await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        // with no exposing camera the interruption settles immediately:
        // P1 is interrupted and P2 promoted to the running slot
        assert_eq!(p1.lock().unwrap().state, PlanState::Interrupted);
        assert_eq!(p2.lock().unwrap().state, PlanState::Running);
        let st = sys.state.read().await;
        let now_sn = st.plan_now.as_ref().map(|p| p.lock().unwrap().plan_sn.clone());
        assert_eq!(now_sn.as_deref(), Some("P2"));
        assert!(st.plan_wait.is_none());
        drop(st);
        sys.stop().await;
    }

    #[tokio::test]
    async fn duplicate_mount_coupling_is_refused() {
        let queue = Arc::new(PlanQueue::new());
        let sys = start(test_params(), test_deps(queue));
        let (mount1, _rx1) = test_conn(PeerClass::Mount);
        let (mount2, _rx2) = test_conn(PeerClass::Mount);
        assert_eq!(sys.couple_mount(mount1.clone(), true).await, CoupleMode::P2h);
        assert_eq!(sys.couple_mount(mount2, true).await, CoupleMode::Refused);
        // re-coupling the same connection is idempotent
        assert_eq!(sys.couple_mount(mount1, true).await, CoupleMode::P2h);
        sys.stop().await;
    }

    #[tokio::test]
    async fn mode_follows_device_availability() {
        let queue = Arc::new(PlanQueue::new());
        let sys = start(test_params(), test_deps(queue));
        assert_eq!(sys.state.read().await.mode, ObsMode::Error);

        let (mount, _m_rx) = test_conn(PeerClass::Mount);
        sys.couple_mount(mount.clone(), true).await;
        assert_eq!(sys.state.read().await.mode, ObsMode::Manual);

        let (camera, _c_rx) = test_conn(PeerClass::Camera);
        sys.couple_camera(camera.clone(), "011").await;
        assert_eq!(sys.state.read().await.mode, ObsMode::Auto);

        // camera drop falls back to MANUAL, mount drop to ERROR
        camera.close();
        sys.device_closed(camera).await;
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        assert_eq!(sys.state.read().await.mode, ObsMode::Manual);
        mount.close();
        sys.device_closed(mount.clone()).await;
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        assert_eq!(sys.state.read().await.mode, ObsMode::Error);

        // decoupling is idempotent
        sys.device_closed(mount).await;
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        assert_eq!(sys.state.read().await.mode, ObsMode::Error);
        sys.stop().await;
    }

    #[tokio::test]
    async fn camera_drop_mid_exposure_abandons_the_plan() {
        let queue = Arc::new(PlanQueue::new());
        let sys = start(test_params(), test_deps(queue.clone()));
        let (mount, _m_rx) = test_conn(PeerClass::Mount);
        let (camera, _c_rx) = test_conn(PeerClass::Camera);
        sys.couple_mount(mount.clone(), false).await;
        sys.couple_camera(camera.clone(), "011").await;

        let plan = object_plan("P1", 5);
        queue.add(plan.clone());
        sys.notify_plan(plan.clone()).await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        // camera reports exposing, then the link dies
        let mut report = kv::CameraReport::default();
        report.state = CameraState::Exposing;
        sys.post_device_kv(
            camera.clone(),
            KvFrame::new(
                DeviceAddr::new("001", "01", "011"),
                KvBody::Camera(report),
            ),
        )
        .await;
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        camera.close();
        sys.device_closed(camera).await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        assert_eq!(plan.lock().unwrap().state, PlanState::Abandoned);
        assert!(sys.state.read().await.plan_now.is_none());
        sys.stop().await;
    }
}
