//! Federation controller: owns the listeners' mailbox, the observation
//! system map, the plan store and the environment table; routes every
//! decoded message to the right place and arbitrates immediate plans.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use obs_wire::fixed::{self, FixedMessage};
use obs_wire::kv::{self, KvBody, KvFrame, PlanFields};
use obs_wire::{DeviceAddr, Odt, PlanState, SlitState};

use crate::config::Config;
use crate::db::DbSink;
use crate::devices::CoupleMode;
use crate::environment::EnvTable;
use crate::journal::Journal;
use crate::net::{ClientRegistry, ConnHandle, ConnRegistry, FrameSink, Inbound, PeerClass};
use crate::obss::{
    self, AcquireHook, ObsSystem, ObssDeps, ObssParams, ACQUIRE_LEAD_SECS, MATCH_NO, MATCH_STRONG,
};
use crate::plans::{seconds_until_local_noon, Plan, PlanPtr, PlanQueue};

pub struct Federation {
    pub cfg: Arc<Config>,
    pub queue: Arc<PlanQueue>,
    pub journal: Journal,
    pub db: DbSink,
    kv_enc: Arc<kv::Encoder>,
    fixed_enc: Arc<fixed::Encoder>,
    obss: RwLock<HashMap<(String, String), ObsSystem>>,
    pub clients: Arc<ClientRegistry>,
    pub registry: Arc<ConnRegistry>,
    pub env: EnvTable,
    /// Point-to-hub connections already coupled, by connection token.
    conn_units: StdMutex<HashMap<Uuid, (String, String)>>,
    tx: FrameSink,
}

impl Federation {
    pub fn new(cfg: Arc<Config>) -> (Arc<Self>, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(256);
        let fed = Arc::new(Self {
            journal: Journal::new(&cfg.log_dir),
            db: DbSink::new(&cfg.database),
            cfg,
            queue: Arc::new(PlanQueue::new()),
            kv_enc: Arc::new(kv::Encoder::new()),
            fixed_enc: Arc::new(fixed::Encoder::new()),
            obss: RwLock::new(HashMap::new()),
            clients: Arc::new(ClientRegistry::default()),
            registry: Arc::new(ConnRegistry::default()),
            env: EnvTable::default(),
            conn_units: StdMutex::new(HashMap::new()),
            tx,
        });
        (fed, rx)
    }

    /// Sink handed to every listener.
    pub fn sink(&self) -> FrameSink {
        self.tx.clone()
    }

    pub async fn run_router(self: Arc<Self>, mut rx: mpsc::Receiver<Inbound>) {
        while let Some(inbound) = rx.recv().await {
            match inbound {
                Inbound::Frame { conn, line } => match conn.peer {
                    PeerClass::Client => self.on_client_frame(conn, line).await,
                    _ => self.on_device_frame(conn, line).await,
                },
                Inbound::Closed { conn } => self.on_closed(conn).await,
            }
        }
    }

    // ── client traffic ───────────────────────────────────────────────────

    async fn on_client_frame(self: &Arc<Self>, conn: ConnHandle, line: String) {
        let frame = match kv::resolve(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn = %conn.id, "client protocol fault: {e}");
                conn.close();
                return;
            }
        };
        match frame.body.clone() {
            KvBody::Register => {
                info!(conn = %conn.id, filter = %frame.addr, "client registered");
                self.clients.register(conn, frame.addr.clone());
            }
            KvBody::Unregister => self.clients.unregister(&conn),
            KvBody::AppendPlan(fields) => self.submit_plan(fields, false, Some(&conn)).await,
            KvBody::ImplementPlan(fields) => self.submit_plan(fields, true, Some(&conn)).await,
            KvBody::AbortPlan { plan_sn } => self.abort_plan_by_sn(&plan_sn, Some(&conn)).await,
            KvBody::CheckPlan { plan_sn } => {
                let state = self
                    .queue
                    .find(&plan_sn)
                    .map(|p| p.lock().unwrap().state)
                    .unwrap_or(PlanState::Error);
                conn.send(self.plan_status_frame(&plan_sn, state));
            }
            _ => {
                // device-directed operation: fan out by wildcard ids
                let targets = self.matching_systems(&frame.addr.gid, &frame.addr.uid).await;
                if targets.is_empty() {
                    warn!(addr = %frame.addr, typ = frame.body.type_name(),
                          "no observation system matches the request");
                    return;
                }
                for sys in targets {
                    sys.notify_client_kv(frame.clone(), Some(conn.clone())).await;
                }
            }
        }
    }

    fn plan_status_frame(&self, plan_sn: &str, state: PlanState) -> bytes::Bytes {
        self.kv_enc.compact(
            DeviceAddr::default(),
            KvBody::PlanStatus { plan_sn: plan_sn.to_string(), state },
        )
    }

    async fn submit_plan(&self, fields: PlanFields, implement: bool, reply: Option<&ConnHandle>) {
        let now = Utc::now();
        let mut plan = Plan::from_wire(fields, now);
        let sn = plan.plan_sn.clone();
        if !plan.complete_check(now) {
            warn!(plan_sn = %sn, "plan rejected by the admission check");
            if let Some(conn) = reply {
                conn.send(self.plan_status_frame(&sn, PlanState::Error));
            }
            return;
        }
        let plan: PlanPtr = Arc::new(StdMutex::new(plan));
        if !self.queue.add(plan.clone()) {
            // duplicate serial: report the state of the plan already known
            let state = self
                .queue
                .find(&sn)
                .map(|p| p.lock().unwrap().state)
                .unwrap_or(PlanState::Error);
            debug!(plan_sn = %sn, "duplicate submission ignored");
            if let Some(conn) = reply {
                conn.send(self.plan_status_frame(&sn, state));
            }
            return;
        }
        info!(plan_sn = %sn, implement, "plan cataloged");
        let detail = plan.lock().unwrap().describe();
        self.journal
            .append(
                crate::journal::JournalEvent::PlanState,
                serde_json::json!({ "state": PlanState::Cataloged.name(), "plan": detail }),
            )
            .await;
        if let Some(conn) = reply {
            conn.send(self.plan_status_frame(&sn, PlanState::Cataloged));
        }
        if implement {
            self.try_implement_plan(plan).await;
        }
    }

    /// Pick the matching observation system with the lowest effective
    /// priority strictly below the plan's own, and hand the plan over. When
    /// nothing qualifies the plan stays cataloged for the acquisition loop.
    pub async fn try_implement_plan(&self, plan: PlanPtr) {
        let now = Utc::now();
        let (sn, gid, uid, prio_plan, timely) = {
            let p = plan.lock().unwrap();
            (
                p.plan_sn.clone(),
                p.gid.clone(),
                p.uid.clone(),
                p.priority,
                (p.tmbegin - now).num_seconds() <= ACQUIRE_LEAD_SECS && p.window_allows(now),
            )
        };
        if !timely {
            warn!(plan_sn = %sn, "implementation window not open, plan stays cataloged");
            return;
        }
        let mut best: Option<(i64, ObsSystem)> = None;
        {
            let map = self.obss.read().await;
            for sys in map.values() {
                if sys.is_matched(&gid, &uid) == MATCH_NO {
                    continue;
                }
                let prio = sys.get_priority(now).await;
                if prio >= prio_plan {
                    continue;
                }
                let safe = {
                    let p = plan.lock().unwrap();
                    sys.is_safe_point(&p, now)
                };
                if !safe {
                    continue;
                }
                if best.as_ref().map(|(b, _)| prio < *b).unwrap_or(true) {
                    best = Some((prio, sys.clone()));
                }
            }
        }
        match best {
            Some((_, sys)) => sys.notify_plan(plan).await,
            None => warn!(plan_sn = %sn, "plan will delay implementation"),
        }
    }

    async fn abort_plan_by_sn(&self, plan_sn: &str, reply: Option<&ConnHandle>) {
        let Some(plan) = self.queue.find(plan_sn) else {
            warn!(plan_sn, "abort requested for an unknown plan");
            if let Some(conn) = reply {
                conn.send(self.plan_status_frame(plan_sn, PlanState::Error));
            }
            return;
        };
        let (state, gid, uid) = {
            let p = plan.lock().unwrap();
            (p.state, p.gid.clone(), p.uid.clone())
        };
        info!(plan_sn, state = state.name(), "abort requested");
        match state {
            PlanState::Cataloged | PlanState::Interrupted => {
                plan.lock().unwrap().state = PlanState::Deleted;
                self.journal.plan_state(plan_sn, PlanState::Deleted.name(), &gid, &uid).await;
                self.db.upload_plan_state(plan_sn, PlanState::Deleted.name(), &gid, &uid).await;
                if let Some(conn) = reply {
                    conn.send(self.plan_status_frame(plan_sn, PlanState::Deleted));
                }
            }
            PlanState::Running | PlanState::Waiting => {
                // the holder identifies the plan by serial; a wildcard-target
                // plan may not carry its unit yet, so fan the abort out
                let map = self.obss.read().await;
                for sys in map.values() {
                    if gid.is_empty() || sys.is_matched(&gid, &uid) != MATCH_NO {
                        sys.abort_plan(plan.clone()).await;
                    }
                }
            }
            _ => {
                if let Some(conn) = reply {
                    conn.send(self.plan_status_frame(plan_sn, state));
                }
            }
        }
    }

    // ── device traffic ───────────────────────────────────────────────────

    async fn on_device_frame(self: &Arc<Self>, conn: ConnHandle, line: String) {
        if fixed::looks_fixed(&line) {
            match fixed::resolve(&line) {
                Ok(msg) => self.route_fixed(conn, msg).await,
                Err(e) => {
                    warn!(conn = %conn.id, peer = conn.peer.name(), "protocol fault: {e}");
                    conn.close();
                }
            }
        } else {
            match kv::resolve(&line) {
                Ok(frame) => self.route_device_kv(conn, frame).await,
                Err(e) => {
                    warn!(conn = %conn.id, peer = conn.peer.name(), "protocol fault: {e}");
                    conn.close();
                }
            }
        }
    }

    async fn route_fixed(self: &Arc<Self>, conn: ConnHandle, msg: FixedMessage) {
        let addr = msg.addr().clone();

        // group-broadcast forms carry no unit id
        match &msg {
            FixedMessage::Slit { state, .. } if addr.uid.is_empty() && !addr.gid.is_empty() => {
                if let Some(s) = SlitState::from_i32(*state) {
                    for sys in self.matching_systems(&addr.gid, "").await {
                        sys.notify_slit_state(s).await;
                    }
                }
                return;
            }
            FixedMessage::Rain { value, .. } if addr.uid.is_empty() => {
                self.handle_environment(&addr.gid, &KvBody::Rainfall { rainy: *value != 0 }).await;
                return;
            }
            _ => {}
        }

        let Some(sys) = self.resolve_unit(&conn, &addr).await else { return };
        if !self.ensure_coupled(&sys, &conn, false, &addr).await {
            return;
        }
        sys.post_device_fixed(conn, msg).await;
    }

    async fn route_device_kv(self: &Arc<Self>, conn: ConnHandle, frame: KvFrame) {
        if conn.peer == PeerClass::Camera && frame.addr.cid.is_empty() {
            let mapped = self.conn_units.lock().unwrap().contains_key(&conn.id);
            if !mapped {
                warn!(conn = %conn.id, "camera frame without a cid, closing");
                conn.close();
                return;
            }
        }
        let Some(sys) = self.resolve_unit(&conn, &frame.addr).await else { return };
        if !self.ensure_coupled(&sys, &conn, true, &frame.addr).await {
            return;
        }
        sys.post_device_kv(conn, frame).await;
    }

    /// Map a device frame to its observation system, lazily creating the
    /// system when the group is configured.
    async fn resolve_unit(self: &Arc<Self>, conn: &ConnHandle, addr: &DeviceAddr) -> Option<ObsSystem> {
        let (gid, uid) = if addr.is_complete_unit() {
            (addr.gid.clone(), addr.uid.clone())
        } else if let Some(unit) = self.conn_units.lock().unwrap().get(&conn.id).cloned() {
            unit
        } else {
            warn!(conn = %conn.id, peer = conn.peer.name(),
                  "frame without identifiers from an uncoupled device, closing");
            conn.close();
            return None;
        };
        let sys = self.find_or_create_obss(&gid, &uid).await;
        if sys.is_none() {
            warn!(%gid, %uid, "no configuration for this unit, closing");
            conn.close();
        }
        sys
    }

    async fn ensure_coupled(
        &self,
        sys: &ObsSystem,
        conn: &ConnHandle,
        kv_dialect: bool,
        addr: &DeviceAddr,
    ) -> bool {
        if self.conn_units.lock().unwrap().contains_key(&conn.id) {
            return true;
        }
        let mode = match conn.peer {
            PeerClass::Mount => sys.couple_mount(conn.clone(), kv_dialect).await,
            PeerClass::Camera => sys.couple_camera(conn.clone(), &addr.cid).await,
            PeerClass::MountAnnex => sys.couple_mount_annex(conn.clone(), kv_dialect).await,
            PeerClass::CameraAnnex => sys.couple_camera_annex(conn.clone(), kv_dialect).await,
            PeerClass::Client => return true,
        };
        match mode {
            CoupleMode::Refused => {
                conn.close();
                false
            }
            // point-to-point: the stream now belongs to the system
            CoupleMode::P2p => true,
            CoupleMode::P2h => {
                self.conn_units
                    .lock()
                    .unwrap()
                    .insert(conn.id, (sys.params.gid.clone(), sys.params.uid.clone()));
                true
            }
        }
    }

    async fn on_closed(self: &Arc<Self>, conn: ConnHandle) {
        self.clients.unregister(&conn);
        let unit = self.conn_units.lock().unwrap().remove(&conn.id);
        if let Some(unit) = unit {
            if let Some(sys) = self.obss.read().await.get(&unit).cloned() {
                sys.device_closed(conn).await;
            }
        }
    }

    // ── observation systems ──────────────────────────────────────────────

    pub async fn find_or_create_obss(self: &Arc<Self>, gid: &str, uid: &str) -> Option<ObsSystem> {
        if gid.is_empty() || uid.is_empty() {
            return None;
        }
        let key = (gid.to_string(), uid.to_string());
        if let Some(sys) = self.obss.read().await.get(&key).cloned() {
            return Some(sys);
        }
        let group_cfg = self.cfg.group(gid)?;
        let mut map = self.obss.write().await;
        // racing creators: the second one adopts the first's system
        if let Some(sys) = map.get(&key).cloned() {
            return Some(sys);
        }
        info!(gid, uid, "creating observation system");
        let params = ObssParams::from_config(group_cfg, uid);
        let deps = ObssDeps {
            queue: self.queue.clone(),
            journal: self.journal.clone(),
            db: self.db.clone(),
            clients: self.clients.clone(),
            kv_enc: self.kv_enc.clone(),
            fixed_enc: self.fixed_enc.clone(),
            hook: make_acquire_hook(self.queue.clone()),
        };
        let sys = obss::start(params, deps);
        map.insert(key, sys.clone());
        Some(sys)
    }

    /// Systems matching `(gid, uid)` under the wildcard rule; a strong match
    /// short-circuits the fanout.
    async fn matching_systems(&self, gid: &str, uid: &str) -> Vec<ObsSystem> {
        let map = self.obss.read().await;
        let mut strong = None;
        let mut weak = Vec::new();
        for sys in map.values() {
            let m = sys.is_matched(gid, uid);
            if m == MATCH_STRONG {
                strong = Some(sys.clone());
                break;
            } else if m != MATCH_NO {
                weak.push(sys.clone());
            }
        }
        match strong {
            Some(sys) => vec![sys],
            None => weak,
        }
    }

    /// Wildcard slit command, e.g. "close every slit in group 001".
    pub async fn command_slit(&self, gid: &str, uid: &str, cmd: SlitState) {
        let frame = KvFrame::new(
            DeviceAddr::group_unit(gid, uid),
            KvBody::Slit { command: Some(cmd), state: None },
        );
        for sys in self.matching_systems(gid, uid).await {
            sys.notify_client_kv(frame.clone(), None).await;
        }
    }

    // ── environment & duration type ──────────────────────────────────────

    pub async fn handle_environment(&self, gid: &str, body: &KvBody) {
        let Some(group_cfg) = self.cfg.group(gid) else {
            debug!(gid, "environment sample for an unconfigured group");
            return;
        };
        if let Some(safe) = self.env.update(gid, body, &group_cfg.environment) {
            if safe {
                info!(gid, "environment back to safe (slits stay closed)");
            } else {
                warn!(gid, "environment turned unsafe");
            }
            self.journal
                .environment(gid, safe, serde_json::json!({ "sample": body.type_name() }))
                .await;
            if !safe && group_cfg.dome.slit {
                warn!(gid, "closing dome slits");
                self.command_slit(gid, "", SlitState::Closed).await;
            }
        }
    }

    /// Duration-type transition for a group; returns `true` on change.
    pub async fn apply_odt(&self, gid: &str, odt: Odt) -> bool {
        let old = self.env.set_odt(gid, odt);
        if old == odt {
            return false;
        }
        {
            let map = self.obss.read().await;
            for sys in map.values() {
                if sys.params.gid == gid {
                    sys.notify_odt(odt).await;
                }
            }
        }
        if let Some(group_cfg) = self.cfg.group(gid) {
            if group_cfg.dome.slit {
                if odt == Odt::Daytime {
                    self.command_slit(gid, "", SlitState::Closed).await;
                } else if old == Odt::Daytime && self.env.is_safe(gid) {
                    self.command_slit(gid, "", SlitState::Open).await;
                }
            }
        }
        true
    }

    // ── periodic work & status ───────────────────────────────────────────

    /// Daily sweep at local noon: expire stale plans, remove terminal ones,
    /// report every removal.
    pub async fn run_plan_sweeper(self: Arc<Self>) {
        loop {
            let tz = chrono::Local::now().offset().local_minus_utc() / 3600;
            let secs = seconds_until_local_noon(Utc::now(), tz);
            tokio::time::sleep(std::time::Duration::from_secs(secs as u64)).await;
            let removed = self.queue.sweep(Utc::now());
            info!("daily sweep removed {} plans", removed.len());
            for s in removed {
                self.journal.plan_state(&s.plan_sn, s.state.name(), &s.gid, &s.uid).await;
                self.db.upload_plan_state(&s.plan_sn, s.state.name(), &s.gid, &s.uid).await;
            }
        }
    }

    pub async fn status_json(&self) -> serde_json::Value {
        let mut systems = Vec::new();
        {
            let map = self.obss.read().await;
            for sys in map.values() {
                let mut doc = sys.status_snapshot().await;
                doc["devices"] = serde_json::json!(sys.is_active().await);
                systems.push(doc);
            }
        }
        serde_json::json!({
            "observation_systems": systems,
            "plans": self.queue.snapshot(),
            "environment": self.env.snapshot(),
            "clients": self.clients.len(),
        })
    }

    /// Stop every observation system's worker; called once on shutdown.
    pub async fn shutdown(&self) {
        let map = self.obss.read().await;
        for sys in map.values() {
            sys.stop().await;
        }
    }
}

/// Acquisition hook handed to every observation system: walk the store's
/// cursor and claim the first plan whose window, unit match and pointing all
/// allow execution right now.
fn make_acquire_hook(queue: Arc<PlanQueue>) -> AcquireHook {
    Arc::new(move |params: &ObssParams| {
        let now = Utc::now();
        queue.begin_iter(&params.gid, &params.uid);
        while let Some(plan) = queue.next() {
            let mut p = plan.lock().unwrap();
            let eligible = p.state.is_selectable()
                && (p.tmbegin - now).num_seconds() <= ACQUIRE_LEAD_SECS
                && p.window_allows(now)
                && obss::is_safe_point(&params.site, params.alt_limit, &p, now);
            if eligible {
                // claim under the plan lock so a concurrent caller skips it
                p.state = PlanState::Waiting;
                drop(p);
                return Some(plan);
            }
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ObssConfig, SiteConfig};
    use crate::net::test_conn;
    use obs_wire::ImageType;

    fn test_config() -> Arc<Config> {
        let mut cfg = Config::default();
        cfg.log_dir = std::env::temp_dir().join("obsd-fed-tests").display().to_string();
        cfg.observation_system.push(ObssConfig {
            group_id: "001".into(),
            site: SiteConfig {
                name: "t".into(),
                lon: 117.0,
                lat: 40.0,
                alt: 900.0,
                timezone: 8,
            },
            ..ObssConfig::default()
        });
        Arc::new(cfg)
    }

    fn plan_fields(sn: &str, priority: i64) -> PlanFields {
        let mut f = PlanFields::default();
        f.plan_sn = sn.into();
        f.imgtype = Some(ImageType::Object);
        f.lon = 180.0;
        f.lat = 30.0;
        f.expdur = 30.0;
        f.frmcnt = 10;
        f.priority = priority;
        f
    }

    #[tokio::test]
    async fn append_plan_catalogs_and_replies() {
        let (fed, _rx) = Federation::new(test_config());
        let (client, _crx) = test_conn(PeerClass::Client);
        fed.submit_plan(plan_fields("A", 10), false, Some(&client)).await;

        assert_eq!(fed.queue.len(), 1);
        let frames = client.take_outbox();
        let text = String::from_utf8_lossy(&frames[0]);
        assert!(text.starts_with("plan "), "reply: {text}");
        assert!(text.contains("plan_sn=A"));
        assert!(text.contains("state=cataloged"));

        // duplicate submission is a no-op, reported with the known state
        fed.submit_plan(plan_fields("A", 99), false, Some(&client)).await;
        assert_eq!(fed.queue.len(), 1);
    }

    #[tokio::test]
    async fn rejected_plan_reports_error() {
        let (fed, _rx) = Federation::new(test_config());
        let (client, _crx) = test_conn(PeerClass::Client);
        let mut f = plan_fields("bad", 10);
        f.frmcnt = 0;
        fed.submit_plan(f, false, Some(&client)).await;
        assert!(fed.queue.is_empty());
        let frames = client.take_outbox();
        assert!(String::from_utf8_lossy(&frames[0]).contains("state=error"));
    }

    #[tokio::test]
    async fn unconfigured_group_is_refused() {
        let (fed, _rx) = Federation::new(test_config());
        assert!(fed.find_or_create_obss("009", "01").await.is_none());
        assert!(fed.find_or_create_obss("001", "01").await.is_some());
        // second lookup reuses the instance
        let a = fed.find_or_create_obss("001", "01").await.unwrap();
        let b = fed.find_or_create_obss("001", "01").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn acquire_hook_claims_eligible_plans_once() {
        let (fed, _rx) = Federation::new(test_config());
        let sys = fed.find_or_create_obss("001", "01").await.unwrap();
        let hook = make_acquire_hook(fed.queue.clone());

        // a south-pole target is filtered by the safety gate
        let mut unsafe_f = plan_fields("south", 5);
        unsafe_f.lat = -60.0;
        fed.submit_plan(unsafe_f, false, None).await;
        // a calibration plan bypasses the gate
        let mut cal = PlanFields::default();
        cal.plan_sn = "cal".into();
        cal.imgtype = Some(ImageType::Bias);
        cal.expdur = 1.0;
        cal.frmcnt = 5;
        fed.submit_plan(cal, false, None).await;

        let got = (hook.as_ref())(&sys.params).expect("hook should yield the bias plan");
        assert_eq!(got.lock().unwrap().plan_sn, "cal");
        // the claim makes a second pass come up empty
        assert!((hook.as_ref())(&sys.params).is_none());
        sys.stop().await;
    }

    #[tokio::test]
    async fn environment_close_is_one_way() {
        let (fed, _rx) = Federation::new({
            let mut cfg = Config::default();
            cfg.log_dir = std::env::temp_dir().join("obsd-fed-tests").display().to_string();
            let mut obss = ObssConfig {
                group_id: "001".into(),
                ..ObssConfig::default()
            };
            obss.dome.slit = true;
            obss.environment.wind.enable = true;
            obss.environment.wind.max = 15.0;
            cfg.observation_system.push(obss);
            Arc::new(cfg)
        });
        fed.handle_environment("001", &KvBody::Wind { speed: 16.0, direction: 0.0 }).await;
        assert!(!fed.env.is_safe("001"));
        // calming down marks safe again but commands nothing
        fed.handle_environment("001", &KvBody::Wind { speed: 10.0, direction: 0.0 }).await;
        assert!(fed.env.is_safe("001"));
    }

    #[tokio::test]
    async fn odt_transition_notifies_group() {
        let (fed, _rx) = Federation::new(test_config());
        let _sys = fed.find_or_create_obss("001", "01").await.unwrap();
        assert!(fed.apply_odt("001", Odt::Night).await);
        assert!(!fed.apply_odt("001", Odt::Night).await);
        assert_eq!(fed.env.odt("001"), Odt::Night);
    }
}
