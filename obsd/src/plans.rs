//! Observation plans and the federation-wide plan store.
//!
//! The store owns every submitted plan for its whole lifecycle; observation
//! systems hold shared handles in their `plan_now` / `plan_wait` slots and
//! flip the state field. Ordering is priority-descending with stable
//! insertion among equals; a single cursor serves the acquisition iteration.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use obs_wire::kv::PlanFields;
use obs_wire::{CoorSys, ImageType, PlanState};

pub type PlanPtr = Arc<Mutex<Plan>>;

#[derive(Debug, Clone)]
pub struct Plan {
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
    pub filters: Vec<String>,
    pub expdur: f64,
    pub delay: f64,
    pub frmcnt: i32,
    pub loopcnt: i32,

    pub priority: i64,
    pub tmbegin: DateTime<Utc>,
    pub tmend: DateTime<Utc>,
    /// Seconds a complete pass of the exposure program needs.
    pub period: i64,

    /* execution cursor */
    pub ifilter: usize,
    pub iloop: i32,
    pub state: PlanState,
    /// Unit that picked the plan up; empty until dispatch.
    pub gid: String,
    pub uid: String,
}

impl Plan {
    pub fn from_wire(f: PlanFields, now: DateTime<Utc>) -> Self {
        let tmbegin = parse_time(&f.tmbegin).unwrap_or(now);
        let tmend = parse_time(&f.tmend).unwrap_or(tmbegin + Duration::hours(24));
        Self {
            plan_sn: f.plan_sn,
            plan_time: f.plan_time,
            plan_type: f.plan_type,
            obstype: f.obstype,
            observer: f.observer,
            grid_id: f.grid_id,
            field_id: f.field_id,
            runname: f.runname,
            objname: f.objname,
            pair_id: f.pair_id,
            coorsys: f.coorsys,
            lon: f.lon,
            lat: f.lat,
            epoch: f.epoch,
            line1: f.line1,
            line2: f.line2,
            objra: f.objra,
            objdec: f.objdec,
            objepoch: f.objepoch,
            objerror: f.objerror,
            imgtype: f.imgtype,
            filters: f.filters,
            expdur: f.expdur,
            delay: f.delay,
            frmcnt: f.frmcnt,
            loopcnt: f.loopcnt,
            priority: f.priority,
            tmbegin,
            tmend,
            period: 0,
            ifilter: 0,
            iloop: 0,
            state: PlanState::Error,
            gid: String::new(),
            uid: String::new(),
        }
    }

    pub fn image_type(&self) -> ImageType {
        self.imgtype.unwrap_or(ImageType::Object)
    }

    /// Admission check. On success the control fields are initialized and
    /// the plan enters `Cataloged`; local plan lifetime is capped at three
    /// days so stale submissions cannot sediment in the queue.
    pub fn complete_check(&mut self, now: DateTime<Utc>) -> bool {
        let ok = !self.plan_sn.is_empty()
            && self.imgtype.is_some()
            && self.expdur >= 0.0
            && self.frmcnt != 0;
        if !ok {
            return false;
        }

        if self.tmend - self.tmbegin > Duration::days(3) {
            self.tmend = self.tmbegin + Duration::days(3);
        }
        let mut t = self.expdur + self.delay;
        if t < 0.001 {
            t = 0.001;
        }
        if !self.filters.is_empty() {
            t *= self.filters.len() as f64;
        }
        self.period = (t * self.frmcnt as f64 * self.loopcnt as f64).ceil() as i64;

        if (self.tmend - now).num_seconds() < self.period {
            return false;
        }
        self.state = PlanState::Cataloged;
        true
    }

    /// Plan-side wildcard match against a concrete unit.
    pub fn is_matched(&self, gid: &str, uid: &str) -> bool {
        self.gid.is_empty() || (self.gid == gid && (self.uid.is_empty() || self.uid == uid))
    }

    /// Provenance document recorded when the plan enters the store.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "plan_sn": self.plan_sn,
            "plan_time": self.plan_time,
            "plan_type": self.plan_type,
            "obstype": self.obstype,
            "observer": self.observer,
            "objname": self.objname,
            "pair_id": self.pair_id,
            "coorsys": self.coorsys,
            "lon": finite_or_null(self.lon),
            "lat": finite_or_null(self.lat),
            "epoch": self.epoch,
            "objra": finite_or_null(self.objra),
            "objdec": finite_or_null(self.objdec),
            "objepoch": self.objepoch,
            "objerror": self.objerror,
            "imgtype": self.imgtype,
            "filters": self.filters,
            "expdur": self.expdur,
            "frmcnt": self.frmcnt,
            "loopcnt": self.loopcnt,
            "priority": self.priority,
            "period": self.period,
        })
    }

    /// Enough of the window left to complete one pass.
    pub fn window_allows(&self, now: DateTime<Utc>) -> bool {
        (self.tmend - now).num_seconds() >= self.period
    }
}

fn finite_or_null(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(t) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t.and_utc());
        }
    }
    None
}

/// Compact view for the status endpoint and sweep reports.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub plan_sn: String,
    pub state: PlanState,
    pub priority: i64,
    pub gid: String,
    pub uid: String,
}

// ── Store ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct QueueInner {
    plans: Vec<PlanPtr>,
    cursor: usize,
    cur_gid: String,
    cur_uid: String,
}

/// Priority-ordered plan store; one coarse mutex guards both the sequence
/// and the iteration cursor.
#[derive(Default)]
pub struct PlanQueue {
    inner: Mutex<QueueInner>,
}

impl PlanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a cataloged plan before the first strictly-lower priority,
    /// keeping submission order among equals. Re-adding a known `plan_sn`
    /// is a no-op.
    pub fn add(&self, plan: PlanPtr) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let (sn, prio, state) = {
            let p = plan.lock().unwrap();
            (p.plan_sn.clone(), p.priority, p.state)
        };
        if state != PlanState::Cataloged {
            return false;
        }
        if inner.plans.iter().any(|p| p.lock().unwrap().plan_sn == sn) {
            return false;
        }
        let pos = inner
            .plans
            .iter()
            .position(|p| p.lock().unwrap().priority < prio)
            .unwrap_or(inner.plans.len());
        inner.plans.insert(pos, plan);
        true
    }

    pub fn find(&self, plan_sn: &str) -> Option<PlanPtr> {
        let inner = self.inner.lock().unwrap();
        inner.plans.iter().find(|p| p.lock().unwrap().plan_sn == plan_sn).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a cursor pass for the given unit. Not reentrant: concurrent
    /// callers serialize on the store mutex and share the single cursor.
    pub fn begin_iter(&self, gid: &str, uid: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.cursor = 0;
        inner.cur_gid = gid.to_string();
        inner.cur_uid = uid.to_string();
    }

    /// Next plan with `state <= Interrupted` matching the cursor's unit.
    pub fn next(&self) -> Option<PlanPtr> {
        let mut inner = self.inner.lock().unwrap();
        while inner.cursor < inner.plans.len() {
            let plan = inner.plans[inner.cursor].clone();
            inner.cursor += 1;
            let p = plan.lock().unwrap();
            if p.state <= PlanState::Interrupted && p.is_matched(&inner.cur_gid, &inner.cur_uid) {
                drop(p);
                return Some(plan);
            }
        }
        None
    }

    /// Daily cleanup: expire plans whose residual window no longer fits one
    /// pass, then remove every terminal plan. Returns the removed plans'
    /// summaries so the caller can report them.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<PlanSummary> {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = Vec::new();
        inner.plans.retain(|plan| {
            let mut p = plan.lock().unwrap();
            if p.state <= PlanState::Interrupted && !p.window_allows(now) {
                info!(plan_sn = %p.plan_sn, "plan expired, abandoned");
                p.state = PlanState::Abandoned;
            }
            if p.state.is_terminal() {
                removed.push(PlanSummary {
                    plan_sn: p.plan_sn.clone(),
                    state: p.state,
                    priority: p.priority,
                    gid: p.gid.clone(),
                    uid: p.uid.clone(),
                });
                false
            } else {
                true
            }
        });
        inner.cursor = 0;
        removed
    }

    pub fn snapshot(&self) -> Vec<PlanSummary> {
        let inner = self.inner.lock().unwrap();
        inner
            .plans
            .iter()
            .map(|plan| {
                let p = plan.lock().unwrap();
                PlanSummary {
                    plan_sn: p.plan_sn.clone(),
                    state: p.state,
                    priority: p.priority,
                    gid: p.gid.clone(),
                    uid: p.uid.clone(),
                }
            })
            .collect()
    }
}

/// Seconds until the next local noon; the daily sweep and the calibration
/// generators both anchor there.
pub fn seconds_until_local_noon(now_utc: DateTime<Utc>, timezone_hours: i32) -> i64 {
    let local = now_utc + Duration::hours(timezone_hours as i64);
    let noon = local.date_naive().and_hms_opt(12, 0, 0).unwrap();
    let mut secs = (noon - local.naive_utc()).num_seconds();
    if secs < 10 {
        secs += 86_400;
    }
    secs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn plan(sn: &str, priority: i64) -> PlanPtr {
        let now = Utc::now();
        let mut f = PlanFields::default();
        f.plan_sn = sn.into();
        f.imgtype = Some(ImageType::Object);
        f.expdur = 30.0;
        f.frmcnt = 10;
        f.priority = priority;
        let mut p = Plan::from_wire(f, now);
        assert!(p.complete_check(now));
        Arc::new(Mutex::new(p))
    }

    #[test]
    fn period_includes_filters_and_loops() {
        let now = Utc::now();
        let mut f = PlanFields::default();
        f.plan_sn = "x".into();
        f.imgtype = Some(ImageType::Object);
        f.expdur = 30.0;
        f.delay = 2.0;
        f.frmcnt = 10;
        f.loopcnt = 2;
        f.push_filters("B|V|R");
        let mut p = Plan::from_wire(f, now);
        assert!(p.complete_check(now));
        assert_eq!(p.period, 32 * 10 * 2 * 3);
    }

    #[test]
    fn complete_check_rejects_bad_plans() {
        let now = Utc::now();
        // missing serial number
        let mut f = PlanFields::default();
        f.imgtype = Some(ImageType::Object);
        assert!(!Plan::from_wire(f, now).complete_check(now));
        // unknown image type
        let mut f = PlanFields::default();
        f.plan_sn = "x".into();
        assert!(!Plan::from_wire(f, now).complete_check(now));
        // zero frame count
        let mut f = PlanFields::default();
        f.plan_sn = "x".into();
        f.imgtype = Some(ImageType::Bias);
        f.frmcnt = 0;
        assert!(!Plan::from_wire(f, now).complete_check(now));
    }

    #[test]
    fn window_one_second_short_is_rejected() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let mut f = PlanFields::default();
        f.plan_sn = "tight".into();
        f.imgtype = Some(ImageType::Object);
        f.expdur = 30.0;
        f.frmcnt = 10;
        f.tmbegin = "2026-08-01T12:00:00".into();
        // period = 300 s; window one second shy of it
        f.tmend = "2026-08-01T12:04:59".into();
        let mut p = Plan::from_wire(f, now);
        assert!(!p.complete_check(now));

        // exactly the period fits
        let mut f2 = PlanFields::default();
        f2.plan_sn = "fits".into();
        f2.imgtype = Some(ImageType::Object);
        f2.expdur = 30.0;
        f2.frmcnt = 10;
        f2.tmbegin = "2026-08-01T12:00:00".into();
        f2.tmend = "2026-08-01T12:05:00".into();
        let mut p2 = Plan::from_wire(f2, now);
        assert!(p2.complete_check(now));
    }

    #[test]
    fn queue_orders_by_priority_with_stable_ties() {
        let q = PlanQueue::new();
        assert!(q.add(plan("low", 1)));
        assert!(q.add(plan("high", 10)));
        assert!(q.add(plan("mid-a", 5)));
        assert!(q.add(plan("mid-b", 5)));
        let order: Vec<String> = q.snapshot().into_iter().map(|s| s.plan_sn).collect();
        assert_eq!(order, vec!["high", "mid-a", "mid-b", "low"]);
    }

    #[test]
    fn queue_deduplicates_by_serial() {
        let q = PlanQueue::new();
        assert!(q.add(plan("a", 1)));
        assert!(!q.add(plan("a", 9)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn cursor_respects_unit_filter() {
        let q = PlanQueue::new();
        let targeted = plan("targeted", 5);
        targeted.lock().unwrap().gid = "002".into();
        q.add(targeted);
        q.add(plan("open", 1));

        q.begin_iter("001", "01");
        let got = q.next().unwrap();
        assert_eq!(got.lock().unwrap().plan_sn, "open");
        assert!(q.next().is_none());

        q.begin_iter("002", "01");
        let got = q.next().unwrap();
        assert_eq!(got.lock().unwrap().plan_sn, "targeted");
    }

    #[test]
    fn sweep_expires_and_removes() {
        let q = PlanQueue::new();
        let over = plan("done", 5);
        over.lock().unwrap().state = PlanState::Over;
        {
            // bypass add()'s cataloged filter for the terminal fixture
            let mut inner = q.inner.lock().unwrap();
            inner.plans.push(over);
        }
        let stale = plan("stale", 1);
        {
            let mut p = stale.lock().unwrap();
            p.period = 60;
            p.tmend = Utc::now() + Duration::seconds(10);
        }
        q.add(stale);
        q.add(plan("alive", 2));

        let removed = q.sweep(Utc::now());
        let mut names: Vec<String> = removed.iter().map(|s| s.plan_sn.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["done", "stale"]);
        assert_eq!(removed.iter().find(|s| s.plan_sn == "stale").unwrap().state, PlanState::Abandoned);
        assert_eq!(q.len(), 1);
    }
}
