//! Environment aggregator: rainfall / wind / cloud samples arrive as UDP
//! key-value datagrams, one record is kept per group, and a safe→unsafe
//! flip closes the group's dome slits. The reverse transition never reopens
//! anything — that is an operator decision.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use obs_wire::kv::{self, KvBody};
use obs_wire::{Odt, MAX_FRAME};

use crate::config::EnvLimitsConfig;
use crate::federation::Federation;

#[derive(Debug, Clone, Serialize)]
pub struct EnvRecord {
    pub rain: bool,
    pub wind_speed: f64,
    pub wind_direction: f64,
    pub cloud_percent: f64,
    pub safe: bool,
    pub odt: Odt,
}

impl Default for EnvRecord {
    fn default() -> Self {
        Self {
            rain: false,
            wind_speed: 0.0,
            wind_direction: 0.0,
            cloud_percent: 0.0,
            safe: true,
            odt: Odt::Daytime,
        }
    }
}

/// Permission to observe under the group's configured limits.
pub fn evaluate_safe(rec: &EnvRecord, limits: &EnvLimitsConfig) -> bool {
    !(limits.rainfall && rec.rain)
        && !(limits.wind.enable && rec.wind_speed > limits.wind.max)
        && !(limits.cloud.enable && rec.cloud_percent > limits.cloud.max)
}

#[derive(Default)]
pub struct EnvTable {
    records: RwLock<HashMap<String, EnvRecord>>,
}

impl EnvTable {
    /// Fold one sample in; returns the new safe bit when it flipped.
    pub fn update(&self, gid: &str, body: &KvBody, limits: &EnvLimitsConfig) -> Option<bool> {
        let mut records = self.records.write().unwrap();
        let rec = records.entry(gid.to_string()).or_default();
        match body {
            KvBody::Rainfall { rainy } => rec.rain = *rainy,
            KvBody::Wind { speed, direction } => {
                rec.wind_speed = *speed;
                rec.wind_direction = *direction;
            }
            KvBody::Cloud { percent } => rec.cloud_percent = *percent,
            _ => return None,
        }
        let safe = evaluate_safe(rec, limits);
        if safe != rec.safe {
            rec.safe = safe;
            Some(safe)
        } else {
            None
        }
    }

    pub fn is_safe(&self, gid: &str) -> bool {
        self.records.read().unwrap().get(gid).map(|r| r.safe).unwrap_or(true)
    }

    /// Returns the previous duration type.
    pub fn set_odt(&self, gid: &str, odt: Odt) -> Odt {
        let mut records = self.records.write().unwrap();
        let rec = records.entry(gid.to_string()).or_default();
        let old = rec.odt;
        rec.odt = odt;
        old
    }

    pub fn odt(&self, gid: &str) -> Odt {
        self.records.read().unwrap().get(gid).map(|r| r.odt).unwrap_or(Odt::Daytime)
    }

    pub fn snapshot(&self) -> HashMap<String, EnvRecord> {
        self.records.read().unwrap().clone()
    }
}

/// UDP ingest task. Errors never kill the loop; a daemon without weather
/// hardware just sees silence here.
pub async fn run_udp(socket: UdpSocket, federation: Arc<Federation>) {
    let mut buf = vec![0u8; MAX_FRAME + 1];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                if len > MAX_FRAME {
                    warn!(%src, "oversize environment datagram dropped");
                    continue;
                }
                let text = String::from_utf8_lossy(&buf[..len]);
                for line in text.lines().filter(|l| !l.is_empty()) {
                    match kv::resolve(line) {
                        Ok(frame) => match frame.body {
                            KvBody::Rainfall { .. } | KvBody::Wind { .. } | KvBody::Cloud { .. } => {
                                federation.handle_environment(&frame.addr.gid, &frame.body).await;
                            }
                            _ => debug!(%src, typ = frame.body.type_name(),
                                        "non-environment datagram ignored"),
                        },
                        Err(e) => debug!(%src, "malformed environment datagram: {e}"),
                    }
                }
            }
            Err(e) => {
                warn!("environment recv error: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CloudConfig, WindConfig};

    fn limits() -> EnvLimitsConfig {
        EnvLimitsConfig {
            rainfall: true,
            wind: WindConfig { enable: true, max: 15.0 },
            cloud: CloudConfig { enable: true, max: 75.0 },
        }
    }

    #[test]
    fn wind_over_limit_flips_to_unsafe_once() {
        let table = EnvTable::default();
        let flip = table.update("001", &KvBody::Wind { speed: 16.0, direction: 270.0 }, &limits());
        assert_eq!(flip, Some(false));
        assert!(!table.is_safe("001"));

        // further unsafe samples do not flip again
        let flip = table.update("001", &KvBody::Wind { speed: 20.0, direction: 180.0 }, &limits());
        assert_eq!(flip, None);

        // calming down flips back (the caller still never reopens the slit)
        let flip = table.update("001", &KvBody::Wind { speed: 10.0, direction: 180.0 }, &limits());
        assert_eq!(flip, Some(true));
    }

    #[test]
    fn disabled_limits_are_ignored() {
        let table = EnvTable::default();
        let mut lim = limits();
        lim.wind.enable = false;
        assert_eq!(table.update("001", &KvBody::Wind { speed: 40.0, direction: 0.0 }, &lim), None);
        assert!(table.is_safe("001"));
    }

    #[test]
    fn rain_and_cloud_combine() {
        let table = EnvTable::default();
        assert_eq!(table.update("001", &KvBody::Cloud { percent: 80.0 }, &limits()), Some(false));
        // rain starts while cloudy: still unsafe, no flip
        assert_eq!(table.update("001", &KvBody::Rainfall { rainy: true }, &limits()), None);
        // clouds clear but the rain keeps it unsafe
        assert_eq!(table.update("001", &KvBody::Cloud { percent: 10.0 }, &limits()), None);
        assert_eq!(table.update("001", &KvBody::Rainfall { rainy: false }, &limits()), Some(true));
    }
}
