//! HTTP database sink.
//!
//! Plan lifecycle changes and observation-system status snapshots are
//! POSTed as JSON documents to the configured endpoint. The sink is fire
//! and forget: upload failures are logged and dropped, the scheduler never
//! blocks on the database.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::DatabaseConfig;

#[derive(Clone)]
pub struct DbSink {
    url: Option<String>,
    client: reqwest::Client,
}

impl DbSink {
    pub fn new(cfg: &DatabaseConfig) -> Self {
        let url = (cfg.enable && !cfg.url.is_empty()).then(|| cfg.url.clone());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { url, client }
    }

    pub fn disabled() -> Self {
        Self { url: None, client: reqwest::Client::new() }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn post(&self, kind: &str, doc: serde_json::Value) {
        let Some(url) = &self.url else { return };
        let url = format!("{}/{kind}", url.trim_end_matches('/'));
        match self.client.post(&url).json(&doc).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(%url, "database upload ok");
            }
            Ok(resp) => warn!(%url, status = %resp.status(), "database upload refused"),
            Err(e) => warn!(%url, "database upload failed: {e}"),
        }
    }

    pub async fn upload_plan_state(&self, plan_sn: &str, state: &str, gid: &str, uid: &str) {
        self.post(
            "plan",
            serde_json::json!({
                "plan_sn": plan_sn,
                "state": state,
                "gid": gid,
                "uid": uid,
                "time": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            }),
        )
        .await;
    }

    pub async fn upload_obss_status(&self, doc: serde_json::Value) {
        self.post("obss", doc).await;
    }
}
