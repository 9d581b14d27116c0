//! Daemon configuration: TOML file, environment overrides, `-d` default
//! emission.
//!
//! One `[[observation_system]]` block per group; units within a group share
//! the block. Scalar settings can be overridden from the environment
//! (`OBSD_*`), which wins over the file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ntp: NtpConfig,
    pub database: DatabaseConfig,
    /// Directory receiving the daily journal files.
    pub log_dir: String,
    pub observation_system: Vec<ObssConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ntp: NtpConfig::default(),
            database: DatabaseConfig::default(),
            log_dir: "logs".into(),
            observation_system: Vec::new(),
        }
    }
}

/// Clock discipline is performed by an external agent; the section is kept
/// so one file configures the whole deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NtpConfig {
    pub enable: bool,
    pub host: String,
    /// Maximum tolerated offset before a forced sync, milliseconds.
    pub sync_on_diff_max: i64,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self { enable: false, host: "127.0.0.1".into(), sync_on_diff_max: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub client_port: u16,
    pub mount_port: u16,
    pub camera_port: u16,
    pub mount_annex_port: u16,
    pub camera_annex_port: u16,
    pub environment_port: u16,
    pub status_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_port: 4010,
            mount_port: 4011,
            camera_port: 4012,
            mount_annex_port: 4013,
            camera_annex_port: 4014,
            environment_port: 4015,
            status_port: 4016,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enable: bool,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObssConfig {
    pub group_id: String,
    pub site: SiteConfig,
    /// Minimum safe pointing altitude, degrees.
    pub alt_limit: f64,
    pub robotic: bool,
    pub sun: SunConfig,
    pub auto_calibration: CalibrationConfig,
    pub p2h: P2hConfig,
    pub dome: DomeConfig,
    pub mirror_cover: OperatorConfig,
    pub mount: MountConfig,
    /// Arrival tolerance for `slewto`, arcminutes.
    pub slew_tolerance: f64,
    pub autofocus: OperatorConfig,
    pub environment: EnvLimitsConfig,
}

impl Default for ObssConfig {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            site: SiteConfig::default(),
            alt_limit: 20.0,
            robotic: true,
            sun: SunConfig::default(),
            auto_calibration: CalibrationConfig::default(),
            p2h: P2hConfig::default(),
            dome: DomeConfig::default(),
            mirror_cover: OperatorConfig::default(),
            mount: MountConfig::default(),
            slew_tolerance: 10.0,
            autofocus: OperatorConfig::default(),
            environment: EnvLimitsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub name: String,
    /// East-positive, degrees.
    pub lon: f64,
    /// North-positive, degrees.
    pub lat: f64,
    /// Meters above sea level.
    pub alt: f64,
    /// Hours east-positive.
    pub timezone: i32,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { name: "site".into(), lon: 0.0, lat: 0.0, alt: 0.0, timezone: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SunConfig {
    /// Sun-center altitude above which the sky counts as daytime, degrees.
    pub day_min: f64,
    /// Sun-center altitude below which the sky counts as night, degrees.
    pub night_max: f64,
}

impl Default for SunConfig {
    fn default() -> Self {
        Self { day_min: -6.0, night_max: -12.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub bias: bool,
    pub dark: bool,
    pub flat: bool,
    pub frame_count: i32,
    /// Exposure seconds for generated dark frames.
    pub duration: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self { bias: false, dark: false, flat: false, frame_count: 10, duration: 10.0 }
    }
}

/// Connection ownership per device class: `true` keeps the read loop at the
/// federation (point-to-hub), `false` hands it to the observation system
/// (point-to-point). Fixed for a connection's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2hConfig {
    pub mount: bool,
    pub camera: bool,
    pub mount_annex: bool,
    pub camera_annex: bool,
}

impl Default for P2hConfig {
    fn default() -> Self {
        Self { mount: true, camera: true, mount_annex: true, camera_annex: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomeConfig {
    pub follow_mount: bool,
    pub slit: bool,
    /// Device class driving the slit: `mount`, `mount-annex` or
    /// `camera-annex`.
    pub operator: String,
}

impl Default for DomeConfig {
    fn default() -> Self {
        Self { follow_mount: false, slit: false, operator: "mount-annex".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    #[serde(rename = "use")]
    pub enable: bool,
    pub operator: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self { enable: false, operator: "mount-annex".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub home_sync: bool,
    pub guide: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self { home_sync: false, guide: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvLimitsConfig {
    pub rainfall: bool,
    pub wind: WindConfig,
    pub cloud: CloudConfig,
}

impl Default for EnvLimitsConfig {
    fn default() -> Self {
        Self { rainfall: false, wind: WindConfig::default(), cloud: CloudConfig::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindConfig {
    #[serde(rename = "use")]
    pub enable: bool,
    /// Maximum wind speed permitting observation, m/s.
    pub max: f64,
}

impl Default for WindConfig {
    fn default() -> Self {
        Self { enable: false, max: 15.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    #[serde(rename = "use")]
    pub enable: bool,
    /// Maximum cloud percentage permitting observation.
    pub max: f64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self { enable: false, max: 75.0 }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {path}"))?;
        let mut cfg: Config =
            toml::from_str(&text).with_context(|| format!("cannot parse config file {path}"))?;
        cfg.apply_env();
        cfg.normalize();
        Ok(cfg)
    }

    /// Environment wins over the file for scalar settings.
    fn apply_env(&mut self) {
        if let Some(v) = env_u16("OBSD_CLIENT_PORT") {
            self.server.client_port = v;
        }
        if let Some(v) = env_u16("OBSD_MOUNT_PORT") {
            self.server.mount_port = v;
        }
        if let Some(v) = env_u16("OBSD_CAMERA_PORT") {
            self.server.camera_port = v;
        }
        if let Some(v) = env_u16("OBSD_ENVIRONMENT_PORT") {
            self.server.environment_port = v;
        }
        if let Some(v) = env_u16("OBSD_STATUS_PORT") {
            self.server.status_port = v;
        }
        if let Ok(v) = std::env::var("OBSD_DATABASE_URL") {
            self.database.url = v;
            self.database.enable = true;
        }
        if let Ok(v) = std::env::var("OBSD_LOG_DIR") {
            self.log_dir = v;
        }
    }

    /// Clamp the sun-altitude thresholds into their legal bands.
    fn normalize(&mut self) {
        for obss in &mut self.observation_system {
            obss.sun.day_min = obss.sun.day_min.clamp(-10.0, 0.0);
            obss.sun.night_max = obss.sun.night_max.clamp(-18.0, -10.0);
        }
    }

    pub fn group(&self, gid: &str) -> Option<&ObssConfig> {
        self.observation_system.iter().find(|o| o.group_id == gid)
    }

    /// Write a commented starter configuration, for `obsd -d`.
    pub fn write_default(path: &str) -> Result<()> {
        if Path::new(path).exists() {
            anyhow::bail!("{path} already exists, refusing to overwrite");
        }
        let mut cfg = Config::default();
        cfg.observation_system.push(ObssConfig {
            group_id: "001".into(),
            site: SiteConfig {
                name: "Xinglong".into(),
                lon: 117.57,
                lat: 40.40,
                alt: 900.0,
                timezone: 8,
            },
            ..ObssConfig::default()
        });
        let text = toml::to_string_pretty(&cfg).context("serialize default config")?;
        std::fs::write(path, text).with_context(|| format!("cannot write {path}"))?;
        Ok(())
    }
}

fn env_u16(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports() {
        let cfg = Config::default();
        assert_eq!(cfg.server.client_port, 4010);
        assert_eq!(cfg.server.environment_port, 4015);
    }

    #[test]
    fn parse_minimal_file() {
        let text = r#"
            log_dir = "/var/log/obsd"

            [[observation_system]]
            group_id = "001"
            alt_limit = 15.0

            [observation_system.site]
            name = "test"
            lon = 117.5
            lat = 40.4
            timezone = 8

            [observation_system.sun]
            day_min = 3.0
            night_max = -25.0

            [observation_system.environment.wind]
            use = true
            max = 15.0
        "#;
        let mut cfg: Config = toml::from_str(text).unwrap();
        cfg.normalize();
        let obss = cfg.group("001").unwrap();
        assert_eq!(obss.alt_limit, 15.0);
        assert!(obss.environment.wind.enable);
        // thresholds are clamped into their bands
        assert_eq!(obss.sun.day_min, 0.0);
        assert_eq!(obss.sun.night_max, -18.0);
        assert!(cfg.group("002").is_none());
    }
}
